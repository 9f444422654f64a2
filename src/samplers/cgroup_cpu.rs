// Copyright (c) The cgscope authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CPU accounting for the monitored cgroup.
//!
//! v1 exposes per-CPU nanosecond counters (split sys/user on recent
//! kernels, user-only on old ones); v2 only has the aggregate in
//! `cpu.stat`. Both paths additionally surface throttling counters and an
//! aggregated `cpu_tot` subsection.

use cgroupfs::CgroupAcctReader;
use cgroupfs::CgroupState;
use cgroupfs::CgroupVersion;
use output::OutputFrontend;
use slog::error;

use crate::samplers::MIN_ELAPSED_SECS;

#[derive(Default, Clone, Copy)]
struct CpuUsageNsec {
    user: u64,
    sys: u64,
}

#[derive(Default)]
pub struct CgroupCpuSampler {
    prev_percpu: Vec<CpuUsageNsec>,
    prev_total: CpuUsageNsec,
    samples_collected: u64,
}

fn percent(current: u64, previous: u64, elapsed: f64) -> f64 {
    100.0 * current.saturating_sub(previous) as f64 / (elapsed * 1e9)
}

impl CgroupCpuSampler {
    pub fn new() -> CgroupCpuSampler {
        Default::default()
    }

    /// Sample once. The first call is the bootstrap: it primes previous
    /// values and emits nothing.
    pub fn sample(
        &mut self,
        logger: &slog::Logger,
        acct: &mut CgroupAcctReader,
        state: &CgroupState,
        out: &mut OutputFrontend,
        elapsed: f64,
    ) {
        let emit = self.samples_collected > 0;
        self.samples_collected += 1;

        if emit {
            out.psection_start("cgroup_cpuacct_stats");
        }

        let total = match state.version {
            CgroupVersion::V1 => self.sample_v1_percpu(logger, acct, state, out, elapsed, emit),
            CgroupVersion::V2 => self.sample_v2(logger, acct, out, emit),
        };

        // aggregated counter across all cpus
        if let Some(total) = total {
            if emit && elapsed > MIN_ELAPSED_SECS {
                out.psubsection_start("cpu_tot");
                out.pdouble("user", percent(total.user, self.prev_total.user, elapsed));
                out.pdouble("sys", percent(total.sys, self.prev_total.sys, elapsed));
                out.psubsection_end();
            }
            self.prev_total = total;
        }

        if emit {
            out.psection_end();
        }
    }

    /// v1: per-CPU subsections from the nanosecond counters, plus the
    /// `cpu.stat` throttling counters.
    fn sample_v1_percpu(
        &mut self,
        logger: &slog::Logger,
        acct: &mut CgroupAcctReader,
        state: &CgroupState,
        out: &mut OutputFrontend,
        elapsed: f64,
        emit: bool,
    ) -> Option<CpuUsageNsec> {
        let total = match acct.read_percpu_usage() {
            Ok(usage) => {
                if self.prev_percpu.len() != usage.user_nsec.len() {
                    self.prev_percpu
                        .resize(usage.user_nsec.len(), CpuUsageNsec::default());
                }
                let mut total = CpuUsageNsec::default();
                for (cpu, user) in usage.user_nsec.iter().enumerate() {
                    let sys = usage.sys_nsec.as_ref().map(|v| v[cpu]);
                    let prev = self.prev_percpu[cpu];
                    if state.is_allowed_cpu(cpu as u32) && emit && elapsed > MIN_ELAPSED_SECS {
                        // a single CPU cannot exceed 100%; clock jitter can
                        // push the quotient slightly over
                        out.psubsection_start(&format!("cpu{cpu}"));
                        out.pdouble("user", percent(*user, prev.user, elapsed).min(100.0));
                        if let Some(sys) = sys {
                            out.pdouble("sys", percent(sys, prev.sys, elapsed).min(100.0));
                        }
                        out.psubsection_end();
                    }
                    total.user += user;
                    total.sys += sys.unwrap_or(0);
                    self.prev_percpu[cpu] = CpuUsageNsec {
                        user: *user,
                        sys: sys.unwrap_or(0),
                    };
                }
                Some(total)
            }
            Err(e) => {
                error!(logger, "failed to sample cgroup per-cpu usage: {e}");
                None
            }
        };

        // throttling counters from cpu.stat, emitted in file order
        match acct.read_cpu_stat() {
            Ok(pairs) => {
                if emit {
                    out.psubsection_start("throttling");
                    for (label, value) in pairs {
                        out.pulong(&label, value);
                    }
                    out.psubsection_end();
                }
            }
            Err(e) => error!(logger, "failed to sample cgroup cpu.stat: {e}"),
        }

        total
    }

    /// v2: `cpu.stat` carries both the aggregate usage (`user_usec`,
    /// `system_usec`, microseconds) and the throttling counters. There is
    /// no per-CPU breakdown.
    fn sample_v2(
        &mut self,
        logger: &slog::Logger,
        acct: &mut CgroupAcctReader,
        out: &mut OutputFrontend,
        emit: bool,
    ) -> Option<CpuUsageNsec> {
        let pairs = match acct.read_cpu_stat() {
            Ok(pairs) => pairs,
            Err(e) => {
                error!(logger, "failed to sample cgroup cpu.stat: {e}");
                return None;
            }
        };

        let mut total = CpuUsageNsec::default();
        let mut usage_fields_found = 0;
        if emit {
            out.psubsection_start("throttling");
        }
        for (label, value) in pairs {
            match label.as_str() {
                // derived: user_usec + system_usec
                "usage_usec" => continue,
                "user_usec" => {
                    total.user = value * 1000;
                    usage_fields_found += 1;
                }
                "system_usec" => {
                    total.sys = value * 1000;
                    usage_fields_found += 1;
                }
                _ => {
                    if emit {
                        out.pulong(&label, value);
                    }
                }
            }
        }
        if emit {
            out.psubsection_end();
        }

        (usage_fields_found == 2).then_some(total)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use cgroupfs::CgroupLimits;
    use cgroupfs::CgroupVersion;
    use common::Cpuset;
    use output::OutputFrontend;
    use output::Section;

    use super::*;

    fn discard_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn fixture(dir: &tempfile::TempDir, name: &str, content: &str) {
        let path = dir.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(path, content).expect("write fixture");
    }

    fn state(dir: &tempfile::TempDir, version: CgroupVersion) -> CgroupState {
        CgroupState {
            version,
            name: "/docker/test".to_owned(),
            memory_path: dir.path().to_path_buf(),
            cpuacct_path: dir.path().to_path_buf(),
            cpuset_path: dir.path().to_path_buf(),
            cpuacct_controller: "cpu,cpuacct".to_owned(),
            process_list_path: dir.path().join("tasks"),
            limits: CgroupLimits {
                allowed_cpus: Cpuset::from_str("0-1").unwrap(),
                memory_limit_bytes: None,
                cpu_quota_us: None,
                cpu_period_us: 100000,
            },
        }
    }

    fn section<'a>(out: &'a OutputFrontend, name: &str) -> &'a Section {
        out.tree()
            .sections()
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("no section {name}"))
    }

    #[test]
    fn test_v1_percpu_percentages() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        // 2 cpus, nanosecond counters
        fixture(&dir, "cpuacct.usage_percpu_user", "1000000000 2000000000\n");
        fixture(&dir, "cpuacct.usage_percpu_sys", "500000000 500000000\n");
        fixture(
            &dir,
            "cpu.stat",
            "nr_periods 10\nnr_throttled 2\nthrottled_time 12345\n",
        );
        let state = state(&dir, CgroupVersion::V1);
        let mut acct = CgroupAcctReader::new(&state, true);
        let mut out = OutputFrontend::new(discard_logger());
        let mut sampler = CgroupCpuSampler::new();

        // bootstrap emits nothing
        sampler.sample(&discard_logger(), &mut acct, &state, &mut out, 1.0);
        assert!(out.tree().is_empty());

        // cpu0 burns half a second of user time over one second elapsed
        fixture(&dir, "cpuacct.usage_percpu_user", "1500000000 2000000000\n");
        fixture(&dir, "cpuacct.usage_percpu_sys", "500000000 750000000\n");
        sampler.sample(&discard_logger(), &mut acct, &state, &mut out, 1.0);

        let stats = section(&out, "cgroup_cpuacct_stats");
        let cpu0 = stats
            .subsections
            .iter()
            .find(|s| s.name == "cpu0")
            .expect("cpu0");
        assert_eq!(cpu0.value_of("user"), Some("50.000"));
        assert_eq!(cpu0.value_of("sys"), Some("0.000"));
        let cpu1 = stats
            .subsections
            .iter()
            .find(|s| s.name == "cpu1")
            .expect("cpu1");
        assert_eq!(cpu1.value_of("user"), Some("0.000"));
        assert_eq!(cpu1.value_of("sys"), Some("25.000"));

        let throttling = stats
            .subsections
            .iter()
            .find(|s| s.name == "throttling")
            .expect("throttling");
        assert_eq!(throttling.value_of("nr_periods"), Some("10"));
        assert_eq!(throttling.value_of("throttled_time"), Some("12345"));

        // total across both cpus: 0.5s user + 0.25s sys
        let cpu_tot = stats
            .subsections
            .iter()
            .find(|s| s.name == "cpu_tot")
            .expect("cpu_tot");
        assert_eq!(cpu_tot.value_of("user"), Some("50.000"));
        assert_eq!(cpu_tot.value_of("sys"), Some("25.000"));
    }

    #[test]
    fn test_v2_aggregate_and_throttling() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        fixture(
            &dir,
            "cpu.stat",
            "usage_usec 3000000\nuser_usec 2000000\nsystem_usec 1000000\n\
             nr_periods 5\nnr_throttled 1\nthrottled_usec 100\n",
        );
        let state = state(&dir, CgroupVersion::V2);
        let mut acct = CgroupAcctReader::new(&state, true);
        let mut out = OutputFrontend::new(discard_logger());
        let mut sampler = CgroupCpuSampler::new();

        sampler.sample(&discard_logger(), &mut acct, &state, &mut out, 1.0);
        assert!(out.tree().is_empty());

        // +1s user, +0.5s sys over 2s elapsed
        fixture(
            &dir,
            "cpu.stat",
            "usage_usec 4500000\nuser_usec 3000000\nsystem_usec 1500000\n\
             nr_periods 6\nnr_throttled 1\nthrottled_usec 100\n",
        );
        sampler.sample(&discard_logger(), &mut acct, &state, &mut out, 2.0);

        let stats = section(&out, "cgroup_cpuacct_stats");
        // v2 has no per-cpu subsections
        assert!(stats.subsections.iter().all(|s| !s.name.starts_with("cpu") || s.name == "cpu_tot"));
        let throttling = stats
            .subsections
            .iter()
            .find(|s| s.name == "throttling")
            .expect("throttling");
        assert_eq!(throttling.value_of("nr_periods"), Some("6"));
        assert_eq!(throttling.value_of("usage_usec"), None);
        assert_eq!(throttling.value_of("user_usec"), None);

        let cpu_tot = stats
            .subsections
            .iter()
            .find(|s| s.name == "cpu_tot")
            .expect("cpu_tot");
        assert_eq!(cpu_tot.value_of("user"), Some("50.000"));
        assert_eq!(cpu_tot.value_of("sys"), Some("25.000"));
    }
}
