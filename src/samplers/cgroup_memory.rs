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

//! Memory accounting for the monitored cgroup: `memory.stat` absolute
//! values plus event counters emitted as deltas (`memory.failcnt` on v1,
//! `memory.events` on v2).

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use cgroupfs::CgroupAcctReader;
use cgroupfs::CgroupState;
use cgroupfs::CgroupVersion;
use output::OutputFrontend;
use slog::error;

use crate::config::DetailLevel;

/// Chart-only allowlists. v1 keys align with v2 naming because the reader
/// strips the `total_` prefix.
const CHARTED_V1_STATS: &[&str] = &["stat.cache", "stat.rss", "events.failcnt"];
const CHARTED_V2_STATS: &[&str] = &["stat.anon"];

#[derive(Default)]
pub struct CgroupMemorySampler {
    prev_failcnt: u64,
    prev_events: BTreeMap<String, u64>,
    samples_collected: u64,
    allowlist: BTreeSet<String>,
}

impl CgroupMemorySampler {
    pub fn new(version: CgroupVersion, detail: DetailLevel) -> CgroupMemorySampler {
        let allowlist = match (detail, version) {
            (DetailLevel::All, _) => BTreeSet::new(),
            (DetailLevel::ChartOnly, CgroupVersion::V1) => {
                CHARTED_V1_STATS.iter().map(|s| s.to_string()).collect()
            }
            (DetailLevel::ChartOnly, CgroupVersion::V2) => {
                CHARTED_V2_STATS.iter().map(|s| s.to_string()).collect()
            }
        };
        CgroupMemorySampler {
            allowlist,
            ..Default::default()
        }
    }

    /// Sample once. Absolute `stat.*` values are emitted on every call,
    /// including the first; the `events.*` counters are emitted as deltas
    /// and therefore suppressed until a baseline exists.
    pub fn sample(
        &mut self,
        logger: &slog::Logger,
        acct: &mut CgroupAcctReader,
        state: &CgroupState,
        out: &mut OutputFrontend,
    ) {
        let emit_deltas = self.samples_collected > 0;
        self.samples_collected += 1;

        out.psection_start("cgroup_memory_stats");

        if state.version == CgroupVersion::V2 {
            // the headline consumption figure leads the section
            match acct.read_memory_current() {
                Ok(Some(current)) => out.pulong("stat.current", current),
                Ok(None) => {}
                Err(e) => error!(logger, "failed to sample memory.current: {e}"),
            }
        }

        match acct.read_memory_stat(&self.allowlist) {
            Ok(stats) => {
                for (label, value) in &stats {
                    out.pulong(label, *value);
                }
            }
            Err(e) => error!(logger, "failed to sample memory.stat: {e}"),
        }

        match state.version {
            CgroupVersion::V1 => match acct.read_memory_failcnt() {
                Ok(Some(failcnt)) => {
                    if emit_deltas {
                        out.pulong("events.failcnt", failcnt.saturating_sub(self.prev_failcnt));
                    }
                    self.prev_failcnt = failcnt;
                }
                Ok(None) => {}
                Err(e) => error!(logger, "failed to sample memory.failcnt: {e}"),
            },
            CgroupVersion::V2 => match acct.read_memory_events(&self.allowlist) {
                Ok(events) => {
                    if emit_deltas {
                        for (label, value) in &events {
                            if let Some(previous) = self.prev_events.get(label) {
                                out.pulong(label, value.saturating_sub(*previous));
                            }
                        }
                    }
                    self.prev_events = events;
                }
                Err(e) => error!(logger, "failed to sample memory.events: {e}"),
            },
        }

        out.psection_end();
    }
}

#[cfg(test)]
mod tests {
    use cgroupfs::CgroupAcctReader;
    use cgroupfs::CgroupLimits;
    use cgroupfs::CgroupState;
    use output::Section;
    use output::OutputFrontend;

    use super::*;

    fn discard_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn fixture(dir: &tempfile::TempDir, name: &str, content: &str) {
        std::fs::write(dir.path().join(name), content).expect("write fixture");
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
            limits: CgroupLimits::default(),
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
    fn test_v1_stats_and_failcnt_delta() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        fixture(
            &dir,
            "memory.stat",
            "cache 1\nrss 2\ntotal_cache 11534336\ntotal_rss 1048576\n",
        );
        fixture(&dir, "memory.failcnt", "100\n");
        let state = state(&dir, CgroupVersion::V1);
        let mut acct = CgroupAcctReader::new(&state, true);
        let mut out = OutputFrontend::new(discard_logger());
        let mut sampler = CgroupMemorySampler::new(CgroupVersion::V1, DetailLevel::All);

        // the first sample already carries the absolute values; only the
        // failcnt delta waits for a baseline
        sampler.sample(&discard_logger(), &mut acct, &state, &mut out);
        let stats = section(&out, "cgroup_memory_stats");
        assert_eq!(stats.value_of("stat.cache"), Some("11534336"));
        assert_eq!(stats.value_of("stat.rss"), Some("1048576"));
        assert_eq!(stats.value_of("events.failcnt"), None);

        out.push_sample().expect("flush");
        fixture(&dir, "memory.failcnt", "103\n");
        sampler.sample(&discard_logger(), &mut acct, &state, &mut out);

        let stats = section(&out, "cgroup_memory_stats");
        assert_eq!(stats.value_of("stat.cache"), Some("11534336"));
        assert_eq!(stats.value_of("stat.rss"), Some("1048576"));
        assert_eq!(stats.value_of("events.failcnt"), Some("3"));
    }

    #[test]
    fn test_v2_current_leads_section() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        fixture(&dir, "memory.stat", "anon 4096\nfile 8192\n");
        fixture(&dir, "memory.current", "123456\n");
        fixture(&dir, "memory.events", "low 0\noom_kill 1\n");
        let state = state(&dir, CgroupVersion::V2);
        let mut acct = CgroupAcctReader::new(&state, true);
        let mut out = OutputFrontend::new(discard_logger());
        let mut sampler = CgroupMemorySampler::new(CgroupVersion::V2, DetailLevel::All);

        // absolute values are present from the very first sample
        sampler.sample(&discard_logger(), &mut acct, &state, &mut out);
        let stats = section(&out, "cgroup_memory_stats");
        assert_eq!(stats.measurements[0].name, "stat.current");
        assert_eq!(stats.value_of("stat.current"), Some("123456"));
        assert_eq!(stats.value_of("stat.anon"), Some("4096"));
        assert_eq!(stats.value_of("events.oom_kill"), None);

        out.push_sample().expect("flush");
        fixture(&dir, "memory.events", "low 0\noom_kill 3\n");
        sampler.sample(&discard_logger(), &mut acct, &state, &mut out);

        let stats = section(&out, "cgroup_memory_stats");
        assert_eq!(stats.measurements[0].name, "stat.current");
        assert_eq!(stats.value_of("stat.current"), Some("123456"));
        assert_eq!(stats.value_of("stat.anon"), Some("4096"));
        assert_eq!(stats.value_of("events.oom_kill"), Some("2"));
        assert_eq!(stats.value_of("events.low"), Some("0"));
    }

    #[test]
    fn test_chart_only_allowlist_filters() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        fixture(
            &dir,
            "memory.stat",
            "total_cache 1\ntotal_rss 2\ntotal_pgfault 3\n",
        );
        fixture(&dir, "memory.failcnt", "0\n");
        let state = state(&dir, CgroupVersion::V1);
        let mut acct = CgroupAcctReader::new(&state, true);
        let mut out = OutputFrontend::new(discard_logger());
        let mut sampler = CgroupMemorySampler::new(CgroupVersion::V1, DetailLevel::ChartOnly);

        sampler.sample(&discard_logger(), &mut acct, &state, &mut out);

        let stats = section(&out, "cgroup_memory_stats");
        assert_eq!(stats.value_of("stat.cache"), Some("1"));
        assert_eq!(stats.value_of("stat.rss"), Some("2"));
        assert_eq!(stats.value_of("stat.pgfault"), None);
    }
}
