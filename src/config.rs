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

//! Runtime configuration, immutable after CLI parsing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// The set of statistics families to collect. Parsed from a
/// comma-separated list; `all_baremetal`, `all_cgroup` and `all` are
/// aggregates.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct CollectFlags {
    pub cpu: bool,
    pub disk: bool,
    pub memory: bool,
    pub network: bool,
    pub cgroup_cpu: bool,
    pub cgroup_memory: bool,
    /// Accepted and reserved; no blkio sampler is wired up yet.
    pub cgroup_blkio: bool,
    pub cgroup_network: bool,
    pub cgroup_processes: bool,
    pub cgroup_threads: bool,
}

impl CollectFlags {
    pub fn all_baremetal() -> CollectFlags {
        CollectFlags {
            cpu: true,
            disk: true,
            memory: true,
            network: true,
            ..Default::default()
        }
    }

    pub fn all_cgroup() -> CollectFlags {
        CollectFlags {
            cgroup_cpu: true,
            cgroup_memory: true,
            cgroup_blkio: true,
            cgroup_processes: true,
            ..Default::default()
        }
    }

    pub fn all() -> CollectFlags {
        Self::all_baremetal().union(Self::all_cgroup())
    }

    pub fn union(self, other: CollectFlags) -> CollectFlags {
        CollectFlags {
            cpu: self.cpu || other.cpu,
            disk: self.disk || other.disk,
            memory: self.memory || other.memory,
            network: self.network || other.network,
            cgroup_cpu: self.cgroup_cpu || other.cgroup_cpu,
            cgroup_memory: self.cgroup_memory || other.cgroup_memory,
            cgroup_blkio: self.cgroup_blkio || other.cgroup_blkio,
            cgroup_network: self.cgroup_network || other.cgroup_network,
            cgroup_processes: self.cgroup_processes || other.cgroup_processes,
            cgroup_threads: self.cgroup_threads || other.cgroup_threads,
        }
    }

    pub fn any_cgroup(&self) -> bool {
        self.cgroup_cpu
            || self.cgroup_memory
            || self.cgroup_blkio
            || self.cgroup_network
            || self.cgroup_processes
            || self.cgroup_threads
    }

    /// The list rendered into the header's `collecting` field.
    pub fn describe(&self) -> String {
        let mut names = Vec::new();
        let flags = [
            (self.cpu, "cpu"),
            (self.disk, "disk"),
            (self.memory, "memory"),
            (self.network, "network"),
            (self.cgroup_cpu, "cgroup_cpu"),
            (self.cgroup_memory, "cgroup_memory"),
            (self.cgroup_blkio, "cgroup_blkio"),
            (self.cgroup_network, "cgroup_network"),
            (self.cgroup_processes, "cgroup_processes"),
            (self.cgroup_threads, "cgroup_threads"),
        ];
        for (enabled, name) in flags {
            if enabled {
                names.push(name);
            }
        }
        names.join(",")
    }
}

impl FromStr for CollectFlags {
    type Err = String;

    fn from_str(s: &str) -> Result<CollectFlags, String> {
        let mut flags = CollectFlags::default();
        for token in s.split(',') {
            let family = match token.trim() {
                "cpu" => CollectFlags {
                    cpu: true,
                    ..Default::default()
                },
                "disk" => CollectFlags {
                    disk: true,
                    ..Default::default()
                },
                "memory" => CollectFlags {
                    memory: true,
                    ..Default::default()
                },
                "network" => CollectFlags {
                    network: true,
                    ..Default::default()
                },
                "cgroup_cpu" => CollectFlags {
                    cgroup_cpu: true,
                    ..Default::default()
                },
                "cgroup_memory" => CollectFlags {
                    cgroup_memory: true,
                    ..Default::default()
                },
                "cgroup_blkio" => CollectFlags {
                    cgroup_blkio: true,
                    ..Default::default()
                },
                "cgroup_network" => CollectFlags {
                    cgroup_network: true,
                    ..Default::default()
                },
                "cgroup_processes" => CollectFlags {
                    cgroup_processes: true,
                    ..Default::default()
                },
                "cgroup_threads" => CollectFlags {
                    cgroup_threads: true,
                    ..Default::default()
                },
                "all_baremetal" => CollectFlags::all_baremetal(),
                "all_cgroup" => CollectFlags::all_cgroup(),
                "all" => CollectFlags::all(),
                other => return Err(format!("unrecognized statistics family: {other}")),
            };
            flags = flags.union(family);
        }
        Ok(flags)
    }
}

/// How many samples to collect before exiting.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SampleCount {
    Forever,
    Finite(u64),
    /// Sample until the monitored cgroup's controller directories vanish.
    UntilCgroupAlive,
}

impl FromStr for SampleCount {
    type Err = String;

    fn from_str(s: &str) -> Result<SampleCount, String> {
        if s == "until-cgroup-alive" {
            return Ok(SampleCount::UntilCgroupAlive);
        }
        match s.parse::<u64>() {
            Ok(0) => Ok(SampleCount::Forever),
            Ok(n) => Ok(SampleCount::Finite(n)),
            Err(_) => Err(format!("unrecognized number of samples: {s}")),
        }
    }
}

/// Field selection: `ChartOnly` keeps the subset consumed by charting
/// tools, `All` emits everything (`--deep-collect`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DetailLevel {
    ChartOnly,
    All,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RemoteConfig {
    pub ip: String,
    pub port: u16,
    pub secret: String,
    pub dbname: String,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Config {
    pub sampling_interval_secs: u64,
    pub num_samples: SampleCount,
    pub collect: CollectFlags,
    pub detail: DetailLevel,
    /// None or "self" monitors the collector's own cgroup.
    pub cgroup_name: Option<String>,
    pub score_threshold: u64,
    pub custom_metadata: BTreeMap<String, String>,
    pub allow_multiple_instances: bool,
    pub foreground: bool,
    pub debug: bool,
    pub output_dir: Option<PathBuf>,
    /// File prefix, or the sentinels `stdout` / `none`.
    pub output_filename: String,
    pub output_pretty: bool,
    pub remote: Option<RemoteConfig>,
}

impl Config {
    /// Default output prefix: `<hostname>_<YYYYMMDD>_<HHMM>`.
    pub fn default_output_prefix() -> String {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_owned());
        let now = chrono::Local::now();
        format!("{}_{}", hostname, now.format("%Y%m%d_%H%M"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_flags_single_families() {
        let flags = CollectFlags::from_str("cpu,cgroup_memory").unwrap();
        assert!(flags.cpu);
        assert!(flags.cgroup_memory);
        assert!(!flags.disk);
        assert!(flags.any_cgroup());
        assert_eq!(flags.describe(), "cpu,cgroup_memory");
    }

    #[test]
    fn test_collect_flags_aggregates() {
        let flags = CollectFlags::from_str("all").unwrap();
        assert!(flags.cpu && flags.disk && flags.memory && flags.network);
        assert!(flags.cgroup_cpu && flags.cgroup_memory && flags.cgroup_processes);
        // threads and cgroup-network are opt-in, not part of `all`
        assert!(!flags.cgroup_threads);
        assert!(!flags.cgroup_network);

        let baremetal = CollectFlags::from_str("all_baremetal").unwrap();
        assert!(!baremetal.any_cgroup());
    }

    #[test]
    fn test_collect_flags_unknown_family() {
        assert!(CollectFlags::from_str("cpu,bogus").is_err());
    }

    #[test]
    fn test_sample_count_parsing() {
        assert_eq!(SampleCount::from_str("0").unwrap(), SampleCount::Forever);
        assert_eq!(
            SampleCount::from_str("42").unwrap(),
            SampleCount::Finite(42)
        );
        assert_eq!(
            SampleCount::from_str("until-cgroup-alive").unwrap(),
            SampleCount::UntilCgroupAlive
        );
        assert!(SampleCount::from_str("many").is_err());
    }
}
