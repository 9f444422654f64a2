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

#![deny(clippy::all)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use common::FastFileReader;
use thiserror::Error;

mod detect;
mod types;

pub use detect::detect;
pub use detect::DetectError;
pub use detect::DetectorConfig;
pub use types::*;


#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid file format: {0:?}")]
    InvalidFileFormat(PathBuf),
    #[error("{1:?}: {0:?}")]
    IoError(PathBuf, #[source] std::io::Error),
    #[error("Unexpected line ({1}) in file: {0:?}")]
    UnexpectedLine(PathBuf, String),
    #[error("Per-CPU counter count changed from {1} to {2} in {0:?}")]
    CpuCountMismatch(PathBuf, usize, usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read a single unsigned integer from a one-line file. `-1` (seen in
/// `cpu.cfs_quota_us` for "no limit") maps to `None`.
pub(crate) fn read_integer_file(path: &Path) -> Result<Option<u64>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::IoError(path.into(), e))?;
    let token = content
        .split_ascii_whitespace()
        .next()
        .ok_or_else(|| Error::InvalidFileFormat(path.into()))?;
    if token == "-1" {
        return Ok(None);
    }
    token
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::UnexpectedLine(path.into(), content.trim_end().to_string()))
}

/// Read a v2 single-value file where the literal `max` means "no limit".
pub(crate) fn read_integer_or_max_file(path: &Path) -> Result<Option<u64>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::IoError(path.into(), e))?;
    let token = content
        .split_ascii_whitespace()
        .next()
        .ok_or_else(|| Error::InvalidFileFormat(path.into()))?;
    if token == "max" {
        return Ok(None);
    }
    token
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::UnexpectedLine(path.into(), content.trim_end().to_string()))
}

/// Read `cpu.max`: either `max <period>` or `<quota> <period>`.
pub(crate) fn read_cpu_max_file(path: &Path) -> Result<(Option<u64>, u64)> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::IoError(path.into(), e))?;
    let mut items = content.split_ascii_whitespace();
    let quota = match items.next() {
        Some("max") => None,
        Some(token) => Some(token.parse::<u64>().map_err(|_| {
            Error::UnexpectedLine(path.into(), content.trim_end().to_string())
        })?),
        None => return Err(Error::InvalidFileFormat(path.into())),
    };
    let period = items
        .next()
        .and_then(|t| t.parse::<u64>().ok())
        .ok_or_else(|| Error::UnexpectedLine(path.into(), content.trim_end().to_string()))?;
    Ok((quota, period))
}

/// Whether `value` appears on any line of the given task-list file.
pub(crate) fn search_integer_in_file(path: &Path, value: u64) -> bool {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return false,
    };
    content
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .any(|v| v == value)
}

/// Per-CPU cpuacct usage counters (nanoseconds), as read from
/// `cpuacct.usage_percpu_user`/`_sys` or the user-only `cpuacct.usage_percpu`.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct PercpuUsage {
    pub user_nsec: Vec<u64>,
    /// Present only when the kernel exposes the split sys/user files.
    pub sys_nsec: Option<Vec<u64>>,
}

/// Reader for the accounting files of one monitored cgroup. Keeps a
/// [`FastFileReader`] per file so steady-state sampling never re-opens
/// them; the process-list file is the exception and is re-opened on every
/// read (rewinding it has been observed to yield stale content).
pub struct CgroupAcctReader {
    version: CgroupVersion,
    cpuacct_path: PathBuf,
    cpu_stat: FastFileReader,
    memory_stat: FastFileReader,
    memory_failcnt: Option<FastFileReader>,
    memory_current: Option<FastFileReader>,
    memory_events: Option<FastFileReader>,
    pids: FastFileReader,
    // per-cpu files are probed lazily: older v1 kernels only have the
    // user-only aggregate
    usage_percpu_user: FastFileReader,
    usage_percpu_sys: FastFileReader,
    usage_percpu: FastFileReader,
    num_cpus_seen: usize,
}

impl CgroupAcctReader {
    /// `reopen_each_time` is for test fixtures that swap files between
    /// samples.
    pub fn new(state: &CgroupState, reopen_each_time: bool) -> CgroupAcctReader {
        let new_reader = |path: PathBuf| -> FastFileReader {
            if reopen_each_time {
                FastFileReader::new_reopening(path)
            } else {
                FastFileReader::new(path)
            }
        };
        let (memory_failcnt, memory_current, memory_events) = match state.version {
            CgroupVersion::V1 => (
                Some(new_reader(state.memory_path.join("memory.failcnt"))),
                None,
                None,
            ),
            CgroupVersion::V2 => (
                None,
                Some(new_reader(state.memory_path.join("memory.current"))),
                Some(new_reader(state.memory_path.join("memory.events"))),
            ),
        };
        CgroupAcctReader {
            version: state.version,
            cpu_stat: new_reader(state.cpuacct_path.join("cpu.stat")),
            memory_stat: new_reader(state.memory_path.join("memory.stat")),
            memory_failcnt,
            memory_current,
            memory_events,
            pids: FastFileReader::new_reopening(state.process_list_path.clone()),
            usage_percpu_user: new_reader(state.cpuacct_path.join("cpuacct.usage_percpu_user")),
            usage_percpu_sys: new_reader(state.cpuacct_path.join("cpuacct.usage_percpu_sys")),
            usage_percpu: new_reader(state.cpuacct_path.join("cpuacct.usage_percpu")),
            cpuacct_path: state.cpuacct_path.clone(),
            num_cpus_seen: 0,
        }
    }

    fn rewind(reader: &mut FastFileReader) -> Result<()> {
        reader
            .open_or_rewind()
            .map_err(|e| Error::IoError(reader.path().to_path_buf(), e))
    }

    /// Read the member pids (really tids) of the cgroup. Fails when the
    /// process-list file has disappeared, i.e. the cgroup is gone.
    pub fn read_pids(&mut self) -> Result<Vec<i32>> {
        Self::rewind(&mut self.pids)?;
        Ok(self
            .pids
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .collect())
    }

    /// v1 per-CPU usage counters. Prefers the split sys/user pair, falls
    /// back to the user-only aggregate. A length mismatch between the two
    /// files, or a change in CPU count between samples, marks the sample
    /// invalid.
    pub fn read_percpu_usage(&mut self) -> Result<PercpuUsage> {
        if Self::rewind(&mut self.usage_percpu_sys).is_ok() {
            let sys = Self::parse_counter_line(&self.usage_percpu_sys)?;
            Self::rewind(&mut self.usage_percpu_user)?;
            let user = Self::parse_counter_line(&self.usage_percpu_user)?;
            if sys.len() != user.len() {
                return Err(Error::CpuCountMismatch(
                    self.usage_percpu_user.path().to_path_buf(),
                    sys.len(),
                    user.len(),
                ));
            }
            self.check_cpu_count(user.len())?;
            Ok(PercpuUsage {
                user_nsec: user,
                sys_nsec: Some(sys),
            })
        } else {
            Self::rewind(&mut self.usage_percpu)?;
            let user = Self::parse_counter_line(&self.usage_percpu)?;
            self.check_cpu_count(user.len())?;
            Ok(PercpuUsage {
                user_nsec: user,
                sys_nsec: None,
            })
        }
    }

    fn parse_counter_line(reader: &FastFileReader) -> Result<Vec<u64>> {
        let line = reader
            .lines()
            .next()
            .ok_or_else(|| Error::InvalidFileFormat(reader.path().to_path_buf()))?;
        line.split_ascii_whitespace()
            .map(|token| {
                token.parse::<u64>().map_err(|_| {
                    Error::UnexpectedLine(reader.path().to_path_buf(), line.to_string())
                })
            })
            .collect()
    }

    fn check_cpu_count(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidFileFormat(
                self.cpuacct_path.join("cpuacct.usage_percpu"),
            ));
        }
        if self.num_cpus_seen == 0 {
            self.num_cpus_seen = count;
        } else if self.num_cpus_seen != count {
            let seen = self.num_cpus_seen;
            self.num_cpus_seen = 0;
            return Err(Error::CpuCountMismatch(
                self.cpuacct_path.join("cpuacct.usage_percpu"),
                seen,
                count,
            ));
        }
        Ok(())
    }

    /// Read `cpu.stat` as ordered key/value pairs: v1 throttling counters
    /// (`nr_periods`, `nr_throttled`, `throttled_time`), v2 usage plus
    /// throttling. File order is preserved because it is observable in the
    /// output.
    pub fn read_cpu_stat(&mut self) -> Result<Vec<(String, u64)>> {
        Self::rewind(&mut self.cpu_stat)?;
        let mut out = Vec::new();
        for line in self.cpu_stat.lines() {
            let mut items = line.split_ascii_whitespace();
            if let (Some(label), Some(value)) = (items.next(), items.next()) {
                if let Ok(value) = value.parse::<u64>() {
                    out.push((label.to_owned(), value));
                }
            }
        }
        if out.is_empty() {
            Err(Error::InvalidFileFormat(
                self.cpu_stat.path().to_path_buf(),
            ))
        } else {
            Ok(out)
        }
    }

    /// Read `memory.stat` filtered by `allowlist` (empty = everything),
    /// keys prefixed with `stat.`. On v1 only the `total_*` lines count and
    /// the prefix is stripped so v1 keys line up with v2 naming.
    pub fn read_memory_stat(
        &mut self,
        allowlist: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, u64>> {
        Self::rewind(&mut self.memory_stat)?;
        let mut out = BTreeMap::new();
        for line in self.memory_stat.lines() {
            let line = match self.version {
                CgroupVersion::V1 => match line.strip_prefix("total_") {
                    Some(rest) => rest,
                    // skip non-totals: only cgroup-total values are wanted
                    None => continue,
                },
                CgroupVersion::V2 => line,
            };
            let mut items = line.split_ascii_whitespace();
            if let (Some(label), Some(value)) = (items.next(), items.next()) {
                if let Ok(value) = value.parse::<u64>() {
                    let label = format!("stat.{label}");
                    if allowlist.is_empty() || allowlist.contains(&label) {
                        out.insert(label, value);
                    }
                }
            }
        }
        Ok(out)
    }

    /// v2 only: read `memory.events` filtered by `allowlist`, keys prefixed
    /// with `events.`.
    pub fn read_memory_events(
        &mut self,
        allowlist: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, u64>> {
        let reader = match self.memory_events.as_mut() {
            Some(r) => r,
            None => return Ok(BTreeMap::new()),
        };
        Self::rewind(reader)?;
        let mut out = BTreeMap::new();
        for line in reader.lines() {
            let mut items = line.split_ascii_whitespace();
            if let (Some(label), Some(value)) = (items.next(), items.next()) {
                if let Ok(value) = value.parse::<u64>() {
                    let label = format!("events.{label}");
                    if allowlist.is_empty() || allowlist.contains(&label) {
                        out.insert(label, value);
                    }
                }
            }
        }
        Ok(out)
    }

    /// v2 only: current memory consumption in bytes.
    pub fn read_memory_current(&mut self) -> Result<Option<u64>> {
        let reader = match self.memory_current.as_mut() {
            Some(r) => r,
            None => return Ok(None),
        };
        Self::rewind(reader)?;
        let line = reader
            .lines()
            .next()
            .ok_or_else(|| Error::InvalidFileFormat(reader.path().to_path_buf()))?;
        line.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::UnexpectedLine(reader.path().to_path_buf(), line.to_string()))
    }

    /// v1 only: monotonic count of failed allocations.
    pub fn read_memory_failcnt(&mut self) -> Result<Option<u64>> {
        let reader = match self.memory_failcnt.as_mut() {
            Some(r) => r,
            None => return Ok(None),
        };
        Self::rewind(reader)?;
        let line = reader
            .lines()
            .next()
            .ok_or_else(|| Error::InvalidFileFormat(reader.path().to_path_buf()))?;
        line.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| Error::UnexpectedLine(reader.path().to_path_buf(), line.to_string()))
    }
}
