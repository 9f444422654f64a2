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

//! Cgroup detection: figure out which cgroup hierarchy this system runs
//! (v1, v2, or a hybrid that resolves to v1), where the controllers of the
//! monitored cgroup live, and which file lists its member tasks.
//!
//! The logic has to cope with different cgroup managers (plain systemd,
//! Docker, LXC, kubelet), both cgroup versions, and distribution quirks
//! such as the `cpu,cpuacct`/`cpuacct,cpu` naming split. Detection failures
//! never abort the collector; the caller degrades to baremetal-only
//! sampling.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use common::Cpuset;
use slog::debug;
use slog::error;
use thiserror::Error;

use crate::read_cpu_max_file;
use crate::read_integer_file;
use crate::read_integer_or_max_file;
use crate::search_integer_in_file;
use crate::CgroupLimits;
use crate::CgroupState;
use crate::CgroupVersion;

/// Any memory limit above this (10^6 GB) is a kernel way of saying
/// "no limit".
const MEMORY_LIMIT_MAX_BYTES: u64 = 1_000_000 * 1_000_000_000;

/// Default CFS period substituted when `cpu.max` is absent.
const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("cannot read {0:?}: {1}")]
    Unreadable(PathBuf, #[source] std::io::Error),
    #[error("invalid line in {0:?}: {1}")]
    InvalidLine(PathBuf, String),
    #[error("no cgroup filesystem mounted")]
    NoCgroupMounts,
    #[error("could not find the '{0}' controller mount")]
    MissingController(String),
    #[error("missing '{0}' entry in /proc/self/cgroup")]
    MissingCgroupEntry(String),
    #[error("own pid {0} not found in any candidate cgroup task list")]
    PidNotFound(u64),
    #[error("cgroup directory {0:?} does not exist")]
    NoSuchCgroup(PathBuf),
    #[error("no process-list file under any controller directory")]
    NoProcessListFile,
    #[error("cannot read limit {0:?}")]
    BadLimit(PathBuf),
}

/// Inputs of the detection pass. Every kernel-provided path can be
/// redirected at a fixture tree, which is how the tests drive the detector
/// deterministically.
pub struct DetectorConfig {
    /// `None` or `Some("self")` monitors the collector's own cgroup;
    /// anything else is a cgroup path relative to the controller mounts.
    pub cgroup_name: Option<String>,
    /// Selects `cgroup.threads` over `cgroup.procs` on v2.
    pub include_threads: bool,
    pub proc_self_cgroup: PathBuf,
    pub proc_self_mounts: PathBuf,
    /// Prefix prepended to the absolute controller paths read from the
    /// mounts table (empty outside of tests).
    pub fs_prefix: PathBuf,
    pub my_pid: u64,
    /// CPUs visible in `/proc/stat`; substituted when a v2 cgroup has no
    /// effective `cpuset.cpus`.
    pub fallback_cpus: Cpuset,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            cgroup_name: None,
            include_threads: false,
            proc_self_cgroup: "/proc/self/cgroup".into(),
            proc_self_mounts: "/proc/self/mounts".into(),
            fs_prefix: PathBuf::new(),
            my_pid: std::process::id() as u64,
            fallback_cpus: Cpuset::new(),
        }
    }
}

struct MountLine {
    fs_spec: String,
    fs_file: String,
    fs_vfstype: String,
    fs_mntops: String,
}

fn scan_mounts(path: &Path) -> Result<Vec<MountLine>, DetectError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| DetectError::Unreadable(path.into(), e))?;
    let mut mounts = Vec::new();
    for line in content.lines() {
        let items: Vec<&str> = line.split_ascii_whitespace().collect();
        if items.len() != 6 {
            return Err(DetectError::InvalidLine(path.into(), line.to_string()));
        }
        mounts.push(MountLine {
            fs_spec: items[0].to_owned(),
            fs_file: items[1].to_owned(),
            fs_vfstype: items[2].to_owned(),
            fs_mntops: items[3].to_owned(),
        });
    }
    Ok(mounts)
}

/// `/proc/self/cgroup` lines are `hierarchy-ID:controller-list:path`; build
/// controller-list -> path. The v2 entry has an empty controller list.
fn scan_self_cgroup(path: &Path) -> Result<BTreeMap<String, String>, DetectError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| DetectError::Unreadable(path.into(), e))?;
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(_hierarchy_id), Some(controllers), Some(cgroup_path)) => {
                map.insert(controllers.to_owned(), cgroup_path.to_owned());
            }
            _ => return Err(DetectError::InvalidLine(path.into(), line.to_string())),
        }
    }
    if map.is_empty() {
        return Err(DetectError::InvalidLine(path.into(), "<empty>".to_string()));
    }
    Ok(map)
}

fn prefixed(prefix: &Path, abs: &str) -> PathBuf {
    PathBuf::from(format!("{}{}", prefix.display(), abs))
}

fn join_relative(base: &Path, rel: &str) -> PathBuf {
    base.join(rel.trim_start_matches('/'))
}

/// v2 iff no v1 controller mount exists and at least one cgroup2 mount
/// does. Hybrid setups (systemd mounting both) resolve to v1: the v1
/// controllers are the ones actually accounting there. Note the fs_spec
/// column reads `cgroup` on some distributions and `cgroup2` on others;
/// the vfstype column is authoritative.
fn decide_version(mounts: &[MountLine]) -> Option<(CgroupVersion, Option<String>)> {
    let mut v1_count = 0usize;
    let mut v2_count = 0usize;
    let mut v2_base = None;
    for mount in mounts {
        if (mount.fs_spec == "cgroup" || mount.fs_spec == "cgroup2")
            && mount.fs_vfstype == "cgroup2"
        {
            v2_base = Some(mount.fs_file.clone());
            v2_count += 1;
        } else if mount.fs_vfstype == "cgroup" {
            v1_count += 1;
        }
    }
    if v1_count == 0 && v2_count >= 1 {
        Some((CgroupVersion::V2, v2_base))
    } else if v1_count > 0 {
        Some((CgroupVersion::V1, None))
    } else {
        None
    }
}

fn v1_controller_prefix(mounts: &[MountLine], controller: &str) -> Option<String> {
    for mount in mounts {
        if mount.fs_spec == "cgroup"
            && mount.fs_vfstype == "cgroup"
            && mount.fs_mntops.contains(controller)
        {
            if mount.fs_file.is_empty() || mount.fs_file == "/" {
                return None;
            }
            return Some(mount.fs_file.clone());
        }
    }
    None
}

struct Candidate {
    version: CgroupVersion,
    memory_path: PathBuf,
    cpuacct_path: PathBuf,
    cpuset_path: PathBuf,
    cpuacct_controller: String,
}

impl Candidate {
    fn paths(&self) -> [&PathBuf; 3] {
        // probe order: memory first, it is the controller the original
        // heuristics anchor on
        [&self.memory_path, &self.cpuacct_path, &self.cpuset_path]
    }

    /// Look for our own pid in the candidate task lists. v1 requires the
    /// pid in all three controllers; v2 has a unified hierarchy but the
    /// three paths may still differ under systemd slices, so the first one
    /// containing the pid wins. Returns the directory holding the matching
    /// process-list file.
    fn search_my_pid(&self, pid: u64) -> Option<PathBuf> {
        match self.version {
            CgroupVersion::V1 => {
                let found = self
                    .paths()
                    .iter()
                    .all(|p| search_integer_in_file(&p.join("tasks"), pid));
                found.then(|| self.memory_path.clone())
            }
            CgroupVersion::V2 => self
                .paths()
                .iter()
                .find(|p| search_integer_in_file(&p.join("cgroup.procs"), pid))
                .map(|p| (*p).clone()),
        }
    }

    fn append_relative(&mut self, memory_rel: &str, cpuacct_rel: &str, cpuset_rel: &str) {
        self.memory_path = join_relative(&self.memory_path, memory_rel);
        self.cpuacct_path = join_relative(&self.cpuacct_path, cpuacct_rel);
        self.cpuset_path = join_relative(&self.cpuset_path, cpuset_rel);
    }
}

/// Run the full detection pass and produce an immutable [`CgroupState`].
///
/// Errors mean "cgroup mode disabled": the caller logs the reason once and
/// keeps collecting baremetal statistics. There is no retry.
pub fn detect(
    logger: &slog::Logger,
    config: &DetectorConfig,
) -> std::result::Result<CgroupState, DetectError> {
    let mounts = scan_mounts(&config.proc_self_mounts)?;

    let mut candidate = match decide_version(&mounts) {
        Some((CgroupVersion::V2, base)) => {
            let base = base.ok_or(DetectError::NoCgroupMounts)?;
            let shared = prefixed(&config.fs_prefix, &base);
            debug!(logger, "detected cgroups v2 with base path {:?}", shared);
            Candidate {
                version: CgroupVersion::V2,
                memory_path: shared.clone(),
                cpuacct_path: shared.clone(),
                cpuset_path: shared,
                cpuacct_controller: String::new(),
            }
        }
        Some((CgroupVersion::V1, _)) => {
            let memory = v1_controller_prefix(&mounts, "memory")
                .ok_or_else(|| DetectError::MissingController("memory".into()))?;
            // some distributions invert the controller label
            let (cpuacct_controller, cpuacct) =
                match v1_controller_prefix(&mounts, "cpu,cpuacct") {
                    Some(path) => ("cpu,cpuacct".to_owned(), path),
                    None => (
                        "cpuacct,cpu".to_owned(),
                        v1_controller_prefix(&mounts, "cpuacct,cpu")
                            .ok_or_else(|| DetectError::MissingController("cpuacct".into()))?,
                    ),
                };
            let cpuset = v1_controller_prefix(&mounts, "cpuset")
                .ok_or_else(|| DetectError::MissingController("cpuset".into()))?;
            let candidate = Candidate {
                version: CgroupVersion::V1,
                memory_path: prefixed(&config.fs_prefix, &memory),
                cpuacct_path: prefixed(&config.fs_prefix, &cpuacct),
                cpuset_path: prefixed(&config.fs_prefix, &cpuset),
                cpuacct_controller,
            };
            debug!(
                logger,
                "detected cgroups v1";
                "memory" => ?candidate.memory_path,
                "cpuacct" => ?candidate.cpuacct_path,
                "cpuset" => ?candidate.cpuset_path
            );
            candidate
        }
        None => return Err(DetectError::NoCgroupMounts),
    };

    let (name, process_list_base) = match config.cgroup_name.as_deref() {
        None | Some("") | Some("self") => {
            resolve_self(logger, config, &mut candidate)?
        }
        Some(user_name) => resolve_named(logger, config, &mut candidate, user_name)?,
    };

    let process_list_file = match (candidate.version, config.include_threads) {
        (CgroupVersion::V1, _) => "tasks",
        (CgroupVersion::V2, true) => "cgroup.threads",
        (CgroupVersion::V2, false) => "cgroup.procs",
    };
    let process_list_path = process_list_base.join(process_list_file);

    let limits = match candidate.version {
        CgroupVersion::V1 => v1_read_limits(logger, &candidate)?,
        CgroupVersion::V2 => v2_read_limits(logger, config, &candidate),
    };

    debug!(
        logger,
        "cgroup monitoring enabled";
        "name" => &name,
        "version" => %candidate.version,
        "cpus" => %limits.allowed_cpus
    );

    Ok(CgroupState {
        version: candidate.version,
        name,
        memory_path: candidate.memory_path,
        cpuacct_path: candidate.cpuacct_path,
        cpuset_path: candidate.cpuset_path,
        cpuacct_controller: candidate.cpuacct_controller,
        process_list_path,
        limits,
    })
}

/// Monitor the cgroup the collector itself lives in. Inside Docker/LXC the
/// pid shows up directly under the absolute mount prefixes; under plain
/// systemd the per-controller relative paths from `/proc/self/cgroup` have
/// to be appended first.
fn resolve_self(
    logger: &slog::Logger,
    config: &DetectorConfig,
    candidate: &mut Candidate,
) -> std::result::Result<(String, PathBuf), DetectError> {
    let cgroup_paths = scan_self_cgroup(&config.proc_self_cgroup)?;

    let name = match candidate.version {
        CgroupVersion::V1 => cgroup_paths
            .get("name=systemd")
            .ok_or_else(|| DetectError::MissingCgroupEntry("name=systemd".into()))?
            .clone(),
        CgroupVersion::V2 => cgroup_paths
            .get("")
            .ok_or_else(|| DetectError::MissingCgroupEntry("0::".into()))?
            .clone(),
    };
    debug!(logger, "own cgroup name detected"; "name" => &name);

    if let Some(base) = candidate.search_my_pid(config.my_pid) {
        debug!(logger, "found own pid under bare controller prefixes (container case)");
        return Ok((name, base));
    }

    match candidate.version {
        CgroupVersion::V1 => {
            let memory_rel = cgroup_paths
                .get("memory")
                .ok_or_else(|| DetectError::MissingCgroupEntry("memory".into()))?;
            let cpuacct_rel = cgroup_paths
                .get(&candidate.cpuacct_controller)
                .ok_or_else(|| {
                    DetectError::MissingCgroupEntry(candidate.cpuacct_controller.clone())
                })?;
            let cpuset_rel = cgroup_paths
                .get("cpuset")
                .ok_or_else(|| DetectError::MissingCgroupEntry("cpuset".into()))?;
            candidate.append_relative(memory_rel, cpuacct_rel, cpuset_rel);
        }
        CgroupVersion::V2 => {
            candidate.append_relative(&name, &name, &name);
        }
    }
    debug!(
        logger,
        "adjusted controller paths with per-controller relative components";
        "memory" => ?candidate.memory_path,
    );

    match candidate.search_my_pid(config.my_pid) {
        Some(base) => Ok((name, base)),
        None => Err(DetectError::PidNotFound(config.my_pid)),
    }
}

/// Monitor a user-named cgroup, assumed to share this process's controller
/// mount prefixes.
fn resolve_named(
    logger: &slog::Logger,
    config: &DetectorConfig,
    candidate: &mut Candidate,
    user_name: &str,
) -> std::result::Result<(String, PathBuf), DetectError> {
    debug!(logger, "resolving user-provided cgroup name"; "name" => user_name);
    candidate.append_relative(user_name, user_name, user_name);

    if !candidate.memory_path.is_dir() {
        return Err(DetectError::NoSuchCgroup(candidate.memory_path.clone()));
    }

    let probe_file = match candidate.version {
        CgroupVersion::V1 => "tasks",
        CgroupVersion::V2 => "cgroup.procs",
    };
    let base = candidate
        .paths()
        .iter()
        .find(|p| p.join(probe_file).is_file())
        .map(|p| (*p).clone())
        .ok_or(DetectError::NoProcessListFile)?;

    Ok((user_name.to_owned(), base))
}

/// v1 limits are load-bearing: any unreadable file disables cgroup mode.
fn v1_read_limits(
    logger: &slog::Logger,
    candidate: &Candidate,
) -> std::result::Result<CgroupLimits, DetectError> {
    let memory_limit_path = candidate.memory_path.join("memory.limit_in_bytes");
    let memory_limit = read_integer_file(&memory_limit_path)
        .ok()
        .flatten()
        .ok_or_else(|| DetectError::BadLimit(memory_limit_path.clone()))?;
    if memory_limit == 0 {
        return Err(DetectError::BadLimit(memory_limit_path));
    }
    let memory_limit_bytes = if memory_limit > MEMORY_LIMIT_MAX_BYTES {
        None // a value in the exabyte range means "no limit"
    } else {
        Some(memory_limit)
    };

    let cpuset_path = candidate.cpuset_path.join("cpuset.cpus");
    let allowed_cpus = read_cpuset_file(&cpuset_path)
        .ok_or_else(|| DetectError::BadLimit(cpuset_path.clone()))?;

    let period_path = candidate.cpuacct_path.join("cpu.cfs_period_us");
    let cpu_period_us = read_integer_file(&period_path)
        .ok()
        .flatten()
        .ok_or_else(|| DetectError::BadLimit(period_path))?;

    // -1 reads as "no quota"
    let quota_path = candidate.cpuacct_path.join("cpu.cfs_quota_us");
    let cpu_quota_us = read_integer_file(&quota_path)
        .map_err(|_| DetectError::BadLimit(quota_path))?;

    debug!(
        logger,
        "v1 limits";
        "memory_limit_bytes" => ?memory_limit_bytes,
        "cpus" => %allowed_cpus,
        "quota_us" => ?cpu_quota_us,
        "period_us" => cpu_period_us
    );

    Ok(CgroupLimits {
        allowed_cpus,
        memory_limit_bytes,
        cpu_quota_us,
        cpu_period_us,
    })
}

/// v2 limit files are routinely absent (systemd user slices ship neither
/// `cpu.max` nor an effective `cpuset.cpus`); absence degrades to "no
/// limit" sentinels with a logged error rather than disabling cgroup mode.
fn v2_read_limits(
    logger: &slog::Logger,
    config: &DetectorConfig,
    candidate: &Candidate,
) -> CgroupLimits {
    let memory_max_path = candidate.memory_path.join("memory.max");
    let memory_limit_bytes = match read_integer_or_max_file(&memory_max_path) {
        Ok(limit) => limit,
        Err(_) => {
            error!(
                logger,
                "could not read memory limit from {:?}; assuming no memory limit", memory_max_path
            );
            None
        }
    };

    let cpuset_path = candidate.cpuset_path.join("cpuset.cpus");
    let allowed_cpus = match read_cpuset_file(&cpuset_path) {
        Some(cpus) if !cpus.is_empty() => cpus,
        _ => {
            error!(
                logger,
                "could not read {:?}; assuming all cpus are available: {}",
                cpuset_path,
                config.fallback_cpus
            );
            config.fallback_cpus.clone()
        }
    };

    let cpu_max_path = candidate.cpuacct_path.join("cpu.max");
    let (cpu_quota_us, cpu_period_us) = match read_cpu_max_file(&cpu_max_path) {
        Ok(pair) => pair,
        Err(_) => {
            error!(
                logger,
                "could not read {:?}; assuming no cpu limit", cpu_max_path
            );
            (None, DEFAULT_CPU_PERIOD_US)
        }
    };

    CgroupLimits {
        allowed_cpus,
        memory_limit_bytes,
        cpu_quota_us,
        cpu_period_us,
    }
}

fn read_cpuset_file(path: &Path) -> Option<Cpuset> {
    let content = std::fs::read_to_string(path).ok()?;
    Cpuset::from_str(content.trim()).ok()
}
