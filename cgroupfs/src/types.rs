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

use std::path::PathBuf;

use common::Cpuset;
use serde::Deserialize;
use serde::Serialize;

/// Which cgroup hierarchy the monitored cgroup lives in. Hybrid mounts
/// (systemd mounting both v1 controllers and the v2 unified tree) resolve
/// to `V1`. Adding a future v3 means adding a variant and a branch in each
/// sampler.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl std::fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CgroupVersion::V1 => write!(f, "1"),
            CgroupVersion::V2 => write!(f, "2"),
        }
    }
}

/// Static limits read once at detection time.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CgroupLimits {
    pub allowed_cpus: Cpuset,
    /// None means unlimited (`max` on v2, an absurdly large value on v1)
    pub memory_limit_bytes: Option<u64>,
    /// None means unlimited (`max` on v2, `-1` on v1)
    pub cpu_quota_us: Option<u64>,
    pub cpu_period_us: u64,
}

/// Fully-resolved description of the monitored cgroup. Built once by the
/// detection pass and immutable afterwards; the only runtime check is
/// [`still_exists`](Self::still_exists).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CgroupState {
    pub version: CgroupVersion,
    /// Display name: the systemd/unified-hierarchy cgroup path or the
    /// user-provided name.
    pub name: String,
    /// Absolute controller directories. Equal under v2, distinct under v1.
    pub memory_path: PathBuf,
    pub cpuacct_path: PathBuf,
    pub cpuset_path: PathBuf,
    /// v1 controller label that resolved: `cpu,cpuacct` or `cpuacct,cpu`.
    pub cpuacct_controller: String,
    /// The file listing member tasks: `tasks` (v1), `cgroup.procs` or
    /// `cgroup.threads` (v2).
    pub process_list_path: PathBuf,
    pub limits: CgroupLimits,
}

impl CgroupState {
    /// Liveness check for `until-cgroup-alive` mode: all three controller
    /// directories must still exist.
    pub fn still_exists(&self) -> bool {
        self.memory_path.exists() && self.cpuacct_path.exists() && self.cpuset_path.exists()
    }

    pub fn is_allowed_cpu(&self, cpu: u32) -> bool {
        self.limits.allowed_cpus.contains(cpu)
    }
}
