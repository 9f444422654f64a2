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

//! Network statistics for the monitored cgroup.
//!
//! The first pid of the cgroup is taken as representative of its network
//! namespace and `/proc/<pid>/net/dev` is read directly — no setns dance.
//! Pids can in principle live in different netns's, but with Docker, LXC
//! and kubelet every task of a cgroup shares one, so the shortcut holds.

use output::OutputFrontend;
use procfs::NetMap;
use procfs::ProcReader;
use slog::error;

use crate::samplers::system::emit_net_deltas;
use crate::samplers::EmitMode;

#[derive(Default)]
pub struct CgroupNetSampler {
    prev: NetMap,
}

impl CgroupNetSampler {
    pub fn new() -> CgroupNetSampler {
        Default::default()
    }

    pub fn sample(
        &mut self,
        logger: &slog::Logger,
        proc_reader: &ProcReader,
        pids: &[i32],
        out: &mut OutputFrontend,
        elapsed: f64,
        emit: EmitMode,
    ) {
        let first_pid = match pids.first() {
            Some(pid) => *pid,
            None => {
                error!(logger, "could not find any pid in the monitored cgroup");
                return;
            }
        };

        let stats = match proc_reader.read_pid_net_dev(first_pid) {
            Ok(stats) => stats,
            Err(e) => {
                // the representative pid may have exited between the list
                // read and now
                error!(logger, "failed to sample net/dev of pid {first_pid}: {e}");
                return;
            }
        };

        if let Some(detail) = emit {
            out.psection_start("cgroup_network");
            emit_net_deltas(out, &stats, &self.prev, elapsed, detail);
            out.psection_end();
        }

        self.prev = stats;
    }
}
