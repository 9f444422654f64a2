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

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// One `cpuN` line of `/proc/stat`. All values are cumulative scheduler
/// ticks (USER_HZ units): the per-interval delta of any field divided by
/// elapsed seconds reads directly as a percentage on a 100 Hz kernel.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CpuTicks {
    pub user: u64,
    pub nice: u64,
    pub sys: u64,
    pub idle: u64,
    pub iowait: u64,
    pub hardirq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub guestnice: u64,
}

/// Parsed `/proc/stat`: per-CPU tick counters plus the scalar counters the
/// collector reports.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Stat {
    pub cpus: BTreeMap<u32, CpuTicks>,
    pub context_switches: u64,
    pub boot_time_epoch_secs: u64,
    pub total_forks: u64,
    pub procs_running: u64,
    pub procs_blocked: u64,
}

/// One device line of `/proc/diskstats`, normalized: sector counts are
/// already converted to KiB (sectors / 2) and the io-ticks field is divided
/// by 10 so that its per-second delta reads as a percentage.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DiskStat {
    pub major: u64,
    pub minor: u64,
    pub reads: u64,
    pub rmerge: u64,
    pub rkb: u64,
    pub rmsec: u64,
    pub writes: u64,
    pub wmerge: u64,
    pub wkb: u64,
    pub wmsec: u64,
    pub inflight: u64,
    pub time: u64,
    pub backlog: u64,
    /// reads + writes
    pub xfers: u64,
    /// average transfer size in bytes: ((rkb + wkb) / xfers) * 1024, zero
    /// when no transfers happened yet
    pub bsize: u64,
}

pub type DiskMap = BTreeMap<String, DiskStat>;

/// One interface line of `/proc/net/dev` (16 numeric columns).
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct NetStat {
    pub ibytes: u64,
    pub ipackets: u64,
    pub ierrs: u64,
    pub idrop: u64,
    pub ififo: u64,
    pub iframe: u64,
    pub obytes: u64,
    pub opackets: u64,
    pub oerrs: u64,
    pub odrop: u64,
    pub ofifo: u64,
    pub ocolls: u64,
    pub ocarrier: u64,
}

pub type NetMap = BTreeMap<String, NetStat>;

/// `/proc/loadavg` run-queue averages.
#[derive(Default, Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub struct Loadavg {
    pub one_min: f64,
    pub five_min: f64,
    pub fifteen_min: f64,
}

/// `/proc/uptime` first field, whole seconds.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Uptime {
    pub total_seconds: u64,
}

/// The subset of `/proc/<pid>/stat` (42-field layout) the collector tracks.
/// Time fields are cumulative scheduler ticks; `rss` is in pages.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PidStat {
    pub pid: i32,
    pub comm: String,
    pub state: char,
    pub ppid: i32,
    pub pgrp: i32,
    pub session: i32,
    pub tty_nr: i32,
    pub flags: u64,
    pub minflt: u64,
    pub majflt: u64,
    pub utime: u64,
    pub stime: u64,
    pub cutime: i64,
    pub cstime: i64,
    pub priority: i64,
    pub nice: i64,
    pub num_threads: i64,
    pub start_time: u64,
    pub vsize: u64,
    pub rss: i64,
    pub rsslimit: u64,
    pub signal_pending: u64,
    pub signal_blocked: u64,
    pub signal_ignore: u64,
    pub signal_catch: u64,
    pub wchan: u64,
    pub swap_pages: u64,
    pub child_swap_pages: u64,
    pub last_cpu: i32,
    pub rt_priority: u64,
    pub sched_policy: u64,
    pub delayacct_blkio_ticks: u64,
}

/// Human-readable process state, decoded from the single-character state
/// field of `/proc/<pid>/stat`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum PidStatState {
    Running,
    SleepingInterruptible,
    WaitingUninterruptible,
    Zombie,
    Stopped,
    Tracing,
    PagingOrWaking,
    Dead,
    Wakekill,
    Parked,
    Idle,
    Unknown(char),
}

impl PidStatState {
    pub fn from_char(c: char) -> PidStatState {
        match c {
            'R' => PidStatState::Running,
            'S' => PidStatState::SleepingInterruptible,
            'D' => PidStatState::WaitingUninterruptible,
            'Z' => PidStatState::Zombie,
            'T' => PidStatState::Stopped,
            't' => PidStatState::Tracing,
            'W' => PidStatState::PagingOrWaking,
            'X' | 'x' => PidStatState::Dead,
            'K' => PidStatState::Wakekill,
            'I' => PidStatState::Idle,
            'P' => PidStatState::Parked,
            other => PidStatState::Unknown(other),
        }
    }

    /// The label emitted in sample output.
    pub fn as_label(&self) -> String {
        match self {
            PidStatState::Running => "Running".into(),
            PidStatState::SleepingInterruptible => "Sleeping-interruptible".into(),
            PidStatState::WaitingUninterruptible => "Waiting-uninterruptible".into(),
            PidStatState::Zombie => "Zombie".into(),
            PidStatState::Stopped => "Stopped".into(),
            PidStatState::Tracing => "Tracing".into(),
            PidStatState::PagingOrWaking => "Paging-or-Waking".into(),
            PidStatState::Dead => "Dead".into(),
            PidStatState::Wakekill => "Wakekill".into(),
            PidStatState::Idle => "Idle".into(),
            PidStatState::Parked => "Parked".into(),
            PidStatState::Unknown(c) => format!("State={}({})", *c as u32, c),
        }
    }
}

/// `/proc/<pid>/statm` (seven fields, all in pages).
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PidStatm {
    pub size: u64,
    pub resident: u64,
    pub share: u64,
    pub text: u64,
    pub lib: u64,
    pub data: u64,
    pub dirty: u64,
}

/// The `Tgid:` field of `/proc/<pid>/status`: equal to the pid for a main
/// thread, different for a secondary thread.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PidStatus {
    pub tgid: i32,
}

/// `/proc/<pid>/io` counters. `rchar`/`wchar` include page-cache traffic;
/// `read_bytes`/`write_bytes` count storage-layer traffic only.
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PidIo {
    pub rchar: u64,
    pub wchar: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}
