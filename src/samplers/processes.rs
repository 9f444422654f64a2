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

//! Per-process/per-thread statistics for the tasks of the monitored
//! cgroup: the "topper".
//!
//! Each tick re-enumerates the cgroup's task list, snapshots every task
//! from `/proc`, scores it against the previous tick's snapshot and emits
//! one subsection per task at or above the score threshold, in ascending
//! score order.

use std::collections::BTreeMap;

use cgroupfs::CgroupState;
use cgroupfs::CgroupVersion;
use common::util::PAGE_SIZE;
use common::util::TICKS_PER_SECOND;
use output::OutputFrontend;
use procfs::PidIo;
use procfs::PidStat;
use procfs::PidStatState;
use procfs::PidStatm;
use procfs::ProcReader;
use slog::debug;
use slog::error;

use crate::config::DetailLevel;
use crate::samplers::rate;
use crate::samplers::EmitMode;

/// Everything the collector tracks about one task, refreshed every tick.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct ProcSnapshot {
    pub uid: u32,
    pub username: Option<String>,
    pub tgid: i32,
    pub stat: PidStat,
    pub statm: Option<PidStatm>,
    pub io: PidIo,
}

/// Score a task by the CPU time it burned since the previous snapshot.
/// A negative delta on either counter (counter wrap, pid reuse) scores
/// zero. The policy is deliberately simple and lives behind this function
/// so it can be swapped out.
pub fn compute_score(current: &ProcSnapshot, previous: &ProcSnapshot, _elapsed: f64) -> u64 {
    if current.stat.utime >= previous.stat.utime && current.stat.stime >= previous.stat.stime {
        let cputime_ticks = (current.stat.utime - previous.stat.utime)
            + (current.stat.stime - previous.stat.stime);
        cputime_ticks * *TICKS_PER_SECOND
    } else {
        0
    }
}

pub struct ProcessSampler {
    logger: slog::Logger,
    // double-buffered pid database: one map holds the current tick, the
    // other the previous one; the index toggles every sample
    databases: [BTreeMap<i32, ProcSnapshot>; 2],
    current_index: usize,
    score_threshold: u64,
    include_threads: bool,
}

impl ProcessSampler {
    pub fn new(logger: slog::Logger, score_threshold: u64, include_threads: bool) -> ProcessSampler {
        ProcessSampler {
            logger,
            databases: [BTreeMap::new(), BTreeMap::new()],
            current_index: 0,
            score_threshold,
            include_threads,
        }
    }

    /// Sample the given task list. With `emit` unset this is a bootstrap
    /// pass that only fills the database.
    pub fn sample(
        &mut self,
        proc_reader: &ProcReader,
        pids: &[i32],
        state: &CgroupState,
        out: &mut OutputFrontend,
        elapsed: f64,
        emit: EmitMode,
    ) {
        let logger = &self.logger;
        let detail = emit.unwrap_or(DetailLevel::ChartOnly);

        // on v2 the choice of cgroup.procs vs cgroup.threads already
        // matches the granularity; v1's tasks file always lists tids and
        // needs post-filtering
        let filter_secondary_threads =
            state.version == CgroupVersion::V1 && !self.include_threads;

        self.current_index = 1 - self.current_index;
        let (left, right) = self.databases.split_at_mut(1);
        let (current_db, previous_db) = if self.current_index == 0 {
            (&mut left[0], &right[0])
        } else {
            (&mut right[0], &left[0])
        };

        current_db.clear();
        let mut failed = 0usize;
        let mut threads_discarded = 0usize;
        for pid in pids {
            match collect_snapshot(logger, proc_reader, *pid, self.include_threads, detail) {
                Some(snapshot) => {
                    if filter_secondary_threads && snapshot.stat.pid != snapshot.tgid {
                        threads_discarded += 1;
                        continue;
                    }
                    current_db.insert(*pid, snapshot);
                }
                None => failed += 1,
            }
        }
        debug!(
            logger,
            "process db refreshed";
            "tracked" => current_db.len(),
            "failed" => failed,
            "threads_discarded" => threads_discarded,
            "previous" => previous_db.len()
        );

        let detail = match emit {
            Some(detail) => detail,
            None => return, // bootstrap: baselines primed, nothing to emit
        };

        // order tasks by score; the (score, pid) key doubles as a multimap
        // since two tasks can tie
        let mut topper: BTreeMap<(u64, i32), (&ProcSnapshot, &ProcSnapshot)> = BTreeMap::new();
        for (pid, current) in current_db.iter() {
            // a task absent from the previous db is a new-born: no delta
            // to compute yet
            if let Some(previous) = previous_db.get(pid) {
                let score = compute_score(current, previous, elapsed);
                topper.insert((score, *pid), (current, previous));
            }
        }

        out.psection_start("cgroup_tasks");
        let mut emitted = 0usize;
        for ((score, _pid), (current, previous)) in
            topper.range((self.score_threshold, i32::MIN)..)
        {
            emit_task(out, *score, current, previous, elapsed, detail);
            emitted += 1;
        }
        out.psection_end();
        debug!(logger, "{emitted} tasks found over score threshold");
    }
}

/// Snapshot one task. `None` means the task should be dropped for this
/// tick: it vanished between enumeration and read, or a statistics file
/// could not be read.
fn collect_snapshot(
    logger: &slog::Logger,
    proc_reader: &ProcReader,
    pid: i32,
    include_threads: bool,
    detail: DetailLevel,
) -> Option<ProcSnapshot> {
    // a missing /proc/<pid> directory is not an error: the pid exited
    // after the task list was read
    let uid = proc_reader.read_task_uid(pid).ok()?;
    let username = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name);

    let stat = match proc_reader.read_task_stat(pid, include_threads) {
        Ok(stat) => stat,
        Err(e) => {
            error!(logger, "failed to read stat of task {pid}: {e}");
            return None;
        }
    };
    let statm = match detail {
        DetailLevel::All => match proc_reader.read_task_statm(pid, include_threads) {
            Ok(statm) => Some(statm),
            Err(e) => {
                error!(logger, "failed to read statm of task {pid}: {e}");
                return None;
            }
        },
        DetailLevel::ChartOnly => None,
    };
    // Tgid is the only reliable way to tell a main thread from a secondary
    // one
    let tgid = match proc_reader.read_task_status(pid, include_threads) {
        Ok(status) => status.tgid,
        Err(e) => {
            error!(logger, "failed to read status of task {pid}: {e}");
            return None;
        }
    };
    let io = match proc_reader.read_task_io(pid, include_threads) {
        Ok(io) => io,
        Err(e) => {
            error!(logger, "failed to read io of task {pid}: {e}");
            return None;
        }
    };

    Some(ProcSnapshot {
        uid,
        username,
        tgid,
        stat,
        statm,
        io,
    })
}

fn emit_task(
    out: &mut OutputFrontend,
    score: u64,
    current: &ProcSnapshot,
    previous: &ProcSnapshot,
    elapsed: f64,
    detail: DetailLevel,
) {
    let ticks = *TICKS_PER_SECOND as f64;
    let page_size = *PAGE_SIZE;
    let stat = &current.stat;

    out.psubsection_start(&format!("pid_{}", stat.pid));
    out.pulong("score", score);

    // identity
    out.pstring("cmd", &stat.comm);
    out.plong("pid", stat.pid as i64);
    out.plong("ppid", stat.ppid as i64);
    out.plong("tgid", current.tgid as i64);
    out.plong("priority", stat.priority);
    out.plong("nice", stat.nice);
    out.pstring("state", &PidStatState::from_char(stat.state).as_label());
    out.pulong("uid", current.uid as u64);
    if detail == DetailLevel::All {
        out.plong("tty_nr", stat.tty_nr as i64);
        out.plong("threads", stat.num_threads);
        out.plong("pgrp", stat.pgrp as i64);
        out.plong("session", stat.session as i64);
        if let Some(username) = &current.username {
            out.pstring("username", username);
        }
        out.pdouble("start_time_secs", stat.start_time as f64 / ticks);
    }

    // cpu: tick deltas over elapsed seconds read directly as percentages,
    // clamped at 100
    out.plong("cpu_last", stat.last_cpu as i64);
    out.pdouble(
        "cpu_usr",
        f64::min(100.0, rate(stat.utime, previous.stat.utime, elapsed)),
    );
    out.pdouble(
        "cpu_sys",
        f64::min(100.0, rate(stat.stime, previous.stat.stime, elapsed)),
    );
    // the monotonic totals feed "top of the toppers" charts
    out.pdouble("cpu_usr_total_secs", stat.utime as f64 / ticks);
    out.pdouble("cpu_sys_total_secs", stat.stime as f64 / ticks);

    // memory
    if detail == DetailLevel::All {
        if let Some(statm) = &current.statm {
            out.pulong("mem_size_kb", statm.size * page_size / 1024);
            out.pulong("mem_resident_kb", statm.resident * page_size / 1024);
            out.pulong("mem_restext_kb", statm.text * page_size / 1024);
            out.pulong("mem_resdata_kb", statm.data * page_size / 1024);
            out.pulong("mem_share_kb", statm.share * page_size / 1024);
        }
        out.pulong("mem_rss_limit_bytes", stat.rsslimit);
    }
    out.pdouble(
        "mem_minor_fault",
        rate(stat.minflt, previous.stat.minflt, elapsed),
    );
    out.pdouble(
        "mem_major_fault",
        rate(stat.majflt, previous.stat.majflt, elapsed),
    );
    out.pulong("mem_virtual_bytes", stat.vsize);
    out.pulong("mem_rss_bytes", stat.rss.max(0) as u64 * page_size);

    if detail == DetailLevel::All {
        out.pulong("swap_pages", stat.swap_pages);
        out.pulong("child_swap_pages", stat.child_swap_pages);
        out.pulong("realtime_priority", stat.rt_priority);
        out.pulong("sched_policy", stat.sched_policy);
    }

    // io
    out.pdouble(
        "io_delayacct_blkio_secs",
        stat.delayacct_blkio_ticks as f64 / ticks,
    );
    out.plong(
        "io_rchar",
        rate(current.io.rchar, previous.io.rchar, elapsed) as i64,
    );
    out.plong(
        "io_wchar",
        rate(current.io.wchar, previous.io.wchar, elapsed) as i64,
    );
    if detail == DetailLevel::All {
        out.plong(
            "io_read_bytes",
            rate(current.io.read_bytes, previous.io.read_bytes, elapsed) as i64,
        );
        out.plong(
            "io_write_bytes",
            rate(current.io.write_bytes, previous.io.write_bytes, elapsed) as i64,
        );
    }
    // monotonic totals
    out.pulong("io_total_read", current.io.rchar);
    out.pulong("io_total_write", current.io.wchar);

    out.psubsection_end();
}

#[cfg(test)]
mod tests {
    use cgroupfs::CgroupLimits;
    use output::OutputFrontend;
    use output::Section;

    use super::*;

    fn snapshot_with_times(utime: u64, stime: u64) -> ProcSnapshot {
        ProcSnapshot {
            stat: PidStat {
                utime,
                stime,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_compute_score_cpu_delta() {
        let previous = snapshot_with_times(100, 50);
        let current = snapshot_with_times(130, 60);
        // 40 ticks of cpu time scaled by the tick rate
        assert_eq!(
            compute_score(&current, &previous, 1.0),
            40 * *TICKS_PER_SECOND
        );
    }

    #[test]
    fn test_compute_score_zero_when_idle() {
        let previous = snapshot_with_times(100, 50);
        let current = snapshot_with_times(100, 50);
        assert_eq!(compute_score(&current, &previous, 1.0), 0);
    }

    #[test]
    fn test_compute_score_clamps_on_counter_regression() {
        // pid reuse: the new task has smaller counters than the old one
        let previous = snapshot_with_times(1000, 1000);
        let current = snapshot_with_times(10, 5);
        assert_eq!(compute_score(&current, &previous, 1.0), 0);
    }

    fn discard_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    struct TaskFixture<'a> {
        pid: i32,
        comm: &'a str,
        tgid: i32,
        utime: u64,
        rchar: u64,
    }

    fn write_task(dir: &tempfile::TempDir, task: &TaskFixture<'_>) {
        let base = dir.path().join(task.pid.to_string());
        std::fs::create_dir_all(&base).expect("mkdir");
        let stat = format!(
            "{pid} ({comm}) S 1 1 1 -1 0 4194560 500 0 2 0 \
             {utime} 40 0 0 20 0 1 0 3132848 189091840 1099 18446744073709551615 \
             1 1 0 0 0 0 0 0 0 0 0 0 17 2 0 0 0\n",
            pid = task.pid,
            comm = task.comm,
            utime = task.utime,
        );
        std::fs::write(base.join("stat"), stat).expect("write stat");
        std::fs::write(
            base.join("status"),
            format!("Name:\t{}\nTgid:\t{}\nPid:\t{}\n", task.comm, task.tgid, task.pid),
        )
        .expect("write status");
        std::fs::write(
            base.join("io"),
            format!(
                "rchar: {}\nwchar: 100\nread_bytes: 0\nwrite_bytes: 0\n",
                task.rchar
            ),
        )
        .expect("write io");
    }

    fn v1_state(dir: &tempfile::TempDir) -> CgroupState {
        CgroupState {
            version: CgroupVersion::V1,
            name: "/docker/test".to_owned(),
            memory_path: dir.path().to_path_buf(),
            cpuacct_path: dir.path().to_path_buf(),
            cpuset_path: dir.path().to_path_buf(),
            cpuacct_controller: "cpu,cpuacct".to_owned(),
            process_list_path: dir.path().join("tasks"),
            limits: CgroupLimits::default(),
        }
    }

    fn tasks_section(out: &OutputFrontend) -> Section {
        out.tree()
            .sections()
            .iter()
            .find(|s| s.name == "cgroup_tasks")
            .expect("cgroup_tasks section")
            .clone()
    }

    #[test]
    fn test_score_threshold_filters_idle_tasks() {
        let proc_dir = tempfile::TempDir::new().expect("tempdir");
        write_task(&proc_dir, &TaskFixture { pid: 100, comm: "busy", tgid: 100, utime: 1000, rchar: 50 });
        write_task(&proc_dir, &TaskFixture { pid: 200, comm: "idle", tgid: 200, utime: 500, rchar: 10 });
        let proc_reader = ProcReader::new_with_root(proc_dir.path().to_path_buf());
        let state = v1_state(&proc_dir);
        let mut out = OutputFrontend::new(discard_logger());
        let mut sampler = ProcessSampler::new(discard_logger(), 1, false);
        let pids = [100, 200];

        // bootstrap fills the database without emitting
        sampler.sample(&proc_reader, &pids, &state, &mut out, 1.0, None);
        assert!(out.tree().is_empty());

        // only pid 100 burns cpu between the ticks
        write_task(&proc_dir, &TaskFixture { pid: 100, comm: "busy", tgid: 100, utime: 1030, rchar: 250 });
        sampler.sample(
            &proc_reader,
            &pids,
            &state,
            &mut out,
            1.0,
            Some(DetailLevel::ChartOnly),
        );

        let tasks = tasks_section(&out);
        let names: Vec<&str> = tasks.subsections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["pid_100"]);

        let busy = &tasks.subsections[0];
        assert_eq!(busy.value_of("cmd"), Some("busy"));
        assert_eq!(busy.value_of("pid"), Some("100"));
        assert_eq!(busy.value_of("state"), Some("Sleeping-interruptible"));
        // 30 utime ticks over 1s elapsed
        assert_eq!(busy.value_of("cpu_usr"), Some("30.000"));
        assert_eq!(busy.value_of("cpu_sys"), Some("0.000"));
        assert_eq!(
            busy.value_of("score"),
            Some((30 * *TICKS_PER_SECOND).to_string().as_str())
        );
        // 200 rchar over 1s
        assert_eq!(busy.value_of("io_rchar"), Some("200"));
        assert_eq!(busy.value_of("io_total_read"), Some("250"));
        // chart-only mode omits the deep-collect fields
        assert_eq!(busy.value_of("threads"), None);
        assert_eq!(busy.value_of("io_read_bytes"), None);
    }

    #[test]
    fn test_zero_threshold_emits_in_ascending_score_order() {
        let proc_dir = tempfile::TempDir::new().expect("tempdir");
        write_task(&proc_dir, &TaskFixture { pid: 100, comm: "busy", tgid: 100, utime: 1000, rchar: 0 });
        write_task(&proc_dir, &TaskFixture { pid: 200, comm: "idle", tgid: 200, utime: 500, rchar: 0 });
        let proc_reader = ProcReader::new_with_root(proc_dir.path().to_path_buf());
        let state = v1_state(&proc_dir);
        let mut out = OutputFrontend::new(discard_logger());
        let mut sampler = ProcessSampler::new(discard_logger(), 0, false);
        let pids = [100, 200];

        sampler.sample(&proc_reader, &pids, &state, &mut out, 1.0, None);
        write_task(&proc_dir, &TaskFixture { pid: 100, comm: "busy", tgid: 100, utime: 1030, rchar: 0 });
        sampler.sample(
            &proc_reader,
            &pids,
            &state,
            &mut out,
            1.0,
            Some(DetailLevel::ChartOnly),
        );

        let tasks = tasks_section(&out);
        let names: Vec<&str> = tasks.subsections.iter().map(|s| s.name.as_str()).collect();
        // ascending score: the idle task (score 0) leads
        assert_eq!(names, vec!["pid_200", "pid_100"]);
    }

    #[test]
    fn test_v1_secondary_threads_filtered_without_include_threads() {
        let proc_dir = tempfile::TempDir::new().expect("tempdir");
        write_task(&proc_dir, &TaskFixture { pid: 100, comm: "main", tgid: 100, utime: 10, rchar: 0 });
        // a secondary thread of pid 100
        write_task(&proc_dir, &TaskFixture { pid: 101, comm: "worker", tgid: 100, utime: 10, rchar: 0 });
        let proc_reader = ProcReader::new_with_root(proc_dir.path().to_path_buf());
        let state = v1_state(&proc_dir);
        let mut out = OutputFrontend::new(discard_logger());
        let mut sampler = ProcessSampler::new(discard_logger(), 0, false);
        let pids = [100, 101];

        sampler.sample(&proc_reader, &pids, &state, &mut out, 1.0, None);
        sampler.sample(
            &proc_reader,
            &pids,
            &state,
            &mut out,
            1.0,
            Some(DetailLevel::ChartOnly),
        );

        let tasks = tasks_section(&out);
        let names: Vec<&str> = tasks.subsections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["pid_100"]);
    }

    #[test]
    fn test_vanished_and_newborn_pids() {
        let proc_dir = tempfile::TempDir::new().expect("tempdir");
        write_task(&proc_dir, &TaskFixture { pid: 100, comm: "old", tgid: 100, utime: 10, rchar: 0 });
        let proc_reader = ProcReader::new_with_root(proc_dir.path().to_path_buf());
        let state = v1_state(&proc_dir);
        let mut out = OutputFrontend::new(discard_logger());
        let mut sampler = ProcessSampler::new(discard_logger(), 0, false);

        sampler.sample(&proc_reader, &[100], &state, &mut out, 1.0, None);

        // pid 100 exits, pid 300 is born: neither has a usable delta
        std::fs::remove_dir_all(proc_dir.path().join("100")).expect("remove pid dir");
        write_task(&proc_dir, &TaskFixture { pid: 300, comm: "newborn", tgid: 300, utime: 5, rchar: 0 });
        sampler.sample(
            &proc_reader,
            &[100, 300],
            &state,
            &mut out,
            1.0,
            Some(DetailLevel::ChartOnly),
        );

        // the section still exists so every sample has the same shape
        let tasks = tasks_section(&out);
        assert!(tasks.subsections.is_empty());

        // next tick pid 300 has a baseline and is emitted
        out.push_sample().expect("flush");
        sampler.sample(
            &proc_reader,
            &[300],
            &state,
            &mut out,
            1.0,
            Some(DetailLevel::ChartOnly),
        );
        let tasks = tasks_section(&out);
        let names: Vec<&str> = tasks.subsections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["pid_300"]);
    }
}
