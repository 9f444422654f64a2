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

//! Baremetal samplers over `/proc`: per-CPU scheduler ticks, disk
//! transfers, network interfaces, memory, load average and uptime.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::process::Command;

use common::Cpuset;
use output::OutputFrontend;
use procfs::CpuTicks;
use procfs::DiskMap;
use procfs::NetMap;
use procfs::ProcReader;
use slog::debug;
use slog::error;

use crate::config::DetailLevel;
use crate::samplers::rate;
use crate::samplers::EmitMode;

/// meminfo keys kept in chart-only mode.
const CHARTED_MEMINFO_STATS: &[&str] = &["MemTotal", "MemFree", "Cached"];

pub struct SystemSampler {
    logger: slog::Logger,
    detail: DetailLevel,
    prev_cpus: BTreeMap<u32, CpuTicks>,
    prev_ctxt: u64,
    prev_forks: u64,
    prev_disks: DiskMap,
    disk_inventory_done: bool,
    prev_net: NetMap,
    net_interfaces: Option<BTreeSet<String>>,
    meminfo_whitelist: BTreeSet<String>,
}

impl SystemSampler {
    pub fn new(logger: slog::Logger, detail: DetailLevel) -> SystemSampler {
        let meminfo_whitelist = match detail {
            DetailLevel::ChartOnly => CHARTED_MEMINFO_STATS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            DetailLevel::All => BTreeSet::new(),
        };
        SystemSampler {
            logger,
            detail,
            prev_cpus: BTreeMap::new(),
            prev_ctxt: 0,
            prev_forks: 0,
            prev_disks: DiskMap::new(),
            disk_inventory_done: false,
            prev_net: NetMap::new(),
            net_interfaces: None,
            meminfo_whitelist,
        }
    }

    /// `/proc/stat`: one `cpuN` subsection per monitored CPU with tick
    /// deltas per second (which read directly as percentages on a 100 Hz
    /// kernel), plus the scalar `counters` subsection.
    pub fn sample_cpu(
        &mut self,
        proc_reader: &mut ProcReader,
        out: &mut OutputFrontend,
        elapsed: f64,
        emit: EmitMode,
        monitored_cpus: Option<&Cpuset>,
    ) {
        let stat = match proc_reader.read_stat() {
            Ok(stat) => stat,
            Err(e) => {
                error!(self.logger, "failed to sample /proc/stat: {e}");
                return;
            }
        };

        out.psection_start("stat");
        // per-CPU percentages are delta-derived and need a baseline
        if emit.is_some() {
            for (cpu_id, ticks) in &stat.cpus {
                if let Some(cpus) = monitored_cpus {
                    if !cpus.contains(*cpu_id) {
                        continue;
                    }
                }
                let prev = match self.prev_cpus.get(cpu_id) {
                    Some(prev) => prev,
                    None => continue, // CPU came online mid-run, no baseline
                };
                out.psubsection_start(&format!("cpu{cpu_id}"));
                out.pdouble("user", rate(ticks.user, prev.user, elapsed));
                out.pdouble("nice", rate(ticks.nice, prev.nice, elapsed));
                out.pdouble("sys", rate(ticks.sys, prev.sys, elapsed));
                out.pdouble("idle", rate(ticks.idle, prev.idle, elapsed));
                out.pdouble("iowait", rate(ticks.iowait, prev.iowait, elapsed));
                out.pdouble("hardirq", rate(ticks.hardirq, prev.hardirq, elapsed));
                out.pdouble("softirq", rate(ticks.softirq, prev.softirq, elapsed));
                out.pdouble("steal", rate(ticks.steal, prev.steal, elapsed));
                out.pdouble("guest", rate(ticks.guest, prev.guest, elapsed));
                out.pdouble("guestnice", rate(ticks.guestnice, prev.guestnice, elapsed));
                out.psubsection_end();
            }
        }

        // the instantaneous counters survive bootstrap suppression; only
        // the rates wait for a baseline
        out.psubsection_start("counters");
        if emit.is_some() {
            out.pdouble("ctxt", rate(stat.context_switches, self.prev_ctxt, elapsed));
        }
        out.pulong("btime", stat.boot_time_epoch_secs);
        if emit.is_some() {
            out.pdouble(
                "processes_forks",
                rate(stat.total_forks, self.prev_forks, elapsed),
            );
        }
        out.pulong("procs_running", stat.procs_running);
        out.pulong("procs_blocked", stat.procs_blocked);
        out.psubsection_end();
        out.psection_end();

        self.prev_cpus = stat.cpus;
        self.prev_ctxt = stat.context_switches;
        self.prev_forks = stat.total_forks;
    }

    /// One-off: ask lsblk which block devices exist. Informational only;
    /// `loop*` pseudo devices are already dropped at parse time.
    fn enumerate_disks(&mut self) {
        self.disk_inventory_done = true;
        let lsblk = Command::new("lsblk")
            .args(["--nodeps", "--output", "NAME,TYPE", "--raw"])
            .output();
        match lsblk {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let disks: Vec<&str> = stdout
                    .lines()
                    .skip(1) // header line
                    .filter_map(|line| line.split_ascii_whitespace().next())
                    .filter(|name| !name.starts_with("loop"))
                    .collect();
                debug!(self.logger, "found {} disks to monitor: {}", disks.len(), disks.join(","));
            }
            _ => debug!(self.logger, "lsblk not available, skipping disk inventory"),
        }
    }

    /// `/proc/diskstats`: per-device delta subsections under `disks`.
    pub fn sample_disk(
        &mut self,
        proc_reader: &mut ProcReader,
        out: &mut OutputFrontend,
        elapsed: f64,
        emit: EmitMode,
    ) {
        if !self.disk_inventory_done {
            self.enumerate_disks();
        }
        let disks = match proc_reader.read_diskstats() {
            Ok(disks) => disks,
            Err(e) => {
                error!(self.logger, "failed to sample /proc/diskstats: {e}");
                return;
            }
        };

        if let Some(detail) = emit {
            out.psection_start("disks");
            for (name, current) in &disks {
                let previous = match self.prev_disks.get(name) {
                    Some(previous) => previous,
                    None => continue, // new device, no baseline yet
                };
                out.psubsection_start(name);
                match detail {
                    DetailLevel::All => {
                        out.pdouble("reads", rate(current.reads, previous.reads, elapsed));
                        out.pdouble("rmerge", rate(current.rmerge, previous.rmerge, elapsed));
                        out.pdouble("rkb", rate(current.rkb, previous.rkb, elapsed));
                        out.pdouble("rmsec", rate(current.rmsec, previous.rmsec, elapsed));
                        out.pdouble("writes", rate(current.writes, previous.writes, elapsed));
                        out.pdouble("wmerge", rate(current.wmerge, previous.wmerge, elapsed));
                        out.pdouble("wkb", rate(current.wkb, previous.wkb, elapsed));
                        out.pdouble("wmsec", rate(current.wmsec, previous.wmsec, elapsed));
                        out.pulong("inflight", current.inflight);
                        out.pdouble("time", rate(current.time, previous.time, elapsed));
                        out.pdouble("backlog", rate(current.backlog, previous.backlog, elapsed));
                        out.pdouble("xfers", rate(current.xfers, previous.xfers, elapsed));
                        out.pulong("bsize", current.bsize);
                    }
                    DetailLevel::ChartOnly => {
                        out.pdouble("rkb", rate(current.rkb, previous.rkb, elapsed));
                        out.pdouble("wkb", rate(current.wkb, previous.wkb, elapsed));
                    }
                }
                out.psubsection_end();
            }
            out.psection_end();
        }

        self.prev_disks = disks;
    }

    /// One-off: interface inventory via getifaddrs, dropping `veth*`
    /// pseudo-interfaces and the loopback. Interfaces currently down stay
    /// in the inventory so the sample structure is stable when they come
    /// up.
    fn enumerate_interfaces(&mut self) -> BTreeSet<String> {
        let mut interfaces = BTreeSet::new();
        match nix::ifaddrs::getifaddrs() {
            Ok(addrs) => {
                for ifaddr in addrs {
                    if ifaddr.interface_name.starts_with("veth")
                        || ifaddr.interface_name == "lo"
                    {
                        continue;
                    }
                    interfaces.insert(ifaddr.interface_name);
                }
            }
            Err(e) => {
                error!(
                    self.logger,
                    "getifaddrs() failed; cannot enumerate network interfaces: {e}"
                );
            }
        }
        debug!(self.logger, "found {} network interfaces to monitor", interfaces.len());
        interfaces
    }

    /// `/proc/net/dev`: per-interface delta subsections under
    /// `network_interfaces`.
    pub fn sample_network(
        &mut self,
        proc_reader: &mut ProcReader,
        out: &mut OutputFrontend,
        elapsed: f64,
        emit: EmitMode,
    ) {
        if self.net_interfaces.is_none() {
            let inventory = self.enumerate_interfaces();
            self.net_interfaces = Some(inventory);
        }
        let whitelist = match self.net_interfaces.as_ref() {
            Some(set) if !set.is_empty() => set,
            // containers without networking end up here
            _ => return,
        };

        let stats = match proc_reader.read_net_dev(whitelist) {
            Ok(stats) => stats,
            Err(e) => {
                error!(self.logger, "failed to sample /proc/net/dev: {e}");
                return;
            }
        };

        if let Some(detail) = emit {
            out.psection_start("network_interfaces");
            emit_net_deltas(out, &stats, &self.prev_net, elapsed, detail);
            out.psection_end();
        }

        self.prev_net = stats;
    }

    /// `/proc/meminfo` (filtered in chart-only mode) and, in deep-collect
    /// mode, all of `/proc/vmstat`. Everything here is an absolute reading,
    /// so nothing is held back on the bootstrap pass.
    pub fn sample_memory(&mut self, proc_reader: &mut ProcReader, out: &mut OutputFrontend) {
        match proc_reader.read_meminfo(&self.meminfo_whitelist) {
            Ok(meminfo) => {
                out.psection_start("proc_meminfo");
                for (label, value) in &meminfo {
                    out.pulong(label, *value);
                }
                out.psection_end();
            }
            Err(e) => error!(self.logger, "failed to sample /proc/meminfo: {e}"),
        }

        if self.detail == DetailLevel::All {
            match proc_reader.read_vmstat(&BTreeSet::new()) {
                Ok(vmstat) => {
                    out.psection_start("proc_vmstat");
                    for (label, value) in &vmstat {
                        out.pulong(label, *value);
                    }
                    out.psection_end();
                }
                Err(e) => error!(self.logger, "failed to sample /proc/vmstat: {e}"),
            }
        }
    }

    /// `/proc/loadavg`, collected on every tick regardless of flags.
    pub fn sample_loadavg(&mut self, proc_reader: &mut ProcReader, out: &mut OutputFrontend) {
        match proc_reader.read_loadavg() {
            Ok(loadavg) => {
                out.psection_start("proc_loadavg");
                out.pdouble("load_avg_1min", loadavg.one_min);
                out.pdouble("load_avg_5min", loadavg.five_min);
                out.pdouble("load_avg_15min", loadavg.fifteen_min);
                out.psection_end();
            }
            Err(e) => error!(self.logger, "failed to sample /proc/loadavg: {e}"),
        }
    }

    /// `/proc/uptime`, deep-collect mode only.
    pub fn sample_uptime(&mut self, proc_reader: &mut ProcReader, out: &mut OutputFrontend) {
        match proc_reader.read_uptime() {
            Ok(uptime) => {
                let secs = uptime.total_seconds;
                out.psection_start("proc_uptime");
                out.pulong("total_seconds", secs);
                out.pulong("days", secs / (24 * 3600));
                out.pulong("hours", (secs % (24 * 3600)) / 3600);
                out.psection_end();
            }
            Err(e) => error!(self.logger, "failed to sample /proc/uptime: {e}"),
        }
    }
}

/// Shared with the cgroup network sampler: emit one subsection per
/// interface that has a previous reading.
pub fn emit_net_deltas(
    out: &mut OutputFrontend,
    stats: &NetMap,
    prev_stats: &NetMap,
    elapsed: f64,
    detail: DetailLevel,
) {
    for (name, current) in stats {
        let previous = match prev_stats.get(name) {
            Some(previous) => previous,
            None => continue, // new interface, no delta yet
        };
        out.psubsection_start(name);
        match detail {
            DetailLevel::All => {
                out.plong("ibytes", rate(current.ibytes, previous.ibytes, elapsed) as i64);
                out.plong(
                    "ipackets",
                    rate(current.ipackets, previous.ipackets, elapsed) as i64,
                );
                out.plong("ierrs", rate(current.ierrs, previous.ierrs, elapsed) as i64);
                out.plong("idrop", rate(current.idrop, previous.idrop, elapsed) as i64);
                out.plong("ififo", rate(current.ififo, previous.ififo, elapsed) as i64);
                out.plong("iframe", rate(current.iframe, previous.iframe, elapsed) as i64);
                out.plong("obytes", rate(current.obytes, previous.obytes, elapsed) as i64);
                out.plong(
                    "opackets",
                    rate(current.opackets, previous.opackets, elapsed) as i64,
                );
                out.plong("oerrs", rate(current.oerrs, previous.oerrs, elapsed) as i64);
                out.plong("odrop", rate(current.odrop, previous.odrop, elapsed) as i64);
                out.plong("ofifo", rate(current.ofifo, previous.ofifo, elapsed) as i64);
                out.plong("ocolls", rate(current.ocolls, previous.ocolls, elapsed) as i64);
                out.plong(
                    "ocarrier",
                    rate(current.ocarrier, previous.ocarrier, elapsed) as i64,
                );
            }
            DetailLevel::ChartOnly => {
                out.plong("ibytes", rate(current.ibytes, previous.ibytes, elapsed) as i64);
                out.plong("obytes", rate(current.obytes, previous.obytes, elapsed) as i64);
                out.plong(
                    "ipackets",
                    rate(current.ipackets, previous.ipackets, elapsed) as i64,
                );
                out.plong(
                    "opackets",
                    rate(current.opackets, previous.opackets, elapsed) as i64,
                );
            }
        }
        out.psubsection_end();
    }
}
