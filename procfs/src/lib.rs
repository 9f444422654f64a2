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

mod types;
pub use types::*;


#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid file format: {0:?}")]
    InvalidFileFormat(PathBuf),
    #[error("{1:?}: {0:?}")]
    IoError(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse {item} as {type_name} in line: {line} from {path:?}")]
    ParseError {
        line: String,
        item: String,
        type_name: String,
        path: PathBuf,
    },
    #[error("Unexpected line ({1}) in file: {0:?}")]
    UnexpectedLine(PathBuf, String),
}

pub type Result<T> = std::result::Result<T, Error>;

// Parse rhs (an option, usually from an iterator) into type $t or report a
// parse error carrying $line and $path otherwise.
macro_rules! parse_item {
    ($path:expr, $rhs:expr, $t:tt, $line:expr) => {
        match $rhs {
            Some(s) => s.parse::<$t>().map_err(|_| Error::ParseError {
                line: $line.to_string(),
                item: s.to_string(),
                type_name: stringify!($t).to_string(),
                path: $path.to_path_buf(),
            }),
            None => Err(Error::InvalidFileFormat($path.to_path_buf())),
        }
    };
}

/// Reader over a procfs mount.
///
/// The files re-read every sampling tick (`stat`, `diskstats`, `net/dev`,
/// `meminfo`, `vmstat`, `loadavg`, `uptime`) each keep one open
/// [`FastFileReader`]; per-pid files are opened fresh because the pid
/// population changes between ticks.
pub struct ProcReader {
    root: PathBuf,
    stat: FastFileReader,
    diskstats: FastFileReader,
    net_dev: FastFileReader,
    meminfo: FastFileReader,
    vmstat: FastFileReader,
    loadavg: FastFileReader,
    uptime: FastFileReader,
}

impl Default for ProcReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcReader {
    pub fn new() -> ProcReader {
        Self::new_with_root(Path::new("/proc").to_path_buf())
    }

    /// Read from an alternate procfs root; used by tests over fixture trees.
    pub fn new_with_root(root: PathBuf) -> ProcReader {
        ProcReader {
            stat: FastFileReader::new(root.join("stat")),
            diskstats: FastFileReader::new(root.join("diskstats")),
            net_dev: FastFileReader::new(root.join("net/dev")),
            meminfo: FastFileReader::new(root.join("meminfo")),
            vmstat: FastFileReader::new(root.join("vmstat")),
            loadavg: FastFileReader::new(root.join("loadavg")),
            uptime: FastFileReader::new(root.join("uptime")),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn rewind(reader: &mut FastFileReader) -> Result<()> {
        reader
            .open_or_rewind()
            .map_err(|e| Error::IoError(reader.path().to_path_buf(), e))
    }

    /// Read `/proc/stat`: per-CPU tick counters plus the scalar counters.
    /// The aggregate `cpu ` summary line is skipped; per-CPU deltas are what
    /// the collector reports.
    pub fn read_stat(&mut self) -> Result<Stat> {
        Self::rewind(&mut self.stat)?;
        let path = self.stat.path().to_path_buf();
        let mut stat = Stat::default();

        for line in self.stat.lines() {
            let mut items = line.split_ascii_whitespace();
            let key = match items.next() {
                Some(k) => k,
                None => continue,
            };
            match key {
                "cpu" => {} // whole-machine summary, skip
                "ctxt" => {
                    stat.context_switches = parse_item!(&path, items.next(), u64, line)?;
                }
                "btime" => {
                    stat.boot_time_epoch_secs = parse_item!(&path, items.next(), u64, line)?;
                }
                "processes" => {
                    stat.total_forks = parse_item!(&path, items.next(), u64, line)?;
                }
                "procs_running" => {
                    stat.procs_running = parse_item!(&path, items.next(), u64, line)?;
                }
                "procs_blocked" => {
                    stat.procs_blocked = parse_item!(&path, items.next(), u64, line)?;
                }
                other => {
                    if let Some(cpu_suffix) = other.strip_prefix("cpu") {
                        let cpu_id = parse_item!(&path, Some(cpu_suffix), u32, line)?;
                        let ticks = Self::parse_cpu_ticks(&path, line, &mut items)?;
                        if stat.cpus.insert(cpu_id, ticks).is_some() {
                            return Err(Error::UnexpectedLine(path, line.to_string()));
                        }
                    }
                }
            }
        }

        if stat == Stat::default() {
            Err(Error::InvalidFileFormat(path))
        } else {
            Ok(stat)
        }
    }

    fn parse_cpu_ticks<'a>(
        path: &Path,
        line: &str,
        items: &mut impl Iterator<Item = &'a str>,
    ) -> Result<CpuTicks> {
        Ok(CpuTicks {
            user: parse_item!(path, items.next(), u64, line)?,
            nice: parse_item!(path, items.next(), u64, line)?,
            sys: parse_item!(path, items.next(), u64, line)?,
            idle: parse_item!(path, items.next(), u64, line)?,
            iowait: parse_item!(path, items.next(), u64, line)?,
            hardirq: parse_item!(path, items.next(), u64, line)?,
            softirq: parse_item!(path, items.next(), u64, line)?,
            steal: parse_item!(path, items.next(), u64, line)?,
            guest: parse_item!(path, items.next(), u64, line)?,
            guestnice: parse_item!(path, items.next(), u64, line)?,
        })
    }

    /// The set of CPU ids present in `/proc/stat`. Used as the fallback for
    /// a cgroup without an effective `cpuset.cpus`.
    pub fn read_all_cpus(&mut self) -> Result<BTreeSet<u32>> {
        Ok(self.read_stat()?.cpus.keys().copied().collect())
    }

    /// Read `/proc/diskstats`. Devices named `loop*` are kernel-backed
    /// pseudo devices and are dropped here. Handles both the 14-field
    /// whole-disk layout and the historical 7-field partition layout (stats
    /// shuffled into the read/write columns, timing columns zeroed).
    pub fn read_diskstats(&mut self) -> Result<DiskMap> {
        Self::rewind(&mut self.diskstats)?;
        let path = self.diskstats.path().to_path_buf();
        let mut disks = DiskMap::new();

        for line in self.diskstats.lines() {
            let items: Vec<&str> = line.split_ascii_whitespace().collect();
            if items.len() < 7 {
                continue;
            }
            let name = items[2];
            if name.starts_with("loop") {
                continue;
            }
            let mut stat = DiskStat {
                major: parse_item!(&path, Some(items[0]), u64, line)?,
                minor: parse_item!(&path, Some(items[1]), u64, line)?,
                ..Default::default()
            };

            let numeric = &items[3..];
            let field = |i: usize| -> Result<u64> {
                parse_item!(&path, numeric.get(i).copied(), u64, line)
            };
            if numeric.len() >= 11 {
                stat.reads = field(0)?;
                stat.rmerge = field(1)?;
                stat.rkb = field(2)? / 2;
                stat.rmsec = field(3)?;
                stat.writes = field(4)?;
                stat.wmerge = field(5)?;
                stat.wkb = field(6)? / 2;
                stat.wmsec = field(7)?;
                stat.inflight = field(8)?;
                // io-ticks scaled to read as a percentage, assuming the
                // historical 10ms update cadence
                stat.time = field(9)? / 10;
                stat.backlog = field(10)?;
            } else if numeric.len() == 4 {
                // partition layout: reads, read sectors, writes, write sectors
                stat.reads = field(0)?;
                stat.rkb = field(1)? / 2;
                stat.writes = field(2)?;
                stat.wkb = field(3)? / 2;
            } else {
                return Err(Error::UnexpectedLine(path, line.to_string()));
            }

            stat.xfers = stat.reads + stat.writes;
            stat.bsize = if stat.xfers == 0 {
                0
            } else {
                ((stat.rkb + stat.wkb) / stat.xfers) * 1024
            };

            disks.insert(name.to_owned(), stat);
        }

        if disks.is_empty() {
            Err(Error::InvalidFileFormat(path))
        } else {
            Ok(disks)
        }
    }

    /// Read `/proc/net/dev`, keeping interfaces in `whitelist` (empty set =
    /// keep all). The loopback device is always dropped.
    pub fn read_net_dev(&mut self, whitelist: &BTreeSet<String>) -> Result<NetMap> {
        Self::rewind(&mut self.net_dev)?;
        let path = self.net_dev.path().to_path_buf();
        parse_net_dev(&path, self.net_dev.contents(), whitelist)
    }

    /// Read `/proc/<pid>/net/dev` — the interface counters of `pid`'s
    /// network namespace. Opened fresh each call since the representative
    /// pid may change between ticks.
    pub fn read_pid_net_dev(&self, pid: i32) -> Result<NetMap> {
        let path = self.root.join(pid.to_string()).join("net/dev");
        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::IoError(path.clone(), e))?;
        parse_net_dev(&path, &content, &BTreeSet::new())
    }

    /// Read `/proc/meminfo` filtered by `whitelist` (empty = everything).
    /// `kB` values are scaled with the historical ×1000 factor.
    pub fn read_meminfo(&mut self, whitelist: &BTreeSet<String>) -> Result<BTreeMap<String, u64>> {
        let mut out = BTreeMap::new();
        self.meminfo
            .read_numeric_stats(whitelist, &mut out)
            .map_err(|e| Error::IoError(self.meminfo.path().to_path_buf(), e))?;
        Ok(out)
    }

    /// Read `/proc/vmstat` filtered by `whitelist` (empty = everything).
    pub fn read_vmstat(&mut self, whitelist: &BTreeSet<String>) -> Result<BTreeMap<String, u64>> {
        let mut out = BTreeMap::new();
        self.vmstat
            .read_numeric_stats(whitelist, &mut out)
            .map_err(|e| Error::IoError(self.vmstat.path().to_path_buf(), e))?;
        Ok(out)
    }

    pub fn read_loadavg(&mut self) -> Result<Loadavg> {
        Self::rewind(&mut self.loadavg)?;
        let path = self.loadavg.path().to_path_buf();
        let line = self
            .loadavg
            .lines()
            .next()
            .ok_or_else(|| Error::InvalidFileFormat(path.clone()))?;
        let mut items = line.split_ascii_whitespace();
        Ok(Loadavg {
            one_min: parse_item!(&path, items.next(), f64, line)?,
            five_min: parse_item!(&path, items.next(), f64, line)?,
            fifteen_min: parse_item!(&path, items.next(), f64, line)?,
        })
    }

    pub fn read_uptime(&mut self) -> Result<Uptime> {
        Self::rewind(&mut self.uptime)?;
        let path = self.uptime.path().to_path_buf();
        let line = self
            .uptime
            .lines()
            .next()
            .ok_or_else(|| Error::InvalidFileFormat(path.clone()))?;
        let first = line.split_ascii_whitespace().next();
        let secs = parse_item!(&path, first, f64, line)?;
        Ok(Uptime {
            total_seconds: secs as u64,
        })
    }

    /// Directory holding the statistics files for one task.
    ///
    /// For a secondary thread B of process A, `/proc/B/stat` reports the
    /// whole process A, not B; only `/proc/B/task/B/stat` reports B itself.
    /// Thread-level sampling must therefore always go through `task/<pid>`,
    /// while process-level sampling reads `/proc/<pid>` directly.
    fn task_dir(&self, pid: i32, thread_level: bool) -> PathBuf {
        let mut dir = self.root.join(pid.to_string());
        if thread_level {
            dir.push("task");
            dir.push(pid.to_string());
        }
        dir
    }

    /// Owner uid of `/proc/<pid>`, which is the uid running the task.
    pub fn read_task_uid(&self, pid: i32) -> Result<u32> {
        use std::os::unix::fs::MetadataExt;
        let path = self.root.join(pid.to_string());
        let meta = std::fs::metadata(&path).map_err(|e| Error::IoError(path, e))?;
        Ok(meta.uid())
    }

    /// Parse the 42-field `/proc/<pid>/stat` layout. `comm` may contain
    /// spaces and parentheses, so the field separator is the *last* `") "`
    /// in the buffer.
    pub fn read_task_stat(&self, pid: i32, thread_level: bool) -> Result<PidStat> {
        let path = self.task_dir(pid, thread_level).join("stat");
        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::IoError(path.clone(), e))?;
        let line = content.trim_end();

        let open = line
            .find('(')
            .ok_or_else(|| Error::InvalidFileFormat(path.clone()))?;
        let close = line
            .rfind(") ")
            .ok_or_else(|| Error::InvalidFileFormat(path.clone()))?;
        if close < open {
            return Err(Error::InvalidFileFormat(path));
        }

        let mut stat = PidStat {
            pid: parse_item!(&path, Some(line[..open].trim()), i32, line)?,
            comm: line[open + 1..close].to_owned(),
            ..Default::default()
        };

        let mut items = line[close + 2..].split_ascii_whitespace();
        stat.state = parse_item!(&path, items.next(), char, line)?; /* 3 */
        stat.ppid = parse_item!(&path, items.next(), i32, line)?; /* 4 */
        stat.pgrp = parse_item!(&path, items.next(), i32, line)?; /* 5 */
        stat.session = parse_item!(&path, items.next(), i32, line)?; /* 6 */
        stat.tty_nr = parse_item!(&path, items.next(), i32, line)?; /* 7 */
        items.next(); /* 8: tpgid */
        stat.flags = parse_item!(&path, items.next(), u64, line)?; /* 9 */
        stat.minflt = parse_item!(&path, items.next(), u64, line)?; /* 10 */
        items.next(); /* 11: cminflt */
        stat.majflt = parse_item!(&path, items.next(), u64, line)?; /* 12 */
        items.next(); /* 13: cmajflt */
        stat.utime = parse_item!(&path, items.next(), u64, line)?; /* 14 */
        stat.stime = parse_item!(&path, items.next(), u64, line)?; /* 15 */
        stat.cutime = parse_item!(&path, items.next(), i64, line)?; /* 16 */
        stat.cstime = parse_item!(&path, items.next(), i64, line)?; /* 17 */
        stat.priority = parse_item!(&path, items.next(), i64, line)?; /* 18 */
        stat.nice = parse_item!(&path, items.next(), i64, line)?; /* 19 */
        stat.num_threads = parse_item!(&path, items.next(), i64, line)?; /* 20 */
        items.next(); /* 21: itrealvalue */
        stat.start_time = parse_item!(&path, items.next(), u64, line)?; /* 22 */
        stat.vsize = parse_item!(&path, items.next(), u64, line)?; /* 23 */
        stat.rss = parse_item!(&path, items.next(), i64, line)?; /* 24 */
        stat.rsslimit = parse_item!(&path, items.next(), u64, line)?; /* 25 */
        items.next(); /* 26: startcode */
        items.next(); /* 27: endcode */
        items.next(); /* 28: startstack */
        items.next(); /* 29: kstkesp */
        items.next(); /* 30: kstkeip */
        stat.signal_pending = parse_item!(&path, items.next(), u64, line)?; /* 31 */
        stat.signal_blocked = parse_item!(&path, items.next(), u64, line)?; /* 32 */
        stat.signal_ignore = parse_item!(&path, items.next(), u64, line)?; /* 33 */
        stat.signal_catch = parse_item!(&path, items.next(), u64, line)?; /* 34 */
        stat.wchan = parse_item!(&path, items.next(), u64, line)?; /* 35 */
        stat.swap_pages = parse_item!(&path, items.next(), u64, line)?; /* 36 */
        stat.child_swap_pages = parse_item!(&path, items.next(), u64, line)?; /* 37 */
        items.next(); /* 38: exit_signal */
        stat.last_cpu = parse_item!(&path, items.next(), i32, line)?; /* 39 */
        stat.rt_priority = parse_item!(&path, items.next(), u64, line)?; /* 40 */
        stat.sched_policy = parse_item!(&path, items.next(), u64, line)?; /* 41 */
        stat.delayacct_blkio_ticks = parse_item!(&path, items.next(), u64, line)?; /* 42 */

        Ok(stat)
    }

    /// Read `/proc/<pid>/statm` (seven page counts).
    pub fn read_task_statm(&self, pid: i32, thread_level: bool) -> Result<PidStatm> {
        let path = self.task_dir(pid, thread_level).join("statm");
        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::IoError(path.clone(), e))?;
        let line = content.trim_end();
        let mut items = line.split_ascii_whitespace();
        Ok(PidStatm {
            size: parse_item!(&path, items.next(), u64, line)?,
            resident: parse_item!(&path, items.next(), u64, line)?,
            share: parse_item!(&path, items.next(), u64, line)?,
            text: parse_item!(&path, items.next(), u64, line)?,
            lib: parse_item!(&path, items.next(), u64, line)?,
            data: parse_item!(&path, items.next(), u64, line)?,
            dirty: parse_item!(&path, items.next(), u64, line)?,
        })
    }

    /// Read the `Tgid:` field of `/proc/<pid>/status`. This is the only
    /// place the kernel distinguishes a main thread (tgid == pid) from a
    /// secondary thread.
    pub fn read_task_status(&self, pid: i32, thread_level: bool) -> Result<PidStatus> {
        let path = self.task_dir(pid, thread_level).join("status");
        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::IoError(path.clone(), e))?;
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("Tgid:") {
                return Ok(PidStatus {
                    tgid: parse_item!(&path, Some(rest.trim()), i32, line)?,
                });
            }
        }
        Err(Error::InvalidFileFormat(path))
    }

    /// Read `/proc/<pid>/io` counters. Missing keys are left at zero (the
    /// kernel omits them for kernel threads).
    pub fn read_task_io(&self, pid: i32, thread_level: bool) -> Result<PidIo> {
        let path = self.task_dir(pid, thread_level).join("io");
        let content =
            std::fs::read_to_string(&path).map_err(|e| Error::IoError(path.clone(), e))?;
        let mut io = PidIo::default();
        for line in content.lines() {
            let mut items = line.split_ascii_whitespace();
            match items.next() {
                Some("rchar:") => io.rchar = parse_item!(&path, items.next(), u64, line)?,
                Some("wchar:") => io.wchar = parse_item!(&path, items.next(), u64, line)?,
                Some("read_bytes:") => {
                    io.read_bytes = parse_item!(&path, items.next(), u64, line)?
                }
                Some("write_bytes:") => {
                    io.write_bytes = parse_item!(&path, items.next(), u64, line)?
                }
                _ => {}
            }
        }
        Ok(io)
    }
}

fn parse_net_dev(path: &Path, content: &str, whitelist: &BTreeSet<String>) -> Result<NetMap> {
    let mut out = NetMap::new();
    // the first two lines are the column headers
    for line in content.lines().skip(2) {
        let (name, rest) = match line.split_once(':') {
            Some(pair) => pair,
            None => return Err(Error::UnexpectedLine(path.to_path_buf(), line.to_string())),
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }
        if !whitelist.is_empty() && !whitelist.contains(name) {
            continue;
        }

        let fields: Vec<&str> = rest.split_ascii_whitespace().collect();
        if fields.len() < 16 {
            return Err(Error::UnexpectedLine(path.to_path_buf(), line.to_string()));
        }
        let field = |i: usize| -> Result<u64> { parse_item!(path, fields.get(i).copied(), u64, line) };
        out.insert(
            name.to_owned(),
            NetStat {
                ibytes: field(0)?,
                ipackets: field(1)?,
                ierrs: field(2)?,
                idrop: field(3)?,
                ififo: field(4)?,
                iframe: field(5)?,
                // 6: compressed, 7: multicast
                obytes: field(8)?,
                opackets: field(9)?,
                oerrs: field(10)?,
                odrop: field(11)?,
                ofifo: field(12)?,
                ocolls: field(13)?,
                ocarrier: field(14)?,
            },
        );
    }
    Ok(out)
}
