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

//! The sampling engine: startup plumbing (instance lock, daemonization,
//! sinks, signals), cgroup detection, header emission, the bootstrap pass
//! and the steady-state tick loop.
//!
//! Everything runs on one thread. A tick walks every enabled sampler
//! sequentially; the work is cheap pseudo-file I/O and the sampling
//! interval dominates by orders of magnitude.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use cgroupfs::CgroupAcctReader;
use cgroupfs::CgroupState;
use cgroupfs::DetectorConfig;
use common::logutil;
use common::Cpuset;
use nix::fcntl::Flock;
use nix::fcntl::FlockArg;
use output::OutputFrontend;
use procfs::ProcReader;
use slog::debug;
use slog::error;
use slog::info;

use crate::config::Config;
use crate::config::DetailLevel;
use crate::config::SampleCount;
use crate::header;
use crate::samplers::cgroup_cpu::CgroupCpuSampler;
use crate::samplers::cgroup_memory::CgroupMemorySampler;
use crate::samplers::cgroup_net::CgroupNetSampler;
use crate::samplers::processes::ProcessSampler;
use crate::samplers::system::SystemSampler;
use crate::samplers::EmitMode;

pub const EXIT_OUTPUT_DIR_UNUSABLE: i32 = 11;
pub const EXIT_OUTPUT_FILE_OPEN: i32 = 13;
pub const EXIT_DB_LOOKUP: i32 = 98;
pub const EXIT_JSON_WRITE: i32 = 99;
pub const EXIT_LOCK_CONFLICT: i32 = 255;

const PID_FILE: &str = "/var/run/cgscope.pid";
/// Granularity of the interruptible sleep between ticks.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Try to take the single-instance lock. `Err(EWOULDBLOCK)` means another
/// instance holds it. A lock file that cannot even be created
/// (unprivileged run) skips the check.
fn acquire_instance_lock(path: &str) -> Result<Option<Flock<File>>, nix::errno::Errno> {
    let file = match OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .mode(0o666)
        .open(path)
    {
        Ok(file) => file,
        Err(_) => return Ok(None),
    };
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(Some(lock)),
        Err((_, errno @ nix::errno::Errno::EWOULDBLOCK)) => Err(errno),
        Err(_) => Ok(None),
    }
}

struct CgroupMonitor {
    state: CgroupState,
    acct: CgroupAcctReader,
}

struct Engine {
    logger: slog::Logger,
    config: Config,
    out: OutputFrontend,
    proc_reader: ProcReader,
    cgroup: Option<CgroupMonitor>,
    system: SystemSampler,
    cgroup_cpu: CgroupCpuSampler,
    cgroup_memory: Option<CgroupMemorySampler>,
    cgroup_net: CgroupNetSampler,
    processes: ProcessSampler,
    terminate: Arc<AtomicBool>,
    flush_and_exit: Arc<AtomicBool>,
}

/// Run the collector to completion; the returned value is the process exit
/// code.
pub fn run(config: Config) -> i32 {
    // single-instance check comes first, before any output is touched
    let _instance_lock = if config.allow_multiple_instances {
        None
    } else {
        match acquire_instance_lock(PID_FILE) {
            Ok(lock) => lock,
            Err(_) => {
                eprintln!(
                    "{PID_FILE}: another instance is already running... aborting. \
                     Use --allow-multiple-instances to run more than one."
                );
                return EXIT_LOCK_CONFLICT;
            }
        }
    };

    if let Some(dir) = &config.output_dir {
        if std::env::set_current_dir(dir).is_err() {
            eprintln!("cannot change to output directory {}", dir.display());
            return EXIT_OUTPUT_DIR_UNUSABLE;
        }
    }

    let logger = match config.output_filename.as_str() {
        "stdout" | "none" => logutil::stderr_logger(config.debug),
        prefix => {
            let err_path = format!("{prefix}.err");
            match logutil::file_logger(Path::new(&err_path), config.debug) {
                Ok(logger) => logger,
                Err(e) => {
                    eprintln!("cannot open error log {err_path}: {e}");
                    return EXIT_OUTPUT_FILE_OPEN;
                }
            }
        }
    };

    let mut out = OutputFrontend::new(logger.clone());
    if config.output_pretty {
        out.enable_pretty_print();
    }
    if let Err(e) = out.init_json_sink(&config.output_filename) {
        eprintln!("{e}");
        return EXIT_OUTPUT_FILE_OPEN;
    }
    if let Some(remote) = &config.remote {
        if let Err(e) = out.init_influx_sink(&remote.ip, remote.port, &remote.dbname) {
            eprintln!("{e}");
            return EXIT_DB_LOOKUP;
        }
    }

    if !config.foreground {
        // detach: fork to background, keep the (possibly changed) cwd,
        // close stdio
        if let Err(e) = nix::unistd::daemon(true, false) {
            error!(logger, "failed to daemonize: {e}");
            return 1;
        }
    }

    let terminate = Arc::new(AtomicBool::new(false));
    let flush_and_exit = Arc::new(AtomicBool::new(false));
    for signal in [
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGINT,
    ] {
        if signal_hook::flag::register(signal, Arc::clone(&terminate)).is_err() {
            error!(logger, "failed to install handler for signal {signal}");
        }
    }
    for signal in [
        signal_hook::consts::SIGUSR1,
        signal_hook::consts::SIGUSR2,
    ] {
        if signal_hook::flag::register(signal, Arc::clone(&flush_and_exit)).is_err() {
            error!(logger, "failed to install handler for signal {signal}");
        }
    }

    let mut proc_reader = ProcReader::new();

    // cgroup detection: failure demotes to baremetal-only collection,
    // never aborts
    let mut config = config;
    let cgroup = if config.collect.any_cgroup() {
        let fallback_cpus: Cpuset = proc_reader
            .read_all_cpus()
            .map(Cpuset::from_cpus)
            .unwrap_or_default();
        let detector_config = DetectorConfig {
            cgroup_name: config.cgroup_name.clone(),
            include_threads: config.collect.cgroup_threads,
            fallback_cpus,
            ..Default::default()
        };
        match cgroupfs::detect(&logger, &detector_config) {
            Ok(state) => {
                let acct = CgroupAcctReader::new(&state, false);
                Some(CgroupMonitor { state, acct })
            }
            Err(e) => {
                error!(logger, "cgroup detection disabled: {e}; continuing with baremetal statistics only");
                config.collect.cgroup_cpu = false;
                config.collect.cgroup_memory = false;
                config.collect.cgroup_blkio = false;
                config.collect.cgroup_network = false;
                config.collect.cgroup_processes = false;
                config.collect.cgroup_threads = false;
                None
            }
        }
    } else {
        None
    };

    let detail = config.detail;
    let cgroup_memory = cgroup
        .as_ref()
        .map(|monitor| CgroupMemorySampler::new(monitor.state.version, detail));
    let include_threads = config.collect.cgroup_threads;
    let mut engine = Engine {
        system: SystemSampler::new(logger.clone(), detail),
        cgroup_cpu: CgroupCpuSampler::new(),
        cgroup_memory,
        cgroup_net: CgroupNetSampler::new(),
        processes: ProcessSampler::new(logger.clone(), config.score_threshold, include_threads),
        logger,
        config,
        out,
        proc_reader,
        cgroup,
        terminate,
        flush_and_exit,
    };
    engine.run_loop()
}

impl Engine {
    fn emit_header(&mut self) -> Result<(), output::Error> {
        header::emit_identity(&mut self.out);
        header::emit_collector_info(&mut self.out, &self.config);
        header::emit_os_release(&mut self.out, Path::new("/etc/os-release"));
        if let Some(monitor) = &self.cgroup {
            header::emit_cgroup_config(&mut self.out, &monitor.state);
        }
        header::emit_cpuinfo(&mut self.out, &self.logger, self.proc_reader.root());
        header::emit_custom_metadata(&mut self.out, &self.config);
        self.out.push_header()
    }

    /// Sleep up to `duration`, returning early once a signal flag is
    /// raised.
    fn interruptible_sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.terminate.load(Ordering::Relaxed)
                || self.flush_and_exit.load(Ordering::Relaxed)
            {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    /// Read the cgroup task list once per tick; shared by the network and
    /// process samplers.
    fn read_cgroup_pids(&mut self) -> Vec<i32> {
        let monitor = match self.cgroup.as_mut() {
            Some(monitor) => monitor,
            None => return Vec::new(),
        };
        match monitor.acct.read_pids() {
            Ok(pids) => pids,
            Err(e) => {
                // the cgroup may be mid-teardown; the liveness check after
                // the flush decides whether to stop
                error!(self.logger, "failed to read cgroup task list: {e}");
                Vec::new()
            }
        }
    }

    /// One pass over every enabled sampler. `emit` is `None` for the
    /// bootstrap pass.
    fn run_samplers(&mut self, elapsed: f64, emit: EmitMode) {
        let flags = self.config.collect;
        let monitored_cpus = self
            .cgroup
            .as_ref()
            .map(|monitor| monitor.state.limits.allowed_cpus.clone());

        if flags.cpu {
            self.system.sample_cpu(
                &mut self.proc_reader,
                &mut self.out,
                elapsed,
                emit,
                monitored_cpus.as_ref(),
            );
        }
        if flags.memory {
            self.system
                .sample_memory(&mut self.proc_reader, &mut self.out);
        }
        if flags.network {
            self.system
                .sample_network(&mut self.proc_reader, &mut self.out, elapsed, emit);
        }
        if flags.disk {
            self.system
                .sample_disk(&mut self.proc_reader, &mut self.out, elapsed, emit);
        }

        let need_pids =
            flags.cgroup_network || flags.cgroup_processes || flags.cgroup_threads;
        let pids = if need_pids && self.cgroup.is_some() {
            self.read_cgroup_pids()
        } else {
            Vec::new()
        };

        if let Some(monitor) = self.cgroup.as_mut() {
            if flags.cgroup_cpu {
                self.cgroup_cpu.sample(
                    &self.logger,
                    &mut monitor.acct,
                    &monitor.state,
                    &mut self.out,
                    elapsed,
                );
            }
            if flags.cgroup_memory {
                if let Some(sampler) = self.cgroup_memory.as_mut() {
                    sampler.sample(
                        &self.logger,
                        &mut monitor.acct,
                        &monitor.state,
                        &mut self.out,
                    );
                }
            }
            if flags.cgroup_network {
                self.cgroup_net.sample(
                    &self.logger,
                    &self.proc_reader,
                    &pids,
                    &mut self.out,
                    elapsed,
                    emit,
                );
            }
            if flags.cgroup_processes || flags.cgroup_threads {
                self.processes.sample(
                    &self.proc_reader,
                    &pids,
                    &monitor.state,
                    &mut self.out,
                    elapsed,
                    emit,
                );
            }
        }
    }

    fn emit_timestamp(&mut self, sample_index: u64) {
        let (local, utc) = common::util::sample_timestamps();
        self.out.psection_start("timestamp");
        self.out.pstring("datetime", &local);
        self.out.pstring("UTC", &utc);
        self.out.pulong("sample_index", sample_index);
        self.out.psection_end();
    }

    fn run_loop(&mut self) -> i32 {
        if let Err(e) = self.emit_header() {
            error!(self.logger, "failed to write header: {e}");
            return EXIT_JSON_WRITE;
        }

        // warm up, then take the bootstrap sample that seeds every delta
        // baseline; its absolute-only output is not part of the document
        let interval = Duration::from_secs(self.config.sampling_interval_secs);
        self.interruptible_sleep(interval.min(Duration::from_secs(60)));
        self.run_samplers(1.0, None);
        self.out.discard_sample();
        let mut previous_tick = Instant::now();

        debug!(
            self.logger,
            "starting sampling";
            "collecting" => self.config.collect.describe()
        );

        let mut exit_code = 0;
        let mut sample_index: u64 = 0;
        loop {
            self.interruptible_sleep(interval);
            if self.terminate.load(Ordering::Relaxed) {
                // graceful: close the document without another sample
                break;
            }
            if self.flush_and_exit.load(Ordering::Relaxed) {
                break;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(previous_tick).as_secs_f64();
            previous_tick = now;

            self.emit_timestamp(sample_index);
            // the load average is cheap and always wanted, independent of
            // the collect flags
            self.system
                .sample_loadavg(&mut self.proc_reader, &mut self.out);
            if self.config.detail == DetailLevel::All {
                self.system
                    .sample_uptime(&mut self.proc_reader, &mut self.out);
            }
            self.run_samplers(elapsed, Some(self.config.detail));

            if let Err(e) = self.out.push_sample() {
                error!(self.logger, "failed to write sample: {e}");
                exit_code = EXIT_JSON_WRITE;
                break;
            }
            sample_index += 1;

            if self.flush_and_exit.load(Ordering::Relaxed)
                || self.terminate.load(Ordering::Relaxed)
            {
                break;
            }
            match self.config.num_samples {
                SampleCount::Finite(n) if sample_index >= n => break,
                SampleCount::UntilCgroupAlive => {
                    let alive = self
                        .cgroup
                        .as_ref()
                        .map(|monitor| monitor.state.still_exists())
                        .unwrap_or(false);
                    if !alive {
                        info!(self.logger, "monitored cgroup is gone, terminating");
                        break;
                    }
                }
                _ => {}
            }
        }

        if let Err(e) = self.out.close() {
            error!(self.logger, "failed to close output: {e}");
            if exit_code == 0 {
                exit_code = EXIT_JSON_WRITE;
            }
        }
        info!(
            self.logger,
            "exiting with code {exit_code}; logged {} errors in this run",
            logutil::error_count()
        );
        exit_code
    }
}
