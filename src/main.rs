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

mod config;
mod engine;
mod header;
mod samplers;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use crate::config::CollectFlags;
use crate::config::Config;
use crate::config::DetailLevel;
use crate::config::RemoteConfig;
use crate::config::SampleCount;

const EXIT_BAD_ARGUMENT: i32 = 51;
const EXIT_IP_WITHOUT_PORT: i32 = 52;
const EXIT_PORT_WITHOUT_IP: i32 = 53;
const EXIT_PROCESSES_AND_THREADS: i32 = 54;

/// A Linux performance-metrics collector that focuses sampling on the
/// resources available to a cgroup (its own, or a named one), on cgroup
/// v1, v2 and hybrid hosts.
#[derive(Parser, Debug)]
#[command(name = "cgscope", version, about)]
struct Opts {
    /// Seconds between samples of data.
    #[arg(long, short = 's', default_value_t = 60)]
    sampling_interval: u64,

    /// Number of samples to collect: a count, '0' for forever, or
    /// 'until-cgroup-alive' to stop when the monitored cgroup disappears.
    #[arg(long, short = 'c', default_value = "0")]
    num_samples: String,

    /// Comma-separated statistics families: cpu, disk, memory, network,
    /// cgroup_cpu, cgroup_memory, cgroup_blkio, cgroup_network,
    /// cgroup_processes, cgroup_threads, all_baremetal, all_cgroup, all.
    #[arg(long, short = 'C', default_value = "all")]
    collect: String,

    /// Collect all available details for the enabled families instead of
    /// only the charted subset.
    #[arg(long, short = 'e')]
    deep_collect: bool,

    /// Cgroup to monitor: 'self' (the default) monitors the cgroup this
    /// collector runs in; anything else is a path relative to the cgroup
    /// controller mounts, e.g. docker/<container-id>.
    #[arg(long, short = 'g')]
    cgroup_name: Option<String>,

    /// Minimum score for a process/thread to be included in the output;
    /// 0 disables the filter.
    #[arg(long, short = 't', default_value_t = 1)]
    score_threshold: u64,

    /// Additional key:value pairs for the header; may be repeated.
    #[arg(long, short = 'M')]
    custom_metadata: Vec<String>,

    /// Skip the single-instance lock.
    #[arg(long, short = 'k')]
    allow_multiple_instances: bool,

    /// Stay in the foreground instead of daemonizing.
    #[arg(long, short = 'F')]
    foreground: bool,

    /// Debug logging; implies --foreground.
    #[arg(long, short = 'd')]
    debug: bool,

    /// Directory the output files are written to (default: cwd).
    #[arg(long, short = 'm')]
    output_directory: Option<PathBuf>,

    /// Output file prefix, or 'stdout' / 'none'. Defaults to
    /// <hostname>_<date>_<time>.
    #[arg(long, short = 'f')]
    output_filename: Option<String>,

    /// Pretty-print the JSON document.
    #[arg(long, short = 'P')]
    output_pretty: bool,

    /// Stream samples to an InfluxDB-compatible endpoint at this address.
    #[arg(long, short = 'i')]
    remote_ip: Option<String>,

    /// Port of the remote endpoint.
    #[arg(long, short = 'p')]
    remote_port: Option<u16>,

    /// Secret for the remote endpoint (default: CGSCOPE_SECRET env var).
    #[arg(long, short = 'X')]
    remote_secret: Option<String>,

    /// Database name for the remote endpoint.
    #[arg(long, short = 'D', default_value = "cgscope")]
    remote_dbname: String,
}

fn build_config(opts: Opts) -> Config {
    let num_samples = match SampleCount::from_str(&opts.num_samples) {
        Ok(count) => count,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_BAD_ARGUMENT);
        }
    };
    let collect = match CollectFlags::from_str(&opts.collect) {
        Ok(flags) => flags,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_BAD_ARGUMENT);
        }
    };
    if collect.cgroup_processes && collect.cgroup_threads {
        eprintln!(
            "--collect=cgroup_threads already samples every process; \
             do not combine it with cgroup_processes"
        );
        std::process::exit(EXIT_PROCESSES_AND_THREADS);
    }

    let mut custom_metadata = BTreeMap::new();
    for entry in &opts.custom_metadata {
        match entry.split_once(':') {
            Some((key, value)) if !key.is_empty() => {
                custom_metadata.insert(key.to_owned(), value.to_owned());
            }
            _ => {
                eprintln!(
                    "invalid custom metadata [{entry}]; expected the form key:value"
                );
                std::process::exit(EXIT_BAD_ARGUMENT);
            }
        }
    }

    let remote = match (&opts.remote_ip, opts.remote_port) {
        (Some(ip), Some(port)) => Some(RemoteConfig {
            ip: ip.clone(),
            port,
            secret: opts
                .remote_secret
                .clone()
                .or_else(|| std::env::var("CGSCOPE_SECRET").ok())
                .unwrap_or_default(),
            dbname: opts.remote_dbname.clone(),
        }),
        (Some(ip), None) => {
            eprintln!("option --remote-ip={ip} provided but --remote-port was not");
            std::process::exit(EXIT_IP_WITHOUT_PORT);
        }
        (None, Some(port)) => {
            eprintln!("option --remote-port={port} provided but --remote-ip was not");
            std::process::exit(EXIT_PORT_WITHOUT_IP);
        }
        (None, None) => None,
    };

    Config {
        sampling_interval_secs: opts.sampling_interval.max(1),
        num_samples,
        collect,
        detail: if opts.deep_collect {
            DetailLevel::All
        } else {
            DetailLevel::ChartOnly
        },
        cgroup_name: opts.cgroup_name,
        score_threshold: opts.score_threshold,
        custom_metadata,
        allow_multiple_instances: opts.allow_multiple_instances,
        // debug stays attached to the terminal
        foreground: opts.foreground || opts.debug,
        debug: opts.debug,
        output_dir: opts.output_directory,
        output_filename: opts
            .output_filename
            .unwrap_or_else(Config::default_output_prefix),
        output_pretty: opts.output_pretty,
        remote,
    }
}

fn main() {
    let opts = Opts::parse();
    let config = build_config(opts);
    std::process::exit(engine::run(config));
}
