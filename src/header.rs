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

//! Header metadata: sections gathered once at startup and flushed as the
//! document's `header` object. The database sink derives its tagset from
//! these sections.

use std::path::Path;

use cgroupfs::CgroupState;
use output::OutputFrontend;
use slog::debug;

use crate::config::Config;
use crate::config::SampleCount;

/// Hostname, short hostname and the address of every non-virtual
/// interface.
pub fn emit_identity(out: &mut OutputFrontend) {
    out.psection_start("identity");

    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned());
    out.pstring("hostname", &hostname);
    let short = hostname.split('.').next().unwrap_or(&hostname);
    out.pstring("shorthostname", short);

    let mut all_ips: Vec<String> = Vec::new();
    if let Ok(addrs) = nix::ifaddrs::getifaddrs() {
        for ifaddr in addrs {
            if ifaddr.interface_name == "lo" || ifaddr.interface_name.starts_with("veth") {
                continue;
            }
            let Some(storage) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = storage.as_sockaddr_in() {
                let ip = sin.ip().to_string();
                out.pstring(&ifaddr.interface_name, &ip);
                all_ips.push(ip);
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                let ip = sin6.ip().to_string();
                out.pstring(&format!("{}_ipv6", ifaddr.interface_name), &ip);
                all_ips.push(ip);
            }
        }
    }
    if !all_ips.is_empty() {
        out.pstring("all_ip_addresses", &all_ips.join(","));
    }

    out.psection_end();
}

/// The collector's own identity: version, command line, sampling
/// parameters, invoking user.
pub fn emit_collector_info(out: &mut OutputFrontend, config: &Config) {
    out.psection_start("cgscope");
    out.pstring("version", env!("CARGO_PKG_VERSION"));

    let command = std::env::args().collect::<Vec<_>>().join(" ");
    out.pstring("command", &command);

    out.pdouble(
        "sample_interval_seconds",
        config.sampling_interval_secs as f64,
    );
    match config.num_samples {
        SampleCount::Forever => out.plong("sample_num", 0),
        SampleCount::Finite(n) => out.plong("sample_num", n as i64),
        SampleCount::UntilCgroupAlive => out.plong("sample_num", -1),
    }
    out.pstring("collecting", &config.collect.describe());
    out.plong("gmt_offset_seconds", common::util::gmt_offset_seconds());

    let uid = nix::unistd::getuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => out.pstring("username", &user.name),
        _ => out.pstring("username", "unknown"),
    }
    out.pulong("userid", uid.as_raw() as u64);
    out.pulong("pid", std::process::id() as u64);

    out.psection_end();
}

/// `/etc/os-release` key/value pairs, quotes stripped.
pub fn emit_os_release(out: &mut OutputFrontend, os_release_path: &Path) {
    let content = match std::fs::read_to_string(os_release_path) {
        Ok(content) => content,
        Err(_) => return, // minimal images may not ship the file
    };
    out.psection_start("os_release");
    for line in content.lines() {
        let (key, value) = match line.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        let value = value.trim_matches('"');
        match key {
            "NAME" => out.pstring("name", value),
            "VERSION" => out.pstring("version", value),
            "PRETTY_NAME" => out.pstring("pretty_name", value),
            "VERSION_ID" => out.pstring("version_id", value),
            _ => {}
        }
    }
    out.psection_end();
}

/// The resolved cgroup configuration: paths, allowed CPUs and limits.
/// Unlimited values render as -1.
pub fn emit_cgroup_config(out: &mut OutputFrontend, state: &CgroupState) {
    out.psection_start("cgroup_config");
    out.pstring("name", &state.name);
    out.pstring("version", &state.version.to_string());

    out.pstring("memory_path", &state.memory_path.display().to_string());
    out.pstring("cpuacct_path", &state.cpuacct_path.display().to_string());
    out.pstring("cpuset_path", &state.cpuset_path.display().to_string());

    out.pstring("cpus", &state.limits.allowed_cpus.to_string());
    match state.limits.cpu_quota_us {
        None => out.pdouble("cpu_quota_perc", -1.0),
        Some(quota) if state.limits.cpu_period_us > 0 => out.pdouble(
            "cpu_quota_perc",
            quota as f64 / state.limits.cpu_period_us as f64,
        ),
        Some(_) => out.pdouble("cpu_quota_perc", 0.0),
    }
    match state.limits.memory_limit_bytes {
        None => out.plong("memory_limit_bytes", -1),
        Some(limit) => out.pulong("memory_limit_bytes", limit),
    }
    out.psection_end();
}

/// `/proc/cpuinfo`, one subsection per processor with the fields worth
/// charting.
pub fn emit_cpuinfo(out: &mut OutputFrontend, logger: &slog::Logger, proc_root: &Path) {
    let path = proc_root.join("cpuinfo");
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            debug!(logger, "cannot read {:?}: {e}", path);
            return;
        }
    };

    out.psection_start("cpuinfo");
    let mut in_processor = false;
    for line in content.lines() {
        let (key, value) = match line.split_once(':') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => continue,
        };
        match key {
            "processor" => {
                if in_processor {
                    out.psubsection_end();
                }
                out.psubsection_start(&format!("proc{value}"));
                in_processor = true;
            }
            _ if !in_processor => {}
            "vendor_id" => out.pstring("vendor_id", value),
            "model name" => out.pstring("model_name", value),
            "cpu MHz" => {
                if let Ok(mhz) = value.parse::<f64>() {
                    out.pdouble("cpu_mhz", mhz);
                }
            }
            "cache size" => out.pstring("cache_size", value),
            "physical id" => {
                if let Ok(id) = value.parse::<i64>() {
                    out.plong("physical_id", id);
                }
            }
            "siblings" => {
                if let Ok(n) = value.parse::<i64>() {
                    out.plong("siblings", n);
                }
            }
            "core id" => {
                if let Ok(id) = value.parse::<i64>() {
                    out.plong("core_id", id);
                }
            }
            "cpu cores" => {
                if let Ok(n) = value.parse::<i64>() {
                    out.plong("cpu_cores", n);
                }
            }
            _ => {}
        }
    }
    if in_processor {
        out.psubsection_end();
    }
    out.psection_end();
}

/// User-supplied `key:value` metadata, verbatim.
pub fn emit_custom_metadata(out: &mut OutputFrontend, config: &Config) {
    if config.custom_metadata.is_empty() {
        return;
    }
    out.psection_start("custom_metadata");
    for (key, value) in &config.custom_metadata {
        out.pstring(key, value);
    }
    out.psection_end();
}
