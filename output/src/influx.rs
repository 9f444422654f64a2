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

//! InfluxDB line-protocol rendering.
//!
//! One measurement per section (or per `<section>_<subsection>` pair),
//! newline separated:
//! `<name>[,<tag>=<value>...] <field>=<value>[,...] <ns-timestamp>`.
//! The tagset is derived once from the identifying header sections and
//! reused verbatim on every batch.

use crate::model::Measurement;
use crate::model::SampleTree;

/// Tag values escape commas, equals signs and spaces with a backslash.
fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ',' | '=' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

/// String field values are double-quoted; embedded quotes escape with a
/// backslash.
fn escape_field_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Build the tagset from the identifying header sections: hostname and IP
/// list, OS name, monitored cgroup name and CPU model.
pub fn tagset_from_header(header: &SampleTree) -> String {
    let mut tags: Vec<(&str, String)> = Vec::new();
    for section in header.sections() {
        match section.name.as_str() {
            "identity" => {
                if let Some(hostname) = section.value_of("hostname") {
                    tags.push(("hostname", hostname.to_owned()));
                }
                if let Some(ips) = section.value_of("all_ip_addresses") {
                    // the list is comma-joined, which would read as a tag
                    // separator
                    tags.push(("all_ip_addresses", ips.replace(',', " ")));
                }
            }
            "os_release" => {
                if let Some(name) = section.value_of("name") {
                    tags.push(("os_name", name.to_owned()));
                }
                if let Some(pretty) = section.value_of("pretty_name") {
                    tags.push(("os_pretty_name", pretty.to_owned()));
                }
            }
            "cgroup_config" => {
                if let Some(name) = section.value_of("name") {
                    tags.push(("cgroup_name", name.to_owned()));
                }
            }
            "cpuinfo" => {
                let model = section.value_of("model_name").map(str::to_owned).or_else(|| {
                    section
                        .subsections
                        .first()
                        .and_then(|sub| sub.value_of("model_name"))
                        .map(str::to_owned)
                });
                if let Some(model) = model {
                    tags.push(("cpu_model_name", model));
                }
            }
            _ => {}
        }
    }

    tags.iter()
        .map(|(name, value)| format!("{}={}", name, escape_tag_value(value)))
        .collect::<Vec<_>>()
        .join(",")
}

fn render_line(
    out: &mut String,
    measurements: &[Measurement],
    measurement_name: &str,
    tagset: &str,
    ts_nsec: u64,
) {
    out.push_str(measurement_name);
    if !tagset.is_empty() {
        out.push(',');
        out.push_str(tagset);
    }
    out.push(' ');
    for (n, m) in measurements.iter().enumerate() {
        out.push_str(&m.name);
        out.push('=');
        if m.numeric {
            out.push_str(&m.value);
        } else {
            out.push('"');
            out.push_str(&escape_field_value(&m.value));
            out.push('"');
        }
        if n + 1 != measurements.len() {
            out.push(',');
        }
    }
    out.push(' ');
    out.push_str(&ts_nsec.to_string());
}

/// Render the whole sample tree to one newline-separated batch. Sections
/// without measurements of their own flatten each subsection into a
/// `<section>_<subsection>` measurement.
pub fn render_lines(tree: &SampleTree, tagset: &str, ts_nsec: u64) -> String {
    let mut out = String::with_capacity(4096);
    let mut first = true;
    for section in tree.sections() {
        if section.measurements.is_empty() {
            for sub in &section.subsections {
                if !first {
                    out.push('\n');
                }
                first = false;
                let name = format!("{}_{}", section.name, sub.name);
                render_line(&mut out, &sub.measurements, &name, tagset, ts_nsec);
            }
        } else {
            if !first {
                out.push('\n');
            }
            first = false;
            render_line(&mut out, &section.measurements, &section.name, tagset, ts_nsec);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagset_from_header() {
        let mut header = SampleTree::new();
        header.section_start("identity");
        header.pstring("hostname", "my host");
        header.pstring("all_ip_addresses", "10.0.0.1,192.168.1.2");
        header.section_end();
        header.section_start("os_release");
        header.pstring("name", "Fedora Linux");
        header.pstring("pretty_name", "Fedora Linux 35");
        header.section_end();
        header.section_start("cgroup_config");
        header.pstring("name", "/docker/d9b85");
        header.section_end();

        let tagset = tagset_from_header(&header);
        assert_eq!(
            tagset,
            "hostname=my\\ host,all_ip_addresses=10.0.0.1\\ 192.168.1.2,\
             os_name=Fedora\\ Linux,os_pretty_name=Fedora\\ Linux\\ 35,\
             cgroup_name=/docker/d9b85"
        );
    }

    #[test]
    fn test_tagset_cpu_model_from_subsection() {
        let mut header = SampleTree::new();
        header.section_start("cpuinfo");
        header.subsection_start("proc0");
        header.pstring("model_name", "AMD EPYC 7571");
        header.subsection_end();
        header.section_end();
        assert_eq!(
            tagset_from_header(&header),
            "cpu_model_name=AMD\\ EPYC\\ 7571"
        );
    }

    #[test]
    fn test_render_flat_section() {
        let mut tree = SampleTree::new();
        tree.section_start("proc_loadavg");
        tree.pdouble("load_avg_1min", 0.5);
        tree.plong("procs", 7);
        tree.pstring("note", "say \"hi\"");
        tree.section_end();

        let lines = render_lines(&tree, "hostname=h", 1234567890);
        assert_eq!(
            lines,
            "proc_loadavg,hostname=h load_avg_1min=0.500,procs=7,note=\"say \\\"hi\\\"\" 1234567890"
        );
    }

    #[test]
    fn test_render_subsections_join_names() {
        let mut tree = SampleTree::new();
        tree.section_start("stat");
        tree.subsection_start("cpu0");
        tree.pdouble("user", 1.0);
        tree.subsection_end();
        tree.subsection_start("cpu1");
        tree.pdouble("user", 2.0);
        tree.subsection_end();
        tree.section_end();
        tree.section_start("proc_meminfo");
        tree.pulong("MemTotal", 1024);
        tree.section_end();

        let lines = render_lines(&tree, "", 42);
        let expected = "stat_cpu0 user=1.000 42\n\
                        stat_cpu1 user=2.000 42\n\
                        proc_meminfo MemTotal=1024 42";
        assert_eq!(lines, expected);
    }

    #[test]
    fn test_empty_tagset_has_no_comma() {
        let mut tree = SampleTree::new();
        tree.section_start("s");
        tree.plong("v", 1);
        tree.section_end();
        assert_eq!(render_lines(&tree, "", 7), "s v=1 7");
    }
}
