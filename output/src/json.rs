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

//! Streaming JSON document writer.
//!
//! The document is `{ "header": {...}, "samples": [ {...}, ... ] }` and is
//! written incrementally: one sample object per tick, never buffered whole.
//! Pretty mode indents with four spaces; compact mode drops indentation but
//! keeps the newline separators between top-level samples so the file stays
//! greppable and tail-able.

use std::io;
use std::io::Write;

use crate::model::Measurement;
use crate::model::SampleTree;

const INDENT: &str = "    ";

pub struct JsonWriter<W: Write> {
    out: W,
    pretty: bool,
    samples_written: usize,
}

impl<W: Write> JsonWriter<W> {
    pub fn new(out: W, pretty: bool) -> JsonWriter<W> {
        JsonWriter {
            out,
            pretty,
            samples_written: 0,
        }
    }

    fn indent(&mut self, depth: usize) -> io::Result<()> {
        if self.pretty {
            for _ in 0..depth {
                self.out.write_all(INDENT.as_bytes())?;
            }
        }
        Ok(())
    }

    fn newline_if_pretty(&mut self) -> io::Result<()> {
        if self.pretty {
            self.out.write_all(b"\n")?;
        }
        Ok(())
    }

    fn write_measurements(
        &mut self,
        measurements: &[Measurement],
        depth: usize,
    ) -> io::Result<()> {
        for (n, m) in measurements.iter().enumerate() {
            self.indent(depth)?;
            let key = serde_json::to_string(&m.name)?;
            self.out.write_all(key.as_bytes())?;
            self.out.write_all(b": ")?;
            if m.numeric {
                self.out.write_all(m.value.as_bytes())?;
            } else {
                let value = serde_json::to_string(&m.value)?;
                self.out.write_all(value.as_bytes())?;
            }
            if n + 1 != measurements.len() {
                self.out.write_all(b",")?;
            }
            self.newline_if_pretty()?;
        }
        Ok(())
    }

    fn write_object_start(&mut self, name: &str, depth: usize) -> io::Result<()> {
        self.indent(depth)?;
        let key = serde_json::to_string(name)?;
        self.out.write_all(key.as_bytes())?;
        self.out.write_all(b": {")?;
        self.newline_if_pretty()
    }

    fn write_object_end(&mut self, last: bool, depth: usize) -> io::Result<()> {
        self.indent(depth)?;
        let closer: &[u8] = if last { b"}" } else { b"}," };
        self.out.write_all(closer)?;
        self.newline_if_pretty()
    }

    fn write_sections(&mut self, tree: &SampleTree, depth: usize) -> io::Result<()> {
        let sections = tree.sections();
        for (idx, section) in sections.iter().enumerate() {
            self.write_object_start(&section.name, depth)?;
            if section.measurements.is_empty() {
                let n_subs = section.subsections.len();
                for (sub_idx, sub) in section.subsections.iter().enumerate() {
                    self.write_object_start(&sub.name, depth + 1)?;
                    self.write_measurements(&sub.measurements, depth + 2)?;
                    self.write_object_end(sub_idx + 1 == n_subs, depth + 1)?;
                }
            } else {
                self.write_measurements(&section.measurements, depth + 1)?;
            }
            self.write_object_end(idx + 1 == sections.len(), depth)?;
        }
        Ok(())
    }

    /// Write the document prologue: the one-off `header` object and the
    /// opening of the `samples` array.
    pub fn write_header(&mut self, tree: &SampleTree) -> io::Result<()> {
        self.out.write_all(b"{\n")?;
        self.write_object_start("header", 1)?;
        self.write_sections(tree, 2)?;
        self.indent(1)?;
        self.out.write_all(b"},\n")?;
        self.indent(1)?;
        self.out.write_all(b"\"samples\": [\n")?;
        Ok(())
    }

    pub fn write_sample(&mut self, tree: &SampleTree) -> io::Result<()> {
        if self.samples_written > 0 {
            self.out.write_all(b",\n")?;
        }
        self.indent(1)?;
        self.out.write_all(b"{")?;
        self.newline_if_pretty()?;
        self.write_sections(tree, 2)?;
        self.indent(1)?;
        self.out.write_all(b"}")?;
        self.samples_written += 1;
        self.out.flush()
    }

    /// Terminate the samples array and the document. Must run exactly once,
    /// also on signal-driven exits, so the emitted JSON stays well-formed.
    pub fn close(&mut self) -> io::Result<()> {
        self.out.write_all(b"\n")?;
        self.indent(1)?;
        self.out.write_all(b"]\n}\n")?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> SampleTree {
        let mut tree = SampleTree::new();
        tree.section_start("timestamp");
        tree.pstring("datetime", "2021-01-01T00:00:00");
        tree.plong("sample_index", 0);
        tree.section_end();
        tree.section_start("stat");
        tree.subsection_start("cpu0");
        tree.pdouble("user", 12.345678);
        tree.subsection_end();
        tree.section_end();
        tree
    }

    fn render(pretty: bool) -> String {
        let mut buf = Vec::new();
        {
            let mut writer = JsonWriter::new(&mut buf, pretty);
            let mut header = SampleTree::new();
            header.section_start("identity");
            header.pstring("hostname", "testhost");
            header.section_end();
            writer.write_header(&header).expect("header");
            writer.write_sample(&sample_tree()).expect("sample 1");
            writer.write_sample(&sample_tree()).expect("sample 2");
            writer.close().expect("close");
        }
        String::from_utf8(buf).expect("utf8 output")
    }

    #[test]
    fn test_document_is_valid_json() {
        for pretty in [false, true] {
            let doc = render(pretty);
            let parsed: serde_json::Value =
                serde_json::from_str(&doc).expect("well-formed JSON");
            assert_eq!(parsed["header"]["identity"]["hostname"], "testhost");
            let samples = parsed["samples"].as_array().expect("samples array");
            assert_eq!(samples.len(), 2);
            assert_eq!(samples[0]["timestamp"]["sample_index"], 0);
            assert_eq!(samples[1]["stat"]["cpu0"]["user"], 12.346);
        }
    }

    #[test]
    fn test_numeric_values_are_unquoted() {
        let doc = render(false);
        assert!(doc.contains("\"sample_index\": 0"));
        assert!(doc.contains("\"user\": 12.346"));
        assert!(doc.contains("\"datetime\": \"2021-01-01T00:00:00\""));
    }

    #[test]
    fn test_compact_mode_keeps_sample_newlines() {
        let doc = render(false);
        // one line per sample between the array brackets
        assert!(doc.contains("\"samples\": [\n"));
        assert!(doc.contains("},\n{"));
        assert!(!doc.contains(INDENT));
    }

    #[test]
    fn test_pretty_mode_indents() {
        let doc = render(true);
        // "header" sits at depth 1, its sections at depth 2, their
        // measurements at depth 3
        assert!(doc.contains("    \"header\": {\n"));
        assert!(doc.contains("        \"identity\": {\n"));
        assert!(doc.contains("            \"hostname\": \"testhost\"\n"));
    }

    #[test]
    fn test_string_values_are_escaped() {
        let mut buf = Vec::new();
        {
            let mut writer = JsonWriter::new(&mut buf, false);
            let mut header = SampleTree::new();
            header.section_start("identity");
            header.pstring("hostname", "quote\"back\\slash");
            header.section_end();
            writer.write_header(&header).expect("header");
            writer.write_sample(&sample_tree()).expect("sample");
            writer.close().expect("close");
        }
        let doc = String::from_utf8(buf).expect("utf8");
        let parsed: serde_json::Value = serde_json::from_str(&doc).expect("valid JSON");
        assert_eq!(parsed["header"]["identity"]["hostname"], "quote\"back\\slash");
    }

    #[test]
    fn test_empty_section_renders_as_empty_object() {
        let mut buf = Vec::new();
        {
            let mut writer = JsonWriter::new(&mut buf, false);
            let mut header = SampleTree::new();
            header.section_start("identity");
            header.pstring("hostname", "h");
            header.section_end();
            writer.write_header(&header).expect("header");

            let mut tree = SampleTree::new();
            tree.section_start("cgroup_tasks");
            tree.section_end();
            writer.write_sample(&tree).expect("sample");
            writer.close().expect("close");
        }
        let doc = String::from_utf8(buf).expect("utf8");
        let parsed: serde_json::Value = serde_json::from_str(&doc).expect("valid JSON");
        assert!(parsed["samples"][0]["cgroup_tasks"]
            .as_object()
            .expect("object")
            .is_empty());
    }
}
