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

use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use slog::debug;
use slog::error;
use thiserror::Error;

mod influx;
mod json;
mod model;

pub use influx::render_lines;
pub use influx::tagset_from_header;
pub use json::JsonWriter;
pub use model::Measurement;
pub use model::SampleTree;
pub use model::Section;
pub use model::Subsection;

#[derive(Error, Debug)]
pub enum Error {
    /// JSON sink failures are fatal; the emitted document is the product.
    #[error("failed to write JSON output: {0}")]
    JsonWrite(#[source] std::io::Error),
    #[error("cannot open output file {0:?}: {1}")]
    OpenFile(PathBuf, #[source] std::io::Error),
    #[error("cannot resolve database host {0}")]
    DbResolve(String),
}

pub type Result<T> = std::result::Result<T, Error>;

const DB_POST_TIMEOUT: Duration = Duration::from_secs(5);

struct InfluxSink {
    client: reqwest::blocking::Client,
    url: String,
    tagset: String,
}

enum JsonSink {
    Disabled,
    Writer(JsonWriter<Box<dyn Write + Send>>),
}

/// The multi-sink output frontend: samplers accumulate measurements into
/// the owned [`SampleTree`] through the `p*` methods; at end of sample the
/// tree is rendered to every enabled sink and cleared.
pub struct OutputFrontend {
    logger: slog::Logger,
    tree: SampleTree,
    json: JsonSink,
    influx: Option<InfluxSink>,
    pretty: bool,
}

impl OutputFrontend {
    pub fn new(logger: slog::Logger) -> OutputFrontend {
        OutputFrontend {
            logger,
            tree: SampleTree::new(),
            json: JsonSink::Disabled,
            influx: None,
            pretty: false,
        }
    }

    /// Pretty-print the JSON document (4-space indent). Must be called
    /// before [`init_json_sink`](Self::init_json_sink).
    pub fn enable_pretty_print(&mut self) {
        self.pretty = true;
    }

    /// Open the JSON sink for `prefix`: the sentinel `stdout` streams to
    /// standard output, `none` disables the sink, anything else names a
    /// file (`.json` appended unless already present).
    pub fn init_json_sink(&mut self, prefix: &str) -> Result<Option<PathBuf>> {
        match prefix {
            "none" => {
                debug!(self.logger, "JSON sink disabled");
                self.json = JsonSink::Disabled;
                Ok(None)
            }
            "stdout" => {
                self.json = JsonSink::Writer(JsonWriter::new(
                    Box::new(std::io::stdout()),
                    self.pretty,
                ));
                Ok(None)
            }
            _ => {
                let path = if Path::new(prefix).extension().is_some_and(|e| e == "json") {
                    PathBuf::from(prefix)
                } else {
                    PathBuf::from(format!("{prefix}.json"))
                };
                let file =
                    File::create(&path).map_err(|e| Error::OpenFile(path.clone(), e))?;
                self.json = JsonSink::Writer(JsonWriter::new(
                    Box::new(BufWriter::new(file)),
                    self.pretty,
                ));
                debug!(self.logger, "opened JSON output file"; "path" => ?path);
                Ok(Some(path))
            }
        }
    }

    /// Prepare the database sink. Host resolution failures are fatal at
    /// startup (better than failing every sample later).
    pub fn init_influx_sink(&mut self, host: &str, port: u16, dbname: &str) -> Result<()> {
        let addr = format!("{host}:{port}");
        addr.to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| Error::DbResolve(host.to_owned()))?;

        let client = reqwest::blocking::Client::builder()
            .timeout(DB_POST_TIMEOUT)
            .build()
            .map_err(|_| Error::DbResolve(host.to_owned()))?;
        self.influx = Some(InfluxSink {
            client,
            url: format!("http://{host}:{port}/write?db={dbname}"),
            tagset: String::new(),
        });
        debug!(self.logger, "database sink enabled"; "host" => host, "port" => port);
        Ok(())
    }

    /// Read-only view of the in-progress sample tree.
    pub fn tree(&self) -> &SampleTree {
        &self.tree
    }

    pub fn has_json_sink(&self) -> bool {
        matches!(self.json, JsonSink::Writer(_))
    }

    pub fn has_influx_sink(&self) -> bool {
        self.influx.is_some()
    }

    // measurement-building API, forwarded to the current sample tree

    pub fn psection_start(&mut self, name: &str) {
        self.tree.section_start(name);
    }

    pub fn psection_end(&mut self) {
        self.tree.section_end();
    }

    pub fn psubsection_start(&mut self, name: &str) {
        self.tree.subsection_start(name);
    }

    pub fn psubsection_end(&mut self) {
        self.tree.subsection_end();
    }

    pub fn pstring(&mut self, name: &str, value: &str) {
        self.tree.pstring(name, value);
    }

    pub fn plong(&mut self, name: &str, value: i64) {
        self.tree.plong(name, value);
    }

    pub fn pulong(&mut self, name: &str, value: u64) {
        self.tree.pulong(name, value);
    }

    pub fn pdouble(&mut self, name: &str, value: f64) {
        self.tree.pdouble(name, value);
    }

    /// Flush the accumulated tree as the one-off `header` object. The
    /// database sink derives its tagset from the header instead of posting
    /// it.
    pub fn push_header(&mut self) -> Result<()> {
        if let JsonSink::Writer(writer) = &mut self.json {
            writer.write_header(&self.tree).map_err(Error::JsonWrite)?;
        }
        if let Some(influx) = &mut self.influx {
            influx.tagset = tagset_from_header(&self.tree);
            debug!(self.logger, "derived database tagset"; "tagset" => &influx.tagset);
        }
        self.tree.clear();
        Ok(())
    }

    /// Flush the accumulated tree as one sample. A JSON write failure is
    /// returned (fatal); a database post failure is logged and that batch
    /// dropped, the next sample proceeds.
    pub fn push_sample(&mut self) -> Result<()> {
        debug!(
            self.logger,
            "flushing sample";
            "measurements" => self.tree.measurement_count()
        );
        if let JsonSink::Writer(writer) = &mut self.json {
            writer.write_sample(&self.tree).map_err(Error::JsonWrite)?;
        }
        if let Some(influx) = &self.influx {
            let batch = render_lines(&self.tree, &influx.tagset, common::util::epoch_nanos());
            let result = influx
                .client
                .post(&influx.url)
                .body(batch)
                .send()
                .and_then(|resp| resp.error_for_status());
            if let Err(e) = result {
                error!(self.logger, "database post failed, sample dropped for this sink: {e}");
            }
        }
        self.tree.clear();
        Ok(())
    }

    /// Drop the accumulated tree without rendering it to any sink. Used
    /// after the bootstrap pass, whose absolute-only readings exist to
    /// prime delta baselines rather than to be published.
    pub fn discard_sample(&mut self) {
        self.tree.clear();
    }

    /// Terminate the JSON document. Runs on every exit path, including
    /// signal-driven ones, so the samples array is closed exactly once.
    pub fn close(&mut self) -> Result<()> {
        if let JsonSink::Writer(writer) = &mut self.json {
            writer.close().map_err(Error::JsonWrite)?;
        }
        self.json = JsonSink::Disabled;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn discard_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn push_minimal_header(frontend: &mut OutputFrontend) {
        frontend.psection_start("identity");
        frontend.pstring("hostname", "testhost");
        frontend.psection_end();
        frontend.push_header().expect("push header");
    }

    fn push_minimal_sample(frontend: &mut OutputFrontend, index: i64) {
        frontend.psection_start("timestamp");
        frontend.pstring("datetime", "2021-01-01T00:00:00");
        frontend.plong("sample_index", index);
        frontend.psection_end();
        frontend.push_sample().expect("push sample");
    }

    #[test]
    fn test_file_sink_roundtrip() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let prefix = dir.path().join("out").display().to_string();

        let mut frontend = OutputFrontend::new(discard_logger());
        let path = frontend
            .init_json_sink(&prefix)
            .expect("open sink")
            .expect("file path");
        assert!(path.to_string_lossy().ends_with("out.json"));

        push_minimal_header(&mut frontend);
        push_minimal_sample(&mut frontend, 0);
        push_minimal_sample(&mut frontend, 1);
        frontend.close().expect("close");

        let doc = std::fs::read_to_string(&path).expect("read output");
        let parsed: serde_json::Value = serde_json::from_str(&doc).expect("valid JSON");
        assert_eq!(parsed["header"]["identity"]["hostname"], "testhost");
        assert_eq!(parsed["samples"].as_array().expect("array").len(), 2);
        assert_eq!(parsed["samples"][1]["timestamp"]["sample_index"], 1);
    }

    #[test]
    fn test_json_suffix_not_doubled() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let prefix = dir.path().join("already.json").display().to_string();
        let mut frontend = OutputFrontend::new(discard_logger());
        let path = frontend
            .init_json_sink(&prefix)
            .expect("open sink")
            .expect("file path");
        assert!(path.to_string_lossy().ends_with("already.json"));
        assert!(!path.to_string_lossy().ends_with("already.json.json"));
    }

    #[test]
    fn test_none_sink_swallows_everything() {
        let mut frontend = OutputFrontend::new(discard_logger());
        assert!(frontend.init_json_sink("none").expect("init").is_none());
        assert!(!frontend.has_json_sink());
        push_minimal_header(&mut frontend);
        push_minimal_sample(&mut frontend, 0);
        frontend.close().expect("close");
    }

    #[test]
    fn test_open_failure_is_reported() {
        let mut frontend = OutputFrontend::new(discard_logger());
        match frontend.init_json_sink("/nonexistent-dir/deeper/out") {
            Err(Error::OpenFile(path, _)) => {
                assert!(path.to_string_lossy().contains("nonexistent-dir"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_db_resolution_failure() {
        let mut frontend = OutputFrontend::new(discard_logger());
        match frontend.init_influx_sink("no-such-host.invalid", 8086, "metrics") {
            Err(Error::DbResolve(host)) => assert_eq!(host, "no-such-host.invalid"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
