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

//! Logger construction for the collector.
//!
//! The collector logs to `<prefix>.err` next to its JSON output (or to
//! stderr when no file sink is configured); debug mode additionally mirrors
//! every record to stdout. Error-level records bump a process-wide counter
//! that the engine reports in its shutdown line.

use std::cell::RefCell;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use slog::Drain;
use slog::Level;

static ERROR_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of error-level records logged so far by this process.
pub fn error_count() -> u64 {
    ERROR_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
pub fn reset_error_count() {
    ERROR_COUNT.store(0, Ordering::Relaxed);
}

/// Drain wrapper that drops records below `min_level` and counts
/// error-level records before forwarding the rest.
pub struct ErrorCountingDrain<D> {
    drain: D,
    min_level: Level,
}

impl<D> ErrorCountingDrain<D> {
    pub fn new(drain: D, min_level: Level) -> Self {
        Self { drain, min_level }
    }
}

impl<D> Drain for ErrorCountingDrain<D>
where
    D: Drain<Ok = ()>,
{
    type Ok = ();
    type Err = D::Err;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<Self::Ok, Self::Err> {
        if !record.level().is_at_least(self.min_level) {
            return Ok(());
        }
        if record.level().is_at_least(Level::Error) {
            ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
        }
        self.drain.log(record, values)
    }
}

/// Decorator writing each record to a primary sink and, when mirroring is
/// enabled, to stdout as well.
pub struct MirroringDecorator<W: io::Write> {
    primary: RefCell<W>,
    mirror_to_stdout: bool,
}

impl<W: io::Write> MirroringDecorator<W> {
    pub fn new(primary: W, mirror_to_stdout: bool) -> Self {
        Self {
            primary: RefCell::new(primary),
            mirror_to_stdout,
        }
    }
}

impl<W: io::Write> slog_term::Decorator for MirroringDecorator<W> {
    fn with_record<F>(
        &self,
        _record: &slog::Record,
        _logger_values: &slog::OwnedKVList,
        f: F,
    ) -> io::Result<()>
    where
        F: FnOnce(&mut dyn slog_term::RecordDecorator) -> io::Result<()>,
    {
        f(&mut MirroringRecordDecorator {
            primary: &self.primary,
            mirror_to_stdout: self.mirror_to_stdout,
        })
    }
}

struct MirroringRecordDecorator<'a, W: io::Write> {
    primary: &'a RefCell<W>,
    mirror_to_stdout: bool,
}

impl<W: io::Write> io::Write for MirroringRecordDecorator<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.mirror_to_stdout {
            let _ = io::stdout().write(buf);
        }
        self.primary.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.mirror_to_stdout {
            let _ = io::stdout().flush();
        }
        self.primary.borrow_mut().flush()
    }
}

impl<W: io::Write> Drop for MirroringRecordDecorator<'_, W> {
    fn drop(&mut self) {
        let _ = self.primary.borrow_mut().flush();
        if self.mirror_to_stdout {
            let _ = io::stdout().flush();
        }
    }
}

impl<W: io::Write> slog_term::RecordDecorator for MirroringRecordDecorator<'_, W> {
    fn reset(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn build_logger<W: io::Write + Send + 'static>(
    sink: W,
    mirror_to_stdout: bool,
    min_level: Level,
) -> slog::Logger {
    let decorator = MirroringDecorator::new(sink, mirror_to_stdout);
    let drain = slog_term::FullFormat::new(decorator).build();
    let drain = ErrorCountingDrain::new(drain, min_level);
    slog::Logger::root(Mutex::new(drain).fuse(), slog::o!())
}

/// Logger writing to `<prefix>.err`; `debug` lowers the threshold to Debug
/// and mirrors records to stdout.
pub fn file_logger(err_path: &Path, debug: bool) -> io::Result<slog::Logger> {
    let file = File::create(err_path)?;
    let min_level = if debug { Level::Debug } else { Level::Info };
    Ok(build_logger(file, debug, min_level))
}

/// Logger writing to stderr (no file sink configured).
pub fn stderr_logger(debug: bool) -> slog::Logger {
    let min_level = if debug { Level::Debug } else { Level::Info };
    build_logger(io::stderr(), false, min_level)
}

#[cfg(test)]
mod tests {
    use slog::error;
    use slog::info;

    use super::*;

    #[test]
    fn test_error_counting() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("test.err");
        let logger = file_logger(&path, false).expect("logger");

        reset_error_count();
        info!(logger, "not an error");
        error!(logger, "first error");
        error!(logger, "second error");
        assert_eq!(error_count(), 2);

        let contents = std::fs::read_to_string(&path).expect("read log");
        assert!(contents.contains("first error"));
        assert!(contents.contains("not an error"));
    }

    #[test]
    fn test_debug_threshold() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("debug.err");
        let logger = file_logger(&path, false).expect("logger");
        slog::debug!(logger, "should be filtered");
        drop(logger);
        let contents = std::fs::read_to_string(&path).expect("read log");
        assert!(!contents.contains("should be filtered"));
    }
}
