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

//! A line-oriented reader for small kernel pseudo-files that keeps its file
//! descriptor open across samples.
//!
//! `/proc` and cgroup control files are re-read once per sampling tick, for
//! thousands of ticks. Paying an `open(2)` on every tick is measurable, so
//! [`FastFileReader`] opens the file once and only rewinds it afterwards.
//! The reopen-each-time mode exists for test fixtures that swap the
//! underlying file (and thus its inode) between ticks.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

const BUFFER_CHUNK_SIZE: usize = 1 << 16;

/// Counters for [`FastFileReader::read_numeric_stats`].
#[derive(Default, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ParserStats {
    pub kept: usize,
    pub discarded: usize,
}

pub struct FastFileReader {
    path: PathBuf,
    reopen_each_time: bool,
    file: Option<File>,
    buffer: Vec<u8>,
    content_len: usize,
}

impl FastFileReader {
    pub fn new<P: Into<PathBuf>>(path: P) -> FastFileReader {
        FastFileReader {
            path: path.into(),
            reopen_each_time: false,
            file: None,
            buffer: Vec::new(),
            content_len: 0,
        }
    }

    /// Test-fixture mode: close and reopen the file on every
    /// [`open_or_rewind`](Self::open_or_rewind) instead of seeking.
    pub fn new_reopening<P: Into<PathBuf>>(path: P) -> FastFileReader {
        FastFileReader {
            reopen_each_time: true,
            ..FastFileReader::new(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the file on first use, rewind it afterwards, and slurp the
    /// current contents into the internal buffer. Fails when the file has
    /// disappeared (e.g. the cgroup was removed between ticks) or is not
    /// readable.
    pub fn open_or_rewind(&mut self) -> io::Result<()> {
        if self.reopen_each_time {
            self.file = None;
        }
        let mut file = match self.file.take() {
            Some(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                file
            }
            None => File::open(&self.path)?,
        };
        self.content_len = read_kern_file(&mut file, &mut self.buffer)?;
        self.file = Some(file);
        if std::str::from_utf8(&self.buffer[..self.content_len]).is_err() {
            self.content_len = 0;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid UTF-8 data in {}", self.path.display()),
            ));
        }
        Ok(())
    }

    /// Contents captured by the last successful
    /// [`open_or_rewind`](Self::open_or_rewind).
    pub fn contents(&self) -> &str {
        std::str::from_utf8(&self.buffer[..self.content_len]).unwrap_or("")
    }

    /// Iterate the captured contents line by line, terminators stripped.
    pub fn lines(&self) -> std::str::Lines<'_> {
        self.contents().lines()
    }

    /// Parse a flat `key[:] value [kB]` file (meminfo/vmstat style) into
    /// `out`, keeping only whitelisted keys when `whitelist` is non-empty.
    /// `kB`-suffixed values are scaled to bytes with the historical factor
    /// of 1000 (not 1024).
    pub fn read_numeric_stats(
        &mut self,
        whitelist: &std::collections::BTreeSet<String>,
        out: &mut BTreeMap<String, u64>,
    ) -> io::Result<ParserStats> {
        self.open_or_rewind()?;
        let mut stats = ParserStats::default();
        for line in self.lines() {
            let mut items = line.split_ascii_whitespace();
            let label = match items.next() {
                Some(l) => l.trim_end_matches(':'),
                None => continue,
            };
            let value = match items.next().and_then(|v| v.parse::<u64>().ok()) {
                Some(v) => v,
                None => continue,
            };
            let value = match items.next() {
                Some("kB") => value * 1000,
                _ => value,
            };
            if whitelist.is_empty() || whitelist.contains(label) {
                out.insert(label.to_owned(), value);
                stats.kept += 1;
            } else {
                stats.discarded += 1;
            }
        }
        Ok(stats)
    }
}

// Kernel files report zero size; read in chunks until EOF. A short read does
// not indicate EOF because the kernel may stop early to avoid splitting a
// line across reads.
fn read_kern_file<R: Read>(reader: &mut R, buffer: &mut Vec<u8>) -> io::Result<usize> {
    let mut total_read = 0;
    loop {
        if buffer.len() < total_read + BUFFER_CHUNK_SIZE {
            let buf_len = buffer.len();
            buffer.resize(buf_len + BUFFER_CHUNK_SIZE, 0);
        }
        match reader.read(&mut buffer[total_read..]) {
            Ok(0) => break,
            Ok(n) => total_read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total_read)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::io::Write;

    use super::*;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).expect("create fixture");
        file.write_all(content.as_bytes()).expect("write fixture");
        path
    }

    #[test]
    fn test_rewind_rereads_same_fd() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = write_file(&dir, "stat", "alpha 1\nbeta 2\n");

        let mut reader = FastFileReader::new(&path);
        reader.open_or_rewind().expect("first open");
        assert_eq!(reader.lines().collect::<Vec<_>>(), vec!["alpha 1", "beta 2"]);

        // Re-reading picks up new content through the same fd.
        std::fs::write(&path, "alpha 3\n").expect("rewrite fixture");
        reader.open_or_rewind().expect("rewind");
        assert_eq!(reader.lines().collect::<Vec<_>>(), vec!["alpha 3"]);
    }

    #[test]
    fn test_reopening_mode_tracks_inode_swap() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = write_file(&dir, "stat", "old 1\n");

        let mut reader = FastFileReader::new_reopening(&path);
        reader.open_or_rewind().expect("first open");

        // Replace the file wholesale (new inode), like unit-test fixtures do.
        std::fs::remove_file(&path).expect("remove fixture");
        write_file(&dir, "stat", "new 2\n");
        reader.open_or_rewind().expect("reopen");
        assert_eq!(reader.lines().collect::<Vec<_>>(), vec!["new 2"]);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let mut reader = FastFileReader::new(dir.path().join("gone"));
        assert!(reader.open_or_rewind().is_err());
    }

    #[test]
    fn test_read_numeric_stats_meminfo_style() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = write_file(
            &dir,
            "meminfo",
            "MemTotal:       16303692 kB\nMemFree:         6109884 kB\nHugePages_Total:       0\n",
        );

        let mut reader = FastFileReader::new(&path);
        let mut out = BTreeMap::new();
        let stats = reader
            .read_numeric_stats(&BTreeSet::new(), &mut out)
            .expect("parse");
        assert_eq!(stats, ParserStats { kept: 3, discarded: 0 });
        assert_eq!(out.get("MemTotal"), Some(&16_303_692_000));
        assert_eq!(out.get("HugePages_Total"), Some(&0));
    }

    #[test]
    fn test_read_numeric_stats_whitelist() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = write_file(&dir, "vmstat", "pgpgin 10\npgpgout 20\noom_kill 1\n");

        let mut reader = FastFileReader::new(&path);
        let mut out = BTreeMap::new();
        let whitelist: BTreeSet<String> = ["oom_kill".to_owned()].into_iter().collect();
        let stats = reader
            .read_numeric_stats(&whitelist, &mut out)
            .expect("parse");
        assert_eq!(stats, ParserStats { kept: 1, discarded: 2 });
        assert_eq!(out.len(), 1);
        assert_eq!(out.get("oom_kill"), Some(&1));
    }
}
