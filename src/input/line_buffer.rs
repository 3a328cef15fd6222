//! Byte-stream-to-line reading for a single followed file.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::warn;

use crate::config::Whence;
use crate::error::{Error, Result};
use crate::meta::SubMeta;

const READ_CHUNK_SIZE: usize = 4096;

/// How far behind the reader is, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LagInfo {
    pub size: u64,
    pub size_unit: &'static str,
}

/// Reads one logical line per call from a single file, tracking a committed
/// byte offset that is flushed through the file's [`SubMeta`].
///
/// The committed offset advances only when a line (or a completed
/// multi-line entry) is handed out, so bytes buffered or accumulated past
/// it are re-read after a restart rather than lost.
pub struct LineBuffer {
    path: PathBuf,
    sub_meta: SubMeta,
    file: Option<File>,
    /// Byte offset of everything handed out through `read_line`; the value
    /// flushed by `sync_meta`.
    offset: u64,
    /// Byte offset of everything split out of `pending`, including lines
    /// held back in an unfinished multi-line entry.
    scan_offset: u64,
    /// Bytes consumed from the file past `scan_offset`, not yet split into
    /// lines.
    pending: Vec<u8>,
    eof: bool,
    head_pattern: Option<Regex>,
    /// Accumulated multi-line entry (head-pattern mode only).
    entry: Option<String>,
    /// End offset of the accumulated entry's last physical line.
    entry_end: u64,
}

impl LineBuffer {
    /// Open `path` for following. A stored offset (clamped to the current
    /// file length) wins over `whence`; with no stored offset, `Oldest`
    /// starts at byte 0 and `Newest` at the end of the file.
    pub fn new(sub_meta: SubMeta, path: &Path, whence: Whence) -> Result<Self> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();

        let offset = match sub_meta.read_offset() {
            Some(stored) if stored <= len => stored,
            Some(stored) => {
                warn!(
                    path = %path.display(),
                    stored,
                    len,
                    "stored offset is past the end of the file, starting over"
                );
                0
            }
            None => match whence {
                Whence::Oldest => 0,
                Whence::Newest => len,
            },
        };
        file.seek(SeekFrom::Start(offset))?;

        Ok(Self {
            path: path.to_path_buf(),
            sub_meta,
            file: Some(file),
            offset,
            scan_offset: offset,
            pending: Vec::new(),
            eof: false,
            head_pattern: None,
            entry: None,
            entry_end: offset,
        })
    }

    /// Join physical lines that do not match `pattern` onto the preceding
    /// entry. Applies to lines read after the call.
    pub fn set_head_pattern(&mut self, pattern: Regex) {
        self.head_pattern = Some(pattern);
    }

    /// Return the next logical line without its terminator. An empty string
    /// means "no complete line right now"; [`reached_eof`](Self::reached_eof)
    /// tells whether the byte stream itself is exhausted.
    pub fn read_line(&mut self) -> Result<String> {
        self.eof = false;
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                self.scan_offset += raw.len() as u64;
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(|c| c == '\n' || c == '\r')
                    .to_string();

                match &self.head_pattern {
                    None => {
                        self.offset = self.scan_offset;
                        return Ok(line);
                    }
                    Some(pattern) => {
                        if pattern.is_match(&line) {
                            // a new head flushes the previous entry; the
                            // head line's own bytes stay uncommitted until
                            // its entry is handed out in turn
                            let prev_end = self.entry_end;
                            self.entry_end = self.scan_offset;
                            if let Some(prev) = self.entry.replace(line) {
                                self.offset = prev_end;
                                return Ok(prev);
                            }
                            continue;
                        }
                        match self.entry.as_mut() {
                            Some(entry) => {
                                entry.push('\n');
                                entry.push_str(&line);
                                self.entry_end = self.scan_offset;
                                continue;
                            }
                            // continuation with no open entry passes through
                            None => {
                                self.offset = self.scan_offset;
                                return Ok(line);
                            }
                        }
                    }
                }
            }

            let file = self.file.as_mut().ok_or(Error::Closed)?;
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = file.read(&mut chunk)?;
            if n == 0 {
                self.eof = true;
                if let Some(entry) = self.entry.take() {
                    self.offset = self.entry_end;
                    return Ok(entry);
                }
                return Ok(String::new());
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Whether the last `read_line` hit the end of the byte stream.
    pub fn reached_eof(&self) -> bool {
        self.eof
    }

    /// Unread bytes remaining in the file.
    pub fn lag(&self) -> Result<LagInfo> {
        let len = fs::metadata(&self.path)?.len();
        Ok(LagInfo {
            size: len.saturating_sub(self.offset),
            size_unit: "bytes",
        })
    }

    /// Flush the committed offset to this file's submeta.
    pub fn sync_meta(&self) -> Result<()> {
        self.sub_meta.write_offset(self.offset)
    }

    pub fn sub_meta(&self) -> &SubMeta {
        &self.sub_meta
    }

    /// Release the file handle. Subsequent reads return [`Error::Closed`].
    pub fn close(&mut self) {
        self.file = None;
    }
}

impl Drop for LineBuffer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::Meta;
    use std::io::Write;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir, name: &str, contents: &str) -> (SubMeta, PathBuf) {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        let meta = Meta::new("test", dir.path().join("meta")).unwrap();
        let sub = meta.new_sub_meta(&path).unwrap();
        (sub, path)
    }

    #[test]
    fn test_read_lines_then_eof() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "hello\nworld\n");

        let mut lb = LineBuffer::new(sub, &path, Whence::Oldest).unwrap();
        assert_eq!(lb.read_line().unwrap(), "hello");
        assert!(!lb.reached_eof());
        assert_eq!(lb.read_line().unwrap(), "world");
        assert_eq!(lb.read_line().unwrap(), "");
        assert!(lb.reached_eof());
    }

    #[test]
    fn test_blank_line_is_empty_but_not_eof() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "a\n\nb\n");

        let mut lb = LineBuffer::new(sub, &path, Whence::Oldest).unwrap();
        assert_eq!(lb.read_line().unwrap(), "a");
        assert_eq!(lb.read_line().unwrap(), "");
        assert!(!lb.reached_eof());
        assert_eq!(lb.read_line().unwrap(), "b");
    }

    #[test]
    fn test_crlf_terminators_are_stripped() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "one\r\ntwo\r\n");

        let mut lb = LineBuffer::new(sub, &path, Whence::Oldest).unwrap();
        assert_eq!(lb.read_line().unwrap(), "one");
        assert_eq!(lb.read_line().unwrap(), "two");
    }

    #[test]
    fn test_partial_trailing_line_waits_for_newline() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "done\npart");

        let mut lb = LineBuffer::new(sub, &path, Whence::Oldest).unwrap();
        assert_eq!(lb.read_line().unwrap(), "done");
        assert_eq!(lb.read_line().unwrap(), "");
        assert!(lb.reached_eof());

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "ial\n").unwrap();

        assert_eq!(lb.read_line().unwrap(), "partial");
    }

    #[test]
    fn test_newest_whence_skips_existing_content() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "old\n");

        let mut lb = LineBuffer::new(sub, &path, Whence::Newest).unwrap();
        assert_eq!(lb.read_line().unwrap(), "");
        assert!(lb.reached_eof());

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "new\n").unwrap();

        assert_eq!(lb.read_line().unwrap(), "new");
    }

    #[test]
    fn test_stored_offset_wins_over_whence() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "one\ntwo\n");

        {
            let mut lb = LineBuffer::new(sub.clone(), &path, Whence::Oldest).unwrap();
            assert_eq!(lb.read_line().unwrap(), "one");
            lb.sync_meta().unwrap();
        }

        let mut lb = LineBuffer::new(sub, &path, Whence::Newest).unwrap();
        assert_eq!(lb.read_line().unwrap(), "two");
    }

    #[test]
    fn test_offset_past_end_starts_over() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "short\n");
        sub.write_offset(10_000).unwrap();

        let mut lb = LineBuffer::new(sub, &path, Whence::Oldest).unwrap();
        assert_eq!(lb.read_line().unwrap(), "short");
    }

    #[test]
    fn test_head_pattern_joins_continuations() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(
            &dir,
            "a.log",
            "2024-01-01 A\n  cont\n2024-01-02 B\n",
        );

        let mut lb = LineBuffer::new(sub, &path, Whence::Oldest).unwrap();
        lb.set_head_pattern(Regex::new(r"^\d{4}-\d{2}-\d{2}").unwrap());

        assert_eq!(lb.read_line().unwrap(), "2024-01-01 A\n  cont");
        assert_eq!(lb.read_line().unwrap(), "2024-01-02 B");
        assert!(lb.reached_eof());
        assert_eq!(lb.read_line().unwrap(), "");
    }

    #[test]
    fn test_head_pattern_offset_stops_at_returned_entry() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "2024-01-01 A\n2024-01-02 B\n");

        {
            let mut lb = LineBuffer::new(sub.clone(), &path, Whence::Oldest).unwrap();
            lb.set_head_pattern(Regex::new(r"^\d{4}-\d{2}-\d{2}").unwrap());
            // both physical lines are scanned here, but only the first
            // entry is handed out
            assert_eq!(lb.read_line().unwrap(), "2024-01-01 A");
            lb.sync_meta().unwrap();
        }

        // the second entry was never handed out; a reopen from the stored
        // offset reads it again instead of dropping it
        let mut lb = LineBuffer::new(sub, &path, Whence::Oldest).unwrap();
        lb.set_head_pattern(Regex::new(r"^\d{4}-\d{2}-\d{2}").unwrap());
        assert_eq!(lb.read_line().unwrap(), "2024-01-02 B");
        assert_eq!(lb.read_line().unwrap(), "");
        assert!(lb.reached_eof());
    }

    #[test]
    fn test_lag_counts_unread_bytes() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "12345\n67890\n");

        let mut lb = LineBuffer::new(sub, &path, Whence::Oldest).unwrap();
        assert_eq!(lb.lag().unwrap().size, 12);
        assert_eq!(lb.read_line().unwrap(), "12345");
        let lag = lb.lag().unwrap();
        assert_eq!(lag.size, 6);
        assert_eq!(lag.size_unit, "bytes");
    }

    #[test]
    fn test_closed_read_errors() {
        let dir = TempDir::new().unwrap();
        let (sub, path) = fixture(&dir, "a.log", "x\n");

        let mut lb = LineBuffer::new(sub, &path, Whence::Oldest).unwrap();
        lb.close();
        assert!(matches!(lb.read_line(), Err(Error::Closed)));
    }
}
