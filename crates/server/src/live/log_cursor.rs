//! Incremental reader for `.ralph/ralph.log`.
//!
//! Tracks the byte offset into the log so that successive reads return only
//! what was appended since the last read. Detects truncation and rewrites
//! and starts over from the beginning when it sees one.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes from the start of the file kept to detect in-place rewrites.
const PREFIX_LEN: usize = 1024;

#[derive(Debug, Default)]
pub struct LogCursor {
    /// Bytes consumed so far, including any buffered partial line.
    offset: u64,
    mtime: Option<SystemTime>,
    prefix: Vec<u8>,
    /// Trailing bytes after the last newline, held until the line completes.
    pending: Vec<u8>,
    seen: bool,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Forget everything; the next read treats the file as never seen.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn restart(&mut self) {
        self.offset = 0;
        self.pending.clear();
    }

    fn rewritten(&self, size: u64, mtime: Option<SystemTime>, prefix: &[u8]) -> bool {
        if size < self.offset {
            return true;
        }
        let overlap = self.prefix.len().min(prefix.len());
        if self.prefix[..overlap] != prefix[..overlap] {
            return true;
        }
        matches!((self.mtime, mtime), (Some(prev), Some(now)) if now < prev)
    }

    /// Read newly appended complete lines, at most `cap` bytes per call.
    ///
    /// Returns the lines with their terminators, concatenated, or `None`
    /// once nothing complete is left to read, so callers drain by calling
    /// until `None`. A file first seen larger than `cap` is read from its
    /// last `cap` bytes, starting at the first full line. The caller should
    /// [`reset`](Self::reset) on error.
    pub async fn read_appended(&mut self, path: &Path, cap: u64) -> io::Result<Option<String>> {
        let mut file = tokio::fs::File::open(path).await?;
        let meta = file.metadata().await?;
        let size = meta.len();
        let mtime = meta.modified().ok();

        let mut prefix = vec![0u8; (size as usize).min(PREFIX_LEN)];
        file.read_exact(&mut prefix).await?;

        let mut align = false;
        if !self.seen {
            self.seen = true;
            if size > cap {
                self.offset = size - cap;
                let mut before = [0u8; 1];
                file.seek(io::SeekFrom::Start(self.offset - 1)).await?;
                file.read_exact(&mut before).await?;
                align = before[0] != b'\n';
            }
        } else if self.rewritten(size, mtime, &prefix) {
            tracing::debug!(path = %path.display(), "Log truncated or rewritten; reading from start");
            self.restart();
        }
        self.mtime = mtime;
        self.prefix = prefix;

        if size <= self.offset {
            return Ok(None);
        }

        let to_read = (size - self.offset).min(cap);
        file.seek(io::SeekFrom::Start(self.offset)).await?;
        let mut buf = vec![0u8; to_read as usize];
        file.read_exact(&mut buf).await?;
        self.offset += to_read;

        if align {
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    buf.drain(..=pos);
                }
                None => buf.clear(),
            }
        }

        self.pending.extend_from_slice(&buf);
        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            // A single line longer than the cap is flushed rather than buffered forever.
            if self.pending.len() as u64 >= cap {
                let line = std::mem::take(&mut self.pending);
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            return Ok(None);
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        Ok(Some(String::from_utf8_lossy(&complete).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CAP: u64 = 256 * 1024;

    fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn reads_only_appended_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ralph.log");
        append(&path, "one\ntwo\n");

        let mut cursor = LogCursor::new();
        assert_eq!(cursor.read_appended(&path, CAP).await.unwrap().as_deref(), Some("one\ntwo\n"));
        assert_eq!(cursor.read_appended(&path, CAP).await.unwrap(), None);

        append(&path, "three\n");
        assert_eq!(cursor.read_appended(&path, CAP).await.unwrap().as_deref(), Some("three\n"));
    }

    #[tokio::test]
    async fn partial_line_is_delivered_once_complete() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ralph.log");
        append(&path, "done\nhalf");

        let mut cursor = LogCursor::new();
        assert_eq!(cursor.read_appended(&path, CAP).await.unwrap().as_deref(), Some("done\n"));
        assert_eq!(cursor.read_appended(&path, CAP).await.unwrap(), None);

        append(&path, "-way\n");
        assert_eq!(
            cursor.read_appended(&path, CAP).await.unwrap().as_deref(),
            Some("half-way\n")
        );
    }

    #[tokio::test]
    async fn truncation_resets_to_start() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ralph.log");
        append(&path, "old line one\nold line two\n");

        let mut cursor = LogCursor::new();
        cursor.read_appended(&path, CAP).await.unwrap();

        std::fs::write(&path, "").unwrap();
        assert_eq!(cursor.read_appended(&path, CAP).await.unwrap(), None);
        assert_eq!(cursor.offset(), 0);

        append(&path, "fresh\n");
        assert_eq!(cursor.read_appended(&path, CAP).await.unwrap().as_deref(), Some("fresh\n"));
    }

    #[tokio::test]
    async fn same_size_rewrite_is_detected_by_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ralph.log");
        append(&path, "aaaa\n");

        let mut cursor = LogCursor::new();
        cursor.read_appended(&path, CAP).await.unwrap();

        std::fs::write(&path, "bbbb\ncc\n").unwrap();
        assert_eq!(
            cursor.read_appended(&path, CAP).await.unwrap().as_deref(),
            Some("bbbb\ncc\n")
        );
    }

    #[tokio::test]
    async fn large_file_first_read_starts_near_end_on_line_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ralph.log");
        let mut content = String::new();
        for i in 0..100 {
            content.push_str(&format!("line-{:03}\n", i));
        }
        append(&path, &content);

        // Each line is 9 bytes; a 40-byte cap lands mid-line.
        let mut cursor = LogCursor::new();
        let text = cursor.read_appended(&path, 40).await.unwrap().unwrap();
        assert!(text.starts_with("line-"));
        assert!(text.ends_with("line-099\n"));
        assert!(text.lines().count() < 5);
    }

    #[tokio::test]
    async fn first_read_keeps_a_line_starting_at_the_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ralph.log");
        append(&path, "aaaa\nbbbb\n");

        let mut cursor = LogCursor::new();
        assert_eq!(cursor.read_appended(&path, 5).await.unwrap().as_deref(), Some("bbbb\n"));
    }

    #[tokio::test]
    async fn older_mtime_is_treated_as_a_rewrite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ralph.log");
        append(&path, "first\n");

        let mut cursor = LogCursor::new();
        cursor.read_appended(&path, CAP).await.unwrap();

        // Same prefix, longer file, but the clock went backwards.
        append(&path, "second\n");
        let earlier = SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(earlier)
            .unwrap();

        assert_eq!(
            cursor.read_appended(&path, CAP).await.unwrap().as_deref(),
            Some("first\nsecond\n")
        );
    }

    #[tokio::test]
    async fn reads_are_capped_per_call() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ralph.log");
        std::fs::write(&path, "").unwrap();

        let mut cursor = LogCursor::new();
        assert_eq!(cursor.read_appended(&path, 10).await.unwrap(), None);

        append(&path, "12345\n67890\nabcde\n");
        let mut all = String::new();
        while let Some(chunk) = cursor.read_appended(&path, 10).await.unwrap() {
            all.push_str(&chunk);
        }
        assert_eq!(all, "12345\n67890\nabcde\n");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cursor = LogCursor::new();
        assert!(cursor.read_appended(&tmp.path().join("nope.log"), CAP).await.is_err());
    }
}
