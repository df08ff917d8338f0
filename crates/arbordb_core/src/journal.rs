//! The root journal.
//!
//! An append-only UTF-8 text file with one line per durable head:
//!
//! ```text
//! <segment-uuid>.<offset-hex4> root <unix-millis>\n
//! ```
//!
//! The journal is the source of truth for the latest committed root: on
//! open, lines are tried newest to oldest and the first line whose root
//! segment still resolves becomes the head. The legacy
//! `<segment-uuid>:<decimal-offset>` record id form is accepted on read.

use crate::error::Result;
use crate::record::RecordId;
use crate::tracker::SegmentTracker;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Conventional file name of the journal.
pub const JOURNAL_FILE_NAME: &str = "journal.log";

/// Returns the current wall-clock time in Unix milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

/// Appends head lines to the journal.
pub struct JournalWriter {
    file: File,
}

impl JournalWriter {
    /// Opens the journal for appending, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self { file })
    }

    /// Appends one head line and forces it to disk.
    ///
    /// This is the durability point of a flush: once this returns, the
    /// head is the root any re-open will adopt.
    pub fn append(&mut self, head: &RecordId, timestamp_millis: u64) -> Result<()> {
        writeln!(self.file, "{head} root {timestamp_millis}")?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for JournalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalWriter").finish_non_exhaustive()
    }
}

/// Reads journal lines, newest first.
pub struct JournalReader {
    /// Lines in reverse file order.
    lines: Vec<String>,
}

impl JournalReader {
    /// Loads the journal. A missing file yields an empty reader.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self { lines: Vec::new() });
        }
        let content = std::fs::read_to_string(path)?;
        let lines = content
            .lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        Ok(Self { lines })
    }

    /// Iterates the recorded heads, newest first, skipping lines whose
    /// record id does not parse.
    pub fn heads<'a>(
        &'a self,
        tracker: &'a SegmentTracker,
    ) -> impl Iterator<Item = RecordId> + 'a {
        self.lines.iter().filter_map(|line| {
            let token = line.split_whitespace().next()?;
            RecordId::parse(tracker, token).ok()
        })
    }

    /// Returns the raw lines, newest first.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// Rewrites the journal to hold a single head line.
///
/// A legal maintenance operation after compaction: older revisions are
/// gone anyway once their segments are reclaimed.
pub fn truncate_to_head(path: impl AsRef<Path>, head: &RecordId) -> Result<()> {
    let line = format!("{head} root {}\n", unix_millis());
    std::fs::write(path.as_ref(), line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record_id(tracker: &SegmentTracker) -> RecordId {
        RecordId::new(tracker.new_data_id(), 0x40)
    }

    #[test]
    fn append_then_read_newest_first() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);
        let tracker = SegmentTracker::new();

        let first = record_id(&tracker);
        let second = record_id(&tracker);
        let mut writer = JournalWriter::open(&path).unwrap();
        writer.append(&first, 100).unwrap();
        writer.append(&second, 200).unwrap();

        let reader = JournalReader::open(&path).unwrap();
        let heads: Vec<RecordId> = reader.heads(&tracker).collect();
        assert_eq!(heads, vec![second, first]);
    }

    #[test]
    fn line_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);
        let tracker = SegmentTracker::new();

        let head = record_id(&tracker);
        let mut writer = JournalWriter::open(&path).unwrap();
        writer.append(&head, 1234567890123).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let tokens: Vec<&str> = content.split_whitespace().collect();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], head.to_string());
        assert_eq!(tokens[1], "root");
        assert_eq!(tokens[2], "1234567890123");
    }

    #[test]
    fn legacy_lines_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);
        let tracker = SegmentTracker::new();

        let head = record_id(&tracker);
        let legacy = format!("{}:{} root 42\n", head.segment_id(), head.offset());
        std::fs::write(&path, legacy).unwrap();

        let reader = JournalReader::open(&path).unwrap();
        let heads: Vec<RecordId> = reader.heads(&tracker).collect();
        assert_eq!(heads, vec![head]);
    }

    #[test]
    fn invalid_lines_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);
        let tracker = SegmentTracker::new();

        let head = record_id(&tracker);
        let content = format!("{head} root 42\nnot a head line\n");
        std::fs::write(&path, content).unwrap();

        let reader = JournalReader::open(&path).unwrap();
        let heads: Vec<RecordId> = reader.heads(&tracker).collect();
        assert_eq!(heads, vec![head]);
    }

    #[test]
    fn missing_journal_is_empty() {
        let dir = tempdir().unwrap();
        let reader = JournalReader::open(dir.path().join(JOURNAL_FILE_NAME)).unwrap();
        assert!(reader.lines().is_empty());
    }

    #[test]
    fn truncate_leaves_single_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(JOURNAL_FILE_NAME);
        let tracker = SegmentTracker::new();

        let mut writer = JournalWriter::open(&path).unwrap();
        writer.append(&record_id(&tracker), 1).unwrap();
        writer.append(&record_id(&tracker), 2).unwrap();
        drop(writer);

        let head = record_id(&tracker);
        truncate_to_head(&path, &head).unwrap();

        let reader = JournalReader::open(&path).unwrap();
        assert_eq!(reader.lines().len(), 1);
        let heads: Vec<RecordId> = reader.heads(&tracker).collect();
        assert_eq!(heads, vec![head]);
    }
}
