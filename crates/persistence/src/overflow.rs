//! The overflow log: an append-only, durable fallback for persistence
//! bundles that could not be admitted to the primary queue (because it was
//! full) or that a worker could not write to the store after exhausting
//! its retry budget. One segment file per calendar day under
//! `persist.overflowDir`, as spec.md §6 describes. Each record is
//! length-prefixed and carries a CRC32 so a single torn write at the tail
//! of a segment (e.g. from a crash mid-append) cannot corrupt the records
//! before it.
//!
//! Segment naming and the on-disk frame format are private to this module;
//! nothing outside `panelstream-persistence` needs to parse them directly.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use panelstream_core::PersistedChunk;
use time::OffsetDateTime;

/// One record as it sits on disk in an overflow segment, after a CRC check
/// has already been applied by the reader.
pub type OverflowRecord = PersistedChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    Record,
    /// The record's CRC did not match its payload; skipped, not aborted —
    /// spec_full.md's decision for a corrupt tail record.
    CorruptSkipped,
}

pub struct OverflowLog {
    dir: PathBuf,
}

impl OverflowLog {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(OverflowLog { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one record to today's segment, creating it if necessary.
    /// Frame layout: `[u32 len_le][u32 crc32_le][len bytes of JSON]`.
    pub fn append(&self, record: &OverflowRecord) -> io::Result<()> {
        let path = self.segment_path_for(OffsetDateTime::now_utc());
        let payload = serde_json::to_vec(record)?;
        let crc = crc32fast::hash(&payload);

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&crc.to_le_bytes())?;
        file.write_all(&payload)?;
        file.flush()
    }

    fn segment_path_for(&self, at: OffsetDateTime) -> PathBuf {
        let date = at.date();
        self.dir.join(format!(
            "{:04}-{:02}-{:02}.segment",
            date.year(),
            u8::from(date.month()),
            date.day()
        ))
    }

    /// All segment files currently on disk, oldest first by filename (which
    /// sorts chronologically since segments are named by ISO-8601 date).
    pub fn segments(&self) -> io::Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|e| e == "segment").unwrap_or(false))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Reads every record out of a single segment file, skipping (not
    /// aborting on) any record whose CRC does not match its payload.
    /// Returns records in on-disk order, which is append order and
    /// therefore preserves per-`(thread_id, message_id)` ordering.
    pub fn read_segment(
        &self,
        path: &Path,
    ) -> io::Result<Vec<(ReplayOutcome, Option<OverflowRecord>)>> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut out = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut crc_buf = [0u8; 4];
            if reader.read_exact(&mut crc_buf).is_err() {
                break; // truncated tail write; stop, do not error the whole segment
            }
            let expected_crc = u32::from_le_bytes(crc_buf);

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }

            if crc32fast::hash(&payload) != expected_crc {
                out.push((ReplayOutcome::CorruptSkipped, None));
                continue;
            }

            match serde_json::from_slice::<OverflowRecord>(&payload) {
                Ok(record) => out.push((ReplayOutcome::Record, Some(record))),
                Err(_) => out.push((ReplayOutcome::CorruptSkipped, None)),
            }
        }

        Ok(out)
    }

    /// Removes a segment file once every record in it has been durably
    /// replayed into the store. Best-effort: a failure here just means the
    /// (already-committed, now deduplicated-on-replay) segment gets
    /// re-scanned next time, which `(thread_id, message_id, seq)` dedup
    /// makes safe.
    pub fn remove_segment(&self, path: &Path) {
        let _ = fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(seq: u64) -> OverflowRecord {
        PersistedChunk {
            thread_id: "t".into(),
            message_id: "m".into(),
            seq,
            kind: "text".into(),
            content: json!({"delta": "hi"}),
            finalized: false,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn append_then_read_round_trips_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = OverflowLog::open(dir.path()).unwrap();
        log.append(&record(1)).unwrap();
        log.append(&record(2)).unwrap();

        let segments = log.segments().unwrap();
        assert_eq!(segments.len(), 1);
        let read = log.read_segment(&segments[0]).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].0, ReplayOutcome::Record);
        assert_eq!(read[0].1.as_ref().unwrap().seq, 1);
        assert_eq!(read[1].1.as_ref().unwrap().seq, 2);
    }

    #[test]
    fn a_corrupted_record_is_skipped_without_losing_the_rest_of_the_segment() {
        let dir = tempfile::tempdir().unwrap();
        let log = OverflowLog::open(dir.path()).unwrap();
        log.append(&record(1)).unwrap();

        let segments = log.segments().unwrap();
        let path = &segments[0];
        let mut bytes = fs::read(path).unwrap();
        // Flip a byte inside the JSON payload (after the 8-byte frame header)
        // so the CRC no longer matches but the length prefix is still valid.
        let flip_at = 8 + bytes.len().saturating_sub(9).min(1);
        bytes[flip_at] ^= 0xFF;
        fs::write(path, &bytes).unwrap();

        let read = log.read_segment(path).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].0, ReplayOutcome::CorruptSkipped);
    }

    #[test]
    fn remove_segment_deletes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = OverflowLog::open(dir.path()).unwrap();
        log.append(&record(1)).unwrap();
        let segments = log.segments().unwrap();
        log.remove_segment(&segments[0]);
        assert!(log.segments().unwrap().is_empty());
    }
}
