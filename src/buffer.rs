//! A single append-only on-disk batch with metadata — spec §3, §4.A.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::error::IngestError;
use crate::message::{event_span, to_persisted_record, IncomingMessage};

/// Min/max of per-message source-log offsets observed in a buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Offsets {
    pub lowest: u64,
    pub highest: u64,
}

/// Min/max of per-event payload timestamps across all appended messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventsRange {
    pub first: i64,
    pub last: i64,
}

/// One generation of a session's buffer: an append-only file plus the
/// counters the flush policy and object-key derivation need.
///
/// Invariant 1: `count == 0 <=> oldest_source_ts.is_none()`. Invariant 2:
/// `oldest_source_ts <= newest_source_ts` when both are set. Invariant 3:
/// `offsets.lowest <= offsets.highest` when `count > 0`. Invariant 4:
/// `events_range.first <= events_range.last` when set (see the open
/// question in the design notes re: degraded ranges). Invariant 5: `file`
/// exists on disk until `destroy` completes.
#[derive(Debug)]
pub struct Buffer {
    pub id: Uuid,
    pub file: PathBuf,
    writer: BufWriter<File>,
    pub count: u64,
    pub size_estimate: u64,
    pub created_at: Instant,
    pub oldest_source_ts: Option<i64>,
    pub newest_source_ts: Option<i64>,
    pub offsets: Option<Offsets>,
    pub events_range: Option<EventsRange>,
    write_error: Option<String>,
}

impl Buffer {
    /// Create a fresh buffer, opening `<dir>/<team>.<session>.<id>.jsonl`
    /// for append. Propagates the open failure so the caller can abort the
    /// manager, per spec §4.A.
    #[instrument(skip(dir), fields(team, session))]
    pub async fn create(dir: &Path, team: &str, session: &str) -> Result<Self, IngestError> {
        let id = Uuid::new_v4();
        tokio::fs::create_dir_all(dir).await?;
        let file = dir.join(format!("{team}.{session}.{id}.jsonl"));

        let handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
            .await?;

        Ok(Self {
            id,
            file,
            writer: BufWriter::new(handle),
            count: 0,
            size_estimate: 0,
            created_at: Instant::now(),
            oldest_source_ts: None,
            newest_source_ts: None,
            offsets: None,
            events_range: None,
            write_error: None,
        })
    }

    /// True once this buffer has taken on a failed write. The next flush's
    /// stream-end step surfaces this as a terminal error (spec §4.A: writer
    /// errors "do not interrupt in-progress appends... the next flush will
    /// surface them via stream termination").
    pub fn has_write_error(&self) -> bool {
        self.write_error.is_some()
    }

    /// Append one message: update source-time/offset/events-range
    /// bookkeeping, serialize the payload to a JSON line, and write it.
    ///
    /// A write failure is logged and captured on the buffer rather than
    /// returned, so the caller's hot append path is never interrupted by
    /// transient disk errors — per spec §4.A / §7.
    #[instrument(skip(self, message), fields(buffer_id = %self.id))]
    pub async fn append(&mut self, message: &IncomingMessage) {
        let source_ts = message.metadata.timestamp;
        self.oldest_source_ts = Some(self.oldest_source_ts.map_or(source_ts, |v| v.min(source_ts)));
        self.newest_source_ts = Some(self.newest_source_ts.map_or(source_ts, |v| v.max(source_ts)));

        if let Some((start, end)) = event_span(message) {
            self.events_range = Some(match self.events_range {
                Some(existing) => EventsRange {
                    first: existing.first.min(start),
                    last: existing.last.max(end),
                },
                None => EventsRange { first: start, last: end },
            });
        }

        let record = to_persisted_record(message);
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize payload at offset {}: {e}", message.metadata.offset);
                return;
            }
        };

        let write_result = match self.writer.write_all(line.as_bytes()).await {
            Ok(()) => self.writer.write_all(b"\n").await,
            Err(e) => Err(e),
        };

        match write_result {
            Ok(()) => {
                self.count += 1;
                self.size_estimate += line.len() as u64 + 1;
                let offset = message.metadata.offset;
                self.offsets = Some(match self.offsets {
                    Some(existing) => Offsets {
                        lowest: existing.lowest.min(offset),
                        highest: existing.highest.max(offset),
                    },
                    None => Offsets { lowest: offset, highest: offset },
                });
            }
            Err(e) => {
                error!("buffer {} write failed: {e}", self.id);
                self.write_error = Some(e.to_string());
            }
        }
    }

    /// Close the file writer: flush OS buffers and drop the file handle.
    /// Guarded by a soft timeout at the call site (spec §4.C step 5); the
    /// write error captured during `append`, if any, is surfaced here.
    #[instrument(skip(self), fields(buffer_id = %self.id))]
    pub async fn end_writer(&mut self) -> Result<(), IngestError> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;
        if let Some(err) = self.write_error.take() {
            return Err(IngestError::WriterError(std::io::Error::other(err)));
        }
        Ok(())
    }

    /// Delete the buffer's file. A missing file is not an error (spec §7).
    #[instrument(skip(self), fields(buffer_id = %self.id))]
    pub async fn destroy(self) {
        match tokio::fs::remove_file(&self.file).await {
            Ok(()) => debug!("removed buffer file {}", self.file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("buffer file {} already removed", self.file.display());
            }
            Err(e) => warn!("failed to remove buffer file {}: {e}", self.file.display()),
        }
    }

    /// Wall-clock milliseconds since this buffer was created. Used by the
    /// `buffer_age_realtime` flush trigger. Backed by `tokio::time::Instant`
    /// rather than `std::time::Instant` so tests can drive it deterministically
    /// with a paused runtime clock instead of a real sleep.
    pub fn age_in_memory_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    /// `true` if this buffer has never been written to.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Validate invariant 1 at any yield point; returns an
    /// [`IngestError::InvariantViolation`] if `count > 0` but
    /// `oldest_source_ts` is unset. Callers should treat this as fatal.
    pub fn check_invariants(&self) -> Result<(), IngestError> {
        if self.count > 0 && self.oldest_source_ts.is_none() {
            return Err(IngestError::InvariantViolation(format!(
                "buffer {} has count={} but oldest_source_ts is unset",
                self.id, self.count
            )));
        }
        Ok(())
    }

    /// Read the buffer file's full current contents, for realtime bootstrap
    /// (spec §4.D). Returns UTF-8 lines already on disk; in-flight writer
    /// buffering means a just-appended line may not yet be visible, which
    /// matches the source's best-effort bootstrap semantics.
    pub async fn read_contents(&self) -> Result<String, IngestError> {
        Ok(tokio::fs::read_to_string(&self.file).await?)
    }

    /// Wall-clock creation timestamp in epoch milliseconds, stored purely
    /// for diagnostics (the flush-age comparisons use `Instant`).
    pub fn created_at_epoch_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageMetadata, RecordingEvent};
    use serde_json::json;
    use tempfile::tempdir;

    fn message(offset: u64, ts: i64, event_ts: i64) -> IncomingMessage {
        IncomingMessage {
            metadata: MessageMetadata { timestamp: ts, offset, partition: 0, topic: "t".into() },
            events: vec![RecordingEvent { timestamp: event_ts, extra: json!({}) }],
            payload: json!({"offset": offset}),
        }
    }

    #[tokio::test]
    async fn fresh_buffer_has_no_source_ts() {
        let dir = tempdir().unwrap();
        let buffer = Buffer::create(dir.path(), "team1", "sess1").await.unwrap();
        assert_eq!(buffer.count, 0);
        assert!(buffer.oldest_source_ts.is_none());
        assert!(buffer.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn append_updates_counters_and_ranges() {
        let dir = tempdir().unwrap();
        let mut buffer = Buffer::create(dir.path(), "team1", "sess1").await.unwrap();

        buffer.append(&message(5, 1_000, 900)).await;
        buffer.append(&message(3, 2_000, 2_100)).await;

        assert_eq!(buffer.count, 2);
        assert_eq!(buffer.oldest_source_ts, Some(1_000));
        assert_eq!(buffer.newest_source_ts, Some(2_000));
        assert_eq!(buffer.offsets, Some(Offsets { lowest: 3, highest: 5 }));
        assert_eq!(buffer.events_range, Some(EventsRange { first: 900, last: 2_100 }));
        assert!(buffer.size_estimate > 0);
        buffer.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn end_writer_then_destroy_removes_file() {
        let dir = tempdir().unwrap();
        let mut buffer = Buffer::create(dir.path(), "team1", "sess1").await.unwrap();
        buffer.append(&message(0, 1, 1)).await;
        buffer.end_writer().await.unwrap();
        let path = buffer.file.clone();
        assert!(path.exists());
        buffer.destroy().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn destroy_missing_file_is_silent() {
        let dir = tempdir().unwrap();
        let buffer = Buffer::create(dir.path(), "team1", "sess1").await.unwrap();
        tokio::fs::remove_file(&buffer.file).await.unwrap();
        buffer.destroy().await; // must not panic
    }
}
