//! Error types for the session recording buffer engine

use thiserror::Error;

/// Errors surfaced by the buffering and flush engine.
///
/// Disposition of each variant is documented per the error-handling design:
/// some are fatal invariant violations the caller should treat as a bug
/// report, others are expected/transient and only logged.
#[derive(Error, Debug)]
pub enum IngestError {
    /// `count > 0` observed with `oldestSourceTs == None`, or an equivalent
    /// impossible state. Always a programming error, never recoverable.
    #[error("buffer invariant violated: {0}")]
    InvariantViolation(String),

    /// Failed to open/write/close the on-disk buffer file.
    #[error("buffer writer I/O error: {0}")]
    WriterError(#[from] std::io::Error),

    /// `flush()` called while a previous flush is still in progress.
    #[error("flush already in progress")]
    FlushAlreadyRunning,

    /// `flush()` invoked (or an age check fired) against an empty buffer.
    #[error("cannot flush an empty buffer")]
    EmptyFlush,

    /// The multipart upload itself failed (network, 5xx, ...).
    #[error("upload error: {0}")]
    UploadError(String),

    /// Upload was aborted because the manager is being destroyed.
    #[error("upload aborted")]
    UploadAborted,

    /// The hard flush deadline (`MAX_FLUSH_TIME_MS`) elapsed.
    #[error("flush exceeded hard timeout")]
    FlushTimedOut,

    /// Record/payload failed to serialize to JSON.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Realtime store operation failed (bootstrap or per-message publish).
    #[error("realtime store error: {0}")]
    RealtimeError(String),

    /// Object-store client error outside of the upload path itself
    /// (e.g. failure to open a multipart session).
    #[error("object store error: {0}")]
    ObjectStoreError(#[from] object_store::Error),

    /// Configuration value failed to parse.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl IngestError {
    /// True for the subset of failures that end a flush attempt but must
    /// still advance offsets per the offset-accounting contract (spec §7):
    /// upload failure and hard-timeout expiry.
    pub fn advances_offsets_on_failure(&self) -> bool {
        matches!(self, IngestError::UploadError(_) | IngestError::FlushTimedOut)
    }
}
