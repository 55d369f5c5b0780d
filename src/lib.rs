//! Session recording buffer engine
//!
//! Per-session buffering and flush engine for a session-recording blob
//! ingester: one [`manager::SessionManager`] per `(team, session)`
//! accumulates incoming recording-event messages into an on-disk buffer,
//! flushes it to object storage once it crosses a size or age threshold,
//! and mirrors it into a realtime store on demand.
//!
//! Configuration via environment variables:
//! - SESSION_RECORDING_MAX_BUFFER_SIZE_KB / _MAX_BUFFER_AGE_SECONDS /
//!   _BUFFER_AGE_JITTER / _BUFFER_AGE_IN_MEMORY_MULTIPLIER
//! - SESSION_RECORDING_LOCAL_DIRECTORY / _REMOTE_FOLDER
//! - OBJECT_STORAGE_BUCKET, MAX_FLUSH_TIME_MS

pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod flush;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod object_store;
pub mod realtime;

pub use buffer::{Buffer, EventsRange, Offsets};
pub use config::EngineConfig;
pub use dispatcher::{FlushedOffsets, OnFinish, ReferenceTimeMs, SessionIdentity};
pub use error::IngestError;
pub use flush::FlushReason;
pub use manager::{SessionManager, SessionStats};
pub use message::IncomingMessage;
pub use object_store::ObjectStoreClient;
pub use realtime::{InMemoryRealtimeStore, RealtimeStore};
