//! Dispatcher-facing types — spec §3 identity, §6 external interface.
//!
//! The partition consumer / process-wide dispatcher itself is out of scope
//! (spec §1); only the shapes it hands to and receives from a
//! `SessionManager` live here.

use std::sync::Arc;

/// Immutable identity of a `SessionManager`, carried for its entire
/// lifetime (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub team: String,
    pub session: String,
    pub partition: u32,
    pub topic: String,
}

/// Offsets reported back to the dispatcher when a flush attempt ends,
/// success or failure alike (spec §4.C `endFlush`, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushedOffsets {
    pub lowest: u64,
    pub highest: u64,
}

/// `onFinish(offsets)` — invoked exactly once per flush attempt so the
/// dispatcher can advance its commit offset. Boxed so a manager can be
/// constructed with an arbitrary closure (e.g. one that commits to a real
/// partition consumer) without making `SessionManager` generic over it.
pub type OnFinish = Arc<dyn Fn(FlushedOffsets) + Send + Sync>;

/// Dispatcher-supplied clock for age-based flushing: "typically the newest
/// timestamp observed across any session in the partition" (spec §4.B).
/// Modeled as a plain value rather than a live clock object because the
/// dispatcher computes and passes it in on each `flush_if_session_buffer_is_old`
/// tick.
pub type ReferenceTimeMs = i64;
