//! Incoming message shape and the on-disk persisted record transform.
//!
//! The event schema itself stays opaque (spec §1): we only need the few
//! fields the buffering/flush policy reasons about — source-log timestamp,
//! source-log offset, and the per-event payload timestamps that define the
//! remote object key range. Everything else rides along as `payload`.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Metadata the durable log attaches to every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Source-log timestamp, in milliseconds.
    pub timestamp: i64,
    /// Source-log offset within `partition`.
    pub offset: u64,
    pub partition: u32,
    pub topic: String,
}

/// One recording event inside a message's payload. Only `timestamp` is
/// meaningful to the engine; everything else is opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEvent {
    pub timestamp: i64,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// One message routed to a `SessionManager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub metadata: MessageMetadata,
    pub events: Vec<RecordingEvent>,
    /// Opaque payload forwarded to disk/realtime verbatim.
    pub payload: serde_json::Value,
}

/// The on-wire record actually written to the buffer file, one per line.
///
/// `convertToPersistedMessage` in the source system; here it is the
/// identity transform over `payload` since the payload is already the
/// canonical serializable record and metadata/events are tracked
/// separately by the buffer's counters.
pub fn to_persisted_record(message: &IncomingMessage) -> &serde_json::Value {
    &message.payload
}

/// Result of scanning a message's `events` for the payload-timestamp span,
/// per spec §4.A step 2: `s = events[0].ts`, `e = events[last].ts`.
///
/// Returns `None` if `events` is empty or either endpoint is missing/zero,
/// matching the source's `setEventsRangeFrom` behavior of skipping the
/// range update and emitting a diagnostic.
pub fn event_span(message: &IncomingMessage) -> Option<(i64, i64)> {
    let first = message.events.first()?;
    let last = message.events.last()?;

    if first.timestamp == 0 || last.timestamp == 0 {
        debug!(
            "message at offset {} has a zero event timestamp, skipping events-range update",
            message.metadata.offset
        );
        return None;
    }

    // Mirrors the source's `end || start` fallback for the max side: if the
    // batch is reverse-ordered, `last` degrades silently to `first` rather
    // than widening the range. Preserved intentionally (spec §9) with a
    // diagnostic so the degradation is visible in logs.
    let end = if last.timestamp != 0 {
        last.timestamp
    } else {
        first.timestamp
    };
    if end < first.timestamp {
        debug!(
            "event span end ({}) precedes start ({}) for offset {}, degrading to start",
            end, first.timestamp, message.metadata.offset
        );
    }

    Some((first.timestamp, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_with_events(events: Vec<i64>) -> IncomingMessage {
        IncomingMessage {
            metadata: MessageMetadata {
                timestamp: 1,
                offset: 0,
                partition: 0,
                topic: "recordings".into(),
            },
            events: events
                .into_iter()
                .map(|ts| RecordingEvent {
                    timestamp: ts,
                    extra: json!({}),
                })
                .collect(),
            payload: json!({"hello": "world"}),
        }
    }

    #[test]
    fn event_span_picks_first_and_last() {
        let m = message_with_events(vec![10, 20, 30]);
        assert_eq!(event_span(&m), Some((10, 30)));
    }

    #[test]
    fn event_span_none_when_empty() {
        let m = message_with_events(vec![]);
        assert_eq!(event_span(&m), None);
    }

    #[test]
    fn event_span_none_when_zero_timestamp() {
        let m = message_with_events(vec![0, 30]);
        assert_eq!(event_span(&m), None);
    }
}
