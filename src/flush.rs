//! Flush reason labels and object-key derivation — spec §4.B, §4.C step 4.

use std::fmt;

use crate::buffer::EventsRange;

/// Labels the counter and informs debugging (spec glossary). `Manual` and
/// `Shutdown` cover the dispatcher's forced-flush interface (`flush(reason)`
/// in spec §6) and destroy-time draining; they are not one of the three
/// policy-driven reasons in spec §4.B but share the same reporting path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    BufferSize,
    BufferAge,
    BufferAgeRealtime,
    Manual,
    Shutdown,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::BufferSize => "buffer_size",
            FlushReason::BufferAge => "buffer_age",
            FlushReason::BufferAgeRealtime => "buffer_age_realtime",
            FlushReason::Manual => "manual",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<remoteFolder>/team_id/<team>/session_id/<session>/data/<first>-<last>`
/// where `first`/`last` are the event-payload timestamps (spec §4.C step
/// 4). The key is uniquely defined by the payload time range of the
/// flushing batch (testable property 3: `first <= last`).
pub fn object_key(remote_folder: &str, team: &str, session: &str, range: &EventsRange) -> String {
    format!(
        "{remote_folder}/team_id/{team}/session_id/{session}/data/{}-{}",
        range.first, range.last
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_uses_event_payload_range() {
        let range = EventsRange { first: 100, last: 200 };
        let key = object_key("session_recordings", "team1", "sess1", &range);
        assert_eq!(
            key,
            "session_recordings/team_id/team1/session_id/sess1/data/100-200"
        );
    }

    #[test]
    fn reason_labels_match_spec() {
        assert_eq!(FlushReason::BufferSize.as_str(), "buffer_size");
        assert_eq!(FlushReason::BufferAge.as_str(), "buffer_age");
        assert_eq!(FlushReason::BufferAgeRealtime.as_str(), "buffer_age_realtime");
    }
}
