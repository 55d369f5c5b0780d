//! Realtime mirror activator — spec §4.D.
//!
//! `RealtimeStore` models the secondary low-latency key/value + pub/sub
//! store as a trait (out of scope per spec §1, referenced only through its
//! interface), with an in-memory double for tests and local smoke-testing.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, instrument};

use crate::error::IngestError;
use crate::message::IncomingMessage;

/// The four realtime-store operations the engine consumes (spec §6).
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn clear_all_messages(&self, team: &str, session: &str);
    async fn add_message(&self, team: &str, session: &str, message: &IncomingMessage);
    async fn add_messages_from_buffer(
        &self,
        team: &str,
        session: &str,
        buffer_content: &str,
        oldest_source_ts: Option<i64>,
    ) -> Result<(), IngestError>;

    /// Subscribe to activation signals for `(team, session)`. Returns a
    /// receiver that fires once per external "start realtime" request.
    fn subscribe(&self, team: &str, session: &str) -> broadcast::Receiver<()>;

    /// Fire an activation signal for `(team, session)`, used by tests and
    /// by whatever surfaces the "a reader wants realtime" request in a real
    /// deployment.
    fn request_realtime(&self, team: &str, session: &str);
}

/// In-memory `RealtimeStore` double: records published messages and
/// bootstrap calls so tests can assert on them, and drives subscription
/// signals through a per-key broadcast channel.
#[derive(Default)]
pub struct InMemoryRealtimeStore {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    published: VecDeque<(String, String, IncomingMessage)>,
    bootstraps: Vec<BootstrapCall>,
    channels: std::collections::HashMap<(String, String), broadcast::Sender<()>>,
}

#[derive(Debug, Clone)]
pub struct BootstrapCall {
    pub team: String,
    pub session: String,
    pub buffer_content: String,
    pub oldest_source_ts: Option<i64>,
}

impl InMemoryRealtimeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, team: &str, session: &str) -> broadcast::Sender<()> {
        let mut state = self.inner.lock();
        state
            .channels
            .entry((team.to_string(), session.to_string()))
            .or_insert_with(|| broadcast::channel(16).0)
            .clone()
    }

    pub fn bootstraps(&self) -> Vec<BootstrapCall> {
        self.inner.lock().bootstraps.clone()
    }

    pub fn published_count(&self) -> usize {
        self.inner.lock().published.len()
    }
}

#[async_trait]
impl RealtimeStore for InMemoryRealtimeStore {
    async fn clear_all_messages(&self, team: &str, session: &str) {
        let mut state = self.inner.lock();
        state
            .published
            .retain(|(t, s, _)| !(t == team && s == session));
    }

    async fn add_message(&self, team: &str, session: &str, message: &IncomingMessage) {
        self.inner
            .lock()
            .published
            .push_back((team.to_string(), session.to_string(), message.clone()));
    }

    async fn add_messages_from_buffer(
        &self,
        team: &str,
        session: &str,
        buffer_content: &str,
        oldest_source_ts: Option<i64>,
    ) -> Result<(), IngestError> {
        self.inner.lock().bootstraps.push(BootstrapCall {
            team: team.to_string(),
            session: session.to_string(),
            buffer_content: buffer_content.to_string(),
            oldest_source_ts,
        });
        Ok(())
    }

    fn subscribe(&self, team: &str, session: &str) -> broadcast::Receiver<()> {
        self.channel(team, session).subscribe()
    }

    fn request_realtime(&self, team: &str, session: &str) {
        let _ = self.channel(team, session).send(());
    }
}

/// Bootstrap the realtime mirror from the currently-active buffer on disk,
/// then leave `realtime` enabled so subsequent appends keep publishing.
/// Failures during bootstrap are reported but do not disable the flag
/// (spec §4.D: "best-effort").
#[instrument(skip(store, buffer_content))]
pub async fn bootstrap(
    store: &Arc<dyn RealtimeStore>,
    team: &str,
    session: &str,
    buffer_content: &str,
    oldest_source_ts: Option<i64>,
) {
    if let Err(e) = store
        .add_messages_from_buffer(team, session, buffer_content, oldest_source_ts)
        .await
    {
        error!("realtime bootstrap failed for {team}:{session}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageMetadata;
    use serde_json::json;

    fn message() -> IncomingMessage {
        IncomingMessage {
            metadata: MessageMetadata { timestamp: 1, offset: 0, partition: 0, topic: "t".into() },
            events: vec![],
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn publish_then_clear() {
        let store = InMemoryRealtimeStore::new();
        store.add_message("team", "sess", &message()).await;
        assert_eq!(store.published_count(), 1);
        store.clear_all_messages("team", "sess").await;
        assert_eq!(store.published_count(), 0);
    }

    #[tokio::test]
    async fn bootstrap_records_call() {
        let store = InMemoryRealtimeStore::new();
        store
            .add_messages_from_buffer("team", "sess", "{}\n", Some(10))
            .await
            .unwrap();
        let calls = store.bootstraps();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].oldest_source_ts, Some(10));
    }

    #[tokio::test]
    async fn subscription_fires_on_request() {
        let store = InMemoryRealtimeStore::new();
        let mut rx = store.subscribe("team", "sess");
        store.request_realtime("team", "sess");
        rx.recv().await.unwrap();
    }
}
