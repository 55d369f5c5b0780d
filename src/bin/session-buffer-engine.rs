//! Session buffer engine demo binary
//!
//! Drives one `SessionManager` against in-memory object-store and
//! realtime-store doubles with a synthetic message generator, so the
//! engine's flush behavior can be observed without a real partition
//! consumer or object store attached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use session_recording_buffer::{
    EngineConfig, IncomingMessage, InMemoryRealtimeStore, ObjectStoreClient, SessionIdentity,
    SessionManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("session_recording_buffer=debug".parse()?),
        )
        .init();

    info!("session-buffer-engine demo starting");

    let config = EngineConfig::from_env();
    let identity = SessionIdentity {
        team: "demo-team".to_string(),
        session: "demo-session".to_string(),
        partition: 0,
        topic: "recording-events".to_string(),
    };

    let committed_highest = Arc::new(AtomicU64::new(0));
    let tracked = Arc::clone(&committed_highest);
    let on_finish = Arc::new(move |offsets: session_recording_buffer::FlushedOffsets| {
        info!(
            "flush finished: offsets [{}, {}]",
            offsets.lowest, offsets.highest
        );
        tracked.store(offsets.highest, Ordering::SeqCst);
    });

    let manager = SessionManager::new(
        identity,
        config,
        ObjectStoreClient::in_memory(),
        Arc::new(InMemoryRealtimeStore::new()),
        on_finish,
    )
    .await?;

    for i in 0..20u64 {
        let message = IncomingMessage {
            metadata: session_recording_buffer::message::MessageMetadata {
                timestamp: 1_000 + i as i64 * 100,
                offset: i,
                partition: 0,
                topic: "recording-events".to_string(),
            },
            events: vec![session_recording_buffer::message::RecordingEvent {
                timestamp: 1_000 + i as i64 * 100,
                extra: json!({}),
            }],
            payload: json!({"offset": i, "kind": "snapshot"}),
        };
        manager.add(message).await?;
    }

    manager.flush(session_recording_buffer::FlushReason::Manual).await?;

    info!(
        "demo complete; last committed offset = {}",
        committed_highest.load(Ordering::SeqCst)
    );
    Ok(())
}
