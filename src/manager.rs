//! `SessionManager` — owns one session's buffer lifecycle end to end:
//! append, size/age flush decisions, the flush pipeline, realtime mirror
//! activation, and destruction (spec §3, §4, §6).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, instrument, warn};

use crate::buffer::Buffer;
use crate::config::EngineConfig;
use crate::dispatcher::{FlushedOffsets, OnFinish, ReferenceTimeMs, SessionIdentity};
use crate::error::IngestError;
use crate::flush::{object_key, FlushReason};
use crate::metrics;
use crate::object_store::ObjectStoreClient;
use crate::realtime::{bootstrap, RealtimeStore};
use crate::message::IncomingMessage;

/// A flush's soft timeout is purely observational: it logs a warning and
/// keeps waiting, unlike the hard deadline in [`EngineConfig::max_flush_time_ms`]
/// which actually cancels the attempt (spec §4.C step 1 vs step 5/7).
const SOFT_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns one session's double buffer, its realtime mirror subscription, and
/// the object-store client it flushes through. Constructed as `Arc<Self>`
/// because the realtime-activation listener holds a weak reference to it
/// across the manager's lifetime.
pub struct SessionManager {
    identity: SessionIdentity,
    config: EngineConfig,
    object_store: ObjectStoreClient,
    realtime_store: Arc<dyn RealtimeStore>,
    on_finish: OnFinish,
    /// Sampled once at construction from `[1 - jitter, 1]` and applied to
    /// every age-based threshold for this session's lifetime (spec §4.B).
    jitter_multiplier: f64,
    active: Mutex<Option<Buffer>>,
    flushing: Mutex<Option<Buffer>>,
    destroying: AtomicBool,
    realtime: AtomicBool,
    /// Reserved synchronously by `run_flush`'s guard, before the buffer swap
    /// ever awaits, so two concurrent `flush()` calls cannot both pass the
    /// "already running" check during the window before `flushing` is
    /// actually populated (spec §5: "at any yield inside flush, flushing is
    /// non-null").
    flush_in_progress: AtomicBool,
    /// Signalled by `destroy()` to cancel an in-flight upload await without
    /// taking ownership of it away from the task driving the pipeline.
    upload_cancel: Notify,
    realtime_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Per-message realtime publishes are funneled through this channel to
    /// the single consumer task spawned in `new`, so publish order matches
    /// append order even though `add` itself never awaits the publish
    /// (spec §5: "order is preserved ... in realtime publishes").
    realtime_tx: mpsc::UnboundedSender<IncomingMessage>,
    realtime_publish_task: JoinHandle<()>,
}

/// A snapshot for diagnostics/demo output; not part of the dispatcher
/// interface (spec §6), added because the teacher's provider exposes an
/// equivalent `get_stats()` for its own demo binary.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub active_count: u64,
    pub active_size_bytes: u64,
    pub flushing_in_progress: bool,
    pub realtime_enabled: bool,
}

impl SessionManager {
    #[instrument(skip_all, fields(team = %identity.team, session = %identity.session))]
    pub async fn new(
        identity: SessionIdentity,
        config: EngineConfig,
        object_store: ObjectStoreClient,
        realtime_store: Arc<dyn RealtimeStore>,
        on_finish: OnFinish,
    ) -> Result<Arc<Self>, IngestError> {
        let local_dir = PathBuf::from(&config.local_directory);
        let active = Buffer::create(&local_dir, &identity.team, &identity.session).await?;

        // Clear any stale realtime state left behind by a previous
        // generation of this (team, session) before accepting messages
        // (spec §3 "Create", §6 "on construction and on finalize").
        realtime_store
            .clear_all_messages(&identity.team, &identity.session)
            .await;

        let jitter = config.buffer_age_jitter.clamp(0.0, 0.999);
        let jitter_multiplier = if jitter <= 0.0 {
            1.0
        } else {
            rand::thread_rng().gen_range((1.0 - jitter)..=1.0)
        };

        let mut subscription = realtime_store.subscribe(&identity.team, &identity.session);

        let (realtime_tx, mut realtime_rx) = mpsc::unbounded_channel::<IncomingMessage>();
        let publish_store = Arc::clone(&realtime_store);
        let publish_team = identity.team.clone();
        let publish_session = identity.session.clone();
        let realtime_publish_task = tokio::spawn(async move {
            while let Some(message) = realtime_rx.recv().await {
                publish_store.add_message(&publish_team, &publish_session, &message).await;
            }
        });

        let manager = Arc::new(Self {
            identity,
            config,
            object_store,
            realtime_store,
            on_finish,
            jitter_multiplier,
            active: Mutex::new(Some(active)),
            flushing: Mutex::new(None),
            destroying: AtomicBool::new(false),
            realtime: AtomicBool::new(false),
            flush_in_progress: AtomicBool::new(false),
            upload_cancel: Notify::new(),
            realtime_task: std::sync::Mutex::new(None),
            realtime_tx,
            realtime_publish_task,
        });

        let weak = Arc::downgrade(&manager);
        let task = tokio::spawn(async move {
            while subscription.recv().await.is_ok() {
                let Some(manager) = weak.upgrade() else { break };
                manager.activate_realtime().await;
            }
        });
        *manager.realtime_task.lock().unwrap() = Some(task);

        Ok(manager)
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Enable the realtime mirror: bootstrap it from the currently-active
    /// buffer's on-disk contents, then leave `realtime` set so every
    /// subsequent `add` also publishes (spec §4.D).
    #[instrument(skip(self), fields(team = %self.identity.team, session = %self.identity.session))]
    async fn activate_realtime(self: &Arc<Self>) {
        if self.realtime.swap(true, Ordering::SeqCst) {
            return; // already active, bootstrap happens once
        }

        let (contents, oldest_source_ts) = {
            let guard = self.active.lock().await;
            match guard.as_ref() {
                Some(buf) => (buf.read_contents().await, buf.oldest_source_ts),
                None => return,
            }
        };

        match contents {
            Ok(contents) => {
                bootstrap(
                    &self.realtime_store,
                    &self.identity.team,
                    &self.identity.session,
                    &contents,
                    oldest_source_ts,
                )
                .await;
            }
            Err(e) => error!("failed to read active buffer for realtime bootstrap: {e}"),
        }
    }

    /// Append one message to the active buffer, mirror it to the realtime
    /// store if active, and trigger a `buffer_size` flush if the new size
    /// crosses the configured threshold (spec §4.A, §4.B).
    #[instrument(skip(self, message), fields(team = %self.identity.team, session = %self.identity.session))]
    pub async fn add(self: &Arc<Self>, message: IncomingMessage) -> Result<(), IngestError> {
        if self.destroying.load(Ordering::SeqCst) {
            return Ok(());
        }

        let should_flush_size = {
            let mut guard = self.active.lock().await;
            let buf = guard
                .as_mut()
                .ok_or_else(|| IngestError::InvariantViolation("manager already destroyed".into()))?;
            buf.append(&message).await;
            buf.check_invariants()?;
            buf.size_estimate >= self.config.max_buffer_size_kb * 1024
        };

        if self.realtime.load(Ordering::SeqCst) {
            // Fire-and-forget, but ordered: the single publisher task drains
            // this channel sequentially, so publish order always matches
            // append order regardless of how many `add` calls race here.
            let _ = self.realtime_tx.send(message);
        }

        if should_flush_size {
            let _ = self.flush(FlushReason::BufferSize).await;
        }
        Ok(())
    }

    /// Evaluate the age-based flush triggers against `reference_now_ms`,
    /// the dispatcher-supplied clock, and flush if either fires. A no-op
    /// on an empty buffer or while another flush is already running
    /// (spec §4.B).
    #[instrument(skip(self), fields(team = %self.identity.team, session = %self.identity.session))]
    pub async fn flush_if_session_buffer_is_old(
        self: &Arc<Self>,
        reference_now_ms: ReferenceTimeMs,
    ) -> Result<(), IngestError> {
        if self.destroying.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.flush_in_progress.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (count, oldest_source_ts, age_in_memory_ms) = {
            let guard = self.active.lock().await;
            let buf = guard
                .as_ref()
                .ok_or_else(|| IngestError::InvariantViolation("manager already destroyed".into()))?;
            (buf.count, buf.oldest_source_ts, buf.age_in_memory_ms())
        };

        if count == 0 {
            return Ok(());
        }
        let oldest_source_ts = oldest_source_ts.ok_or_else(|| {
            IngestError::InvariantViolation(format!(
                "session {} has count>0 with oldest_source_ts unset during age check",
                self.identity.session
            ))
        })?;

        let base_threshold_ms =
            (self.config.max_buffer_age_seconds * 1000) as f64 * self.jitter_multiplier;
        let source_age_ms = (reference_now_ms - oldest_source_ts) as f64;
        let in_memory_threshold_ms = base_threshold_ms * self.config.age_in_memory_multiplier;

        let reason = if source_age_ms >= base_threshold_ms {
            Some(FlushReason::BufferAge)
        } else if (age_in_memory_ms as f64) >= in_memory_threshold_ms {
            Some(FlushReason::BufferAgeRealtime)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.flush(reason).await?;
        }
        Ok(())
    }

    /// Force a flush for `reason`, bypassing the age/size checks. Used by
    /// `flush_if_session_buffer_is_old` internally and exposed directly for
    /// manual/shutdown-triggered flushes (spec §6).
    pub async fn flush(self: &Arc<Self>, reason: FlushReason) -> Result<(), IngestError> {
        self.run_flush(reason).await
    }

    pub async fn get_lowest_offset(&self) -> Option<u64> {
        let active_low = {
            let guard = self.active.lock().await;
            let buf = guard.as_ref()?;
            // Preserves an intentional quirk (spec §9, open question): this
            // returns `None` whenever the active buffer is empty, even if
            // `flushing` still holds unacknowledged offsets.
            if buf.count == 0 {
                return None;
            }
            buf.offsets.map(|o| o.lowest)
        };

        let flushing_low = {
            let guard = self.flushing.lock().await;
            guard.as_ref().and_then(|b| b.offsets).map(|o| o.lowest)
        };

        match (active_low, flushing_low) {
            (Some(a), Some(f)) => Some(a.min(f)),
            (Some(a), None) => Some(a),
            (None, other) => other,
        }
    }

    pub async fn is_empty(&self) -> bool {
        let active_empty = self
            .active
            .lock()
            .await
            .as_ref()
            .map_or(true, Buffer::is_empty);
        let flushing_empty = self
            .flushing
            .lock()
            .await
            .as_ref()
            .map_or(true, Buffer::is_empty);
        active_empty && flushing_empty
    }

    pub async fn stats(&self) -> SessionStats {
        let (active_count, active_size_bytes) = {
            let guard = self.active.lock().await;
            guard.as_ref().map_or((0, 0), |b| (b.count, b.size_estimate))
        };
        SessionStats {
            active_count,
            active_size_bytes,
            flushing_in_progress: self.flush_in_progress.load(Ordering::SeqCst),
            realtime_enabled: self.realtime.load(Ordering::SeqCst),
        }
    }

    /// Tear the session down: stop the realtime listener, abort any
    /// in-flight upload, and remove the active buffer's file immediately.
    /// The flushing buffer (if any) is cleaned up by the in-flight flush's
    /// own `end_flush`, which still runs to completion so `onFinish` fires
    /// exactly once (spec §4.E "destroy").
    #[instrument(skip(self), fields(team = %self.identity.team, session = %self.identity.session))]
    pub async fn destroy(&self) {
        self.destroying.store(true, Ordering::SeqCst);
        self.upload_cancel.notify_waiters();

        if let Some(task) = self.realtime_task.lock().unwrap().take() {
            task.abort();
        }
        self.realtime_publish_task.abort();

        if let Some(buf) = self.active.lock().await.take() {
            buf.destroy().await;
        }
    }

    async fn run_flush(self: &Arc<Self>, reason: FlushReason) -> Result<(), IngestError> {
        if self.destroying.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Reserved synchronously, before any await, so two concurrent
        // `flush()` calls can't both observe "no flush running" during the
        // window before `run_flush_pipeline` actually populates `flushing`.
        if self.flush_in_progress.swap(true, Ordering::SeqCst) {
            warn!(
                "flush already running for {}:{}, reason={reason}",
                self.identity.team, self.identity.session
            );
            return Err(IngestError::FlushAlreadyRunning);
        }

        let hard_timeout = Duration::from_millis(self.config.max_flush_time_ms);
        let started = tokio::time::Instant::now();
        let result = match tokio::time::timeout(hard_timeout, self.run_flush_pipeline(reason)).await
        {
            Ok(r) => r,
            Err(_) => {
                error!(
                    "flush for {}:{} exceeded the {}ms hard deadline",
                    self.identity.team, self.identity.session, self.config.max_flush_time_ms
                );
                Err(IngestError::FlushTimedOut)
            }
        };

        if let Err(ref e) = result {
            if !matches!(e, IngestError::UploadAborted) {
                metrics::S3_WRITE_ERRORED.inc();
            }
        } else {
            metrics::SESSION_FLUSH_TIME_SECONDS.observe(started.elapsed().as_secs_f64());
        }

        self.end_flush().await;
        self.flush_in_progress.store(false, Ordering::SeqCst);
        result
    }

    /// Steps 2-8 of the flush pipeline: swap, validate, derive the key,
    /// close the writer, upload, and record metrics. Wrapped by
    /// `run_flush`'s hard timeout and followed unconditionally by
    /// `end_flush` (spec §4.C).
    async fn run_flush_pipeline(self: &Arc<Self>, reason: FlushReason) -> Result<(), IngestError> {
        let local_dir = PathBuf::from(&self.config.local_directory);
        let new_buffer =
            Buffer::create(&local_dir, &self.identity.team, &self.identity.session).await?;

        let old_active = {
            let mut guard = self.active.lock().await;
            match guard.take() {
                Some(old) => {
                    *guard = Some(new_buffer);
                    old
                }
                None => {
                    return Err(IngestError::InvariantViolation(
                        "manager destroyed before flush swap".into(),
                    ))
                }
            }
        };
        *self.flushing.lock().await = Some(old_active);

        let (count, events_range, file_path, age_seconds) = {
            let guard = self.flushing.lock().await;
            let buf = guard.as_ref().expect("flushing buffer just set");
            (
                buf.count,
                buf.events_range,
                buf.file.clone(),
                buf.age_in_memory_ms() as f64 / 1000.0,
            )
        };

        // Preserves an intentional quirk (spec §9): this check runs after
        // the swap has already replaced `active`, so an empty flush still
        // discards the freshly-created buffer's predecessor.
        if count == 0 || events_range.is_none() {
            warn!(
                "empty flush attempted for {}:{} (reason={reason})",
                self.identity.team, self.identity.session
            );
            return Err(IngestError::EmptyFlush);
        }
        let events_range = events_range.unwrap();

        let key = object_key(
            &self.config.remote_folder,
            &self.identity.team,
            &self.identity.session,
            &events_range,
        );

        {
            let mut guard = self.flushing.lock().await;
            let buf = guard.as_mut().expect("flushing buffer present");
            with_soft_timeout(SOFT_TIMEOUT, "ending buffer writer", buf.end_writer()).await?;
        }

        let mut upload = self.object_store.begin_gzip_upload(&key, &file_path).await?;
        let cancelled = self.upload_cancel.notified();
        tokio::pin!(cancelled);

        let outcome = tokio::select! {
            biased;
            _ = &mut cancelled => UploadOutcome::Cancelled,
            result = with_soft_timeout(SOFT_TIMEOUT, "awaiting upload completion", upload.complete()) => {
                UploadOutcome::Completed(result)
            }
        };

        match outcome {
            UploadOutcome::Completed(Ok(())) => {}
            UploadOutcome::Completed(Err(e)) => return Err(e),
            UploadOutcome::Cancelled => {
                let _ = upload.abort().await;
                return Err(IngestError::UploadAborted);
            }
        }

        let size_kb = {
            let guard = self.flushing.lock().await;
            guard.as_ref().map_or(0.0, |b| b.size_estimate as f64 / 1024.0)
        };
        metrics::S3_FILES_WRITTEN.with_label_values(&[reason.as_str()]).inc();
        metrics::S3_LINES_WRITTEN_HISTOGRAM.observe(count as f64);
        metrics::BLOB_INGESTION_S3_KB_WRITTEN.observe(size_kb);
        metrics::SESSION_AGE_SECONDS
            .with_label_values(&[reason.as_str()])
            .observe(age_seconds);
        metrics::SESSION_SIZE_KB.observe(size_kb);
        metrics::SESSION_LINES.observe(count as f64);

        Ok(())
    }

    /// Runs exactly once per flush attempt regardless of outcome: takes the
    /// flushing buffer, reports its offsets via `onFinish` if it ever held
    /// any, and removes its file. Also disables the realtime mirror, since
    /// it mirrored the buffer generation that just ended (spec §4.C step
    /// 10, §4.D).
    async fn end_flush(self: &Arc<Self>) {
        self.realtime.store(false, Ordering::SeqCst);
        // Clear realtime state on finalize, mirroring the clear performed
        // on construction (spec §6: "on construction and on finalize").
        self.realtime_store
            .clear_all_messages(&self.identity.team, &self.identity.session)
            .await;

        let Some(buf) = self.flushing.lock().await.take() else {
            return;
        };
        let offsets = buf.offsets.map(|o| FlushedOffsets { lowest: o.lowest, highest: o.highest });
        buf.destroy().await;

        if let Some(offsets) = offsets {
            (self.on_finish)(offsets);
        }
    }
}

enum UploadOutcome {
    Completed(Result<(), IngestError>),
    Cancelled,
}

/// Race `fut` against a `duration` sleep; on expiry, log and keep awaiting
/// the same future rather than cancelling it — the soft-timeout semantics
/// used for the writer-close and upload-completion steps (spec §4.C).
async fn with_soft_timeout<F, T>(duration: Duration, label: &str, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::pin!(fut);
    tokio::select! {
        biased;
        result = &mut fut => result,
        _ = tokio::time::sleep(duration) => {
            warn!("{label} exceeded the {duration:?} soft timeout; continuing to wait");
            (&mut fut).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageMetadata;
    use crate::realtime::InMemoryRealtimeStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU64;
    use tempfile::tempdir;

    fn message(offset: u64, ts: i64) -> IncomingMessage {
        IncomingMessage {
            metadata: MessageMetadata { timestamp: ts, offset, partition: 0, topic: "t".into() },
            events: vec![crate::message::RecordingEvent { timestamp: ts, extra: json!({}) }],
            payload: json!({"offset": offset}),
        }
    }

    async fn manager(dir: &std::path::Path) -> (Arc<SessionManager>, Arc<AtomicU64>) {
        let config = EngineConfig {
            local_directory: dir.to_string_lossy().to_string(),
            max_buffer_size_kb: 1, // trip the size trigger almost immediately
            max_flush_time_ms: 5_000,
            ..EngineConfig::default()
        };
        let identity = SessionIdentity {
            team: "team1".into(),
            session: "sess1".into(),
            partition: 0,
            topic: "events".into(),
        };
        let last_highest = Arc::new(AtomicU64::new(0));
        let captured = Arc::clone(&last_highest);
        let on_finish: OnFinish = Arc::new(move |offsets| {
            captured.store(offsets.highest, Ordering::SeqCst);
        });

        let manager = SessionManager::new(
            identity,
            config,
            ObjectStoreClient::in_memory(),
            Arc::new(InMemoryRealtimeStore::new()),
            on_finish,
        )
        .await
        .unwrap();
        (manager, last_highest)
    }

    #[tokio::test]
    async fn size_triggered_flush_reports_offsets() {
        let dir = tempdir().unwrap();
        let (manager, last_highest) = manager(dir.path()).await;

        for i in 0..50 {
            manager.add(message(i, 1_000 + i as i64)).await.unwrap();
        }

        // allow the spawned size-flush to complete
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(last_highest.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn manual_flush_on_empty_buffer_is_an_error() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path()).await;
        let result = manager.flush(FlushReason::Manual).await;
        assert!(matches!(result, Err(IngestError::EmptyFlush)));
    }

    #[tokio::test]
    async fn concurrent_flush_is_rejected() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path()).await;
        manager.add(message(1, 1_000)).await.unwrap();

        let m2 = Arc::clone(&manager);
        let first = tokio::spawn(async move { m2.flush(FlushReason::Manual).await });
        tokio::task::yield_now().await;
        let second = manager.flush(FlushReason::Manual).await;

        let first_result = first.await.unwrap();
        assert!(first_result.is_ok() || matches!(second, Err(IngestError::FlushAlreadyRunning)));
    }

    #[tokio::test]
    async fn get_lowest_offset_is_none_on_empty_active_buffer() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path()).await;
        assert_eq!(manager.get_lowest_offset().await, None);
    }

    #[tokio::test]
    async fn destroy_removes_active_buffer_file() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path()).await;
        manager.add(message(1, 1_000)).await.unwrap();
        manager.destroy().await;
        assert!(manager.is_empty().await);
    }
}
