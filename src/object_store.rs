//! Flush pipeline steps 6-7 (spec §4.C): gzip the sealed buffer file and
//! hand it to a multipart upload, retaining the handle so `destroy` can
//! abort an in-flight upload.
//!
//! Grounded on the pack's `object_store` usage (sui-analytics-indexer's
//! `MockStore`/`ObjectStore` trait wrapping): we program against
//! `object_store::ObjectStore` rather than a concrete cloud SDK, so the
//! production backend (S3, GCS, local disk, ...) and the in-memory test
//! backend share one code path.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzEncoder;
use flate2::Compression;
use object_store::path::Path as ObjectPath;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use tracing::instrument;

use crate::error::IngestError;

/// Thin wrapper around an `object_store::ObjectStore` handle. Shared
/// read-only across all `SessionManager`s (spec §5: "The ... object store
/// client is shared across all managers").
#[derive(Clone)]
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreClient {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// In-memory backend for tests and local smoke-testing.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }

    /// Gzip `file_path`'s contents and begin a multipart upload to `key`,
    /// returning a handle the caller retains as `inProgressUpload` so a
    /// concurrent `destroy()` can abort it (spec §4.C step 6, §5).
    #[instrument(skip(self), fields(key))]
    pub async fn begin_gzip_upload(
        &self,
        key: &str,
        file_path: &Path,
    ) -> Result<InProgressUpload, IngestError> {
        let compressed = gzip_file(file_path).await?;
        let object_path = ObjectPath::from(key);
        let handle = self
            .store
            .put_multipart(&object_path)
            .await
            .map_err(IngestError::ObjectStoreError)?;

        Ok(InProgressUpload {
            handle,
            payload: compressed,
        })
    }
}

/// Compress `path`'s contents with gzip off the async runtime thread,
/// since `flate2`'s `GzEncoder` is a synchronous `Read` adapter.
async fn gzip_file(path: &Path) -> Result<Bytes, IngestError> {
    let path = path.to_path_buf();
    let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
        let file = std::fs::File::open(&path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        let mut out = Vec::new();
        encoder.read_to_end(&mut out)?;
        Ok(out)
    })
    .await
    .map_err(|e| IngestError::UploadError(format!("gzip task panicked: {e}")))??;

    Ok(Bytes::from(bytes))
}

/// A retained, abortable multipart upload. Exclusively owned by the
/// manager performing a single flush (spec §3 "Ownership").
pub struct InProgressUpload {
    handle: Box<dyn MultipartUpload>,
    payload: Bytes,
}

impl InProgressUpload {
    /// Write the whole gzipped payload as a single part and complete the
    /// upload. Real multi-gigabyte recordings would chunk this; session
    /// recording batches are capped well below any part-size limit by the
    /// `buffer_size` flush trigger (spec §4.B), so one part suffices.
    /// Takes `&mut self` rather than consuming the upload so a concurrent
    /// `destroy()` can still reach `abort` while this is in flight — they
    /// race via cancellation, not via exclusive ownership.
    #[instrument(skip(self))]
    pub async fn complete(&mut self) -> Result<(), IngestError> {
        let payload = PutPayload::from_bytes(self.payload.clone());
        self.handle
            .put_part(payload)
            .await
            .map_err(|e| IngestError::UploadError(e.to_string()))?;
        self.handle
            .complete()
            .await
            .map_err(|e| IngestError::UploadError(e.to_string()))?;
        Ok(())
    }

    /// Abort the upload. Called from `destroy()`; an error here is
    /// expected and silent per spec §7 ("Upload abort during destroy").
    #[instrument(skip(self))]
    pub async fn abort(&mut self) -> Result<(), IngestError> {
        self.handle
            .abort()
            .await
            .map_err(|e| IngestError::UploadError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn gzip_then_multipart_upload_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.jsonl");
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"{\"a\":1}\n{\"a\":2}\n").await.unwrap();
        file.flush().await.unwrap();

        let client = ObjectStoreClient::in_memory();
        let mut upload = client.begin_gzip_upload("team/session/data/1-2", &path).await.unwrap();
        upload.complete().await.unwrap();
    }

    #[tokio::test]
    async fn abort_does_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.jsonl");
        tokio::fs::write(&path, b"{}\n").await.unwrap();

        let client = ObjectStoreClient::in_memory();
        let mut upload = client.begin_gzip_upload("team/session/data/1-1", &path).await.unwrap();
        upload.abort().await.unwrap();
    }
}
