//! A shared, process-wide in-memory blob store keyed by digest (§9 Design
//! Notes: "Shared in-memory blob driver keyed by name is used in the
//! source for tests; specify it only as a capability"). Covered by its own
//! unit tests below, and wired into the HTTP surface as a drop-in
//! `BlobStore` by `tests/api_integration.rs`'s memory-backed suite.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::RwLock;

use super::{BlobContent, BlobStore, ByteRange, UploadSessionInfo, blob_unknown, upload_unknown};
use crate::domain::{Digest, DigestVerifier};
use crate::error::{AppError, OciError};

struct PendingUpload {
    bytes: Vec<u8>,
    started_at: i64,
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
}

#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Minimal `AsyncRead` over an owned byte buffer; avoids depending on an
/// unverified tokio blanket impl for `std::io::Cursor`.
struct VecReader {
    data: Vec<u8>,
    pos: usize,
}

impl VecReader {
    fn new(data: Vec<u8>) -> Self {
        VecReader { data, pos: 0 }
    }
}

impl AsyncRead for VecReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let remaining = &this.data[this.pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn stat(&self, digest: &Digest) -> Result<u64, AppError> {
        let inner = self.inner.read().await;
        inner
            .blobs
            .get(&digest.to_string())
            .map(|b| b.len() as u64)
            .ok_or_else(|| blob_unknown(digest))
    }

    async fn read(&self, digest: &Digest, range: Option<ByteRange>) -> Result<BlobContent, AppError> {
        let inner = self.inner.read().await;
        let bytes = inner
            .blobs
            .get(&digest.to_string())
            .ok_or_else(|| blob_unknown(digest))?;
        let total_size = bytes.len() as u64;

        let slice = match range {
            Some(r) => {
                let end = r.end.min(total_size.saturating_sub(1));
                if r.start > end {
                    bytes[0..0].to_vec()
                } else {
                    bytes[r.start as usize..=end as usize].to_vec()
                }
            }
            None => bytes.clone(),
        };
        let content_length = slice.len() as u64;
        Ok(BlobContent {
            reader: Box::pin(VecReader::new(slice)),
            content_length,
            total_size,
        })
    }

    async fn delete(&self, digest: &Digest) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        if inner.blobs.remove(&digest.to_string()).is_none() {
            return Err(blob_unknown(digest));
        }
        Ok(())
    }

    async fn create_upload(&self) -> Result<UploadSessionInfo, AppError> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now().timestamp();
        let mut inner = self.inner.write().await;
        inner.uploads.insert(
            uuid.clone(),
            PendingUpload {
                bytes: Vec::new(),
                started_at,
            },
        );
        Ok(UploadSessionInfo {
            uuid,
            offset: 0,
            started_at,
        })
    }

    async fn session_info(&self, uuid: &str) -> Result<UploadSessionInfo, AppError> {
        let inner = self.inner.read().await;
        let upload = inner.uploads.get(uuid).ok_or_else(|| upload_unknown(uuid))?;
        Ok(UploadSessionInfo {
            uuid: uuid.to_string(),
            offset: upload.bytes.len() as u64,
            started_at: upload.started_at,
        })
    }

    async fn append_chunk(
        &self,
        uuid: &str,
        mut data: Pin<Box<dyn AsyncRead + Send>>,
    ) -> Result<u64, AppError> {
        use tokio::io::AsyncReadExt;
        let mut chunk = Vec::new();
        data.read_to_end(&mut chunk).await.map_err(AppError::from)?;

        let mut inner = self.inner.write().await;
        let upload = inner.uploads.get_mut(uuid).ok_or_else(|| upload_unknown(uuid))?;
        upload.bytes.extend_from_slice(&chunk);
        Ok(upload.bytes.len() as u64)
    }

    async fn commit_upload(&self, uuid: &str, expected_digest: &Digest) -> Result<u64, AppError> {
        let mut inner = self.inner.write().await;
        let upload = inner
            .uploads
            .remove(uuid)
            .ok_or_else(|| upload_unknown(uuid))?;

        let mut verifier = DigestVerifier::new();
        verifier.update(&upload.bytes);
        if !verifier.verify(expected_digest) {
            return Err(AppError::Oci(OciError::DigestInvalid(format!(
                "uploaded bytes do not hash to {expected_digest}"
            ))));
        }

        let size = upload.bytes.len() as u64;
        inner.blobs.insert(expected_digest.to_string(), upload.bytes);
        Ok(size)
    }

    async fn abort_upload(&self, uuid: &str) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        inner
            .uploads
            .remove(uuid)
            .map(|_| ())
            .ok_or_else(|| upload_unknown(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn reader(bytes: &[u8]) -> Pin<Box<dyn AsyncRead + Send>> {
        Box::pin(VecReader::new(bytes.to_vec()))
    }

    #[tokio::test]
    async fn upload_commit_and_read_round_trip() {
        let store = InMemoryBlobStore::new();
        let session = store.create_upload().await.unwrap();
        let offset = store.append_chunk(&session.uuid, reader(b"hello world")).await.unwrap();
        assert_eq!(offset, 11);

        let digest = crate::domain::digest::digest_bytes(b"hello world");
        let size = store.commit_upload(&session.uuid, &digest).await.unwrap();
        assert_eq!(size, 11);

        let stat = store.stat(&digest).await.unwrap();
        assert_eq!(stat, 11);

        let mut content = store.read(&digest, None).await.unwrap();
        let mut buf = Vec::new();
        content.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn commit_rejects_digest_mismatch() {
        let store = InMemoryBlobStore::new();
        let session = store.create_upload().await.unwrap();
        store.append_chunk(&session.uuid, reader(b"hello world")).await.unwrap();

        let wrong_digest = crate::domain::digest::digest_bytes(b"not the same bytes");
        let err = store.commit_upload(&session.uuid, &wrong_digest).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn range_read_returns_requested_slice() {
        let store = InMemoryBlobStore::new();
        let session = store.create_upload().await.unwrap();
        store.append_chunk(&session.uuid, reader(b"0123456789")).await.unwrap();
        let digest = crate::domain::digest::digest_bytes(b"0123456789");
        store.commit_upload(&session.uuid, &digest).await.unwrap();

        let mut content = store
            .read(&digest, Some(ByteRange { start: 2, end: 4 }))
            .await
            .unwrap();
        let mut buf = Vec::new();
        content.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"234");
        assert_eq!(content.total_size, 10);
    }

    #[tokio::test]
    async fn stat_on_missing_digest_is_blob_unknown() {
        let store = InMemoryBlobStore::new();
        let digest = crate::domain::digest::digest_bytes(b"never uploaded");
        let err = store.stat(&digest).await.unwrap_err();
        assert!(matches!(err, AppError::Oci(OciError::BlobUnknown(_))));
    }

    #[tokio::test]
    async fn session_info_tracks_running_offset() {
        let store = InMemoryBlobStore::new();
        let session = store.create_upload().await.unwrap();
        store.append_chunk(&session.uuid, reader(b"abc")).await.unwrap();
        store.append_chunk(&session.uuid, reader(b"def")).await.unwrap();
        let info = store.session_info(&session.uuid).await.unwrap();
        assert_eq!(info.offset, 6);
    }
}
