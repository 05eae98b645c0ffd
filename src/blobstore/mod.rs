//! The blob store (§4.2): stat/read/delete of immutable content-addressed
//! bytes, plus resumable upload sessions. One object store backs the
//! whole registry — unlike metadata, blob bytes are never dual-written
//! (§3 "Object store exclusively owns blob bytes").

pub mod filesystem;
pub mod memory;
pub mod upload_token;

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::domain::Digest;
use crate::error::{AppError, OciError};

pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end offset, per HTTP `Range` semantics.
    pub end: u64,
}

pub struct BlobContent {
    pub reader: BlobReader,
    /// Number of bytes the reader will yield (the range length, or the
    /// full blob size when no range was requested).
    pub content_length: u64,
    pub total_size: u64,
}

/// A single resumable upload's session state as tracked by the blob
/// store, independent of the HMAC token carried on the wire.
#[derive(Debug, Clone)]
pub struct UploadSessionInfo {
    pub uuid: String,
    pub offset: u64,
    pub started_at: i64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns the blob's size, or `BlobUnknown` if no blob with that
    /// digest has been committed.
    async fn stat(&self, digest: &Digest) -> Result<u64, AppError>;

    /// Opens a reader over `digest`'s bytes, honoring `range` when given.
    async fn read(&self, digest: &Digest, range: Option<ByteRange>) -> Result<BlobContent, AppError>;

    /// Removes a committed blob's bytes. Implementations that don't
    /// support deletion (e.g. an immutable backing store) return
    /// `OciError::Unsupported`.
    async fn delete(&self, digest: &Digest) -> Result<(), AppError>;

    /// Starts a new upload session with offset 0.
    async fn create_upload(&self) -> Result<UploadSessionInfo, AppError>;

    /// Looks up a session's persisted offset, for GET-status and for the
    /// four-way cross-check on PATCH/PUT (§4.3).
    async fn session_info(&self, uuid: &str) -> Result<UploadSessionInfo, AppError>;

    /// Appends `data` to the session's partial bytes, returning the new
    /// total offset.
    async fn append_chunk(
        &self,
        uuid: &str,
        data: Pin<Box<dyn tokio::io::AsyncRead + Send>>,
    ) -> Result<u64, AppError>;

    /// Finalizes a session: verifies the accumulated bytes hash to
    /// `expected_digest`, commits them into the content-addressed store,
    /// and releases the session. Returns the committed size.
    async fn commit_upload(&self, uuid: &str, expected_digest: &Digest) -> Result<u64, AppError>;

    /// Aborts a session, releasing any partial bytes.
    async fn abort_upload(&self, uuid: &str) -> Result<(), AppError>;
}

pub(crate) fn blob_unknown(digest: &Digest) -> AppError {
    AppError::Oci(OciError::BlobUnknown(digest.to_string()))
}

pub(crate) fn upload_unknown(uuid: &str) -> AppError {
    AppError::Oci(OciError::BlobUploadUnknown(uuid.to_string()))
}
