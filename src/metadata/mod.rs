//! The metadata store (§3, §4.7): relational model and CRUD for
//! repositories, manifests, blobs, tags, manifest-list items, and the GC
//! review queue. `MetadataStore` is the capability every handler is
//! written against; `postgres` and `filesystem` are its two concrete
//! backends, selected and possibly mirrored by the dual-write router in
//! `crate::router`.
//!
//! GC coordination (§4.8) is deliberately NOT part of this trait: it is a
//! `SELECT ... FOR UPDATE`-based protocol that only a genuine relational
//! backend can implement, and lives in `crate::gc` operating directly on
//! the Postgres pool.

pub mod filesystem;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Digest, Reference};
use crate::domain::models::{Blob, Manifest, ManifestLayer, ManifestListItem, Repository, Tag};
use crate::error::AppError;

/// Pagination request shared by tag listing and catalog listing (§4.5, §4.6).
#[derive(Debug, Clone)]
pub struct Pagination {
    pub n: usize,
    pub last: Option<String>,
}

impl Pagination {
    pub const DEFAULT_N: usize = 100;

    pub fn new(n: Option<i64>, last: Option<String>) -> Self {
        let n = match n {
            Some(n) if n > 0 => n as usize,
            _ => Self::DEFAULT_N,
        };
        Pagination { n, last }
    }
}

/// A page of lexicographically sorted names, with the marker to continue
/// from when `has_more` — the `Link: ...; rel="next"` contract of §4.5/§4.6.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<String>,
    pub next_last: Option<String>,
}

/// Everything needed to persist a manifest: the row plus its layer and
/// list-item associations, as parsed by the manifest engine (§4.4).
#[derive(Debug, Clone)]
pub struct NewManifest {
    pub schema_version: i32,
    pub media_type: String,
    pub digest: Digest,
    pub payload: Vec<u8>,
    pub config_media_type: Option<String>,
    pub config_digest: Option<Digest>,
    pub config_payload: Option<Vec<u8>>,
    pub layers: Vec<ManifestLayer>,
    pub list_items: Vec<ManifestListItem>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Looks up a repository by path without creating it.
    async fn get_repository(&self, path: &str) -> Result<Option<Repository>, AppError>;

    /// Creates the repository row on first write if absent (§3: "created
    /// lazily on the first successful blob upload, manifest push, or tag
    /// write"), otherwise returns the existing row.
    async fn ensure_repository(&self, path: &str) -> Result<Repository, AppError>;

    /// Links `digest` to `repository_id`, creating the `Blob` row if this
    /// is the first time this digest has been seen anywhere. Idempotent:
    /// re-linking an already-linked blob is a no-op (§5 upload idempotency).
    async fn link_blob(
        &self,
        repository_id: Uuid,
        digest: &Digest,
        media_type: &str,
        size: u64,
    ) -> Result<(), AppError>;

    /// Whether `digest` is linked to `repository_id` — the gate behind
    /// every blob GET/HEAD (§3 RepositoryBlob link).
    async fn blob_linked(&self, repository_id: Uuid, digest: &Digest) -> Result<bool, AppError>;

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Blob>, AppError>;

    /// Removes the repository↔blob link. Does not touch the `Blob` row
    /// itself or the object store; GC owns blob-row reclamation.
    async fn unlink_blob(&self, repository_id: Uuid, digest: &Digest) -> Result<(), AppError>;

    /// Idempotent create-or-find of a manifest row plus its layer/list-item
    /// associations (§4.4 "CreateOrFind"). Returns the persisted manifest
    /// with `id` populated, whether newly inserted or pre-existing.
    async fn put_manifest(
        &self,
        repository_id: Uuid,
        manifest: NewManifest,
    ) -> Result<Manifest, AppError>;

    async fn get_manifest_by_digest(
        &self,
        repository_id: Uuid,
        digest: &Digest,
    ) -> Result<Option<Manifest>, AppError>;

    async fn get_manifest_by_id(&self, manifest_id: Uuid) -> Result<Option<Manifest>, AppError>;

    /// Resolves a `Reference` (tag or digest) to a manifest within a
    /// repository, the join every GET/HEAD manifest handler performs.
    async fn resolve_reference(
        &self,
        repository_id: Uuid,
        reference: &Reference,
    ) -> Result<Option<Manifest>, AppError>;

    /// Removes every tag in this repository pointing at `manifest_id` and
    /// tombstones the manifest itself, so it becomes unreachable via
    /// `get_manifest_by_digest` and a second DELETE on the same digest
    /// returns `ManifestUnknown` (§4.4 DELETE semantics). The row itself is
    /// left for GC to reap; re-pushing the same digest later clears the
    /// tombstone.
    async fn delete_manifest_link(&self, repository_id: Uuid, manifest_id: Uuid) -> Result<(), AppError>;

    async fn get_tag(&self, repository_id: Uuid, name: &str) -> Result<Option<Tag>, AppError>;

    /// Upserts `(repository_id, name) -> manifest_id`, atomically
    /// replacing any prior pointer (§3 Tag invariant).
    async fn upsert_tag(&self, repository_id: Uuid, name: &str, manifest_id: Uuid) -> Result<(), AppError>;

    async fn delete_tag(&self, repository_id: Uuid, name: &str) -> Result<(), AppError>;

    /// Whether any tag in this repository still points at `manifest_id` —
    /// used by the GC dangling check (§4.8) and by manifest-list deletion.
    async fn manifest_has_tags(&self, repository_id: Uuid, manifest_id: Uuid) -> Result<bool, AppError>;

    /// Whether any manifest list in this repository still references
    /// `manifest_id` as a child — the other half of the GC dangling check.
    async fn manifest_has_list_references(&self, manifest_id: Uuid) -> Result<bool, AppError>;

    async fn list_tags(&self, repository_id: Uuid, page: Pagination) -> Result<Page, AppError>;

    async fn list_repositories(&self, page: Pagination) -> Result<Page, AppError>;
}
