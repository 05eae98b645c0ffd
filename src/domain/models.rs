//! Entity structs mirroring the relational schema of SPEC_FULL.md §3.
//! These are shared between the Postgres-backed `MetadataStore` and the
//! in-memory test double; the filesystem-backed (old-layout) metadata
//! store translates to/from these at its boundary instead of owning them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Repository {
    pub id: Uuid,
    pub path: String,
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Blob {
    pub digest: String,
    pub media_type: String,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestLayer {
    pub position: i32,
    pub blob_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestListItem {
    pub position: i32,
    pub child_digest: String,
    pub platform_os: Option<String>,
    pub platform_arch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub schema_version: i32,
    pub media_type: String,
    pub digest: String,
    pub payload: Vec<u8>,
    pub config_media_type: Option<String>,
    pub config_digest: Option<String>,
    pub config_payload: Option<Vec<u8>>,
    /// Populated only when the caller asked for layers/children to be
    /// joined in; absent on the lightweight row-only fetch paths.
    pub layers: Vec<ManifestLayer>,
    pub list_items: Vec<ManifestListItem>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tag {
    pub repository_id: Uuid,
    pub name: String,
    pub manifest_id: Uuid,
}

#[derive(Debug, Clone, FromRow)]
pub struct GcManifestTask {
    pub repository_id: Uuid,
    pub manifest_id: Uuid,
    pub review_after: DateTime<Utc>,
}
