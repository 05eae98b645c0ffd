//! The relational metadata backend (§3, §4.7), backed by a Postgres pool
//! via `sqlx`. This is the store the dual-write router treats as
//! authoritative for pagination (§4.7 contract 3) and, in the
//! database-only/database-first configurations, for everything else.
//!
//! Grounded in the teacher's `storage/repo_storage.rs`/`user_storage.rs`
//! (the `sqlx::query_as` + `Arc<Pool>` pattern), generalized from SQLite to
//! Postgres and from a single-table repo lookup to the full schema of
//! SPEC_FULL.md §3.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{MetadataStore, NewManifest, Page, Pagination};
use crate::domain::models::{Blob, Manifest, ManifestLayer, ManifestListItem, Repository, Tag};
use crate::domain::{Digest, Reference};
use crate::error::AppError;

pub struct PostgresMetadataStore {
    pool: PgPool,
}

impl PostgresMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        PostgresMetadataStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_layers(&self, manifest_id: Uuid) -> Result<Vec<ManifestLayer>, AppError> {
        let rows = sqlx::query(
            "SELECT position, blob_digest FROM manifest_layers WHERE manifest_id = $1 ORDER BY position",
        )
        .bind(manifest_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ManifestLayer {
                position: r.get("position"),
                blob_digest: r.get("blob_digest"),
            })
            .collect())
    }

    async fn load_list_items(&self, manifest_id: Uuid) -> Result<Vec<ManifestListItem>, AppError> {
        let rows = sqlx::query(
            "SELECT position, child_digest, platform_os, platform_arch FROM manifest_list_items \
             WHERE manifest_id = $1 ORDER BY position",
        )
        .bind(manifest_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ManifestListItem {
                position: r.get("position"),
                child_digest: r.get("child_digest"),
                platform_os: r.get("platform_os"),
                platform_arch: r.get("platform_arch"),
            })
            .collect())
    }

    async fn row_to_manifest(&self, row: sqlx::postgres::PgRow) -> Result<Manifest, AppError> {
        let id: Uuid = row.get("id");
        let layers = self.load_layers(id).await?;
        let list_items = self.load_list_items(id).await?;
        Ok(Manifest {
            id,
            repository_id: row.get("repository_id"),
            schema_version: row.get("schema_version"),
            media_type: row.get("media_type"),
            digest: row.get("digest"),
            payload: row.get("payload"),
            config_media_type: row.get("config_media_type"),
            config_digest: row.get("config_digest"),
            config_payload: row.get("config_payload"),
            layers,
            list_items,
        })
    }
}

#[async_trait]
impl MetadataStore for PostgresMetadataStore {
    async fn get_repository(&self, path: &str) -> Result<Option<Repository>, AppError> {
        let repo = sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE path = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(repo)
    }

    async fn ensure_repository(&self, path: &str) -> Result<Repository, AppError> {
        if let Some(repo) = self.get_repository(path).await? {
            return Ok(repo);
        }
        let repo = sqlx::query_as::<_, Repository>(
            "INSERT INTO repositories (id, path, parent_id, created_at) \
             VALUES ($1, $2, NULL, now()) \
             ON CONFLICT (path) DO UPDATE SET path = EXCLUDED.path \
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(path)
        .fetch_one(&self.pool)
        .await?;
        Ok(repo)
    }

    async fn link_blob(
        &self,
        repository_id: Uuid,
        digest: &Digest,
        media_type: &str,
        size: u64,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO blobs (digest, media_type, size) VALUES ($1, $2, $3) \
             ON CONFLICT (digest) DO NOTHING",
        )
        .bind(digest.to_string())
        .bind(media_type)
        .bind(size as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO repository_blobs (repository_id, blob_digest) VALUES ($1, $2) \
             ON CONFLICT (repository_id, blob_digest) DO NOTHING",
        )
        .bind(repository_id)
        .bind(digest.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn blob_linked(&self, repository_id: Uuid, digest: &Digest) -> Result<bool, AppError> {
        let row = sqlx::query(
            "SELECT 1 FROM repository_blobs WHERE repository_id = $1 AND blob_digest = $2",
        )
        .bind(repository_id)
        .bind(digest.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Blob>, AppError> {
        let blob = sqlx::query_as::<_, Blob>("SELECT * FROM blobs WHERE digest = $1")
            .bind(digest.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(blob)
    }

    async fn unlink_blob(&self, repository_id: Uuid, digest: &Digest) -> Result<(), AppError> {
        sqlx::query("DELETE FROM repository_blobs WHERE repository_id = $1 AND blob_digest = $2")
            .bind(repository_id)
            .bind(digest.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository_id: Uuid,
        manifest: NewManifest,
    ) -> Result<Manifest, AppError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            "SELECT id FROM manifests WHERE repository_id = $1 AND digest = $2",
        )
        .bind(repository_id)
        .bind(manifest.digest.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let manifest_id = if let Some(row) = existing {
            let id = row.get::<Uuid, _>("id");
            // A re-push of a previously deleted digest (§4.4) reinstates it:
            // CreateOrFind is idempotent on the digest, not on deletion state.
            sqlx::query("UPDATE manifests SET deleted_at = NULL WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            id
        } else {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO manifests \
                 (id, repository_id, schema_version, media_type, digest, payload, \
                  config_media_type, config_digest, config_payload) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(id)
            .bind(repository_id)
            .bind(manifest.schema_version)
            .bind(&manifest.media_type)
            .bind(manifest.digest.to_string())
            .bind(&manifest.payload)
            .bind(&manifest.config_media_type)
            .bind(manifest.config_digest.as_ref().map(|d| d.to_string()))
            .bind(&manifest.config_payload)
            .execute(&mut *tx)
            .await?;

            for layer in &manifest.layers {
                sqlx::query(
                    "INSERT INTO manifest_layers (manifest_id, position, blob_digest) \
                     VALUES ($1, $2, $3) ON CONFLICT (manifest_id, position) DO NOTHING",
                )
                .bind(id)
                .bind(layer.position)
                .bind(&layer.blob_digest)
                .execute(&mut *tx)
                .await?;
            }

            for item in &manifest.list_items {
                sqlx::query(
                    "INSERT INTO manifest_list_items \
                     (manifest_id, position, child_digest, platform_os, platform_arch) \
                     VALUES ($1, $2, $3, $4, $5) ON CONFLICT (manifest_id, position) DO NOTHING",
                )
                .bind(id)
                .bind(item.position)
                .bind(&item.child_digest)
                .bind(&item.platform_os)
                .bind(&item.platform_arch)
                .execute(&mut *tx)
                .await?;
            }

            id
        };

        tx.commit().await?;

        self.get_manifest_by_id(manifest_id)
            .await?
            .ok_or_else(|| AppError::Internal("manifest vanished immediately after insert".into()))
    }

    async fn get_manifest_by_digest(
        &self,
        repository_id: Uuid,
        digest: &Digest,
    ) -> Result<Option<Manifest>, AppError> {
        let row = sqlx::query(
            "SELECT * FROM manifests WHERE repository_id = $1 AND digest = $2 AND deleted_at IS NULL",
        )
        .bind(repository_id)
        .bind(digest.to_string())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_manifest(row).await?)),
            None => Ok(None),
        }
    }

    /// Looked up by id rather than digest, this bypasses the tombstone
    /// filter `get_manifest_by_digest` applies — GC's dangling-reference
    /// checks need to see a manifest even after it has been deleted.
    async fn get_manifest_by_id(&self, manifest_id: Uuid) -> Result<Option<Manifest>, AppError> {
        let row = sqlx::query("SELECT * FROM manifests WHERE id = $1")
            .bind(manifest_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.row_to_manifest(row).await?)),
            None => Ok(None),
        }
    }

    async fn resolve_reference(
        &self,
        repository_id: Uuid,
        reference: &Reference,
    ) -> Result<Option<Manifest>, AppError> {
        match reference {
            Reference::Digest(d) => self.get_manifest_by_digest(repository_id, d).await,
            Reference::Tag(name) => {
                let Some(tag) = self.get_tag(repository_id, name).await? else {
                    return Ok(None);
                };
                self.get_manifest_by_id(tag.manifest_id).await
            }
        }
    }

    async fn delete_manifest_link(&self, repository_id: Uuid, manifest_id: Uuid) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tags WHERE repository_id = $1 AND manifest_id = $2")
            .bind(repository_id)
            .bind(manifest_id)
            .execute(&mut *tx)
            .await?;
        // There is no direct repository<->manifest link table distinct from
        // `manifests.repository_id` (a manifest belongs to exactly one
        // repository, unlike blobs). Tombstoning the row itself is what
        // makes the digest unreachable (§4.4): without this, a second
        // DELETE on the same digest would keep finding it via
        // `get_manifest_by_digest` and return 202 again instead of 404.
        // Reclamation of the row is still left to GC.
        sqlx::query(
            "UPDATE manifests SET deleted_at = now() \
             WHERE repository_id = $1 AND id = $2 AND deleted_at IS NULL",
        )
        .bind(repository_id)
        .bind(manifest_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_tag(&self, repository_id: Uuid, name: &str) -> Result<Option<Tag>, AppError> {
        let tag = sqlx::query_as::<_, Tag>(
            "SELECT * FROM tags WHERE repository_id = $1 AND name = $2",
        )
        .bind(repository_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tag)
    }

    async fn upsert_tag(&self, repository_id: Uuid, name: &str, manifest_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO tags (repository_id, name, manifest_id) VALUES ($1, $2, $3) \
             ON CONFLICT (repository_id, name) DO UPDATE SET manifest_id = EXCLUDED.manifest_id",
        )
        .bind(repository_id)
        .bind(name)
        .bind(manifest_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_tag(&self, repository_id: Uuid, name: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM tags WHERE repository_id = $1 AND name = $2")
            .bind(repository_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn manifest_has_tags(&self, repository_id: Uuid, manifest_id: Uuid) -> Result<bool, AppError> {
        let row = sqlx::query("SELECT 1 FROM tags WHERE repository_id = $1 AND manifest_id = $2")
            .bind(repository_id)
            .bind(manifest_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn manifest_has_list_references(&self, manifest_id: Uuid) -> Result<bool, AppError> {
        let digest = self
            .get_manifest_by_id(manifest_id)
            .await?
            .map(|m| m.digest);
        let Some(digest) = digest else {
            return Ok(false);
        };
        let row = sqlx::query("SELECT 1 FROM manifest_list_items WHERE child_digest = $1")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_tags(&self, repository_id: Uuid, page: Pagination) -> Result<Page, AppError> {
        let limit = page.n as i64 + 1;
        let rows = match &page.last {
            Some(last) => {
                sqlx::query(
                    "SELECT name FROM tags WHERE repository_id = $1 AND name > $2 \
                     ORDER BY name LIMIT $3",
                )
                .bind(repository_id)
                .bind(last)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT name FROM tags WHERE repository_id = $1 ORDER BY name LIMIT $2")
                    .bind(repository_id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        paginate(rows, page.n, |r| r.get::<String, _>("name"))
    }

    async fn list_repositories(&self, page: Pagination) -> Result<Page, AppError> {
        let limit = page.n as i64 + 1;
        let rows = match &page.last {
            Some(last) => {
                sqlx::query("SELECT path FROM repositories WHERE path > $1 ORDER BY path LIMIT $2")
                    .bind(last)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT path FROM repositories ORDER BY path LIMIT $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        paginate(rows, page.n, |r| r.get::<String, _>("path"))
    }
}

/// Shared page-assembly for the two lexicographic listings (§4.5, §4.6):
/// fetch `n + 1` rows, and if the extra row came back, trim it and report
/// the last included item as the `last=` marker for `rel="next"`.
fn paginate(
    mut rows: Vec<sqlx::postgres::PgRow>,
    n: usize,
    extract: impl Fn(&sqlx::postgres::PgRow) -> String,
) -> Result<Page, AppError> {
    let has_more = rows.len() > n;
    if has_more {
        rows.truncate(n);
    }
    let items: Vec<String> = rows.iter().map(&extract).collect();
    let next_last = if has_more { items.last().cloned() } else { None };
    Ok(Page { items, next_last })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_to_100_on_invalid_n() {
        let p = Pagination::new(Some(-1), None);
        assert_eq!(p.n, Pagination::DEFAULT_N);
        let p = Pagination::new(None, None);
        assert_eq!(p.n, Pagination::DEFAULT_N);
    }

    #[test]
    fn pagination_honors_explicit_n() {
        let p = Pagination::new(Some(4), Some("hpgkt/bmawb".to_string()));
        assert_eq!(p.n, 4);
        assert_eq!(p.last.as_deref(), Some("hpgkt/bmawb"));
    }
}
