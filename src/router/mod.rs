//! The dual-write router (§4.7): a single policy object every handler
//! calls through instead of scattering `if mirror_fs { ... }` checks
//! across the codebase (§9: "A clean re-architecture introduces a single
//! policy object consulted by every handler, erasing the per-handler
//! if-ladders"). `DualWriteRouter` itself implements `MetadataStore`, so
//! handlers hold one `Arc<dyn MetadataStore>` and never see which
//! concrete backend(s) answered.

pub mod proxy;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::DualWriteConfig;
use crate::domain::models::{Blob, Manifest, Repository, Tag};
use crate::domain::{Digest, Reference};
use crate::error::AppError;
use crate::metadata::filesystem::FilesystemMetadataStore;
use crate::metadata::postgres::PostgresMetadataStore;
use crate::metadata::{MetadataStore, NewManifest, Page, Pagination};
use crate::metrics::Metrics;

pub use proxy::MigrationProxy;

pub struct DualWriteRouter {
    config: DualWriteConfig,
    database: Option<Arc<PostgresMetadataStore>>,
    filesystem: Option<Arc<FilesystemMetadataStore>>,
    metrics: Arc<Metrics>,
}

impl DualWriteRouter {
    pub fn new(
        config: DualWriteConfig,
        database: Option<Arc<PostgresMetadataStore>>,
        filesystem: Option<Arc<FilesystemMetadataStore>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        DualWriteRouter {
            config,
            database,
            filesystem,
            metrics,
        }
    }

    /// Times `call` and records it against `statement_class` in the
    /// per-statement DB histogram (§2 Observability), regardless of which
    /// backend(s) actually answered.
    async fn timed<T>(
        &self,
        statement_class: &'static str,
        call: impl std::future::Future<Output = T>,
    ) -> T {
        let start = std::time::Instant::now();
        let result = call.await;
        self.metrics.observe_db_call(statement_class, start.elapsed());
        result
    }

    fn db(&self) -> Result<&PostgresMetadataStore, AppError> {
        self.database
            .as_deref()
            .ok_or_else(|| AppError::Internal("database metadata store is not configured".into()))
    }

    fn fs(&self) -> Result<&FilesystemMetadataStore, AppError> {
        self.filesystem
            .as_deref()
            .ok_or_else(|| AppError::Internal("filesystem metadata store is not configured".into()))
    }

    /// Runs a write per contract 1: when mirroring, the filesystem side
    /// (idempotent) goes first, and the database transaction's commit is
    /// the linearization point whose result is returned to the caller.
    /// Database-only and filesystem-only modes just call the one
    /// configured backend.
    async fn write<T, FFs, FutFs, FDb, FutDb>(
        &self,
        write_fs: FFs,
        write_db: FDb,
    ) -> Result<T, AppError>
    where
        FFs: FnOnce(&FilesystemMetadataStore) -> FutFs,
        FutFs: std::future::Future<Output = Result<T, AppError>>,
        FDb: FnOnce(&PostgresMetadataStore) -> FutDb,
        FutDb: std::future::Future<Output = Result<T, AppError>>,
    {
        if self.config.mirror_fs {
            write_fs(self.fs()?).await?;
            write_db(self.db()?).await
        } else if self.config.database_enabled {
            write_db(self.db()?).await
        } else {
            write_fs(self.fs()?).await
        }
    }

    /// Runs a read per contract 2: database is authoritative when enabled;
    /// a miss or a database error falls back to the filesystem read with a
    /// warning log, when `fallback_on_db_miss` is configured. Otherwise the
    /// database's answer (including "not found") is final.
    async fn read<T, FDb, FutDb, FFs, FutFs>(&self, read_db: FDb, read_fs: FFs) -> Result<Option<T>, AppError>
    where
        FDb: FnOnce(&PostgresMetadataStore) -> FutDb,
        FutDb: std::future::Future<Output = Result<Option<T>, AppError>>,
        FFs: FnOnce(&FilesystemMetadataStore) -> FutFs,
        FutFs: std::future::Future<Output = Result<Option<T>, AppError>>,
    {
        if !self.config.database_enabled {
            return read_fs(self.fs()?).await;
        }

        match read_db(self.db()?).await {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                if self.config.fallback_on_db_miss {
                    if let Ok(fs) = self.fs() {
                        tracing::warn!("database miss, falling back to filesystem metadata read");
                        return read_fs(fs).await;
                    }
                }
                Ok(None)
            }
            Err(e) => {
                if self.config.fallback_on_db_miss {
                    if let Ok(fs) = self.fs() {
                        tracing::warn!(error = %e, "database error, falling back to filesystem metadata read");
                        return read_fs(fs).await;
                    }
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl MetadataStore for DualWriteRouter {
    async fn get_repository(&self, path: &str) -> Result<Option<Repository>, AppError> {
        self.timed(
            "get_repository",
            self.read(|db| db.get_repository(path), |fs| fs.get_repository(path)),
        )
        .await
    }

    async fn ensure_repository(&self, path: &str) -> Result<Repository, AppError> {
        self.timed(
            "ensure_repository",
            self.write(|fs| fs.ensure_repository(path), |db| db.ensure_repository(path)),
        )
        .await
    }

    async fn link_blob(
        &self,
        repository_id: Uuid,
        digest: &Digest,
        media_type: &str,
        size: u64,
    ) -> Result<(), AppError> {
        self.timed(
            "link_blob",
            self.write(
                |fs| fs.link_blob(repository_id, digest, media_type, size),
                |db| db.link_blob(repository_id, digest, media_type, size),
            ),
        )
        .await
    }

    async fn blob_linked(&self, repository_id: Uuid, digest: &Digest) -> Result<bool, AppError> {
        Ok(self
            .timed(
                "blob_linked",
                self.read(
                    |db| async move { db.blob_linked(repository_id, digest).await.map(Some) },
                    |fs| async move { fs.blob_linked(repository_id, digest).await.map(Some) },
                ),
            )
            .await?
            .unwrap_or(false))
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Blob>, AppError> {
        self.timed(
            "get_blob",
            self.read(|db| db.get_blob(digest), |fs| fs.get_blob(digest)),
        )
        .await
    }

    async fn unlink_blob(&self, repository_id: Uuid, digest: &Digest) -> Result<(), AppError> {
        self.timed(
            "unlink_blob",
            self.write(
                |fs| fs.unlink_blob(repository_id, digest),
                |db| db.unlink_blob(repository_id, digest),
            ),
        )
        .await
    }

    async fn put_manifest(
        &self,
        repository_id: Uuid,
        manifest: NewManifest,
    ) -> Result<Manifest, AppError> {
        let fs_manifest = manifest.clone();
        self.timed(
            "put_manifest",
            self.write(
                |fs| fs.put_manifest(repository_id, fs_manifest),
                |db| db.put_manifest(repository_id, manifest),
            ),
        )
        .await
    }

    async fn get_manifest_by_digest(
        &self,
        repository_id: Uuid,
        digest: &Digest,
    ) -> Result<Option<Manifest>, AppError> {
        self.timed(
            "get_manifest_by_digest",
            self.read(
                |db| db.get_manifest_by_digest(repository_id, digest),
                |fs| fs.get_manifest_by_digest(repository_id, digest),
            ),
        )
        .await
    }

    async fn get_manifest_by_id(&self, manifest_id: Uuid) -> Result<Option<Manifest>, AppError> {
        self.timed(
            "get_manifest_by_id",
            self.read(
                |db| db.get_manifest_by_id(manifest_id),
                |fs| fs.get_manifest_by_id(manifest_id),
            ),
        )
        .await
    }

    async fn resolve_reference(
        &self,
        repository_id: Uuid,
        reference: &Reference,
    ) -> Result<Option<Manifest>, AppError> {
        self.timed(
            "resolve_reference",
            self.read(
                |db| db.resolve_reference(repository_id, reference),
                |fs| fs.resolve_reference(repository_id, reference),
            ),
        )
        .await
    }

    async fn delete_manifest_link(&self, repository_id: Uuid, manifest_id: Uuid) -> Result<(), AppError> {
        self.timed(
            "delete_manifest_link",
            self.write(
                |fs| fs.delete_manifest_link(repository_id, manifest_id),
                |db| db.delete_manifest_link(repository_id, manifest_id),
            ),
        )
        .await
    }

    async fn get_tag(&self, repository_id: Uuid, name: &str) -> Result<Option<Tag>, AppError> {
        self.timed(
            "get_tag",
            self.read(|db| db.get_tag(repository_id, name), |fs| fs.get_tag(repository_id, name)),
        )
        .await
    }

    async fn upsert_tag(&self, repository_id: Uuid, name: &str, manifest_id: Uuid) -> Result<(), AppError> {
        self.timed(
            "upsert_tag",
            self.write(
                |fs| fs.upsert_tag(repository_id, name, manifest_id),
                |db| db.upsert_tag(repository_id, name, manifest_id),
            ),
        )
        .await
    }

    async fn delete_tag(&self, repository_id: Uuid, name: &str) -> Result<(), AppError> {
        self.timed(
            "delete_tag",
            self.write(
                |fs| fs.delete_tag(repository_id, name),
                |db| db.delete_tag(repository_id, name),
            ),
        )
        .await
    }

    async fn manifest_has_tags(&self, repository_id: Uuid, manifest_id: Uuid) -> Result<bool, AppError> {
        Ok(self
            .timed(
                "manifest_has_tags",
                self.read(
                    |db| async move { db.manifest_has_tags(repository_id, manifest_id).await.map(Some) },
                    |fs| async move { fs.manifest_has_tags(repository_id, manifest_id).await.map(Some) },
                ),
            )
            .await?
            .unwrap_or(false))
    }

    async fn manifest_has_list_references(&self, manifest_id: Uuid) -> Result<bool, AppError> {
        Ok(self
            .timed(
                "manifest_has_list_references",
                self.read(
                    |db| async move { db.manifest_has_list_references(manifest_id).await.map(Some) },
                    |fs| async move { fs.manifest_has_list_references(manifest_id).await.map(Some) },
                ),
            )
            .await?
            .unwrap_or(false))
    }

    /// Contract 3: pagination is database-exclusive — the filesystem
    /// backend cannot produce deterministic `Link` headers.
    async fn list_tags(&self, repository_id: Uuid, page: Pagination) -> Result<Page, AppError> {
        self.timed("list_tags", async { self.db()?.list_tags(repository_id, page).await })
            .await
    }

    async fn list_repositories(&self, page: Pagination) -> Result<Page, AppError> {
        self.timed("list_repositories", async { self.db()?.list_repositories(page).await })
            .await
    }
}
