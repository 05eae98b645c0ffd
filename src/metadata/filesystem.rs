//! The old, pre-migration metadata layout (§3, §4.7): repositories, tags,
//! and manifests recorded as files under a directory tree, mirroring the
//! teacher's `storage/paths.rs` layout (`repositories/<name>/_manifests/
//! tags/<tag>/link`) generalized to also hold the manifest payload/layer
//! data that layout's teacher draft left to a separate blob-only store.
//!
//! This backend exists for the dual-write router (`crate::router`) to
//! mirror writes into during migration, and as the fallback read path when
//! `fallback_on_db_miss` is set (§4.7 contract 2). It intentionally has no
//! GC coordination of its own — the review-queue protocol (§4.8) is a
//! relational-store capability that lives in `crate::gc` against Postgres.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use super::{MetadataStore, NewManifest, Page, Pagination};
use crate::domain::models::{Blob, Manifest, Repository, Tag};
use crate::domain::{Digest, Reference};
use crate::error::AppError;

#[derive(Serialize, Deserialize)]
struct TagRecord {
    manifest_id: Uuid,
}

#[derive(Serialize, Deserialize)]
struct BlobRecord {
    media_type: String,
    size: i64,
}

pub struct FilesystemMetadataStore {
    root: PathBuf,
}

impl FilesystemMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemMetadataStore { root: root.into() }
    }

    fn repositories_root(&self) -> PathBuf {
        self.root.join("v2").join("repositories")
    }

    fn repository_dir(&self, path: &str) -> PathBuf {
        self.repositories_root().join(path)
    }

    fn repository_record_path(&self, path: &str) -> PathBuf {
        self.repository_dir(path).join("repo.json")
    }

    fn manifests_dir(&self, repo_path: &str) -> PathBuf {
        self.repository_dir(repo_path).join("_manifests")
    }

    fn revision_path(&self, repo_path: &str, digest: &Digest) -> PathBuf {
        self.manifests_dir(repo_path)
            .join("revisions")
            .join(digest.algorithm().to_string())
            .join(format!("{}.json", digest.hex()))
    }

    /// A deleted manifest's revision file is left in place (GC still needs
    /// it to reap later) but marked with a sibling tombstone file, checked
    /// by `get_manifest_by_digest` so the digest reads as gone (§4.4).
    fn revision_tombstone_path(&self, repo_path: &str, digest: &Digest) -> PathBuf {
        self.manifests_dir(repo_path)
            .join("revisions")
            .join(digest.algorithm().to_string())
            .join(format!("{}.deleted", digest.hex()))
    }

    fn tag_link_path(&self, repo_path: &str, tag: &str) -> PathBuf {
        self.manifests_dir(repo_path).join("tags").join(tag).join("link")
    }

    fn tags_dir(&self, repo_path: &str) -> PathBuf {
        self.manifests_dir(repo_path).join("tags")
    }

    fn blob_record_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("v2")
            .join("blobs")
            .join(digest.algorithm().to_string())
            .join(digest.shard_prefix())
            .join(digest.hex())
            .join("meta.json")
    }

    fn repository_blob_link_path(&self, repo_path: &str, digest: &Digest) -> PathBuf {
        self.manifests_dir(repo_path)
            .join("blobs")
            .join(digest.algorithm().to_string())
            .join(digest.hex())
    }

    async fn write_json<T: Serialize>(path: &std::path::Path, value: &T) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(AppError::from)?;
        }
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| AppError::Internal(format!("failed to serialize metadata record: {e}")))?;
        fs::write(path, bytes).await.map_err(AppError::from)
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        path: &std::path::Path,
    ) -> Result<Option<T>, AppError> {
        match fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| AppError::Internal(format!("corrupt metadata record at {path:?}: {e}")))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::from(e)),
        }
    }

    /// Walks the repository tree looking for directories carrying a
    /// `repo.json` marker, reconstructing each repository's slash-joined
    /// path from the directory nesting. Iterative (a work-queue, not
    /// recursion) since async fns can't recurse without boxing.
    async fn list_repository_paths(&self) -> Result<Vec<String>, AppError> {
        let root = self.repositories_root();
        let mut out = Vec::new();
        let mut stack = vec![(root, String::new())];

        while let Some((dir, prefix)) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::from(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(AppError::from)? {
                let file_type = entry.file_type().await.map_err(AppError::from)?;
                if !file_type.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                let child_path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                let child_dir = dir.join(&name);
                if fs::metadata(child_dir.join("repo.json")).await.is_ok() {
                    out.push(child_path.clone());
                }
                stack.push((child_dir, child_path));
            }
        }

        out.sort();
        Ok(out)
    }

    async fn list_tag_names(&self, repo_path: &str) -> Result<Vec<String>, AppError> {
        let dir = self.tags_dir(repo_path);
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(AppError::from(e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(AppError::from)? {
            if entry.file_type().await.map_err(AppError::from)?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

fn paginate_names(mut names: Vec<String>, page: &Pagination) -> Page {
    if let Some(last) = &page.last {
        names.retain(|n| n.as_str() > last.as_str());
    }
    let has_more = names.len() > page.n;
    names.truncate(page.n);
    let next_last = if has_more { names.last().cloned() } else { None };
    Page {
        items: names,
        next_last,
    }
}

#[async_trait]
impl MetadataStore for FilesystemMetadataStore {
    async fn get_repository(&self, path: &str) -> Result<Option<Repository>, AppError> {
        Self::read_json(&self.repository_record_path(path)).await
    }

    async fn ensure_repository(&self, path: &str) -> Result<Repository, AppError> {
        if let Some(repo) = self.get_repository(path).await? {
            return Ok(repo);
        }
        let repo = Repository {
            id: Uuid::new_v4(),
            path: path.to_string(),
            parent_id: None,
            created_at: Utc::now(),
        };
        Self::write_json(&self.repository_record_path(path), &repo).await?;
        Ok(repo)
    }

    async fn link_blob(
        &self,
        repository_id: Uuid,
        digest: &Digest,
        media_type: &str,
        size: u64,
    ) -> Result<(), AppError> {
        let repo = self
            .get_repository_by_id(repository_id)
            .await?
            .ok_or_else(|| AppError::Internal("link_blob on unknown repository".into()))?;
        let record = BlobRecord {
            media_type: media_type.to_string(),
            size: size as i64,
        };
        Self::write_json(&self.blob_record_path(digest), &record).await?;
        let link_path = self.repository_blob_link_path(&repo.path, digest);
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent).await.map_err(AppError::from)?;
        }
        fs::write(&link_path, digest.to_string()).await.map_err(AppError::from)
    }

    async fn blob_linked(&self, repository_id: Uuid, digest: &Digest) -> Result<bool, AppError> {
        let Some(repo) = self.get_repository_by_id(repository_id).await? else {
            return Ok(false);
        };
        Ok(fs::metadata(self.repository_blob_link_path(&repo.path, digest))
            .await
            .is_ok())
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Blob>, AppError> {
        let record: Option<BlobRecord> = Self::read_json(&self.blob_record_path(digest)).await?;
        Ok(record.map(|r| Blob {
            digest: digest.to_string(),
            media_type: r.media_type,
            size: r.size,
        }))
    }

    async fn unlink_blob(&self, repository_id: Uuid, digest: &Digest) -> Result<(), AppError> {
        let Some(repo) = self.get_repository_by_id(repository_id).await? else {
            return Ok(());
        };
        let link_path = self.repository_blob_link_path(&repo.path, digest);
        match fs::remove_file(&link_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(AppError::from(e)),
        }
        // Clean up the now-possibly-empty `<digest algorithm>/` directory
        // the link lived in, mirroring `link_blob`'s `create_dir_all`.
        if let Some(parent) = link_path.parent() {
            let _ = fs::remove_dir(parent).await;
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository_id: Uuid,
        new_manifest: NewManifest,
    ) -> Result<Manifest, AppError> {
        let repo = self
            .get_repository_by_id(repository_id)
            .await?
            .ok_or_else(|| AppError::Internal("put_manifest on unknown repository".into()))?;
        let path = self.revision_path(&repo.path, &new_manifest.digest);
        if let Some(existing) = Self::read_json::<Manifest>(&path).await? {
            // A re-push of a previously deleted digest (§4.4) reinstates it:
            // CreateOrFind is idempotent on the digest, not on deletion state.
            let _ = fs::remove_file(self.revision_tombstone_path(&repo.path, &new_manifest.digest)).await;
            return Ok(existing);
        }
        let manifest = Manifest {
            id: Uuid::new_v4(),
            repository_id,
            schema_version: new_manifest.schema_version,
            media_type: new_manifest.media_type,
            digest: new_manifest.digest.to_string(),
            payload: new_manifest.payload,
            config_media_type: new_manifest.config_media_type,
            config_digest: new_manifest.config_digest.map(|d| d.to_string()),
            config_payload: new_manifest.config_payload,
            layers: new_manifest.layers,
            list_items: new_manifest.list_items,
        };
        Self::write_json(&path, &manifest).await?;
        Ok(manifest)
    }

    async fn get_manifest_by_digest(
        &self,
        repository_id: Uuid,
        digest: &Digest,
    ) -> Result<Option<Manifest>, AppError> {
        let Some(repo) = self.get_repository_by_id(repository_id).await? else {
            return Ok(None);
        };
        if fs::metadata(self.revision_tombstone_path(&repo.path, digest)).await.is_ok() {
            return Ok(None);
        }
        Self::read_json(&self.revision_path(&repo.path, digest)).await
    }

    async fn get_manifest_by_id(&self, manifest_id: Uuid) -> Result<Option<Manifest>, AppError> {
        for repo_path in self.list_repository_paths().await? {
            let revisions_dir = self.manifests_dir(&repo_path).join("revisions").join("sha256");
            let mut entries = match fs::read_dir(&revisions_dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::from(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(AppError::from)? {
                let manifest: Option<Manifest> = Self::read_json(&entry.path()).await?;
                if let Some(manifest) = manifest {
                    if manifest.id == manifest_id {
                        return Ok(Some(manifest));
                    }
                }
            }
        }
        Ok(None)
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
        let Some(repo) = self.get_repository_by_id(repository_id).await? else {
            return Ok(());
        };
        for tag in self.list_tag_names(&repo.path).await? {
            if let Some(record) = self.read_tag_record(&repo.path, &tag).await? {
                if record.manifest_id == manifest_id {
                    let _ = fs::remove_dir_all(self.tag_link_path(&repo.path, &tag).parent().unwrap())
                        .await;
                }
            }
        }
        // Tombstone the manifest itself so the digest reads as gone via
        // `get_manifest_by_digest` (§4.4); without this a second DELETE on
        // the same digest would find the revision file again and return
        // 202 instead of 404.
        if let Some(manifest) = self.get_manifest_by_id(manifest_id).await? {
            let digest: Digest = manifest
                .digest
                .parse()
                .map_err(|_| AppError::Internal("stored manifest digest is malformed".into()))?;
            Self::write_json(&self.revision_tombstone_path(&repo.path, &digest), &true).await?;
        }
        Ok(())
    }

    async fn get_tag(&self, repository_id: Uuid, name: &str) -> Result<Option<Tag>, AppError> {
        let Some(repo) = self.get_repository_by_id(repository_id).await? else {
            return Ok(None);
        };
        let record = self.read_tag_record(&repo.path, name).await?;
        Ok(record.map(|r| Tag {
            repository_id,
            name: name.to_string(),
            manifest_id: r.manifest_id,
        }))
    }

    async fn upsert_tag(&self, repository_id: Uuid, name: &str, manifest_id: Uuid) -> Result<(), AppError> {
        let repo = self
            .get_repository_by_id(repository_id)
            .await?
            .ok_or_else(|| AppError::Internal("upsert_tag on unknown repository".into()))?;
        let record = TagRecord { manifest_id };
        Self::write_json(&self.tag_link_path(&repo.path, name), &record).await
    }

    async fn delete_tag(&self, repository_id: Uuid, name: &str) -> Result<(), AppError> {
        let Some(repo) = self.get_repository_by_id(repository_id).await? else {
            return Ok(());
        };
        let dir = self.tag_link_path(&repo.path, name);
        let dir = dir.parent().unwrap();
        match fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::from(e)),
        }
    }

    async fn manifest_has_tags(&self, repository_id: Uuid, manifest_id: Uuid) -> Result<bool, AppError> {
        let Some(repo) = self.get_repository_by_id(repository_id).await? else {
            return Ok(false);
        };
        for tag in self.list_tag_names(&repo.path).await? {
            if let Some(record) = self.read_tag_record(&repo.path, &tag).await? {
                if record.manifest_id == manifest_id {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn manifest_has_list_references(&self, manifest_id: Uuid) -> Result<bool, AppError> {
        let Some(manifest) = self.get_manifest_by_id(manifest_id).await? else {
            return Ok(false);
        };
        for repo_path in self.list_repository_paths().await? {
            let revisions_dir = self.manifests_dir(&repo_path).join("revisions").join("sha256");
            let mut entries = match fs::read_dir(&revisions_dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::from(e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(AppError::from)? {
                let candidate: Option<Manifest> = Self::read_json(&entry.path()).await?;
                if let Some(candidate) = candidate {
                    if candidate
                        .list_items
                        .iter()
                        .any(|item| item.child_digest == manifest.digest)
                    {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn list_tags(&self, repository_id: Uuid, page: Pagination) -> Result<Page, AppError> {
        let Some(repo) = self.get_repository_by_id(repository_id).await? else {
            return Ok(Page {
                items: vec![],
                next_last: None,
            });
        };
        let names = self.list_tag_names(&repo.path).await?;
        Ok(paginate_names(names, &page))
    }

    async fn list_repositories(&self, page: Pagination) -> Result<Page, AppError> {
        let names = self.list_repository_paths().await?;
        Ok(paginate_names(names, &page))
    }
}

impl FilesystemMetadataStore {
    async fn get_repository_by_id(&self, repository_id: Uuid) -> Result<Option<Repository>, AppError> {
        for path in self.list_repository_paths().await? {
            if let Some(repo) = self.get_repository(&path).await? {
                if repo.id == repository_id {
                    return Ok(Some(repo));
                }
            }
        }
        Ok(None)
    }

    async fn read_tag_record(&self, repo_path: &str, tag: &str) -> Result<Option<TagRecord>, AppError> {
        Self::read_json(&self.tag_link_path(repo_path, tag)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::digest::digest_bytes;

    #[tokio::test]
    async fn ensure_repository_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemMetadataStore::new(dir.path());
        let a = store.ensure_repository("foo/bar").await.unwrap();
        let b = store.ensure_repository("foo/bar").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn tag_upsert_then_resolve_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemMetadataStore::new(dir.path());
        let repo = store.ensure_repository("foo/bar").await.unwrap();

        let digest = digest_bytes(b"manifest payload");
        let manifest = store
            .put_manifest(
                repo.id,
                NewManifest {
                    schema_version: 2,
                    media_type: "application/vnd.oci.image.manifest.v1+json".into(),
                    digest: digest.clone(),
                    payload: b"manifest payload".to_vec(),
                    config_media_type: None,
                    config_digest: None,
                    config_payload: None,
                    layers: vec![],
                    list_items: vec![],
                },
            )
            .await
            .unwrap();

        store.upsert_tag(repo.id, "latest", manifest.id).await.unwrap();
        let resolved = store
            .resolve_reference(repo.id, &Reference::Tag("latest".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.digest, digest.to_string());
    }

    #[tokio::test]
    async fn catalog_listing_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemMetadataStore::new(dir.path());
        store.ensure_repository("zeta").await.unwrap();
        store.ensure_repository("alpha").await.unwrap();
        store.ensure_repository("mid/repo").await.unwrap();

        let page = store
            .list_repositories(Pagination::new(Some(10), None))
            .await
            .unwrap();
        assert_eq!(page.items, vec!["alpha", "mid/repo", "zeta"]);
    }

    #[tokio::test]
    async fn deleted_manifest_is_unreachable_by_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemMetadataStore::new(dir.path());
        let repo = store.ensure_repository("foo/bar").await.unwrap();

        let digest = digest_bytes(b"manifest payload");
        let manifest = store
            .put_manifest(
                repo.id,
                NewManifest {
                    schema_version: 2,
                    media_type: "application/vnd.oci.image.manifest.v1+json".into(),
                    digest: digest.clone(),
                    payload: b"manifest payload".to_vec(),
                    config_media_type: None,
                    config_digest: None,
                    config_payload: None,
                    layers: vec![],
                    list_items: vec![],
                },
            )
            .await
            .unwrap();

        store.delete_manifest_link(repo.id, manifest.id).await.unwrap();
        assert!(
            store
                .get_manifest_by_digest(repo.id, &digest)
                .await
                .unwrap()
                .is_none()
        );

        // A second delete of the same digest must not error: it's already gone.
        store.delete_manifest_link(repo.id, manifest.id).await.unwrap();
    }

    #[tokio::test]
    async fn unlink_blob_actually_removes_the_link() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemMetadataStore::new(dir.path());
        let repo = store.ensure_repository("foo/bar").await.unwrap();

        let digest = digest_bytes(b"blob contents");
        store
            .link_blob(repo.id, &digest, "application/octet-stream", 13)
            .await
            .unwrap();
        assert!(store.blob_linked(repo.id, &digest).await.unwrap());

        store.unlink_blob(repo.id, &digest).await.unwrap();
        assert!(!store.blob_linked(repo.id, &digest).await.unwrap());
    }
}
