//! Filesystem blob driver, generalized from the teacher's
//! `storage/driver/filesystem.rs` + `storage/paths.rs`: content-addressed,
//! split-directory layout under `<root>/blobs/<algo>/<shard>/<hex>/data`,
//! with upload sessions staged under `<root>/uploads/<uuid>/`.
//!
//! Where the teacher's draft also used this layout to store tag symlinks
//! (mixing blob storage with metadata), this driver is blob-bytes-only —
//! tags and manifest payloads now live exclusively in the metadata store
//! (§3: "Object store exclusively owns blob bytes").

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use super::{BlobContent, BlobStore, ByteRange, UploadSessionInfo, blob_unknown, upload_unknown};
use crate::domain::{Digest, DigestVerifier};
use crate::error::{AppError, OciError};

pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemBlobStore { root: root.into() }
    }

    fn blob_dir(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().to_string())
            .join(digest.shard_prefix())
            .join(digest.hex())
    }

    fn blob_data_path(&self, digest: &Digest) -> PathBuf {
        self.blob_dir(digest).join("data")
    }

    fn upload_dir(&self, uuid: &str) -> PathBuf {
        self.root.join("uploads").join(uuid)
    }

    fn upload_data_path(&self, uuid: &str) -> PathBuf {
        self.upload_dir(uuid).join("data")
    }

    fn upload_started_at_path(&self, uuid: &str) -> PathBuf {
        self.upload_dir(uuid).join("started_at")
    }

    async fn ensure_parent(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn file_size(path: &Path) -> std::io::Result<u64> {
        Ok(fs::metadata(path).await?.len())
    }
}

fn map_not_found<E>(to: impl Fn() -> E) -> impl Fn(std::io::Error) -> AppError
where
    E: Into<AppError>,
{
    move |e: std::io::Error| {
        if e.kind() == std::io::ErrorKind::NotFound {
            to().into()
        } else {
            AppError::Storage(e)
        }
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn stat(&self, digest: &Digest) -> Result<u64, AppError> {
        let path = self.blob_data_path(digest);
        fs::metadata(&path)
            .await
            .map(|m| m.len())
            .map_err(map_not_found(|| AppError::Oci(OciError::BlobUnknown(digest.to_string()))))
    }

    async fn read(&self, digest: &Digest, range: Option<ByteRange>) -> Result<BlobContent, AppError> {
        let path = self.blob_data_path(digest);
        let total_size = Self::file_size(&path)
            .await
            .map_err(map_not_found(|| blob_unknown(digest)))?;

        let mut file = File::open(&path)
            .await
            .map_err(map_not_found(|| blob_unknown(digest)))?;

        match range {
            Some(r) => {
                use tokio::io::AsyncSeekExt;
                let end = r.end.min(total_size.saturating_sub(1));
                let len = if r.start > end { 0 } else { end - r.start + 1 };
                file.seek(std::io::SeekFrom::Start(r.start.min(total_size)))
                    .await
                    .map_err(AppError::from)?;
                let limited = file.take(len);
                Ok(BlobContent {
                    reader: Box::pin(limited),
                    content_length: len,
                    total_size,
                })
            }
            None => Ok(BlobContent {
                reader: Box::pin(file),
                content_length: total_size,
                total_size,
            }),
        }
    }

    async fn delete(&self, digest: &Digest) -> Result<(), AppError> {
        let dir = self.blob_dir(digest);
        fs::remove_dir_all(&dir)
            .await
            .map_err(map_not_found(|| blob_unknown(digest)))
    }

    async fn create_upload(&self) -> Result<UploadSessionInfo, AppError> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now().timestamp();

        let data_path = self.upload_data_path(&uuid);
        Self::ensure_parent(&data_path).await.map_err(AppError::from)?;
        File::create(&data_path).await.map_err(AppError::from)?;

        let started_at_path = self.upload_started_at_path(&uuid);
        fs::write(&started_at_path, started_at.to_string())
            .await
            .map_err(AppError::from)?;

        Ok(UploadSessionInfo {
            uuid,
            offset: 0,
            started_at,
        })
    }

    async fn session_info(&self, uuid: &str) -> Result<UploadSessionInfo, AppError> {
        let data_path = self.upload_data_path(uuid);
        let offset = Self::file_size(&data_path)
            .await
            .map_err(map_not_found(|| upload_unknown(uuid)))?;

        let started_at_path = self.upload_started_at_path(uuid);
        let started_at = fs::read_to_string(&started_at_path)
            .await
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(0);

        Ok(UploadSessionInfo {
            uuid: uuid.to_string(),
            offset,
            started_at,
        })
    }

    async fn append_chunk(
        &self,
        uuid: &str,
        mut data: Pin<Box<dyn tokio::io::AsyncRead + Send>>,
    ) -> Result<u64, AppError> {
        let data_path = self.upload_data_path(uuid);
        if fs::metadata(&data_path).await.is_err() {
            return Err(upload_unknown(uuid));
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&data_path)
            .await
            .map_err(AppError::from)?;
        let mut writer = BufWriter::new(file);
        tokio::io::copy(&mut data, &mut writer).await.map_err(AppError::from)?;
        writer.flush().await.map_err(AppError::from)?;

        Self::file_size(&data_path).await.map_err(AppError::from)
    }

    async fn commit_upload(&self, uuid: &str, expected_digest: &Digest) -> Result<u64, AppError> {
        let data_path = self.upload_data_path(uuid);
        let mut file = File::open(&data_path)
            .await
            .map_err(map_not_found(|| upload_unknown(uuid)))?;

        let mut verifier = DigestVerifier::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await.map_err(AppError::from)?;
            if n == 0 {
                break;
            }
            verifier.update(&buf[..n]);
        }
        if !verifier.verify(expected_digest) {
            return Err(AppError::Oci(OciError::DigestInvalid(format!(
                "uploaded bytes do not hash to {expected_digest}"
            ))));
        }

        let dest = self.blob_data_path(expected_digest);
        Self::ensure_parent(&dest).await.map_err(AppError::from)?;
        let size = Self::file_size(&data_path).await.map_err(AppError::from)?;
        fs::rename(&data_path, &dest).await.map_err(AppError::from)?;
        let _ = fs::remove_file(self.upload_started_at_path(uuid)).await;
        let _ = fs::remove_dir(self.upload_dir(uuid)).await;

        Ok(size)
    }

    async fn abort_upload(&self, uuid: &str) -> Result<(), AppError> {
        fs::remove_dir_all(self.upload_dir(uuid))
            .await
            .map_err(map_not_found(|| upload_unknown(uuid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tmp_store() -> (FilesystemBlobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (FilesystemBlobStore::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn upload_commit_and_stat_round_trip() {
        let (store, _dir) = tmp_store().await;
        let session = store.create_upload().await.unwrap();
        let reader: Pin<Box<dyn tokio::io::AsyncRead + Send>> =
            Box::pin(std::io::Cursor::new(b"hello".to_vec()));
        let offset = store.append_chunk(&session.uuid, reader).await.unwrap();
        assert_eq!(offset, 5);

        let digest = crate::domain::digest::digest_bytes(b"hello");
        let size = store.commit_upload(&session.uuid, &digest).await.unwrap();
        assert_eq!(size, 5);
        assert_eq!(store.stat(&digest).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn commit_with_wrong_digest_fails_and_leaves_upload_in_place() {
        let (store, _dir) = tmp_store().await;
        let session = store.create_upload().await.unwrap();
        let reader: Pin<Box<dyn tokio::io::AsyncRead + Send>> =
            Box::pin(std::io::Cursor::new(b"hello".to_vec()));
        store.append_chunk(&session.uuid, reader).await.unwrap();

        let wrong = crate::domain::digest::digest_bytes(b"not hello");
        assert!(store.commit_upload(&session.uuid, &wrong).await.is_err());

        // Session survives a failed commit so the client can retry.
        let info = store.session_info(&session.uuid).await.unwrap();
        assert_eq!(info.offset, 5);
    }

    #[tokio::test]
    async fn delete_on_missing_blob_is_blob_unknown() {
        let (store, _dir) = tmp_store().await;
        let digest = crate::domain::digest::digest_bytes(b"never uploaded");
        let err = store.delete(&digest).await.unwrap_err();
        assert!(matches!(err, AppError::Oci(OciError::BlobUnknown(_))));
    }
}
