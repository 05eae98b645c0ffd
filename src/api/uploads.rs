//! Resumable blob upload sessions (§4.3, §6): open/monolithic POST, chunked
//! PATCH, finalizing PUT, status GET, abort DELETE, and cross-repository
//! mount. Generalizes the teacher's `service/blob.rs` upload handlers,
//! which tracked sessions in an in-process `AppState` map, onto sessions
//! owned by the `BlobStore` and resumed via the HMAC `_state` token so no
//! additional server-side session bookkeeping is needed here.

use std::collections::HashMap;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::blobstore::upload_token::{self, UploadState};
use crate::domain::Digest;
use crate::domain::reference::is_valid_repository_name;
use crate::error::{AppError, OciError};
use crate::state::AppState;

fn validate_name(name: &str) -> Result<(), AppError> {
    if is_valid_repository_name(name) {
        Ok(())
    } else {
        Err(AppError::Oci(OciError::NameInvalid(name.to_string())))
    }
}

fn body_to_reader(body: Bytes) -> Pin<Box<dyn AsyncRead + Send>> {
    Box::pin(std::io::Cursor::new(body.to_vec()))
}

fn request_to_reader(request: Request) -> Pin<Box<dyn AsyncRead + Send>> {
    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    Box::pin(StreamReader::new(stream))
}

fn sign_state(state: &AppState, name: &str, uuid: &str, offset: u64, started_at: i64) -> String {
    upload_token::sign(
        &state.config.upload_hmac_secret,
        &UploadState {
            name: name.to_string(),
            uuid: uuid.to_string(),
            offset,
            started_at,
        },
    )
}

/// Verifies `_state` (when present) against the session's persisted offset
/// per §4.3's four-point resume check: HMAC validity, repository match,
/// uuid match, persisted-offset match.
async fn verify_resume(
    state: &AppState,
    name: &str,
    uuid: &str,
    params: &HashMap<String, String>,
) -> Result<u64, AppError> {
    let info = state.blobs.session_info(uuid).await?;
    if let Some(token) = params.get("_state") {
        let decoded = upload_token::verify(&state.config.upload_hmac_secret, token)?;
        upload_token::check_resume(&decoded, name, uuid, info.offset)?;
    }
    Ok(info.offset)
}

fn parse_content_range(headers: &HeaderMap) -> Result<Option<(u64, u64)>, AppError> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    if let Some(raw) = headers.get(header::CONTENT_RANGE).and_then(|v| v.to_str().ok()) {
        let (start_s, end_s) = raw
            .split_once('-')
            .ok_or_else(|| AppError::Oci(OciError::BlobUploadInvalid("invalid Content-Range".into())))?;
        let start: u64 = start_s
            .parse()
            .map_err(|_| AppError::Oci(OciError::BlobUploadInvalid("invalid Content-Range start".into())))?;
        let end: u64 = end_s
            .parse()
            .map_err(|_| AppError::Oci(OciError::BlobUploadInvalid("invalid Content-Range end".into())))?;
        if start > end {
            return Err(AppError::Oci(OciError::BlobUploadInvalid(
                "Content-Range start exceeds end".into(),
            )));
        }
        if content_length != Some(end - start + 1) {
            return Err(AppError::Oci(OciError::SizeInvalid(
                "Content-Length does not match Content-Range".into(),
            )));
        }
        return Ok(Some((start, end)));
    }
    Ok(content_length.map(|_| (0, 0)))
}

/// `POST /v2/{name}/blobs/uploads/`: opens a session, or (with `?digest=`)
/// completes a monolithic upload in one request, or (with `?mount=&from=`)
/// cross-repository-mounts an existing blob.
pub async fn post_blob_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    let repository = state.metadata.ensure_repository(&name).await?;

    if let (Some(mount_str), Some(from)) = (params.get("mount"), params.get("from")) {
        validate_name(from)?;
        if let Ok(digest) = Digest::from_str(mount_str) {
            let source = state.metadata.get_repository(from).await?;
            if let Some(source) = source
                && state.metadata.blob_linked(source.id, &digest).await?
                && let Some(blob) = state.metadata.get_blob(&digest).await?
            {
                state
                    .metadata
                    .link_blob(repository.id, &digest, &blob.media_type, blob.size as u64)
                    .await?;
                let location = format!("/v2/{name}/blobs/{digest}");
                return Ok(Response::builder()
                    .status(StatusCode::CREATED)
                    .header(header::LOCATION, location)
                    .header("Docker-Content-Digest", digest.to_string())
                    .body(Body::empty())
                    .unwrap());
            }
        }
        // Mount target unavailable: fall through to a normal upload session,
        // matching how real clients expect an unmountable blob to still be
        // uploadable in the same request round trip.
    }

    if let Some(digest_str) = params.get("digest") {
        let digest = Digest::from_str(digest_str)
            .map_err(|_| AppError::Oci(OciError::DigestInvalid(digest_str.clone())))?;
        let session = state.blobs.create_upload().await?;
        state.blobs.append_chunk(&session.uuid, body_to_reader(body)).await?;
        let size = state.blobs.commit_upload(&session.uuid, &digest).await?;
        state
            .metadata
            .link_blob(repository.id, &digest, "application/octet-stream", size)
            .await?;
        let location = format!("/v2/{name}/blobs/{digest}");
        return Ok(Response::builder()
            .status(StatusCode::CREATED)
            .header(header::LOCATION, location)
            .header("Docker-Content-Digest", digest.to_string())
            .body(Body::empty())
            .unwrap());
    }

    let session = state.blobs.create_upload().await?;
    let token = sign_state(&state, &name, &session.uuid, 0, session.started_at);
    let location = format!("/v2/{name}/blobs/uploads/{}?_state={token}", session.uuid);
    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, location)
        .header("Docker-Upload-UUID", session.uuid)
        .header(header::RANGE, "0-0")
        .body(Body::empty())
        .unwrap())
}

pub async fn patch_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, uuid)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    let persisted_offset = verify_resume(&state, &name, &uuid, &params).await?;

    if let Some((start, _end)) = parse_content_range(&headers)?
        && start != persisted_offset
    {
        return Err(AppError::Oci(OciError::BlobUploadInvalid(format!(
            "Content-Range start {start} does not match current offset {persisted_offset}"
        ))));
    }

    let new_offset = state
        .blobs
        .append_chunk(&uuid, request_to_reader(request))
        .await?;
    let info = state.blobs.session_info(&uuid).await?;
    let token = sign_state(&state, &name, &uuid, new_offset, info.started_at);
    let location = format!("/v2/{name}/blobs/uploads/{uuid}?_state={token}");

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::LOCATION, location)
        .header("Docker-Upload-UUID", &uuid)
        .header(header::RANGE, format!("0-{}", new_offset.saturating_sub(1)))
        .body(Body::empty())
        .unwrap())
}

pub async fn put_blob_handler(
    State(state): State<Arc<AppState>>,
    Path((name, uuid)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    verify_resume(&state, &name, &uuid, &params).await?;

    let digest_str = params
        .get("digest")
        .ok_or_else(|| AppError::Oci(OciError::DigestInvalid("digest query parameter is required".into())))?;
    let digest = Digest::from_str(digest_str)
        .map_err(|_| AppError::Oci(OciError::DigestInvalid(digest_str.clone())))?;

    let body = axum::body::to_bytes(request.into_body(), usize::MAX).await?;
    if !body.is_empty() {
        state.blobs.append_chunk(&uuid, body_to_reader(body)).await?;
    }

    let size = state.blobs.commit_upload(&uuid, &digest).await?;
    let repository = state.metadata.ensure_repository(&name).await?;
    state
        .metadata
        .link_blob(repository.id, &digest, "application/octet-stream", size)
        .await?;

    let location = format!("/v2/{name}/blobs/{digest}");
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, location)
        .header("Docker-Content-Digest", digest.to_string())
        .body(Body::empty())
        .unwrap())
}

pub async fn get_upload_status_handler(
    State(state): State<Arc<AppState>>,
    Path((name, uuid)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    let info = state.blobs.session_info(&uuid).await?;
    let location = format!("/v2/{name}/blobs/uploads/{uuid}");
    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::LOCATION, location)
        .header("Docker-Upload-UUID", &uuid)
        .header(header::RANGE, format!("0-{}", info.offset.saturating_sub(1)))
        .body(Body::empty())
        .unwrap())
}

pub async fn delete_upload_handler(
    State(state): State<Arc<AppState>>,
    Path((name, uuid)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    validate_name(&name)?;
    state.blobs.abort_upload(&uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}
