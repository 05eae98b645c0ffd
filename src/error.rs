//! Error taxonomy (§7). `OciError` covers every spec-mandated client-facing
//! code; `AppError` adds the internal/infra cases (unclassified storage
//! failures, GC-lock timeouts) and is what handlers actually return.
//!
//! Structure follows the teacher's `error.rs`: a `thiserror` enum per
//! concern, each with its own `IntoResponse`, composed into one top-level
//! `AppError` handlers use as their `Result` error type.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OciErrorCode {
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    ManifestUnverified,
    NameUnknown,
    NameInvalid,
    TagInvalid,
    SizeInvalid,
    Unsupported,
    Denied,
    Unauthorized,
    Unavailable,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub code: OciErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorInfo {
    fn new(code: OciErrorCode, message: impl Into<String>) -> Self {
        ErrorInfo {
            code,
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponseBody {
    pub errors: Vec<ErrorInfo>,
}

fn error_response(status: StatusCode, errors: Vec<ErrorInfo>) -> Response {
    (status, Json(ErrorResponseBody { errors })).into_response()
}

/// The client-facing error kinds of §7. A single `OciError` maps to a
/// single HTTP status; `ManifestBlobUnknown` carries every missing digest
/// at once so the handler can emit one entry per digest in the same
/// response, per §4.4's "one `ManifestBlobUnknown` per missing digest".
#[derive(Error, Debug)]
pub enum OciError {
    #[error("blob unknown: {0}")]
    BlobUnknown(String),
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),
    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),
    #[error("digest invalid: {0}")]
    DigestInvalid(String),
    #[error("manifest references unknown blob(s): {0:?}")]
    ManifestBlobUnknown(Vec<String>),
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),
    #[error("manifest unverified: {0}")]
    ManifestUnverified(String),
    #[error("name unknown: {0}")]
    NameUnknown(String),
    #[error("name invalid: {0}")]
    NameInvalid(String),
    #[error("tag invalid: {0}")]
    TagInvalid(String),
    #[error("size invalid: {0}")]
    SizeInvalid(String),
    #[error("unsupported")]
    Unsupported(String),
    #[error("denied: {0}")]
    Denied(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl IntoResponse for OciError {
    fn into_response(self) -> Response {
        let (status, info) = match &self {
            OciError::BlobUnknown(digest) => (
                StatusCode::NOT_FOUND,
                vec![ErrorInfo::new(OciErrorCode::BlobUnknown, "blob unknown")
                    .with_detail(json!({ "digest": digest }))],
            ),
            OciError::BlobUploadInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                vec![ErrorInfo::new(OciErrorCode::BlobUploadInvalid, msg.clone())],
            ),
            OciError::BlobUploadUnknown(session_id) => (
                StatusCode::NOT_FOUND,
                vec![
                    ErrorInfo::new(OciErrorCode::BlobUploadUnknown, "blob upload unknown")
                        .with_detail(json!({ "upload_id": session_id })),
                ],
            ),
            OciError::DigestInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                vec![ErrorInfo::new(OciErrorCode::DigestInvalid, msg.clone())],
            ),
            OciError::ManifestBlobUnknown(digests) => (
                StatusCode::BAD_REQUEST,
                digests
                    .iter()
                    .map(|d| {
                        ErrorInfo::new(OciErrorCode::ManifestBlobUnknown, "blob unknown to registry")
                            .with_detail(json!({ "digest": d }))
                    })
                    .collect(),
            ),
            OciError::ManifestInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                vec![ErrorInfo::new(OciErrorCode::ManifestInvalid, msg.clone())],
            ),
            OciError::ManifestUnknown(reference) => (
                StatusCode::NOT_FOUND,
                vec![ErrorInfo::new(OciErrorCode::ManifestUnknown, "manifest unknown")
                    .with_detail(json!({ "reference": reference }))],
            ),
            OciError::ManifestUnverified(msg) => (
                StatusCode::BAD_REQUEST,
                vec![ErrorInfo::new(OciErrorCode::ManifestUnverified, msg.clone())],
            ),
            OciError::NameUnknown(name) => (
                StatusCode::NOT_FOUND,
                vec![ErrorInfo::new(OciErrorCode::NameUnknown, "repository name not known to registry")
                    .with_detail(json!({ "name": name }))],
            ),
            OciError::NameInvalid(name) => (
                StatusCode::BAD_REQUEST,
                vec![ErrorInfo::new(OciErrorCode::NameInvalid, "invalid repository name")
                    .with_detail(json!({ "name": name }))],
            ),
            OciError::TagInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                vec![ErrorInfo::new(OciErrorCode::TagInvalid, msg.clone())],
            ),
            OciError::SizeInvalid(msg) => (
                StatusCode::BAD_REQUEST,
                vec![ErrorInfo::new(OciErrorCode::SizeInvalid, msg.clone())],
            ),
            OciError::Unsupported(msg) => (
                StatusCode::METHOD_NOT_ALLOWED,
                vec![ErrorInfo::new(OciErrorCode::Unsupported, msg.clone())],
            ),
            OciError::Denied(msg) => (
                StatusCode::FORBIDDEN,
                vec![ErrorInfo::new(OciErrorCode::Denied, msg.clone())],
            ),
            OciError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                vec![ErrorInfo::new(OciErrorCode::Unauthorized, msg.clone())],
            ),
            OciError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                vec![ErrorInfo::new(OciErrorCode::Unavailable, msg.clone())],
            ),
        };
        error_response(status, info)
    }
}

/// Top-level error type every handler returns. Wraps `OciError` for
/// spec-mandated client errors and carries its own variants for the two
/// infra cases that don't map to a client mistake: unclassified storage
/// failure, and request cancellation.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Oci(#[from] OciError),

    #[error("storage error: {0}")]
    Storage(#[source] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("request cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<axum::Error> for AppError {
    fn from(e: axum::Error) -> Self {
        AppError::Oci(OciError::BlobUploadInvalid(e.to_string()))
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::Oci(OciError::BlobUnknown("not found".to_string()))
        } else {
            AppError::Storage(e)
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Oci(_) => tracing::debug!(error = %self, "request failed"),
            AppError::Cancelled => tracing::debug!("request cancelled by client"),
            _ => tracing::error!(error = %self, "internal error"),
        }
        match self {
            AppError::Oci(e) => e.into_response(),
            AppError::Cancelled => StatusCode::REQUEST_TIMEOUT.into_response(),
            AppError::Storage(_) | AppError::Database(_) | AppError::Internal(_) => {
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    vec![ErrorInfo::new(OciErrorCode::Unknown, "an internal error occurred")],
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_blob_unknown_emits_one_entry_per_digest() {
        let err = OciError::ManifestBlobUnknown(vec!["sha256:a".into(), "sha256:b".into()]);
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn blob_unknown_is_404() {
        let resp = OciError::BlobUnknown("sha256:x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unavailable_is_503() {
        let resp = OciError::Unavailable("gc lock timeout".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
