//! `GET /v2/{name}/tags/list` and `DELETE /v2/{name}/tags/{reference}`
//! (§4.5). Generalizes the teacher's `service/manifest.rs` tag-list handler,
//! which walked the filesystem's tag directory and paginated in Rust, onto
//! `MetadataStore::list_tags`'s database-side keyset pagination (§4.7
//! contract 3) and the GC review-lock protocol (§4.8) on delete.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use oci_spec::distribution::TagListBuilder;

use crate::domain::reference::is_valid_repository_name;
use crate::error::{AppError, OciError};
use crate::gc::{REVIEW_GRACE, REVIEW_LOCK_DEADLINE};
use crate::metadata::Pagination;
use crate::state::AppState;

use super::common::require_repository_for_read;

fn validate_name(name: &str) -> Result<(), AppError> {
    if is_valid_repository_name(name) {
        Ok(())
    } else {
        Err(AppError::Oci(OciError::NameInvalid(name.to_string())))
    }
}

/// Percent-encodes `/` so a pagination marker survives as a single query
/// value (§8 S6).
fn percent_encode(s: &str) -> String {
    s.replace('%', "%25").replace('/', "%2F")
}

pub async fn get_tag_list_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    validate_name(&name)?;
    let repository = require_repository_for_read(&state, &name).await?;

    let n = params.get("n").and_then(|v| v.parse::<i64>().ok());
    let last = params.get("last").cloned();
    let page = state
        .metadata
        .list_tags(repository.id, Pagination::new(n, last.clone()))
        .await?;

    // A repository with no tags at all reports them as absent rather than an
    // empty array (§4.5); a filtered/paginated request that legitimately
    // lands on an empty trailing page still reports `tags: []`. `TagList`'s
    // `tags` field is a plain (non-optional) `Vec<String>`, which can't
    // express the omitted-entirely case, so that branch is built by hand.
    let mut response = if page.items.is_empty() && last.is_none() {
        (StatusCode::OK, Json(serde_json::json!({ "name": name }))).into_response()
    } else {
        let body = TagListBuilder::default()
            .name(name.clone())
            .tags(page.items)
            .build()
            .map_err(|e| AppError::Internal(format!("building tag list response: {e}")))?;
        (StatusCode::OK, Json(body)).into_response()
    };

    if let Some(next_last) = page.next_last {
        let n = n.filter(|v| *v > 0).unwrap_or(Pagination::DEFAULT_N as i64);
        let link = format!(
            "</v2/{name}/tags/list?last={}&n={}>; rel=\"next\"",
            percent_encode(&next_last),
            n
        );
        response
            .headers_mut()
            .insert(header::LINK, link.parse().unwrap());
    }
    Ok(response)
}

pub async fn delete_tag_handler(
    State(state): State<Arc<AppState>>,
    Path((name, tag_name)): Path<(String, String)>,
) -> Result<Response, AppError> {
    validate_name(&name)?;
    let repository = require_repository_for_read(&state, &name).await?;
    let tag = state
        .metadata
        .get_tag(repository.id, &tag_name)
        .await?
        .ok_or_else(|| AppError::Oci(OciError::ManifestUnknown(tag_name.clone())))?;

    if let Some(gc) = &state.gc {
        gc.delete_tag_under_lock(repository.id, tag.manifest_id, &tag_name, REVIEW_LOCK_DEADLINE)
            .await?;
        gc.schedule_review(
            repository.id,
            tag.manifest_id,
            chrono::Utc::now() + chrono::Duration::from_std(REVIEW_GRACE).unwrap(),
        )
        .await?;
    }
    // Always go through the router too, mirroring `delete_manifest_handler`:
    // the GC lock above only ever touches the Postgres pool directly, so the
    // filesystem mirror (when `mirror_fs` is on) still needs this call to
    // see the deletion. Harmless no-op against Postgres when the row is
    // already gone.
    state.metadata.delete_tag(repository.id, &tag_name).await?;

    Ok(axum::response::Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(header::CONTENT_LENGTH, 0)
        .body(axum::body::Body::empty())
        .unwrap())
}
