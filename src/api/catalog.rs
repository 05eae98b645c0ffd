//! `GET /v2/_catalog` (§4.6): paginated repository enumeration, sharing the
//! `Link: ...; rel="next"` pagination contract with tag listing (§4.5, §4.7
//! contract 3). Generalizes the teacher's `service/manifest.rs` tag-list
//! handler, which paginated by walking the filesystem tag directory in Rust,
//! onto `MetadataStore::list_repositories`'s database-side keyset query.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::AppError;
use crate::metadata::Pagination;
use crate::state::AppState;

#[derive(Serialize)]
struct CatalogResponse {
    repositories: Vec<String>,
}

pub async fn get_catalog_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let n = params.get("n").and_then(|v| v.parse::<i64>().ok());
    let last = params.get("last").cloned();
    let page = state
        .metadata
        .list_repositories(Pagination::new(n, last.clone()))
        .await?;

    let mut response = (
        StatusCode::OK,
        Json(CatalogResponse {
            repositories: page.items,
        }),
    )
        .into_response();

    if let Some(next_last) = page.next_last {
        let n = n.filter(|v| *v > 0).unwrap_or(Pagination::DEFAULT_N as i64);
        let link = format!(
            "</v2/_catalog?last={}&n={}>; rel=\"next\"",
            percent_encode(&next_last),
            n
        );
        response
            .headers_mut()
            .insert(header::LINK, link.parse().unwrap());
    }
    Ok(response)
}

/// Percent-encodes `/` in a pagination marker so it survives as a single
/// query value when it names a repository or tag path containing slashes
/// (§8 S6's `?last=hpgkt%2Fbmawb&n=4` example).
fn percent_encode(s: &str) -> String {
    s.replace('%', "%25").replace('/', "%2F")
}
