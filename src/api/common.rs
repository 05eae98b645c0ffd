//! Shared lookups used by several handler modules: repository resolution
//! and `Accept`-header parsing for manifest content negotiation (§4.4).

use axum::http::{HeaderMap, header};

use crate::domain::models::Repository;
use crate::error::{AppError, OciError};
use crate::state::AppState;

/// Resolves an existing repository for a read path; `NameUnknown` if it has
/// never been written to.
pub async fn require_repository_for_read(
    state: &AppState,
    name: &str,
) -> Result<Repository, AppError> {
    state
        .metadata
        .get_repository(name)
        .await?
        .ok_or_else(|| AppError::Oci(OciError::NameUnknown(name.to_string())))
}

/// Splits a multi-valued `Accept` header into its comma-separated media
/// types, stripping any `;q=...` parameters, in the order the client sent
/// them (§4.4: "inspects Accept, splitting multi-valued and comma-lists,
/// parsing parameters"). No weight-based reordering is performed — ties
/// are broken by first-listed, which is the common client behavior this
/// negotiation needs to support.
pub fn parse_accept(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| {
            part.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn accepts(accept: &[String], media_type: &str) -> bool {
    accept.is_empty() || accept.iter().any(|a| a == media_type || a == "*/*")
}

/// Collects every `Accept` header occurrence (a client may repeat the
/// header rather than send one comma-joined value) and parses each through
/// [`parse_accept`], preserving send order across occurrences.
pub fn collect_accept(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(parse_accept)
        .collect()
}
