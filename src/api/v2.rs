//! The `/v2` API surface (§6): route table and method dispatch. Repository
//! names may themselves contain `/`, so axum's normal per-segment routing
//! can't express `/{name}/manifests/{reference}` when `name` is
//! `a/b/c` — this generalizes the teacher's `api/v2.rs` `dispatch_handler`,
//! which captures the whole remaining path as one wildcard segment and
//! splits on `/` itself, onto the new handler modules and the migration
//! proxy (§4.9).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Router, middleware};

use crate::error::AppError;
use crate::state::AppState;

use super::{blobs, catalog, manifests, middleware as api_middleware, tags, uploads};

pub fn create_v2_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(probe))
        .route("/{*tail}", any(dispatch_handler))
        .layer(middleware::from_fn_with_state(
            state,
            api_middleware::enforce_write_policy,
        ))
}

pub async fn probe() -> impl IntoResponse {
    (
        StatusCode::OK,
        [
            ("Docker-Distribution-Api-Version", "registry/2.0"),
            ("Content-Type", "application/json"),
        ],
        "{}",
    )
}

fn method_not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response()
}

/// Outcome of checking whether a repository-scoped request should instead
/// be handed to the migration proxy.
enum RouteDecision {
    Forwarded(Response),
    Local(Request),
}

/// Forwards to the successor registry when a proxy is configured, it is
/// eligible for `name` (§4.9 include patterns), and the repository does not
/// exist locally yet. Otherwise hands the untouched request back so normal
/// dispatch continues. `client_addr`/`local_host` are the real peer address
/// and request `Host`, set on the forwarded `X-Forwarded-For`/
/// `X-Forwarded-Host` headers (§4.9).
async fn route_or_forward(
    state: &AppState,
    name: &str,
    request: Request,
    client_addr: Option<String>,
    local_host: Option<String>,
) -> Result<RouteDecision, AppError> {
    if let Some(proxy) = &state.proxy
        && proxy.matches(name)
        && state.metadata.get_repository(name).await?.is_none()
    {
        let method = request.method().clone();
        let uri = request.uri().clone();
        let headers = request.headers().clone();
        let body = axum::body::to_bytes(request.into_body(), usize::MAX).await?;
        let response = proxy
            .forward(method, &uri, headers, body, client_addr, local_host)
            .await;
        return Ok(RouteDecision::Forwarded(response));
    }
    Ok(RouteDecision::Local(request))
}

async fn dispatch_handler(
    State(state): State<Arc<AppState>>,
    Path(tail): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, AppError> {
    let method = request.method().clone();
    let segments: Vec<&str> = tail.split('/').collect();
    let client_addr = Some(peer.ip().to_string());
    let local_host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match segments.as_slice() {
        ["_catalog"] => {
            if method == Method::GET {
                catalog::get_catalog_handler(State(state), Query(params))
                    .await
                    .map(|r| r.into_response())
            } else {
                Ok(method_not_allowed())
            }
        }

        [name @ .., "manifests", reference] if !name.is_empty() => {
            let name = name.join("/");
            let reference = reference.to_string();
            let request = match route_or_forward(&state, &name, request, client_addr, local_host).await? {
                RouteDecision::Forwarded(resp) => return Ok(resp),
                RouteDecision::Local(r) => r,
            };
            match method {
                Method::GET => manifests::get_manifest_handler(State(state), Path((name, reference)), headers)
                    .await
                    .map(|r| r.into_response()),
                Method::HEAD => manifests::head_manifest_handler(State(state), Path((name, reference)), headers)
                    .await
                    .map(|r| r.into_response()),
                Method::PUT => {
                    let body = axum::body::to_bytes(request.into_body(), usize::MAX).await?;
                    manifests::put_manifest_handler(State(state), Path((name, reference)), headers, body)
                        .await
                        .map(|r| r.into_response())
                }
                Method::DELETE => manifests::delete_manifest_handler(State(state), Path((name, reference)))
                    .await
                    .map(|r| r.into_response()),
                _ => Ok(method_not_allowed()),
            }
        }

        [name @ .., "blobs", digest] if !name.is_empty() && *digest != "uploads" => {
            let name = name.join("/");
            let digest = digest.to_string();
            let _request = match route_or_forward(&state, &name, request, client_addr, local_host).await? {
                RouteDecision::Forwarded(resp) => return Ok(resp),
                RouteDecision::Local(r) => r,
            };
            match method {
                Method::GET => blobs::get_blob_handler(State(state), Path((name, digest)), headers)
                    .await
                    .map(|r| r.into_response()),
                Method::HEAD => blobs::head_blob_handler(State(state), Path((name, digest)))
                    .await
                    .map(|r| r.into_response()),
                Method::DELETE => blobs::delete_blob_handler(State(state), Path((name, digest)))
                    .await
                    .map(|r| r.into_response()),
                _ => Ok(method_not_allowed()),
            }
        }

        // tail: /{name}/blobs/uploads/ (trailing slash leaves a final empty segment)
        [name @ .., "blobs", "uploads", session_id] if !name.is_empty() && session_id.is_empty() => {
            let name = name.join("/");
            let request = match route_or_forward(&state, &name, request, client_addr, local_host).await? {
                RouteDecision::Forwarded(resp) => return Ok(resp),
                RouteDecision::Local(r) => r,
            };
            if method == Method::POST {
                let body = axum::body::to_bytes(request.into_body(), usize::MAX).await?;
                uploads::post_blob_handler(State(state), Path(name), Query(params), body)
                    .await
                    .map(|r| r.into_response())
            } else {
                Ok(method_not_allowed())
            }
        }

        [name @ .., "blobs", "uploads", session_id] if !name.is_empty() && !session_id.is_empty() => {
            let name = name.join("/");
            let session_id = session_id.to_string();
            let request = match route_or_forward(&state, &name, request, client_addr, local_host).await? {
                RouteDecision::Forwarded(resp) => return Ok(resp),
                RouteDecision::Local(r) => r,
            };
            match method {
                Method::PATCH => uploads::patch_blob_handler(
                    State(state),
                    Path((name, session_id)),
                    Query(params),
                    headers,
                    request,
                )
                .await
                .map(|r| r.into_response()),
                Method::PUT => {
                    uploads::put_blob_handler(State(state), Path((name, session_id)), Query(params), request)
                        .await
                        .map(|r| r.into_response())
                }
                Method::GET => uploads::get_upload_status_handler(State(state), Path((name, session_id)))
                    .await
                    .map(|r| r.into_response()),
                Method::DELETE => uploads::delete_upload_handler(State(state), Path((name, session_id)))
                    .await
                    .map(|r| r.into_response()),
                _ => Ok(method_not_allowed()),
            }
        }

        [name @ .., "tags", "list"] if !name.is_empty() => {
            let name = name.join("/");
            let _request = match route_or_forward(&state, &name, request, client_addr, local_host).await? {
                RouteDecision::Forwarded(resp) => return Ok(resp),
                RouteDecision::Local(r) => r,
            };
            if method == Method::GET {
                tags::get_tag_list_handler(State(state), Path(name), Query(params))
                    .await
                    .map(|r| r.into_response())
            } else {
                Ok(method_not_allowed())
            }
        }

        [name @ .., "tags", tag_name] if !name.is_empty() => {
            let name = name.join("/");
            let tag_name = tag_name.to_string();
            let _request = match route_or_forward(&state, &name, request, client_addr, local_host).await? {
                RouteDecision::Forwarded(resp) => return Ok(resp),
                RouteDecision::Local(r) => r,
            };
            if method == Method::DELETE {
                tags::delete_tag_handler(State(state), Path((name, tag_name)))
                    .await
                    .map(|r| r.into_response())
            } else {
                Ok(method_not_allowed())
            }
        }

        _ => Ok((StatusCode::NOT_FOUND, "not found").into_response()),
    }
}
