//! Cross-cutting response shaping (§6): every response except a 405 carries
//! `X-Content-Type-Options: nosniff`. Grounded in the teacher's
//! `api/middleware.rs` pattern of a `from_fn_with_state` layer wrapping the
//! whole `/v2` router, generalized from an authorization check to a plain
//! header injection since auth policy itself is out of scope here.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::OciError;
use crate::state::AppState;

pub async fn nosniff(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    if response.status() != StatusCode::METHOD_NOT_ALLOWED {
        response
            .headers_mut()
            .insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    }
    response
}

/// Decrements the in-flight gauge on drop, so a cancelled request (client
/// disconnects mid-handler, dropping this future before it resolves) still
/// releases its slot instead of leaking it (§5: cancellation must abort
/// cleanly).
struct InFlightGuard(Arc<AppState>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.metrics.in_flight_connections.dec();
    }
}

/// Tracks the in-flight-connections gauge (§2 Observability, §5 "Prometheus
/// histograms: concurrent observation is lock-free") for as long as this
/// request is being handled, regardless of how the handler returns.
pub async fn track_in_flight(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    state.metrics.in_flight_connections.inc();
    let _guard = InFlightGuard(state);
    next.run(req).await
}

/// Rejects every mutating request with 405 `Unsupported` before it reaches
/// a handler when the registry is configured read-only (§4.5, §4.7). A
/// registry run as a pull-through cache is, in terms of the recognized
/// configuration surface (§4.7), just this flag combined with the
/// migration proxy enabled — there is no separate mode flag to check.
pub async fn enforce_write_policy(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let mutating = matches!(
        *req.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if mutating && state.config.dual_write.readonly {
        return OciError::Unsupported("registry is read-only".into()).into_response();
    }
    next.run(req).await
}
