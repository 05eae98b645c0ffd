//! HTTP surface (§6): wires the `/v2` router — content-type sniffing
//! protection, the in-flight-connections gauge, and the read-only write
//! gate as cross-cutting layers, then the full method/path dispatch in
//! `v2`.

pub mod blobs;
pub mod catalog;
pub mod common;
pub mod manifests;
pub mod middleware;
pub mod tags;
pub mod uploads;
pub mod v2;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/v2/", get(v2::probe))
        .nest("/v2", v2::create_v2_router(state.clone()))
        .layer(axum::middleware::from_fn(middleware::nosniff))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::track_in_flight,
        ))
        .with_state(state)
}
