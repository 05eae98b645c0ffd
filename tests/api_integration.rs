//! End-to-end HTTP surface tests against the full `axum` router (§8's
//! testable-property scenarios S1-S4), wired with the filesystem-only
//! dual-write configuration (`database.enabled = false`) so no live
//! Postgres is required. Pagination (`tags/list`, `_catalog`) is a
//! database-exclusive capability (§4.7 contract 3) exercised instead by the
//! pagination unit tests in `src/metadata/postgres.rs`. The GC review-lock
//! protocol (§8 S5) needs real lock contention over `sqlx::PgPool` that this
//! filesystem-only setup cannot drive at all; that scenario has its own
//! Postgres-backed suite in `tests/gc_review_lock.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use oci_registry_core::blobstore::filesystem::FilesystemBlobStore;
use oci_registry_core::blobstore::memory::InMemoryBlobStore;
use oci_registry_core::config::{Config, DualWriteConfig, ProxyConfig};
use oci_registry_core::domain::digest::digest_bytes;
use oci_registry_core::metadata::filesystem::FilesystemMetadataStore;
use oci_registry_core::metrics::Metrics;
use oci_registry_core::router::DualWriteRouter;
use oci_registry_core::state::AppState;
use oci_registry_core::api;
use tower::ServiceExt;

fn test_state(root: &std::path::Path) -> Arc<AppState> {
    test_state_with(root, false)
}

fn test_state_with(root: &std::path::Path, readonly: bool) -> Arc<AppState> {
    let config = Config {
        host: "127.0.0.1".into(),
        port: 0,
        root_dir: root.to_string_lossy().into_owned(),
        database_url: None,
        database_max_connections: 1,
        registry_url: "http://localhost:5000".into(),
        upload_hmac_secret: b"test-secret-test-secret-test-sec".to_vec(),
        dual_write: DualWriteConfig {
            database_enabled: false,
            mirror_fs: false,
            fallback_on_db_miss: false,
            delete_enabled: true,
            readonly,
        },
        proxy: ProxyConfig {
            enabled: false,
            url: None,
            include: vec![],
        },
    };

    let metrics = Arc::new(Metrics::new());
    let filesystem = Arc::new(FilesystemMetadataStore::new(root));
    let metadata_store = Arc::new(DualWriteRouter::new(
        config.dual_write.clone(),
        None,
        Some(filesystem),
        metrics.clone(),
    ));
    let blobs = Arc::new(FilesystemBlobStore::new(root));

    Arc::new(AppState::new(config, metadata_store, blobs, None, None, metrics))
}

/// Same wiring as [`test_state`], but backed by [`InMemoryBlobStore`] instead
/// of the filesystem driver, so the HTTP surface gets exercised against both
/// `BlobStore` implementations rather than just one.
fn test_state_with_memory_blobs(root: &std::path::Path) -> Arc<AppState> {
    let config = Config {
        host: "127.0.0.1".into(),
        port: 0,
        root_dir: root.to_string_lossy().into_owned(),
        database_url: None,
        database_max_connections: 1,
        registry_url: "http://localhost:5000".into(),
        upload_hmac_secret: b"test-secret-test-secret-test-sec".to_vec(),
        dual_write: DualWriteConfig {
            database_enabled: false,
            mirror_fs: false,
            fallback_on_db_miss: false,
            delete_enabled: true,
            readonly: false,
        },
        proxy: ProxyConfig {
            enabled: false,
            url: None,
            include: vec![],
        },
    };

    let metrics = Arc::new(Metrics::new());
    let filesystem = Arc::new(FilesystemMetadataStore::new(root));
    let metadata_store = Arc::new(DualWriteRouter::new(
        config.dual_write.clone(),
        None,
        Some(filesystem),
        metrics.clone(),
    ));
    let blobs = Arc::new(InMemoryBlobStore::new());

    Arc::new(AppState::new(config, metadata_store, blobs, None, None, metrics))
}

/// Direct `oneshot` dispatch bypasses axum's `into_make_service_with_connect_info`,
/// so the `ConnectInfo<SocketAddr>` extractor used by the migration-proxy
/// check in `dispatch_handler` gets its value from a manually inserted
/// request extension instead.
async fn send(state: &Arc<AppState>, mut request: Request<Body>) -> axum::http::Response<Body> {
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))));
    api::create_router(state.clone())
        .oneshot(request)
        .await
        .unwrap()
}

async fn body_bytes(response: axum::http::Response<Body>) -> Vec<u8> {
    response.into_body().collect().await.unwrap().to_bytes().to_vec()
}

fn put_blob_request(name: &str, digest: &oci_registry_core::domain::Digest, bytes: &[u8]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/v2/{name}/blobs/uploads/?digest={digest}"))
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(bytes.to_vec()))
        .unwrap()
}

/// S1: PUT 32 random bytes as a blob, then GET it back byte-for-byte.
#[tokio::test]
async fn blob_push_then_pull_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let bytes: Vec<u8> = (0..32u8).collect();
    let digest = digest_bytes(&bytes);

    let response = send(&state, put_blob_request("foo/bar", &digest, &bytes)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(location, format!("/v2/foo/bar/blobs/{digest}"));

    let get = send(
        &state,
        Request::builder().method("GET").uri(&location).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(body_bytes(get).await, bytes);
}

/// S1 again, but against `InMemoryBlobStore` instead of the filesystem
/// driver, including a delete — exercises the in-memory `BlobStore` through
/// the real HTTP surface rather than only its own `#[cfg(test)]` module.
#[tokio::test]
async fn blob_push_then_pull_round_trips_with_memory_blob_store() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state_with_memory_blobs(dir.path());

    let bytes: Vec<u8> = (0..32u8).map(|b| b.wrapping_add(100)).collect();
    let digest = digest_bytes(&bytes);

    let response = send(&state, put_blob_request("foo/bar", &digest, &bytes)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(location, format!("/v2/foo/bar/blobs/{digest}"));

    let get = send(
        &state,
        Request::builder().method("GET").uri(&location).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(body_bytes(get).await, bytes);

    let delete = send(
        &state,
        Request::builder().method("DELETE").uri(&location).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(delete.status(), StatusCode::ACCEPTED);

    let get_again = send(
        &state,
        Request::builder().method("GET").uri(&location).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(get_again.status(), StatusCode::NOT_FOUND);
}

/// S2: pushing a manifest before its config blob exists fails with
/// `ManifestBlobUnknown`; uploading the config and retrying succeeds.
#[tokio::test]
async fn manifest_push_reports_missing_blobs_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let name = "foo/bar";

    let layer_bytes = b"layer contents".to_vec();
    let layer_digest = digest_bytes(&layer_bytes);
    send(&state, put_blob_request(name, &layer_digest, &layer_bytes)).await;

    let config_bytes = b"{}".to_vec();
    let config_digest = digest_bytes(&config_bytes);

    let manifest_json = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest.to_string(),
            "size": config_bytes.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": layer_digest.to_string(),
            "size": layer_bytes.len(),
        }],
    });
    let manifest_bytes = serde_json::to_vec(&manifest_json).unwrap();

    let put_manifest = |body: Vec<u8>| {
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/{name}/manifests/latest"))
            .header(header::CONTENT_TYPE, "application/vnd.oci.image.manifest.v1+json")
            .body(Body::from(body))
            .unwrap()
    };

    let first = send(&state, put_manifest(manifest_bytes.clone())).await;
    assert_eq!(first.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(first).await).unwrap();
    assert_eq!(body["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");

    send(&state, put_blob_request(name, &config_digest, &config_bytes)).await;

    let second = send(&state, put_manifest(manifest_bytes)).await;
    assert_eq!(second.status(), StatusCode::CREATED);
    assert!(second.headers().get("docker-content-digest").is_some());
}

/// S3: pushing a manifest by tag, reading it back by tag, then deleting
/// the tag leaves the underlying manifest digest still reachable.
#[tokio::test]
async fn tag_put_then_delete_leaves_digest_reachable() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let name = "foo/bar";

    let manifest_json = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [],
    });
    let manifest_bytes = serde_json::to_vec(&manifest_json).unwrap();
    let digest = digest_bytes(&manifest_bytes);

    let put = send(
        &state,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/{name}/manifests/latest"))
            .header(header::CONTENT_TYPE, "application/vnd.oci.image.index.v1+json")
            .body(Body::from(manifest_bytes))
            .unwrap(),
    )
    .await;
    assert_eq!(put.status(), StatusCode::CREATED);

    let by_tag = send(
        &state,
        Request::builder()
            .method("GET")
            .uri(format!("/v2/{name}/manifests/latest"))
            .header(header::ACCEPT, "application/vnd.oci.image.index.v1+json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(by_tag.status(), StatusCode::OK);

    let delete = send(
        &state,
        Request::builder()
            .method("DELETE")
            .uri(format!("/v2/{name}/tags/latest"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(delete.status(), StatusCode::ACCEPTED);

    let by_tag_again = send(
        &state,
        Request::builder()
            .method("GET")
            .uri(format!("/v2/{name}/manifests/latest"))
            .header(header::ACCEPT, "application/vnd.oci.image.index.v1+json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(by_tag_again.status(), StatusCode::NOT_FOUND);

    let by_digest = send(
        &state,
        Request::builder()
            .method("GET")
            .uri(format!("/v2/{name}/manifests/{digest}"))
            .header(header::ACCEPT, "application/vnd.oci.image.index.v1+json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(by_digest.status(), StatusCode::OK);
}

/// S4: cross-repository mount creates the destination link without
/// re-uploading bytes.
#[tokio::test]
async fn cross_repository_mount_links_without_copying_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let bytes = b"shared layer".to_vec();
    let digest = digest_bytes(&bytes);
    send(&state, put_blob_request("foo/bar", &digest, &bytes)).await;

    let mount = send(
        &state,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/dst/blobs/uploads/?mount={digest}&from=foo/bar"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(mount.status(), StatusCode::CREATED);
    let location = mount.headers().get(header::LOCATION).unwrap().to_str().unwrap().to_string();
    assert_eq!(location, format!("/v2/dst/blobs/{digest}"));

    let head = send(
        &state,
        Request::builder().method("HEAD").uri(&location).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(head.status(), StatusCode::OK);
}

/// Unrelated legacy schema1 manifests are rejected at ingest (§4.4, §7).
#[tokio::test]
async fn schema1_manifest_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let body = serde_json::json!({
        "schemaVersion": 1,
        "name": "foo/bar",
        "tag": "latest",
        "fsLayers": [],
        "history": [],
    });

    let response = send(
        &state,
        Request::builder()
            .method("PUT")
            .uri("/v2/foo/bar/manifests/latest")
            .header(header::CONTENT_TYPE, "application/vnd.docker.distribution.manifest.v1+json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Read-only mode rejects mutating methods with 405 before touching storage.
#[tokio::test]
async fn readonly_mode_rejects_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state_with(dir.path(), true);

    let response = send(
        &state,
        Request::builder()
            .method("DELETE")
            .uri("/v2/foo/bar/tags/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

/// Unknown repository on a manifest GET is `NameUnknown`, not a panic.
#[tokio::test]
async fn unknown_repository_manifest_get_is_name_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let response = send(
        &state,
        Request::builder()
            .method("GET")
            .uri("/v2/never/seen/manifests/latest")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["errors"][0]["code"], "NAME_UNKNOWN");
}

/// The `/v2/` probe always succeeds, even with no repositories written yet.
#[tokio::test]
async fn probe_endpoint_returns_empty_object() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());

    let response = send(
        &state,
        Request::builder().method("GET").uri("/v2/").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"{}");
}

