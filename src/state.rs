//! Process-wide shared state (§4.7, §4.8, §4.9), assembled once at startup
//! and handed to every handler as `Arc<AppState>`. Generalizes the
//! teacher's `utils/state.rs` `AppState` (a bag of `Arc<dyn Trait>`
//! capabilities plus `Arc<Config>`) to this crate's capability set: one
//! `MetadataStore` (usually the dual-write router), one `BlobStore`, the
//! GC coordinator, an optional migration proxy, and the metrics registry.
//! Unlike the teacher's `AppState`, there is no in-process upload-session
//! map: sessions are owned by the `BlobStore` implementation itself and
//! resumed via the HMAC `_state` token, so no additional bookkeeping lives
//! here.

use std::sync::Arc;

use crate::blobstore::BlobStore;
use crate::config::Config;
use crate::gc::GcCoordinator;
use crate::metadata::MetadataStore;
use crate::metrics::Metrics;
use crate::router::MigrationProxy;

pub struct AppState {
    pub config: Config,
    pub metadata: Arc<dyn MetadataStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub gc: Option<Arc<GcCoordinator>>,
    pub proxy: Option<Arc<MigrationProxy>>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        gc: Option<Arc<GcCoordinator>>,
        proxy: Option<Arc<MigrationProxy>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        AppState {
            config,
            metadata,
            blobs,
            gc,
            proxy,
            metrics,
        }
    }
}
