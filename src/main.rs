#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use oci_registry_core::{api, blobstore, config, gc, metadata, metrics, router, state};

use config::{Args, validate_config};
use metadata::filesystem::FilesystemMetadataStore;
use metadata::postgres::PostgresMetadataStore;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let args = Args::parse();
    let config = validate_config(&args)?;
    let metrics = Arc::new(metrics::Metrics::new());

    let database: Option<Arc<PostgresMetadataStore>> = if config.dual_write.database_enabled {
        let database_url = config
            .database_url
            .as_ref()
            .expect("validate_config guarantees database_url is set when database_enabled");
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Some(Arc::new(PostgresMetadataStore::new(pool)))
    } else {
        None
    };

    // The filesystem metadata backend is needed whenever it could be read
    // or written: mirroring, database-disabled, or a configured fallback.
    let filesystem: Option<Arc<FilesystemMetadataStore>> =
        if config.dual_write.mirror_fs || !config.dual_write.database_enabled || config.dual_write.fallback_on_db_miss
        {
            Some(Arc::new(FilesystemMetadataStore::new(config.root_dir.as_str())))
        } else {
            None
        };

    let gc = database
        .as_ref()
        .map(|db| Arc::new(gc::GcCoordinator::new(db.pool().clone())));

    let proxy = if config.proxy.enabled {
        let url = config
            .proxy
            .url
            .clone()
            .expect("validate_config guarantees proxy_url is set when proxy_enabled");
        Some(Arc::new(router::MigrationProxy::new(url, config.proxy.include.clone())))
    } else {
        None
    };

    let metadata_store = Arc::new(router::DualWriteRouter::new(
        config.dual_write.clone(),
        database,
        filesystem,
        metrics.clone(),
    ));
    let blobs = Arc::new(blobstore::filesystem::FilesystemBlobStore::new(config.root_dir.as_str()));

    let host = config.host.clone();
    let port = config.port;
    let state = Arc::new(AppState::new(config, metadata_store, blobs, gc, proxy, metrics));

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let app = api::create_router(state).layer(TraceLayer::new_for_http());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down");
}
