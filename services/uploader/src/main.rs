use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uploader_service::{
    export_session, storage, Config, CoordinatorSettings, ExifExtractor, PgPhotoStore,
    SpatialIndex, UploadCoordinator, UploadRequest, UploadState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        storage = ?config.storage.storage_type,
        bucket = %config.storage.bucket,
        "Starting Streetview Uploader Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let photo_store = Arc::new(
        PgPhotoStore::new(&config.database)
            .await
            .context("Failed to initialize photo store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        photo_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let object_store = storage::connect(&config.storage)
        .await
        .context("Failed to initialize object store")?;

    let index = Arc::new(SpatialIndex::new(object_store.clone()));
    index.load().await.context("Failed to load spatial index")?;

    let coordinator = UploadCoordinator::new(
        CoordinatorSettings::from(&config.uploader),
        object_store,
        photo_store,
        Arc::new(ExifExtractor),
        index.clone(),
    );

    info!("Uploader service started successfully");

    let mut handles = Vec::new();
    for path in std::env::args().skip(1) {
        match coordinator.submit(UploadRequest::new(&path)) {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!(file = %path, error = %e, "Upload not accepted"),
        }
    }

    let interrupted = tokio::select! {
        states = join_all(handles.iter().map(|h| h.wait())) => {
            let committed = states
                .iter()
                .filter(|s| **s == UploadState::RecordCommitted)
                .count();
            info!(submitted = states.len(), committed, "Uploads finished");
            false
        }
        _ = shutdown_signal() => true,
    };

    if !interrupted {
        export_route(&coordinator).await;
    }

    info!("Shutting down uploader service");

    if !coordinator.shutdown(config.shutdown_grace()).await {
        warn!("Some uploads were still in flight at shutdown");
    }

    index.save().await.context("Failed to save spatial index")?;

    info!("Uploader service stopped");

    Ok(())
}

/// Export the session as a route when `UPLOADER_ROUTE_ID` is set
async fn export_route(coordinator: &UploadCoordinator) {
    let Ok(raw) = std::env::var("UPLOADER_ROUTE_ID") else {
        return;
    };
    let route_id = match raw.parse::<u32>() {
        Ok(id) => id,
        Err(e) => {
            warn!(route_id = %raw, error = %e, "Ignoring invalid route id");
            return;
        }
    };

    match export_session(coordinator, route_id) {
        Ok(handle) => {
            let state = handle.wait().await;
            info!(route_id, state = %state, "Route export finished");
        }
        Err(e) => error!(route_id, error = %e, "Route export failed"),
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
