use anyhow::{Context, Result};
use revelo_ingest::config::{BackendKind, Config};
use revelo_ingest::derivative_generator::{DerivativeGenerator, Watermark};
use revelo_ingest::ingestor::Ingestor;
use revelo_ingest::photo_api::{start_api_server, AppState};
use revelo_ingest::record_store::{InMemoryRecordStore, PostgresRecordStore, RecordStore};
use revelo_ingest::retrieval_gate::RetrievalGate;
use revelo_ingest::storage_backend::{LocalDiskBackend, S3Backend, StorageBackend};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Revelo ingestion service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // The watermark is process-wide read-only state; refuse to start
    // without it instead of failing per-request.
    let watermark = Watermark::load(Path::new(&config.derivative.watermark_path))
        .context("Failed to load watermark asset")?;
    let generator = Arc::new(DerivativeGenerator::new(
        config.derivative.clone(),
        Some(watermark),
    ));

    // Select the storage backend from configuration
    let mut local_uploads = None;
    let storage: Arc<dyn StorageBackend> = match config.storage.backend {
        BackendKind::Local => {
            let backend = Arc::new(LocalDiskBackend::new(&config.storage.local));
            local_uploads = Some(backend.clone());
            backend
        }
        BackendKind::S3 => {
            let s3_config = config
                .storage
                .s3
                .as_ref()
                .context("storage.s3 must be configured when storage.backend = \"s3\"")?;
            Arc::new(
                S3Backend::new(s3_config)
                    .await
                    .context("Failed to initialize S3 backend")?,
            )
        }
    };

    // Select the record store from configuration
    let store: Arc<dyn RecordStore> = match config.database.url.as_deref() {
        Some(url) => {
            let store = PostgresRecordStore::new(&config.database, url)
                .await
                .context("Failed to initialize record store")?;

            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Arc::new(store)
        }
        None => {
            warn!("No database configured; photo records are held in memory only");
            Arc::new(InMemoryRecordStore::new())
        }
    };

    let ingestor = Arc::new(Ingestor::new(
        storage.clone(),
        store.clone(),
        generator,
        config.ingest.clone(),
    ));
    let gate = Arc::new(RetrievalGate::new(store.clone(), storage.clone()));

    let state = AppState {
        ingestor,
        store,
        gate,
        local_uploads,
        api: config.api.clone(),
    };

    // Spawn API server task
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Ingestion service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down ingestion service");

    api_handle.abort();

    info!("Ingestion service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
