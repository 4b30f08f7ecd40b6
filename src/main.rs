mod artifact_store;
mod classifier;
mod config;
mod db;
mod decoder;
mod ecg_api;
mod ecg_store;
mod envelope;
mod error;
mod publisher;
mod server;
mod telemetry_store;
mod webhook_api;

use crate::artifact_store::{ArtifactStore, S3ArtifactStore};
use crate::config::Config;
use crate::decoder::{DeviceDecoder, SectionDecoder};
use crate::ecg_store::{EcgStore, PgEcgStore};
use crate::publisher::{ChannelPublisher, KafkaChannelPublisher};
use crate::server::{start_http_server, AppState};
use crate::telemetry_store::{PgTelemetryStore, TelemetryStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);
    error::set_expose_error_detail(config.service.expose_error_detail);

    info!(
        service = %config.service.name,
        "Starting Vitalink telemetry gateway"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Shared database pool
    let pool = db::connect_pool(&config.database)
        .await
        .context("Failed to initialize database pool")?;

    if config.database.run_migrations {
        db::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;
    }

    let telemetry_store: Arc<dyn TelemetryStore> = Arc::new(PgTelemetryStore::new(pool.clone()));
    let ecg_store: Arc<dyn EcgStore> = Arc::new(PgEcgStore::new(pool.clone()));

    let artifact_store: Arc<dyn ArtifactStore> = Arc::new(
        S3ArtifactStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 artifact store")?,
    );

    let decoder: Arc<dyn DeviceDecoder> = Arc::new(SectionDecoder);

    // The message bus is optional: without it, config pushes and
    // acknowledgments are disabled rather than failing requests.
    let publisher: Option<Arc<dyn ChannelPublisher>> = match &config.iot.bootstrap_servers {
        Some(servers) => {
            let publisher = KafkaChannelPublisher::new(servers, config.publish_timeout())
                .context("Failed to create message-bus producer")?;
            Some(Arc::new(publisher))
        }
        None => {
            warn!("Message bus not configured; config push and acknowledgments disabled");
            None
        }
    };

    let state = AppState {
        telemetry_store,
        ecg_store,
        artifact_store,
        decoder,
        publisher,
        presigned_url_expiry: config.presigned_url_expiry(),
    };

    start_http_server(state, &config.http).await?;

    info!("Gateway stopped");

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
