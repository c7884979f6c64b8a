//! Fleet tracker - vehicle location ingest, geofence alerts and history API
//!
//! Module structure:
//! - `domain/` - Location reports, geofence math
//! - `io/` - External interfaces (MQTT, SQLite, RabbitMQ, HTTP)
//! - `services/` - Ingest pipeline and query facade
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use anyhow::Context;
use clap::Parser;
use fleet_tracker::infra::{Config, Metrics};
use fleet_tracker::io::{amqp, http_api, mqtt};
use fleet_tracker::io::{AmqpPublisher, AmqpSettings, SqliteLocationStore, StoreConfig};
use fleet_tracker::services::{IngestPipeline, QueryService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Fleet tracker - vehicle location ingest and geofence alerting
#[derive(Parser, Debug)]
#[command(name = "fleet-tracker", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls verbosity; debug shows every stored report
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "fleet-tracker starting");

    let args = Args::parse();
    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path).with_env_overrides();

    let geofence = config.geofence();
    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        amqp_exchange = %config.amqp_exchange(),
        amqp_queue = %config.amqp_queue(),
        geofence_latitude = %geofence.center().latitude,
        geofence_longitude = %geofence.center().longitude,
        geofence_radius_m = %geofence.radius_m(),
        db_path = %config.db_path(),
        http_port = %config.server_port(),
        "config_loaded"
    );

    fleet_tracker::infra::broker::start_embedded_broker(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    let store_config = StoreConfig {
        pool_size: config.db_pool_size(),
        busy_timeout_ms: config.db_busy_timeout_ms(),
    };
    let store = Arc::new(
        SqliteLocationStore::open(config.db_path(), &store_config)
            .with_context(|| format!("failed to open location store {}", config.db_path()))?,
    );

    let publisher = Arc::new(
        AmqpPublisher::connect(AmqpSettings::from(&config))
            .await
            .context("failed to connect to RabbitMQ")?,
    );

    // Geofence alert consumer on its own channel
    if config.amqp_consumer_enabled() {
        let channel = publisher.open_channel().await.context("failed to open consumer channel")?;
        let queue = publisher.queue().to_string();
        let consumer_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = amqp::start_geofence_consumer(channel, queue, consumer_shutdown).await {
                error!(error = %e, "geofence_consumer_error");
            }
        });
    }

    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        publisher.clone(),
        geofence,
        metrics.clone(),
    ));

    // MQTT subscriber (one ingest task per message)
    let mqtt_config = config.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::start_mqtt_subscriber(&mqtt_config, pipeline, mqtt_shutdown).await {
            error!(error = %e, "mqtt_subscriber_error");
        }
    });

    // HTTP read API
    let api_state = Arc::new(http_api::ApiState {
        query: QueryService::new(store, metrics.clone()),
        metrics: metrics.clone(),
    });
    let http_port = config.server_port();
    let http_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = http_api::start_http_server(http_port, api_state, http_shutdown).await {
            error!(error = %e, "http_server_error");
        }
    });

    // Periodic metrics log line
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    info!("fleet-tracker started");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Let in-flight ingest tasks finish before the publisher goes away
    if let Err(e) = mqtt_handle.await {
        error!(error = %e, "mqtt_subscriber_join_failed");
    }
    publisher.close().await;

    metrics.report().log();
    info!("fleet-tracker shutdown complete");
    Ok(())
}
