//! Ingest Worker Service
//!
//! Long-running worker that drains a queue into object storage.
//!
//! ## Architecture
//!
//! ```text
//! SQS queue (INGEST_QUEUE_URL)
//!   ↓ (N consumers, long polling)
//! Shared worker pool (INGEST_MAX_IN_FLIGHT)
//!   ↓
//! S3 bucket (INGEST_STORAGE_BUCKET)  message-<id>.txt
//!   ↓
//! SNS topic (INGEST_NOTIFICATION_TOPIC)
//!   ↓
//! delete from queue
//! ```
//!
//! ## Features
//!
//! - Idempotent writes, safe under at-least-once redelivery
//! - Bounded concurrency across all consumers
//! - Classified retries with exponential backoff
//! - Graceful shutdown on SIGINT/SIGTERM with a drain deadline
//! - Health, readiness and Prometheus endpoints for Kubernetes

use axum::Router;
use clap::Parser;
use core_config::server::ServerConfig;
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{app_info, Environment, FromEnv};
use eyre::{Result, WrapErr};
use ingest_pipeline::aws::{load_sdk_config, S3ObjectStore, SnsPublisher, SqsQueue};
use ingest_pipeline::{health_router, metrics, HealthState, PipelineConfig, Supervisor};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "ingest-worker")]
#[command(about = "Move queue messages into object storage and announce them on a topic")]
pub struct Cli {
    /// Receive and process a single batch, then exit
    #[arg(long)]
    pub once: bool,

    /// Number of receive loops (overrides INGEST_CONSUMERS)
    #[arg(short, long)]
    pub consumers: Option<usize>,

    /// Global in-flight message cap (overrides INGEST_MAX_IN_FLIGHT)
    #[arg(short, long)]
    pub max_in_flight: Option<usize>,

    /// Do not start the admin HTTP server
    #[arg(long)]
    pub no_admin: bool,
}

impl Cli {
    /// Apply command line overrides on top of the environment configuration.
    pub fn apply(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(consumers) = self.consumers {
            config = config.with_consumers(consumers);
        }
        if let Some(max_in_flight) = self.max_in_flight {
            config = config.with_max_in_flight(max_in_flight);
        }
        config
    }
}

/// Start the health and admin HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
/// - Pipeline counters: `/stats`
async fn start_health_server(health_state: HealthState, server: ServerConfig) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the ingest worker
///
/// 1. Sets up error reports and structured logging
/// 2. Loads pipeline and admin server configuration from the environment
/// 3. Builds the SQS, S3 and SNS clients from the default AWS credential chain
/// 4. Runs the supervisor until SIGINT/SIGTERM, or for one batch with `--once`
///
/// # Errors
///
/// Returns an error if configuration is missing or invalid, the metrics
/// recorder cannot be installed, or a single-batch run fails to receive.
pub async fn run(cli: Cli) -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting ingest worker");

    let config = PipelineConfig::from_env().wrap_err("Failed to load pipeline configuration")?;
    let config = cli.apply(config);
    config.validate().wrap_err("Invalid pipeline configuration")?;
    let server = ServerConfig::from_env().wrap_err("Failed to load admin server configuration")?;

    info!(
        queue_url = %config.queue_url,
        storage_bucket = %config.storage_bucket,
        notification_topic = %config.notification_topic,
        consumers = config.consumers,
        max_in_flight = config.max_in_flight,
        batch_size = config.batch_size,
        "Pipeline configuration loaded"
    );

    let sdk_config = load_sdk_config().await;
    let supervisor = Supervisor::new(
        &config,
        Arc::new(SqsQueue::from_sdk_config(&sdk_config, config.queue_url.clone())),
        Arc::new(S3ObjectStore::from_sdk_config(
            &sdk_config,
            config.storage_bucket.clone(),
        )),
        Arc::new(SnsPublisher::from_sdk_config(&sdk_config)),
    );

    if cli.once {
        let report = supervisor
            .run_once()
            .await
            .wrap_err("Single batch run failed")?;
        info!(
            received = report.received,
            acknowledged = report.acknowledged,
            failed = report.failed,
            "Ingest worker finished single batch"
        );
        return Ok(());
    }

    if !cli.no_admin {
        let health_state = HealthState::for_supervisor(&supervisor, app_info.name, app_info.version);
        tokio::spawn(async move {
            if let Err(e) = start_health_server(health_state, server).await {
                error!(error = %e, "Health server failed");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let report = supervisor
        .run(shutdown_rx)
        .await
        .wrap_err("Supervisor failed")?;

    if !report.abandoned.is_empty() {
        warn!(
            abandoned = report.abandoned.len(),
            "Messages abandoned at shutdown will be redelivered by the queue"
        );
    }

    info!("Ingest worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = sigterm.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
