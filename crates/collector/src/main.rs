//! Sentinel collector - Kubernetes telemetry collector
//!
//! Polls the cluster for node, pod and event state (and samples its own
//! process), and streams the results to Kafka as JSON records.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collector_lib::{
    broker::{KafkaBrokerWriter, Topics},
    cluster::{ClusterClientFactory, KubeClusterApi},
    config::{LogFormat, LoggingConfig},
    health::HealthRegistry,
    observability::{CollectorMetrics, StructuredLogger},
    supervisor::{Intervals, SupervisorBuilder},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const COLLECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kubernetes telemetry collector
#[derive(Parser)]
#[command(name = "sentinel-collector")]
#[command(author, version, about = "Streams Kubernetes node, pod and event telemetry to Kafka", long_about = None)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, short, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Version) = cli.command {
        println!("sentinel-collector {}", COLLECTOR_VERSION);
        return Ok(());
    }

    let config = config::load(cli.config.as_deref())?;
    init_logging(&config.logging);

    let logger = StructuredLogger::new(instance_name());
    logger.log_startup(COLLECTOR_VERSION);

    let health_registry = HealthRegistry::new();
    let metrics = CollectorMetrics::new();

    // Probes answer (not ready) while the connections come up
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics.clone()));
    let api_handle = api::spawn(config.server.port, app_state);

    let (client, credential_source) = ClusterClientFactory::new(config.kubernetes.clone())
        .connect()
        .await
        .context("failed to connect to the cluster")?;
    logger.log_credential_source(&credential_source);

    let writer = KafkaBrokerWriter::connect(&config.kafka)
        .await
        .context("failed to connect to Kafka")?;

    let supervisor = Arc::new(
        SupervisorBuilder::new()
            .cluster(Arc::new(KubeClusterApi::new(client)))
            .writer(Arc::new(writer))
            .recorder(Arc::new(metrics))
            .health(health_registry.clone())
            .topics(Topics::from(&config.kafka.topics))
            .intervals(Intervals::from(&config.collection))
            .build()?,
    );

    let mut runner = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start().await })
    };

    let reason = tokio::select! {
        reason = shutdown_signal() => reason,
        result = &mut runner => {
            match result {
                Ok(Ok(())) => "supervisor exited",
                Ok(Err(e)) => {
                    error!(error = %e, "Collection supervisor failed");
                    "supervisor failed"
                }
                Err(e) => {
                    error!(error = %e, "Collection supervisor task panicked");
                    "supervisor panicked"
                }
            }
        }
    };

    logger.log_shutdown(reason);
    supervisor
        .stop(config.collection.shutdown_timeout())
        .await
        .context("failed to stop cleanly")?;

    api_handle.abort();
    info!("Shutdown complete");

    Ok(())
}

/// JSON or text output, filtered by RUST_LOG or the configured level
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

fn instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "sentinel-collector".to_string())
}

/// Resolves on SIGINT or SIGTERM with the reason to log
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
