// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0

//! # Gantry Daemon
//!
//! The `gantry` binary provisions elastic build agents on a Docker Swarm
//! cluster on behalf of a CI orchestrator.
//!
//! ## Architecture
//!
//! The daemon connects to one engine endpoint at startup and serves an
//! HTTP API for the orchestrator:
//!
//! - **Provisioning**: create an agent service per scheduled job
//! - **Reconciliation**: periodic sweep re-syncs state from the engine
//! - **Cleanup**: instances that never register are removed after the
//!   auto-register window
//!
//! Cluster defaults come from flags or `GANTRY_*` environment variables;
//! a request may override them with its own cluster properties.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use gantry_core::application::provisioning::ProvisioningService;
use gantry_core::application::registry::InstanceRegistry;
use gantry_core::application::status::StatusService;
use gantry_core::application::validators::ValidationPipeline;
use gantry_core::domain::backend::ContainerBackend;
use gantry_core::domain::profile::Properties;
use gantry_core::domain::settings::{keys, ClusterSettings};
use gantry_core::infrastructure::docker::SwarmBackend;
use gantry_core::presentation::api;

/// Gantry - elastic build agents on Docker Swarm
#[derive(Parser)]
#[command(name = "gantry")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address the HTTP API listens on
    #[arg(long, env = "GANTRY_BIND", default_value = "127.0.0.1:7632")]
    bind: SocketAddr,

    /// Docker engine endpoint (unix:// or tcp://); auto-detected when unset
    #[arg(long, env = "GANTRY_DOCKER_URI")]
    docker_uri: Option<String>,

    /// Orchestrator URL the launched agents register against
    #[arg(long, env = "GANTRY_SERVER_URL")]
    server_url: String,

    /// Ceiling on concurrently running agent instances
    #[arg(long, env = "GANTRY_MAX_AGENTS", default_value = "10")]
    max_agents: usize,

    /// Minutes an instance may run unregistered before cleanup removes it
    #[arg(long, env = "GANTRY_AUTO_REGISTER_TIMEOUT", default_value = "10")]
    auto_register_timeout: u64,

    /// Seconds between reconcile sweeps against the engine
    #[arg(long, env = "GANTRY_RECONCILE_INTERVAL", default_value = "30")]
    reconcile_interval: u64,

    /// Seconds before an engine call is abandoned
    #[arg(long, env = "GANTRY_ENGINE_TIMEOUT", default_value = "30")]
    engine_timeout: u64,

    /// Address to expose Prometheus metrics on (disabled when unset)
    #[arg(long, env = "GANTRY_METRICS_BIND")]
    metrics_bind: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GANTRY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    if let Some(addr) = cli.metrics_bind {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to start Prometheus exporter")?;
        info!("Metrics exposed on {}", addr);
    }

    let defaults = cluster_defaults(&cli).await?;

    let backend: Arc<dyn ContainerBackend> = Arc::new(SwarmBackend::connect(
        cli.docker_uri.as_deref(),
        Duration::from_secs(cli.engine_timeout),
    )?);
    match backend.api_version().await {
        Ok(version) => info!("Connected to Docker engine (API {})", version),
        Err(err) => warn!("Could not verify engine API version: {}", err),
    }

    let registry = Arc::new(InstanceRegistry::default());
    let provisioning = Arc::new(ProvisioningService::new(
        Arc::clone(&backend),
        registry,
        defaults,
    ));
    let status = Arc::new(StatusService::new(
        Arc::clone(&backend),
        Arc::clone(&provisioning),
    ));

    spawn_reconciler(Arc::clone(&provisioning), cli.reconcile_interval);

    let app = api::app(provisioning, status);
    let listener = TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", cli.bind))?;
    info!("Gantry daemon listening on {}", cli.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Gantry daemon shutting down");
    Ok(())
}

/// Builds the default cluster settings from the command line and rejects
/// them with the same rules a request-supplied override faces.
async fn cluster_defaults(cli: &Cli) -> Result<ClusterSettings> {
    let mut properties = Properties::new();
    properties.insert(keys::SERVER_URL.to_string(), cli.server_url.clone());
    properties.insert(keys::MAX_INSTANCES.to_string(), cli.max_agents.to_string());
    properties.insert(
        keys::AUTO_REGISTER_TIMEOUT.to_string(),
        cli.auto_register_timeout.to_string(),
    );
    if let Some(uri) = &cli.docker_uri {
        properties.insert(keys::DOCKER_URI.to_string(), uri.clone());
    }

    let validation = ValidationPipeline::cluster().run(&properties).await;
    if !validation.is_ok() {
        bail!("Invalid cluster settings: {}", validation);
    }
    ClusterSettings::from_properties(&properties).context("Invalid cluster settings")
}

/// Periodic engine sweep so capacity tracks reality even when no requests
/// arrive.
fn spawn_reconciler(provisioning: Arc<ProvisioningService>, interval_secs: u64) {
    tokio::spawn(async move {
        let defaults = provisioning.defaults().clone();
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = provisioning.refresh(&defaults).await {
                warn!("Reconcile sweep failed: {}", err);
            }
        }
    });
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

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
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
