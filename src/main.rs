//! puo - Platform Upgrade Operator.
//!
//! Watches `Upgrade` resources and drives the cluster through a staged platform
//! upgrade: chart repository, managed add-ons, manifest charts and finally a
//! node-by-node rollout.

mod compat;
mod config;
mod controller;
mod crd;
mod error;
mod k8s;
mod phases;
mod resources;
mod status;
mod syncer;
mod telemetry;
mod watchers;

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use config::Config;
use controller::Context;
use k8s::client::KubeCluster;
use telemetry::health::HealthState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Upgrade driver plus the four satellite watchers.
const CONTROLLERS: usize = 5;

#[tokio::main]
async fn main() {
    // Initialize logging
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting puo v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    if let Err(e) = run().await {
        error!("Operator failed: {:#}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing subscriber with JSON format for production.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .init();

    Ok(())
}

/// Main operator loop.
async fn run() -> Result<()> {
    let config = Config::load()?;
    info!(
        system_namespace = %config.system_namespace,
        upgrade_namespace = %config.upgrade_namespace,
        server_version = %config.server_version,
        "Loaded configuration"
    );

    // Build in-cluster Kubernetes client
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Initialize Prometheus metrics
    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(telemetry::metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = HealthState::new(CONTROLLERS);
    let health_port = config.health_port;
    let health_state_clone = health_state.clone();
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(health_port, health_state_clone).await {
            error!("Health server failed: {}", e);
        }
    });

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(metrics_port, registry).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let ctx = Arc::new(Context::new(KubeCluster::new(client), config, metrics));

    // The syncer has no shutdown hook of its own; it ends with the process.
    tokio::spawn(syncer::run(ctx.clone()));

    info!("Starting controllers");
    tokio::join!(
        controller::run(ctx.clone(), health_state.clone()),
        watchers::deployment::run(ctx.clone(), health_state.clone()),
        watchers::job::run(ctx.clone(), health_state.clone()),
        watchers::plan::run(ctx.clone(), health_state.clone()),
        watchers::addon::run(ctx, health_state),
    );

    info!("Controllers stopped");
    Ok(())
}
