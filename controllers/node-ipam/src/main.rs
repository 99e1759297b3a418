//! Node IPAM Daemon
//!
//! Runs on every node and owns the pod address allocations of the node's
//! `IPPool` resources.
//!
//! On startup it removes allocations of pods that no longer exist, then
//! periodically synchronizes recorded allocations with the addresses the
//! running pods report.

mod backoff;
mod config;
mod daemon;
mod error;
mod kube_store;

use crate::config::DaemonConfig;
use crate::daemon::Daemon;
use crate::error::DaemonError;
use crate::kube_store::{KubePoolStore, KubeWorkloadOracle};
use kube::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Configure rustls crypto provider (ring); fails only if already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting Node IPAM Daemon");

    // Load configuration from environment variables
    let config = DaemonConfig::from_env()?;

    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  Sync interval: {}s", config.sync_interval.as_secs());
    info!("  History timeout: {}s", config.history_timeout.as_secs());

    let client = Client::try_default().await?;
    let store = KubePoolStore::new(client.clone());
    let oracle = KubeWorkloadOracle::new(client, config.node_name.clone());

    let daemon = Daemon::new(store, oracle, &config);
    let handle = tokio::spawn(daemon.run());

    handle
        .await
        .map_err(|e| DaemonError::Task(format!("Daemon task panicked: {}", e)))??;

    Ok(())
}
