//! CIDR Controller
//!
//! Computes the address plan of every multi-NIC network.
//!
//! This controller reconciles `AddressPlan` CRDs against the `HostInterface`
//! inventory: it assigns a VLAN block per master network and a pod block per
//! host, persists the assignment in the plan status and maintains one
//! `IPPool` per pod block for the node IPAM daemons.

mod config;
mod controller;
mod error;
mod reconciler;
mod watcher;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Configure rustls crypto provider (ring); fails only if already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting CIDR Controller");

    // Load configuration from environment variables
    let config = ControllerConfig::from_env()?;

    info!("Configuration:");
    info!("  Resync interval: {}s", config.resync_interval.as_secs());

    // Initialize and run controller
    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
