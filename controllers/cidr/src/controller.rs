//! Main controller implementation.
//!
//! This module contains the `Controller` struct that orchestrates
//! reconciliation, resource watching and the periodic resync for the
//! CIDR Controller.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use crds::{AddressPlan, HostInterface, IPPool};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Main controller for address plan management.
pub struct Controller {
    address_plan_watcher: JoinHandle<Result<(), ControllerError>>,
    host_interface_watcher: JoinHandle<Result<(), ControllerError>>,
    resync: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing CIDR Controller");

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;

        // All CRDs are cluster-scoped
        let address_plan_api: Api<AddressPlan> = Api::all(kube_client.clone());
        let host_interface_api: Api<HostInterface> = Api::all(kube_client.clone());
        let ip_pool_api: Api<IPPool> = Api::all(kube_client);

        let reconciler = Arc::new(Reconciler::new(
            address_plan_api.clone(),
            host_interface_api.clone(),
            ip_pool_api,
        ));

        let watcher_instance = Arc::new(Watcher::new(
            reconciler.clone(),
            address_plan_api,
            host_interface_api,
        ));

        // Start watchers in background tasks
        let address_plan_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_address_plans().await })
        };

        let host_interface_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.watch_host_interfaces().await })
        };

        let resync = tokio::spawn(resync_loop(reconciler, config.resync_interval));

        Ok(Self {
            address_plan_watcher,
            host_interface_watcher,
            resync,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("CIDR Controller running");

        // Wait for any task to exit (they should run forever)
        tokio::select! {
            result = &mut self.address_plan_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("AddressPlan watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("AddressPlan watcher error: {}", e)))?;
            }
            result = &mut self.host_interface_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("HostInterface watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("HostInterface watcher error: {}", e)))?;
            }
            result = &mut self.resync => {
                result.map_err(|e| ControllerError::Watch(format!("Resync task panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}

/// Reconcile every plan on a fixed period
async fn resync_loop(reconciler: Arc<Reconciler>, period: Duration) -> Result<(), ControllerError> {
    let mut ticker = tokio::time::interval(period);
    // the first tick completes immediately; watchers cover startup
    ticker.tick().await;
    loop {
        ticker.tick().await;
        info!("Periodic resync of all AddressPlans");
        if let Err(e) = reconciler.reconcile_all_address_plans().await {
            warn!("Periodic resync failed: {}", e);
        }
    }
}
