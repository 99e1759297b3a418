//! Kubernetes resource watchers.
//!
//! This module handles watching AddressPlan and HostInterface resources
//! for changes and triggering reconciliation.

use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crds::{AddressPlan, HostInterface};
use futures::TryStreamExt;
use kube::Api;
use kube_runtime::watcher;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Watches Kubernetes resources for changes.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    address_plan_api: Api<AddressPlan>,
    host_interface_api: Api<HostInterface>,
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        reconciler: Arc<Reconciler>,
        address_plan_api: Api<AddressPlan>,
        host_interface_api: Api<HostInterface>,
    ) -> Self {
        Self {
            reconciler,
            address_plan_api,
            host_interface_api,
        }
    }

    /// Starts watching AddressPlan resources.
    pub async fn watch_address_plans(&self) -> Result<(), ControllerError> {
        info!("Starting AddressPlan watcher");

        let mut stream = Box::pin(watcher(self.address_plan_api.clone(), watcher::Config::default()));

        while let Some(result) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("Watcher stream error: {}", e)))?
        {
            match result {
                watcher::Event::Apply(plan) => {
                    let name = plan.metadata.name.as_deref().unwrap_or("<unknown>");
                    info!("AddressPlan applied: {}", name);

                    if let Err(e) = self.reconciler.reconcile_address_plan(&plan).await {
                        error!("Failed to reconcile AddressPlan {}: {}", name, e);
                    }
                }
                watcher::Event::Delete(plan) => {
                    let name = plan.metadata.name.as_deref().unwrap_or("<unknown>");
                    info!("AddressPlan deleted: {}", name);

                    if let Err(e) = self.reconciler.cleanup_address_plan(name).await {
                        error!("Failed to clean up AddressPlan {}: {}", name, e);
                    }
                }
                watcher::Event::Init => {
                    info!("AddressPlan watcher initialized");
                }
                watcher::Event::InitApply(plan) => {
                    let name = plan.metadata.name.as_deref().unwrap_or("<unknown>");
                    debug!("AddressPlan init apply: {}", name);

                    if let Err(e) = self.reconciler.reconcile_address_plan(&plan).await {
                        warn!("Failed to reconcile AddressPlan {}: {}", name, e);
                    }
                }
                watcher::Event::InitDone => {
                    info!("AddressPlan watcher initialization complete");
                }
            }
        }

        Ok(())
    }

    /// Starts watching HostInterface resources.
    ///
    /// Any inventory change recomputes every plan; the initial listing is
    /// handled once on `InitDone`.
    pub async fn watch_host_interfaces(&self) -> Result<(), ControllerError> {
        info!("Starting HostInterface watcher");

        let mut stream = Box::pin(watcher(self.host_interface_api.clone(), watcher::Config::default()));

        while let Some(result) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("Watcher stream error: {}", e)))?
        {
            match result {
                watcher::Event::Apply(host) | watcher::Event::Delete(host) => {
                    let name = host.metadata.name.as_deref().unwrap_or("<unknown>");
                    info!("HostInterface changed: {}", name);

                    if let Err(e) = self.reconciler.reconcile_all_address_plans().await {
                        warn!("Failed to reconcile AddressPlans after HostInterface {} changed: {}", name, e);
                    }
                }
                watcher::Event::Init => {
                    debug!("HostInterface watcher initialized");
                }
                watcher::Event::InitApply(host) => {
                    let name = host.metadata.name.as_deref().unwrap_or("<unknown>");
                    debug!("HostInterface init apply: {}", name);
                }
                watcher::Event::InitDone => {
                    debug!("HostInterface watcher initialization complete");

                    if let Err(e) = self.reconciler.reconcile_all_address_plans().await {
                        warn!("Failed to reconcile AddressPlans: {}", e);
                    }
                }
            }
        }

        Ok(())
    }
}
