//! Reconciliation logic for AddressPlan CRDs.
//!
//! This module runs the per-plan assignment engine against the current
//! HostInterface inventory, persists the resulting entries in the plan
//! status and keeps the plan's IPPool resources in line with its host
//! blocks.

use crate::error::ControllerError;
use chrono::Utc;
use crds::{
    AddressPlan, Allocation, HOST_NAME_LABEL, HostInterface, HostInterfaceSpec, IPPool, IPPoolSpec,
    InterfaceBlockEntry, NETWORK_NAME_LABEL,
};
use ipam_core::compute::{parse_address, parse_cidr};
use ipam_core::{PlanEngine, desired_pools, validate_plan};
use kube::Api;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Reconciles address plans and their pools.
pub struct Reconciler {
    address_plan_api: Api<AddressPlan>,
    host_interface_api: Api<HostInterface>,
    ip_pool_api: Api<IPPool>,
    /// One engine per plan name; each engine serialises its own passes
    engines: Mutex<HashMap<String, Arc<PlanEngine>>>,
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        address_plan_api: Api<AddressPlan>,
        host_interface_api: Api<HostInterface>,
        ip_pool_api: Api<IPPool>,
    ) -> Self {
        Self {
            address_plan_api,
            host_interface_api,
            ip_pool_api,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Engine of a plan, seeded from its persisted status on first use
    async fn engine_for(&self, plan: &AddressPlan, name: &str) -> Arc<PlanEngine> {
        let mut engines = self.engines.lock().await;
        engines
            .entry(name.to_string())
            .or_insert_with(|| {
                let persisted = plan.status.as_ref().map(|s| s.entries.clone()).unwrap_or_default();
                debug!("Creating assignment engine for AddressPlan {} with {} entries", name, persisted.len());
                Arc::new(PlanEngine::new(persisted))
            })
            .clone()
    }

    /// Current host interface inventory keyed by host name
    async fn inventory_snapshot(&self) -> Result<BTreeMap<String, HostInterfaceSpec>, ControllerError> {
        let list = self.host_interface_api.list(&ListParams::default()).await?;
        let mut inventory = BTreeMap::new();
        for item in list.items {
            let host = if item.spec.host_name.is_empty() {
                match item.metadata.name.clone() {
                    Some(name) => name,
                    None => continue,
                }
            } else {
                item.spec.host_name.clone()
            };
            inventory.insert(host, item.spec);
        }
        Ok(inventory)
    }

    /// Reconciles an AddressPlan resource.
    ///
    /// This method:
    /// 1. Recomputes the assignment against a fresh inventory snapshot
    /// 2. Persists the entries in the plan status when they changed
    /// 3. Creates, updates and deletes the plan's IPPools
    ///
    /// If persisting the status fails, the engine is rolled back so the
    /// next pass detects the change again.
    pub async fn reconcile_address_plan(&self, plan: &AddressPlan) -> Result<(), ControllerError> {
        let name = plan
            .metadata
            .name
            .as_ref()
            .ok_or_else(|| ControllerError::InvalidConfig("AddressPlan missing name".to_string()))?;

        info!("Reconciling AddressPlan {}", name);

        let layout = match validate_plan(&plan.spec) {
            Ok(layout) => layout,
            Err(e) => {
                error!("AddressPlan {} is invalid: {}", name, e);
                self.patch_status_error(name, &e.to_string()).await;
                return Err(e.into());
            }
        };

        let engine = self.engine_for(plan, name).await;
        // the pass is held through status and pool writes; other triggers queue
        let mut pass = engine.begin().await;
        let inventory = self.inventory_snapshot().await?;
        let previous = pass.entries().to_vec();
        let outcome = pass.reconcile(&plan.spec, &inventory)?;

        if outcome.changed {
            if let Err(e) = self.patch_status_entries(name, &outcome.entries).await {
                error!("Failed to update AddressPlan {} status: {}", name, e);
                pass.restore(previous);
                return Err(e);
            }
            info!("Updated AddressPlan {} status ({} entries)", name, outcome.entries.len());
        } else if plan.status.as_ref().is_some_and(|s| s.error.is_some()) {
            self.patch_status_entries(name, &outcome.entries).await?;
        } else {
            debug!("AddressPlan {} assignment unchanged", name);
        }

        let desired = desired_pools(name, &layout, &outcome.entries);
        self.apply_pools(name, desired).await
    }

    async fn patch_status_entries(&self, name: &str, entries: &[InterfaceBlockEntry]) -> Result<(), ControllerError> {
        let status_patch = json!({
            "status": {
                "entries": entries,
                "lastChanged": Utc::now(),
                "error": null,
            }
        });
        let pp = PatchParams::default();
        self.address_plan_api
            .patch_status(name, &pp, &Patch::Merge(&status_patch))
            .await?;
        Ok(())
    }

    async fn patch_status_error(&self, name: &str, error_msg: &str) {
        let status_patch = json!({
            "status": {
                "error": error_msg,
            }
        });
        let pp = PatchParams::default();
        if let Err(e) = self
            .address_plan_api
            .patch_status(name, &pp, &Patch::Merge(&status_patch))
            .await
        {
            error!("Failed to update AddressPlan {} error status: {}", name, e);
        }
    }

    /// Bring the pools of a plan in line with its desired pools.
    ///
    /// Existing pools keep their allocations; pools whose block is no
    /// longer assigned are deleted.
    async fn apply_pools(&self, plan_name: &str, desired: BTreeMap<String, IPPoolSpec>) -> Result<(), ControllerError> {
        let lp = ListParams::default().labels(&format!("{}={}", NETWORK_NAME_LABEL, plan_name));
        let existing: BTreeMap<String, IPPool> = self
            .ip_pool_api
            .list(&lp)
            .await?
            .items
            .into_iter()
            .filter_map(|pool| pool.metadata.name.clone().map(|name| (name, pool)))
            .collect();

        for (pool_name, spec) in &desired {
            match existing.get(pool_name) {
                Some(current) if current.spec.same_block(spec) => {
                    debug!("IPPool {} up to date", pool_name);
                }
                Some(current) => {
                    let merged = merge_pool_spec(spec, &current.spec);
                    for allocation in allocations_in_excludes(&merged) {
                        warn!(
                            "IPPool {} allocation {} of {}/{} now falls inside an exclude",
                            pool_name, allocation.address, allocation.namespace, allocation.pod
                        );
                    }
                    // allocations are owned by the node daemon and left out of the patch
                    let patch = json!({
                        "metadata": { "labels": pool_labels(&merged) },
                        "spec": {
                            "podCIDR": merged.pod_cidr,
                            "vlanCIDR": merged.vlan_cidr,
                            "networkName": merged.network_name,
                            "hostName": merged.host_name,
                            "interfaceName": merged.interface_name,
                            "excludes": merged.excludes,
                        },
                    });
                    if let Err(e) = self
                        .ip_pool_api
                        .patch(pool_name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                    {
                        error!("Failed to update IPPool {}: {}", pool_name, e);
                    } else {
                        info!("Updated IPPool {}", pool_name);
                    }
                }
                None => {
                    let mut pool = IPPool::new(pool_name, spec.clone());
                    pool.metadata.labels = Some(pool_labels(spec));
                    match self.ip_pool_api.create(&PostParams::default(), &pool).await {
                        Ok(_) => info!("Created IPPool {} ({})", pool_name, spec.pod_cidr),
                        Err(e) => error!("Failed to create IPPool {}: {}", pool_name, e),
                    }
                }
            }
        }

        for pool_name in existing.keys().filter(|name| !desired.contains_key(*name)) {
            self.delete_pool(pool_name).await;
        }
        Ok(())
    }

    async fn delete_pool(&self, pool_name: &str) {
        match self.ip_pool_api.delete(pool_name, &DeleteParams::default()).await {
            Ok(_) => info!("Deleted IPPool {}", pool_name),
            Err(kube::Error::Api(ae)) if ae.code == 404 => debug!("IPPool {} already gone", pool_name),
            Err(e) => error!("Failed to delete IPPool {}: {}", pool_name, e),
        }
    }

    /// Forget a deleted plan and delete all of its pools.
    pub async fn cleanup_address_plan(&self, name: &str) -> Result<(), ControllerError> {
        info!("Cleaning up AddressPlan {}", name);
        let engine = self.engines.lock().await.remove(name);
        // wait for a pass in progress so it cannot recreate pools afterwards
        let _pass = match &engine {
            Some(engine) => Some(engine.begin().await),
            None => None,
        };

        let lp = ListParams::default().labels(&format!("{}={}", NETWORK_NAME_LABEL, name));
        let pools = self.ip_pool_api.list(&lp).await?;
        for pool in pools.items {
            if let Some(pool_name) = pool.metadata.name.as_deref() {
                self.delete_pool(pool_name).await;
            }
        }
        Ok(())
    }

    /// Reconcile every plan, then delete pools whose plan no longer exists.
    ///
    /// Failures of single plans are logged and do not stop the pass.
    pub async fn reconcile_all_address_plans(&self) -> Result<(), ControllerError> {
        let plans = self.address_plan_api.list(&ListParams::default()).await?;
        let mut plan_names = BTreeSet::new();
        for plan in &plans.items {
            let Some(name) = plan.metadata.name.clone() else { continue };
            if let Err(e) = self.reconcile_address_plan(plan).await {
                warn!("Failed to reconcile AddressPlan {}: {}", name, e);
            }
            plan_names.insert(name);
        }

        self.engines
            .lock()
            .await
            .retain(|name, _| plan_names.contains(name));

        let pools = self.ip_pool_api.list(&ListParams::default()).await?;
        for pool in pools.items {
            if plan_names.contains(&pool.spec.network_name) {
                continue;
            }
            if let Some(pool_name) = pool.metadata.name.as_deref() {
                info!("IPPool {} belongs to missing AddressPlan {}", pool_name, pool.spec.network_name);
                self.delete_pool(pool_name).await;
            }
        }
        Ok(())
    }
}

/// Labels every pool carries so daemons can select their own pools
pub fn pool_labels(spec: &IPPoolSpec) -> BTreeMap<String, String> {
    BTreeMap::from([
        (HOST_NAME_LABEL.to_string(), spec.host_name.clone()),
        (NETWORK_NAME_LABEL.to_string(), spec.network_name.clone()),
    ])
}

/// Block fields from the recomputed pool, allocations from the stored one
pub fn merge_pool_spec(desired: &IPPoolSpec, current: &IPPoolSpec) -> IPPoolSpec {
    IPPoolSpec {
        pod_cidr: desired.pod_cidr.clone(),
        vlan_cidr: desired.vlan_cidr.clone(),
        network_name: desired.network_name.clone(),
        host_name: desired.host_name.clone(),
        interface_name: desired.interface_name.clone(),
        excludes: desired.excludes.clone(),
        allocations: current.allocations.clone(),
    }
}

/// Allocations of a pool whose address lies inside one of its excludes
pub fn allocations_in_excludes(spec: &IPPoolSpec) -> Vec<&Allocation> {
    let excludes: Vec<_> = spec
        .excludes
        .iter()
        .filter_map(|cidr| parse_cidr(cidr).ok())
        .map(|net| net.trunc())
        .collect();
    spec.allocations
        .iter()
        .filter(|allocation| {
            parse_address(&allocation.address)
                .is_ok_and(|address| excludes.iter().any(|net| net.contains(&address)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> IPPoolSpec {
        IPPoolSpec {
            pod_cidr: "192.168.0.0/24".to_string(),
            vlan_cidr: "192.168.0.0/18".to_string(),
            network_name: "net".to_string(),
            host_name: "node-a".to_string(),
            interface_name: "eth1".to_string(),
            excludes: vec![],
            allocations: vec![],
        }
    }

    fn alloc(pod: &str, index: u32) -> Allocation {
        Allocation {
            pod: pod.to_string(),
            namespace: "default".to_string(),
            index,
            address: format!("192.168.0.{}", index),
        }
    }

    #[test]
    fn test_pool_labels() {
        let labels = pool_labels(&spec());
        assert_eq!(labels.get("hostname").map(String::as_str), Some("node-a"));
        assert_eq!(labels.get("netname").map(String::as_str), Some("net"));
    }

    #[test]
    fn test_merge_keeps_stored_allocations() {
        let mut current = spec();
        current.allocations = vec![alloc("p1", 1)];
        let mut desired = spec();
        desired.interface_name = "net1".to_string();
        desired.excludes = vec!["192.168.0.0/30".to_string()];

        let merged = merge_pool_spec(&desired, &current);
        assert_eq!(merged.interface_name, "net1");
        assert_eq!(merged.excludes, desired.excludes);
        assert_eq!(merged.allocations, current.allocations);
    }

    #[test]
    fn test_allocations_in_excludes() {
        let mut pool = spec();
        pool.excludes = vec!["192.168.0.0/30".to_string()];
        pool.allocations = vec![alloc("p1", 1), alloc("p5", 5)];
        let hits = allocations_in_excludes(&pool);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].pod, "p1");
    }
}
