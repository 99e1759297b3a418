//! In-memory collaborators for unit testing
//!
//! `MemoryPoolStore` and `MockWorkloadOracle` implement the collaborator
//! traits without a cluster. Both can be switched into a failing mode to
//! exercise error paths.

use crate::error::IpamError;
use crate::store::{LiveAddress, PoolStore, WorkloadOracle};
use crds::{Allocation, IPPoolSpec};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory pool store
#[derive(Debug, Clone, Default)]
pub struct MemoryPoolStore {
    pools: Arc<Mutex<BTreeMap<String, IPPoolSpec>>>,
    updates: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
}

impl MemoryPoolStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a pool (for test setup)
    pub fn insert_pool(&self, name: impl Into<String>, spec: IPPoolSpec) {
        lock(&self.pools).insert(name.into(), spec);
    }

    /// Current spec of a pool
    pub fn pool(&self, name: &str) -> Option<IPPoolSpec> {
        lock(&self.pools).get(name).cloned()
    }

    /// Number of successful `update_allocations` calls so far
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Make every call fail with a store error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), IpamError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(IpamError::Store("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl PoolStore for MemoryPoolStore {
    async fn list_pools(
        &self,
        host: &str,
        network: Option<&str>,
    ) -> Result<BTreeMap<String, IPPoolSpec>, IpamError> {
        self.check()?;
        Ok(lock(&self.pools)
            .iter()
            .filter(|(_, spec)| spec.host_name == host)
            .filter(|(_, spec)| network.is_none_or(|n| spec.network_name == n))
            .map(|(name, spec)| (name.clone(), spec.clone()))
            .collect())
    }

    async fn update_allocations(&self, pool_name: &str, allocations: &[Allocation]) -> Result<(), IpamError> {
        self.check()?;
        let mut pools = lock(&self.pools);
        let pool = pools
            .get_mut(pool_name)
            .ok_or_else(|| IpamError::Store(format!("pool {} not found", pool_name)))?;
        pool.allocations = allocations.to_vec();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock workload oracle
#[derive(Debug, Clone, Default)]
pub struct MockWorkloadOracle {
    workloads: Arc<Mutex<HashSet<(String, String)>>>,
    live: Arc<Mutex<HashMap<String, Vec<LiveAddress>>>>,
    failing: Arc<AtomicBool>,
}

impl MockWorkloadOracle {
    /// Create an oracle that knows no workloads
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running workload
    pub fn add_workload(&self, name: &str, namespace: &str) {
        lock(&self.workloads).insert((name.to_string(), namespace.to_string()));
    }

    /// Forget a workload
    pub fn remove_workload(&self, name: &str, namespace: &str) {
        lock(&self.workloads).remove(&(name.to_string(), namespace.to_string()));
    }

    /// Set the live addresses reported on a network
    pub fn set_live_addresses(&self, network: &str, live: Vec<LiveAddress>) {
        lock(&self.live).insert(network.to_string(), live);
    }

    /// Make every call fail with an oracle error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), IpamError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(IpamError::Oracle("oracle unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl WorkloadOracle for MockWorkloadOracle {
    async fn workload_exists(&self, name: &str, namespace: &str) -> Result<bool, IpamError> {
        self.check()?;
        Ok(lock(&self.workloads).contains(&(name.to_string(), namespace.to_string())))
    }

    async fn live_addresses(&self, network: &str) -> Result<Vec<LiveAddress>, IpamError> {
        self.check()?;
        Ok(lock(&self.live).get(network).cloned().unwrap_or_default())
    }
}
