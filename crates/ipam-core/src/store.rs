//! Collaborator traits
//!
//! The allocator and synchronizer never talk to the cluster directly.
//! Pool persistence and workload lookups go through these traits so the
//! node daemon can back them with the Kubernetes API and tests can use
//! the in-memory versions from `mock`.

use crate::error::IpamError;
use crds::{Allocation, IPPoolSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An address currently reported by a running workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveAddress {
    /// Workload (pod) name
    pub workload: String,

    /// Workload namespace
    pub namespace: String,

    /// Reported IPv4 address
    pub address: String,
}

impl LiveAddress {
    /// Convenience constructor
    pub fn new(workload: impl Into<String>, namespace: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            namespace: namespace.into(),
            address: address.into(),
        }
    }
}

/// Persistent store of per-host pools.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait PoolStore: Send + Sync {
    /// Pools owned by `host`, optionally restricted to one network, keyed by pool name
    async fn list_pools(
        &self,
        host: &str,
        network: Option<&str>,
    ) -> Result<BTreeMap<String, IPPoolSpec>, IpamError>;

    /// Replace the allocation list of a pool
    async fn update_allocations(&self, pool_name: &str, allocations: &[Allocation]) -> Result<(), IpamError>;
}

/// Ground truth about running workloads
#[async_trait::async_trait]
pub trait WorkloadOracle: Send + Sync {
    /// Whether the workload still exists
    async fn workload_exists(&self, name: &str, namespace: &str) -> Result<bool, IpamError>;

    /// Addresses reported by running workloads on `network`, oldest observation first
    async fn live_addresses(&self, network: &str) -> Result<Vec<LiveAddress>, IpamError>;
}
