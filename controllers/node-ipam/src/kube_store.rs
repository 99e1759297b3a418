//! Kubernetes-backed collaborators.
//!
//! `KubePoolStore` persists pools as `IPPool` resources labelled with their
//! host and network. `KubeWorkloadOracle` answers workload questions from
//! the pods scheduled on this node.

use async_trait::async_trait;
use crds::{Allocation, HOST_NAME_LABEL, IPPool, IPPoolSpec, NETWORK_NAME_LABEL};
use ipam_core::{IpamError, LiveAddress, PoolStore, WorkloadOracle};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Pod annotation where the network attachment runtime reports attachments
pub const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks-status";

/// `IPPool` resources as a pool store
#[derive(Clone)]
pub struct KubePoolStore {
    api: Api<IPPool>,
}

impl KubePoolStore {
    /// Store over the cluster-scoped `IPPool` API
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

fn pool_selector(host: &str, network: Option<&str>) -> String {
    match network {
        Some(network) => format!("{}={},{}={}", HOST_NAME_LABEL, host, NETWORK_NAME_LABEL, network),
        None => format!("{}={}", HOST_NAME_LABEL, host),
    }
}

#[async_trait]
impl PoolStore for KubePoolStore {
    async fn list_pools(
        &self,
        host: &str,
        network: Option<&str>,
    ) -> Result<BTreeMap<String, IPPoolSpec>, IpamError> {
        let params = ListParams::default().labels(&pool_selector(host, network));
        let pools = self
            .api
            .list(&params)
            .await
            .map_err(|e| IpamError::Store(format!("Failed to list IPPools of {}: {}", host, e)))?;

        Ok(pools
            .items
            .into_iter()
            .filter_map(|pool| pool.metadata.name.clone().map(|name| (name, pool.spec)))
            .collect())
    }

    async fn update_allocations(&self, pool_name: &str, allocations: &[Allocation]) -> Result<(), IpamError> {
        let patch = json!({
            "spec": {
                "allocations": allocations,
            }
        });

        self.api
            .patch(pool_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| IpamError::Store(format!("Failed to update IPPool {}: {}", pool_name, e)))?;

        debug!("Updated IPPool {} with {} allocations", pool_name, allocations.len());
        Ok(())
    }
}

/// Pods of this node as the workload oracle
#[derive(Clone)]
pub struct KubeWorkloadOracle {
    client: Client,
    node_name: String,
}

impl KubeWorkloadOracle {
    /// Oracle answering for pods scheduled on `node_name`
    pub fn new(client: Client, node_name: impl Into<String>) -> Self {
        Self {
            client,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl WorkloadOracle for KubeWorkloadOracle {
    async fn workload_exists(&self, name: &str, namespace: &str) -> Result<bool, IpamError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api
            .get_opt(name)
            .await
            .map_err(|e| IpamError::Oracle(format!("Failed to get pod {}/{}: {}", namespace, name, e)))?;
        Ok(pod.is_some())
    }

    async fn live_addresses(&self, network: &str) -> Result<Vec<LiveAddress>, IpamError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={},status.phase=Running", self.node_name));
        let mut pods = api
            .list(&params)
            .await
            .map_err(|e| IpamError::Oracle(format!("Failed to list pods of {}: {}", self.node_name, e)))?
            .items;

        // oldest observation first
        pods.sort_by_key(|pod| pod.metadata.creation_timestamp.clone());

        let mut live = Vec::new();
        for pod in &pods {
            let (Some(name), Some(namespace)) = (pod.metadata.name.as_deref(), pod.metadata.namespace.as_deref())
            else {
                continue;
            };
            let Some(raw) = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(NETWORK_STATUS_ANNOTATION))
            else {
                continue;
            };
            match parse_network_status(raw, network) {
                Ok(addresses) => {
                    live.extend(addresses.into_iter().map(|address| LiveAddress::new(name, namespace, address)));
                }
                Err(e) => warn!("Ignoring malformed network status of {}/{}: {}", namespace, name, e),
            }
        }
        Ok(live)
    }
}

#[derive(Debug, Deserialize)]
struct NetworkStatus {
    name: String,
    #[serde(default)]
    ips: Vec<String>,
}

/// Addresses a network-status annotation reports for `network`.
///
/// Attachment names may be namespace-qualified (`namespace/network`).
pub fn parse_network_status(raw: &str, network: &str) -> Result<Vec<String>, serde_json::Error> {
    let statuses: Vec<NetworkStatus> = serde_json::from_str(raw)?;
    Ok(statuses
        .into_iter()
        .filter(|status| status.name.rsplit('/').next() == Some(network))
        .flat_map(|status| status.ips)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_selector() {
        assert_eq!(pool_selector("worker-1", None), "hostname=worker-1");
        assert_eq!(
            pool_selector("worker-1", Some("multinic-a")),
            "hostname=worker-1,netname=multinic-a"
        );
    }

    #[test]
    fn test_parse_network_status_matches_network() {
        let raw = r#"[
            {"name": "cbr0", "interface": "eth0", "ips": ["10.244.1.7"], "default": true},
            {"name": "default/multinic-a", "interface": "net1", "ips": ["192.168.0.66"]},
            {"name": "multinic-b", "interface": "net2", "ips": ["192.168.64.2"]}
        ]"#;
        assert_eq!(parse_network_status(raw, "multinic-a").unwrap(), vec!["192.168.0.66"]);
        assert_eq!(parse_network_status(raw, "multinic-b").unwrap(), vec!["192.168.64.2"]);
        assert!(parse_network_status(raw, "multinic-c").unwrap().is_empty());
    }

    #[test]
    fn test_parse_network_status_multiple_attachments() {
        let raw = r#"[
            {"name": "ns/multinic-a", "interface": "net1", "ips": ["192.168.0.66"]},
            {"name": "ns/multinic-a", "interface": "net2", "ips": ["192.168.0.130"]},
            {"name": "ns/multinic-a", "interface": "net3"}
        ]"#;
        assert_eq!(
            parse_network_status(raw, "multinic-a").unwrap(),
            vec!["192.168.0.66", "192.168.0.130"]
        );
    }

    #[test]
    fn test_parse_network_status_malformed() {
        assert!(parse_network_status("not json", "multinic-a").is_err());
        assert!(parse_network_status(r#"{"name": "multinic-a"}"#, "multinic-a").is_err());
    }
}
