//! IPPool CRD
//!
//! One pool per pod block: the block itself plus the pod addresses
//! handed out from it by the node IPAM daemon.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the owning host name
pub const HOST_NAME_LABEL: &str = "hostname";

/// Label carrying the owning network (AddressPlan) name
pub const NETWORK_NAME_LABEL: &str = "netname";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "multinic.fms.io",
    version = "v1",
    kind = "IPPool",
    printcolumn = r#"{"name":"PodCIDR","type":"string","jsonPath":".spec.podCIDR"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.hostName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// Pod block CIDR
    #[serde(rename = "podCIDR")]
    pub pod_cidr: String,

    /// Parent VLAN block CIDR
    #[serde(rename = "vlanCIDR")]
    pub vlan_cidr: String,

    /// Owning network (AddressPlan) name
    pub network_name: String,

    /// Host owning the pod block
    pub host_name: String,

    /// Interface name at the host
    pub interface_name: String,

    /// Plan excludes that fall inside this pod block
    #[serde(default)]
    pub excludes: Vec<String>,

    /// Allocations ordered by offset
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

impl IPPoolSpec {
    /// Whether the non-allocation fields of two pool specs match
    pub fn same_block(&self, other: &IPPoolSpec) -> bool {
        self.pod_cidr == other.pod_cidr
            && self.vlan_cidr == other.vlan_cidr
            && self.network_name == other.network_name
            && self.host_name == other.host_name
            && self.interface_name == other.interface_name
            && self.excludes == other.excludes
    }
}

/// A pod address handed out from a pool
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    /// Workload (pod) name
    pub pod: String,

    /// Workload namespace
    pub namespace: String,

    /// Offset of the address within the pod block
    pub index: u32,

    /// Resulting address
    pub address: String,
}

impl Allocation {
    /// Whether this allocation belongs to the given workload
    pub fn is_owned_by(&self, pod: &str, namespace: &str) -> bool {
        self.pod == pod && self.namespace == namespace
    }
}

/// Pool name for a network and pod block: `<network>-<ip>-<prefix>`
pub fn pool_name(network_name: &str, pod_cidr: &str) -> String {
    format!("{}-{}", network_name, pod_cidr.replace('/', "-"))
}
