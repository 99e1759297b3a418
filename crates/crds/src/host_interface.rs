//! HostInterface CRD
//!
//! Per-host inventory of secondary interfaces, reported by the node daemon.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "multinic.fms.io",
    version = "v1",
    kind = "HostInterface"
)]
#[serde(rename_all = "camelCase")]
pub struct HostInterfaceSpec {
    /// Host (node) name
    pub host_name: String,

    /// Interfaces discovered on the host
    #[serde(default)]
    pub interfaces: Vec<InterfaceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    /// Interface name (e.g., "eth1")
    pub interface_name: String,

    /// Network address of the interface (e.g., "10.0.0.0/24")
    #[serde(default)]
    pub net_address: String,

    /// Primary IP of the interface
    #[serde(default, rename = "hostIP")]
    pub host_ip: String,

    /// PCI vendor ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,

    /// PCI product ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,

    /// PCI address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_address: Option<String>,
}
