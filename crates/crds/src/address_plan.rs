//! AddressPlan CRD
//!
//! Describes how one multi-interface network carves its subnet into
//! per-interface VLAN blocks and per-host pod blocks. The status holds the
//! assignment computed by the CIDR controller.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// AddressPlanSpec defines the address plan configuration of one network
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[kube(
    group = "multinic.fms.io",
    version = "v1",
    kind = "AddressPlan",
    status = "AddressPlanStatus",
    printcolumn = r#"{"name":"Subnet","type":"string","jsonPath":".spec.subnet"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AddressPlanSpec {
    /// Base CIDR to partition (e.g., "192.168.0.0/16").
    /// Empty means each interface borrows its host network address as VLAN block.
    #[serde(default)]
    pub subnet: String,

    /// Network addresses of the master interfaces to allocate for.
    /// Empty means every network address reported by host inventory.
    #[serde(default)]
    pub master_nets: Vec<String>,

    /// Bits used for the interface index
    pub interface_block: u8,

    /// Bits used for the host index
    pub host_block: u8,

    /// CIDRs that must never be handed out
    #[serde(default, rename = "excludeCIDRs")]
    pub exclude_cidrs: Vec<String>,

    /// VLAN mode of the attached plugin
    #[serde(default)]
    pub vlan_mode: VlanMode,
}

impl AddressPlanSpec {
    /// Whether VLAN blocks are taken from host network addresses instead of `subnet`
    pub fn is_borrowed_subnet(&self) -> bool {
        self.subnet.trim().is_empty()
    }
}

/// VLAN mode of the network plugin
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VlanMode {
    /// No VLAN mode configured
    #[default]
    #[serde(alias = "")]
    None,

    /// Layer 2 mode
    L2,

    /// Layer 3 mode
    L3,

    /// Layer 3 mode with source routing
    L3s,
}

/// One interface-level block of the plan
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceBlockEntry {
    /// Master network address (entry key)
    pub net_address: String,

    /// Interface index, unique within the plan
    pub interface_index: u32,

    /// VLAN block CIDR
    #[serde(rename = "vlanCIDR")]
    pub vlan_cidr: String,

    /// Host assignments ordered by host index
    #[serde(default)]
    pub hosts: Vec<HostBlockAssignment>,
}

/// Pod block assigned to one host on one interface entry
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HostBlockAssignment {
    /// Host index, unique within the owning entry
    pub host_index: u32,

    /// Host (node) name
    pub host_name: String,

    /// Interface name at that host
    pub interface_name: String,

    /// Primary IP of the host interface
    #[serde(rename = "hostIP")]
    pub host_ip: String,

    /// Pod block CIDR
    #[serde(rename = "podCIDR")]
    pub pod_cidr: String,
}

/// AddressPlanStatus holds the computed assignment
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddressPlanStatus {
    /// Interface entries ordered by interface index
    #[serde(default)]
    pub entries: Vec<InterfaceBlockEntry>,

    /// Last time the assignment changed.
    /// Only written on change so status updates never retrigger reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<chrono::DateTime<chrono::Utc>>,

    /// Last reconciliation error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
