//! Multi-NIC IPAM CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the CIDR controller
//! and the node IPAM daemon.

pub mod address_plan;
pub mod host_interface;
pub mod ip_pool;

pub use address_plan::*;
pub use host_interface::*;
pub use ip_pool::*;
