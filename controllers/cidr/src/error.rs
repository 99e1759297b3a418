//! Controller-specific error types.
//!
//! This module defines error types specific to the CIDR Controller
//! that are not covered by upstream library errors.

use ipam_core::IpamError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the CIDR Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Address assignment error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
