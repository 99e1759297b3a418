//! Daemon-specific error types.

use ipam_core::IpamError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the node IPAM daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Allocation error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Background task failed
    #[error("Task failed: {0}")]
    Task(String),
}
