//! IPAM errors

use thiserror::Error;

/// Errors that can occur while assigning blocks or allocating pod addresses
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IpamError {
    /// Index exceeds the capacity of its bit field
    #[error("index {index} out of range (max {max})")]
    OutOfRange { index: u64, max: u64 },

    /// Computed block escaped its base network (internal misuse)
    #[error("mask violation: {0}")]
    MaskViolation(String),

    /// No free index left at some level
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Allocate request for an interface without an assigned pool
    #[error("no matching pool for interface {0}")]
    NoMatchingPool(String),

    /// Pool has no free address left
    #[error("no free address in pool {0}")]
    NoFreeAddress(String),

    /// Unparseable CIDR or address
    #[error("invalid CIDR or address: {0}")]
    InvalidCidr(String),

    /// Plan configuration rejected by validation
    #[error("invalid address plan: {0}")]
    InvalidPlan(String),

    /// Pool store collaborator failed
    #[error("pool store error: {0}")]
    Store(String),

    /// Workload oracle collaborator failed
    #[error("workload oracle error: {0}")]
    Oracle(String),
}
