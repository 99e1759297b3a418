//! Multi-NIC IPAM Core
//!
//! Hierarchical address management for multi-homed pods:
//!
//! - **CIDR arithmetic** (`compute`): sub-block computation, tabu range
//!   detection, offset mapping and index gap search
//! - **Assignment engine** (`assignment`): interface index to VLAN block and
//!   host index to pod block, recomputed as host inventory changes
//! - **Pod IP allocator** (`allocator`): per-node address allocation from the
//!   pod blocks of the local host
//! - **Allocation synchronizer** (`sync`): reconciles recorded allocations
//!   with the addresses running workloads report
//!
//! Cluster access goes through the collaborator traits in `store`.

pub mod allocator;
pub mod assignment;
pub mod compute;
pub mod error;
pub mod store;
pub mod sync;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

#[cfg(test)]
mod scenario_test;

pub use allocator::{AddressAssignment, AllocationOutcome, DeallocationHistory, IpRequest, IpResponse, PodIpAllocator, DEFAULT_HISTORY_TIMEOUT};
pub use assignment::{PlanEngine, PlanLayout, PlanPass, ReconcileOutcome, assign_host_index, assign_interface_index, desired_pools, reconcile_entries, validate_plan};
pub use compute::{compute_sub_block, find_gap, is_excluded, offset_of, project_excludes};
pub use error::IpamError;
pub use store::{LiveAddress, PoolStore, WorkloadOracle};
pub use sync::{SyncOutcome, sync_allocations};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MemoryPoolStore, MockWorkloadOracle};
