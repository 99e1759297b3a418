//! Allocation synchronizer
//!
//! Reconciles the allocations recorded in a pool against the addresses
//! running workloads actually report.

use crate::compute::{address_at, max_pod_offset, offset_of, parse_address, parse_cidr};
use crate::error::IpamError;
use crate::store::LiveAddress;
use crds::{Allocation, IPPoolSpec};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Result of synchronizing one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Whether `survivors` differ from the recorded allocations
    pub changed: bool,

    /// Allocations to keep, ordered by offset
    pub survivors: Vec<Allocation>,
}

type Owner = (String, String);

/// Reconcile `recorded` allocations of `pool` with `live` observations.
///
/// Live observations are the ground truth, oldest first; when two
/// observations claim the same address or the same workload, the later one
/// wins. Recorded allocations without a live address are dropped, and a
/// workload seen at a different address keeps the live one. Live addresses
/// inside the block that nobody recorded are adopted. Addresses outside the
/// usable range of the block are ignored.
pub fn sync_allocations(
    pool: &IPPoolSpec,
    recorded: &[Allocation],
    live: &[LiveAddress],
) -> Result<SyncOutcome, IpamError> {
    let block = parse_cidr(&pool.pod_cidr)?.trunc();
    let max = max_pod_offset(&block);

    let mut by_offset: BTreeMap<u32, Owner> = BTreeMap::new();
    let mut by_owner: HashMap<Owner, u32> = HashMap::new();
    for observed in live {
        let Ok(address) = parse_address(&observed.address) else {
            debug!("Ignoring unparseable live address {} of {}", observed.address, observed.workload);
            continue;
        };
        let Some(offset) = offset_of(&block, address).filter(|o| (1..=max).contains(o)) else {
            continue;
        };

        let owner: Owner = (observed.workload.clone(), observed.namespace.clone());
        if let Some(previous) = by_owner.insert(owner.clone(), offset) {
            if previous != offset {
                by_offset.remove(&previous);
            }
        }
        if let Some(displaced) = by_offset.insert(offset, owner.clone()) {
            if displaced != owner {
                by_owner.remove(&displaced);
            }
        }
    }

    let mut survivors = Vec::with_capacity(by_offset.len());
    for (offset, (pod, namespace)) in by_offset {
        if let Some(existing) = recorded
            .iter()
            .find(|a| a.index == offset && a.is_owned_by(&pod, &namespace))
        {
            survivors.push(existing.clone());
            continue;
        }
        let Some(address) = address_at(&block, offset) else { continue };
        survivors.push(Allocation {
            pod,
            namespace,
            index: offset,
            address: address.to_string(),
        });
    }

    let mut before = recorded.to_vec();
    before.sort_by_key(|a| a.index);
    let changed = before != survivors;

    Ok(SyncOutcome { changed, survivors })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> IPPoolSpec {
        IPPoolSpec {
            pod_cidr: "192.168.1.0/24".to_string(),
            vlan_cidr: "192.168.0.0/18".to_string(),
            network_name: "net".to_string(),
            host_name: "node-a".to_string(),
            interface_name: "eth1".to_string(),
            excludes: vec![],
            allocations: vec![],
        }
    }

    fn alloc(pod: &str, index: u32) -> Allocation {
        Allocation {
            pod: pod.to_string(),
            namespace: "default".to_string(),
            index,
            address: format!("192.168.1.{}", index),
        }
    }

    fn live(pod: &str, address: &str) -> LiveAddress {
        LiveAddress::new(pod, "default", address)
    }

    #[test]
    fn test_matching_state_is_unchanged() {
        let recorded = vec![alloc("p1", 1), alloc("p2", 2)];
        let outcome = sync_allocations(
            &pool(),
            &recorded,
            &[live("p2", "192.168.1.2"), live("p1", "192.168.1.1")],
        )
        .unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.survivors, recorded);
    }

    #[test]
    fn test_dead_allocation_is_dropped() {
        let recorded = vec![alloc("p1", 1), alloc("p2", 2)];
        let outcome = sync_allocations(&pool(), &recorded, &[live("p2", "192.168.1.2")]).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.survivors, vec![alloc("p2", 2)]);
    }

    #[test]
    fn test_live_address_wins_over_recorded_one() {
        let recorded = vec![alloc("p1", 1)];
        let outcome = sync_allocations(&pool(), &recorded, &[live("p1", "192.168.1.7")]).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.survivors, vec![alloc("p1", 7)]);
    }

    #[test]
    fn test_latest_observation_wins_on_shared_address() {
        let recorded = vec![alloc("p1", 3), alloc("p2", 4)];
        let outcome = sync_allocations(
            &pool(),
            &recorded,
            &[live("p1", "192.168.1.3"), live("p2", "192.168.1.3")],
        )
        .unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.survivors, vec![alloc("p2", 3)]);
    }

    #[test]
    fn test_unrecorded_live_address_is_adopted() {
        let outcome = sync_allocations(&pool(), &[], &[live("p9", "192.168.1.9")]).unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.survivors, vec![alloc("p9", 9)]);
    }

    #[test]
    fn test_addresses_outside_block_are_ignored() {
        let recorded = vec![alloc("p1", 1)];
        let outcome = sync_allocations(
            &pool(),
            &recorded,
            &[
                live("p1", "192.168.1.1"),
                live("p2", "10.0.0.2"),
                live("p3", "192.168.1.0"),
                live("p4", "192.168.1.255"),
                live("p5", "not-an-ip"),
            ],
        )
        .unwrap();
        assert!(!outcome.changed);
        assert_eq!(outcome.survivors, recorded);
    }

    #[test]
    fn test_unsorted_record_is_reported_changed() {
        let recorded = vec![alloc("p2", 2), alloc("p1", 1), alloc("p2", 2)];
        let outcome = sync_allocations(
            &pool(),
            &recorded,
            &[live("p1", "192.168.1.1"), live("p2", "192.168.1.2")],
        )
        .unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.survivors, vec![alloc("p1", 1), alloc("p2", 2)]);
    }

    #[test]
    fn test_invalid_pool_cidr() {
        let mut bad = pool();
        bad.pod_cidr = "garbage".to_string();
        assert!(matches!(
            sync_allocations(&bad, &[], &[]),
            Err(IpamError::InvalidCidr(_))
        ));
    }
}
