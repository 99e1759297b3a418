//! Allocator and synchronizer scenarios against the in-memory collaborators

use crate::allocator::{IpRequest, PodIpAllocator};
use crate::error::IpamError;
use crate::mock::{MemoryPoolStore, MockWorkloadOracle};
use crate::store::LiveAddress;
use crds::{Allocation, IPPoolSpec};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

fn pool(pod_cidr: &str, vlan_cidr: &str, host: &str, interface: &str) -> IPPoolSpec {
    IPPoolSpec {
        pod_cidr: pod_cidr.to_string(),
        vlan_cidr: vlan_cidr.to_string(),
        network_name: "net".to_string(),
        host_name: host.to_string(),
        interface_name: interface.to_string(),
        excludes: vec![],
        allocations: vec![],
    }
}

fn alloc(pod: &str, index: u32, prefix: &str) -> Allocation {
    Allocation {
        pod: pod.to_string(),
        namespace: "default".to_string(),
        index,
        address: format!("{}.{}", prefix, index),
    }
}

fn request(pod: &str, masters: &[&str]) -> IpRequest {
    IpRequest {
        pod: pod.to_string(),
        namespace: "default".to_string(),
        host: "node-a".to_string(),
        def: "net".to_string(),
        masters: masters.iter().map(ToString::to_string).collect(),
    }
}

fn node_store() -> MemoryPoolStore {
    let store = MemoryPoolStore::new();
    store.insert_pool("net-192.168.0.0-24", pool("192.168.0.0/24", "192.168.0.0/18", "node-a", "eth1"));
    store.insert_pool("net-192.168.64.0-24", pool("192.168.64.0/24", "192.168.64.0/18", "node-a", "eth2"));
    store.insert_pool("net-192.168.1.0-24", pool("192.168.1.0/24", "192.168.0.0/18", "node-b", "eth1"));
    store
}

fn indices(store: &MemoryPoolStore, name: &str) -> Vec<(String, u32)> {
    store
        .pool(name)
        .unwrap()
        .allocations
        .into_iter()
        .map(|a| (a.pod, a.index))
        .collect()
}

#[tokio::test]
async fn test_allocate_one_address_per_interface() {
    let allocator = PodIpAllocator::new(node_store(), WINDOW);
    let outcome = allocator.allocate(&request("p1", &["eth1", "eth2"])).await.unwrap();

    assert!(outcome.failed.is_empty());
    let mut addresses: Vec<(String, String, u8)> = outcome
        .assigned
        .iter()
        .map(|a| (a.interface_name.clone(), a.address.clone(), a.block_size_bits))
        .collect();
    addresses.sort();
    assert_eq!(
        addresses,
        vec![
            ("eth1".to_string(), "192.168.0.1".to_string(), 18),
            ("eth2".to_string(), "192.168.64.1".to_string(), 18),
        ]
    );
    assert_eq!(indices(allocator.store(), "net-192.168.0.0-24"), vec![("p1".to_string(), 1)]);
    assert!(indices(allocator.store(), "net-192.168.1.0-24").is_empty());
    assert_eq!(outcome.responses().len(), 2);
}

#[tokio::test]
async fn test_allocate_skips_excluded_offsets() {
    let store = MemoryPoolStore::new();
    let mut spec = pool("192.168.0.0/24", "192.168.0.0/18", "node-a", "eth1");
    spec.excludes = vec!["192.168.0.0/30".to_string()];
    store.insert_pool("excluded", spec);

    let allocator = PodIpAllocator::new(store, WINDOW);
    let outcome = allocator.allocate(&request("p1", &["eth1"])).await.unwrap();
    assert_eq!(outcome.assigned[0].address, "192.168.0.4");
}

#[tokio::test]
async fn test_allocate_is_idempotent_per_workload() {
    let allocator = PodIpAllocator::new(node_store(), WINDOW);
    let first = allocator.allocate(&request("p1", &["eth1"])).await.unwrap();
    let second = allocator.allocate(&request("p1", &["eth1"])).await.unwrap();

    assert_eq!(first.assigned, second.assigned);
    assert_eq!(indices(allocator.store(), "net-192.168.0.0-24").len(), 1);
}

#[tokio::test]
async fn test_allocate_reports_unmatched_interface() {
    let allocator = PodIpAllocator::new(node_store(), WINDOW);
    let outcome = allocator.allocate(&request("p1", &["eth1", "eth9"])).await.unwrap();

    assert_eq!(outcome.assigned.len(), 1);
    assert_eq!(
        outcome.failed,
        vec![("eth9".to_string(), IpamError::NoMatchingPool("eth9".to_string()))]
    );
}

#[tokio::test]
async fn test_allocate_reports_exhausted_pool() {
    let store = MemoryPoolStore::new();
    let mut small = pool("192.168.0.0/30", "192.168.0.0/18", "node-a", "eth1");
    small.allocations = vec![alloc("p1", 1, "192.168.0"), alloc("p2", 2, "192.168.0")];
    store.insert_pool("small", small);
    store.insert_pool("net-192.168.64.0-24", pool("192.168.64.0/24", "192.168.64.0/18", "node-a", "eth2"));

    let allocator = PodIpAllocator::new(store, WINDOW);
    let outcome = allocator.allocate(&request("p3", &["eth1", "eth2"])).await.unwrap();

    assert_eq!(outcome.assigned.len(), 1);
    assert_eq!(outcome.assigned[0].interface_name, "eth2");
    assert_eq!(
        outcome.failed,
        vec![("eth1".to_string(), IpamError::NoFreeAddress("small".to_string()))]
    );
}

#[tokio::test]
async fn test_allocate_fails_when_store_is_down() {
    let store = node_store();
    store.set_failing(true);
    let allocator = PodIpAllocator::new(store, WINDOW);
    let err = allocator.allocate(&request("p1", &["eth1"])).await.unwrap_err();
    assert!(matches!(err, IpamError::Store(_)));
}

#[tokio::test]
async fn test_freed_offset_not_handed_to_next_workload() {
    let allocator = PodIpAllocator::new(node_store(), WINDOW);
    let t0 = Instant::now();
    allocator.allocate_at(&request("p0", &["eth1"]), t0).await.unwrap();
    allocator.allocate_at(&request("p1", &["eth1"]), t0).await.unwrap();

    let released = allocator.deallocate_at(&request("p1", &[]), t0).await.unwrap();
    assert_eq!(released, 1);

    let outcome = allocator
        .allocate_at(&request("p2", &["eth1"]), t0 + Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(outcome.assigned[0].address, "192.168.0.3");

    // after the window the history is gone
    let later = t0 + WINDOW + Duration::from_secs(1);
    allocator.allocate_at(&request("p3", &["eth1"]), later).await.unwrap();
    assert_eq!(allocator.history_len().await, 0);
}

#[tokio::test]
async fn test_returning_workload_offset_strictly_increases() {
    let allocator = PodIpAllocator::new(node_store(), WINDOW);
    let t0 = Instant::now();
    allocator.allocate_at(&request("p0", &["eth1"]), t0).await.unwrap();
    allocator.allocate_at(&request("p1", &["eth1"]), t0).await.unwrap();
    allocator.deallocate_at(&request("p1", &[]), t0).await.unwrap();

    let second = allocator
        .allocate_at(&request("p1", &["eth1"]), t0 + Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(second.assigned[0].address, "192.168.0.4");

    allocator
        .deallocate_at(&request("p1", &[]), t0 + Duration::from_secs(2))
        .await
        .unwrap();
    let third = allocator
        .allocate_at(&request("p1", &["eth1"]), t0 + Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(third.assigned[0].address, "192.168.0.7");
}

#[tokio::test]
async fn test_offset_freed_by_second_deallocation_keeps_full_window() {
    let allocator = PodIpAllocator::new(node_store(), WINDOW);
    let t0 = Instant::now();
    allocator.allocate_at(&request("p0", &["eth1"]), t0).await.unwrap();
    allocator.allocate_at(&request("p1", &["eth1"]), t0).await.unwrap();
    allocator.deallocate_at(&request("p1", &[]), t0).await.unwrap();

    let back = allocator
        .allocate_at(&request("p1", &["eth1"]), t0 + Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(back.assigned[0].address, "192.168.0.4");
    allocator
        .deallocate_at(&request("p1", &[]), t0 + Duration::from_secs(50))
        .await
        .unwrap();

    // .2 has expired by now, .4 was freed only 15s ago
    let mut addresses = Vec::new();
    for (pod, secs) in [("p2", 65), ("p3", 66), ("p4", 67)] {
        let outcome = allocator
            .allocate_at(&request(pod, &["eth1"]), t0 + Duration::from_secs(secs))
            .await
            .unwrap();
        addresses.push(outcome.assigned[0].address.clone());
    }
    assert_eq!(addresses, vec!["192.168.0.5", "192.168.0.6", "192.168.0.7"]);
    assert_eq!(allocator.history_len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_get_distinct_offsets() {
    let allocator = Arc::new(PodIpAllocator::new(node_store(), WINDOW));
    let handles: Vec<_> = (0..50)
        .map(|i| {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move { allocator.allocate(&request(&format!("p{}", i), &["eth1"])).await })
        })
        .collect();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.failed.is_empty());
    }

    let offsets: Vec<u32> = indices(allocator.store(), "net-192.168.0.0-24")
        .into_iter()
        .map(|(_, index)| index)
        .collect();
    let unique: HashSet<u32> = offsets.iter().copied().collect();
    assert_eq!(offsets.len(), 50);
    assert_eq!(unique.len(), 50);
}

#[tokio::test]
async fn test_freed_offset_reused_when_pool_is_otherwise_full() {
    let store = MemoryPoolStore::new();
    let mut small = pool("192.168.0.0/30", "192.168.0.0/18", "node-a", "eth1");
    small.allocations = vec![alloc("p1", 1, "192.168.0"), alloc("p2", 2, "192.168.0")];
    store.insert_pool("small", small);

    let allocator = PodIpAllocator::new(store, WINDOW);
    let t0 = Instant::now();
    allocator.deallocate_at(&request("p2", &[]), t0).await.unwrap();
    let outcome = allocator
        .allocate_at(&request("p3", &["eth1"]), t0 + Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(outcome.assigned[0].address, "192.168.0.2");
}

#[tokio::test]
async fn test_deallocate_releases_every_interface() {
    let allocator = PodIpAllocator::new(node_store(), WINDOW);
    allocator.allocate(&request("p1", &["eth1", "eth2"])).await.unwrap();
    allocator.allocate(&request("p2", &["eth1"])).await.unwrap();

    let released = allocator.deallocate(&request("p1", &[])).await.unwrap();
    assert_eq!(released, 2);
    assert_eq!(indices(allocator.store(), "net-192.168.0.0-24"), vec![("p2".to_string(), 2)]);
    assert!(indices(allocator.store(), "net-192.168.64.0-24").is_empty());

    let again = allocator.deallocate(&request("p1", &[])).await.unwrap();
    assert_eq!(again, 0);
}

#[tokio::test]
async fn test_reap_stale_removes_missing_workloads() {
    let store = node_store();
    let mut spec = pool("192.168.0.0/24", "192.168.0.0/18", "node-a", "eth1");
    spec.allocations = vec![alloc("p1", 1, "192.168.0"), alloc("p2", 2, "192.168.0")];
    store.insert_pool("net-192.168.0.0-24", spec);

    let oracle = MockWorkloadOracle::new();
    oracle.add_workload("p1", "default");

    let allocator = PodIpAllocator::new(store, WINDOW);
    let removed = allocator.reap_stale("node-a", &oracle).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(indices(allocator.store(), "net-192.168.0.0-24"), vec![("p1".to_string(), 1)]);
}

#[tokio::test]
async fn test_reap_stale_keeps_allocations_when_oracle_fails() {
    let store = node_store();
    let mut spec = pool("192.168.0.0/24", "192.168.0.0/18", "node-a", "eth1");
    spec.allocations = vec![alloc("p1", 1, "192.168.0")];
    store.insert_pool("net-192.168.0.0-24", spec);

    let oracle = MockWorkloadOracle::new();
    oracle.set_failing(true);

    let allocator = PodIpAllocator::new(store, WINDOW);
    assert_eq!(allocator.reap_stale("node-a", &oracle).await.unwrap(), 0);
    assert_eq!(indices(allocator.store(), "net-192.168.0.0-24").len(), 1);
}

#[tokio::test]
async fn test_synchronize_rewrites_only_diverged_pools() {
    let store = node_store();
    let mut spec = pool("192.168.0.0/24", "192.168.0.0/18", "node-a", "eth1");
    spec.allocations = vec![alloc("p1", 1, "192.168.0"), alloc("p2", 2, "192.168.0")];
    store.insert_pool("net-192.168.0.0-24", spec);

    let oracle = MockWorkloadOracle::new();
    oracle.set_live_addresses(
        "net",
        vec![
            LiveAddress::new("p1", "default", "192.168.0.1"),
            LiveAddress::new("p3", "default", "192.168.0.9"),
        ],
    );

    let allocator = PodIpAllocator::new(store, WINDOW);
    let rewritten = allocator.synchronize("node-a", &oracle).await.unwrap();
    assert_eq!(rewritten, 1);
    assert_eq!(
        indices(allocator.store(), "net-192.168.0.0-24"),
        vec![("p1".to_string(), 1), ("p3".to_string(), 9)]
    );

    let updates = allocator.store().update_count();
    assert_eq!(allocator.synchronize("node-a", &oracle).await.unwrap(), 0);
    assert_eq!(allocator.store().update_count(), updates);
}

#[tokio::test]
async fn test_synchronize_spares_fresh_allocations() {
    let oracle = MockWorkloadOracle::new();
    oracle.set_live_addresses("net", vec![]);

    let allocator = PodIpAllocator::new(node_store(), WINDOW);
    let t0 = Instant::now();
    allocator.allocate_at(&request("p1", &["eth1"]), t0).await.unwrap();

    let early = allocator
        .synchronize_at("node-a", &oracle, t0 + Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(early, 0);
    assert_eq!(indices(allocator.store(), "net-192.168.0.0-24").len(), 1);

    let late = allocator
        .synchronize_at("node-a", &oracle, t0 + WINDOW + Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(late, 1);
    assert!(indices(allocator.store(), "net-192.168.0.0-24").is_empty());
}

#[tokio::test]
async fn test_synchronize_skips_network_when_oracle_fails() {
    let store = node_store();
    let mut spec = pool("192.168.0.0/24", "192.168.0.0/18", "node-a", "eth1");
    spec.allocations = vec![alloc("p1", 1, "192.168.0")];
    store.insert_pool("net-192.168.0.0-24", spec);

    let oracle = MockWorkloadOracle::new();
    oracle.set_failing(true);

    let allocator = PodIpAllocator::new(store, WINDOW);
    assert_eq!(allocator.synchronize("node-a", &oracle).await.unwrap(), 0);
    assert_eq!(indices(allocator.store(), "net-192.168.0.0-24").len(), 1);
}
