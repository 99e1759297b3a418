//! # Pod IP Allocator
//!
//! Node-local allocator handing out pod addresses from the pools assigned
//! to this host. One lock serialises every pool mutation on the node.
//!
//! Recently deallocated workloads are remembered for a short window: a
//! workload name that comes back within the window is placed further away
//! from the last occupied offset on each return, and the offsets it freed
//! stay reserved so another workload does not pick them up before the
//! deletion has propagated.

use crate::compute::{address_at, excluded_offsets, find_gap, max_pod_offset, parse_cidr};
use crate::error::IpamError;
use crate::store::{LiveAddress, PoolStore, WorkloadOracle};
use crate::sync::sync_allocations;
use crds::{Allocation, IPPoolSpec};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default lifetime of a deallocation history record
pub const DEFAULT_HISTORY_TIMEOUT: Duration = Duration::from_secs(60);

/// Allocate/deallocate request body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRequest {
    /// Workload (pod) name
    pub pod: String,

    /// Workload namespace
    pub namespace: String,

    /// Host the workload runs on
    pub host: String,

    /// Network (plan) name
    pub def: String,

    /// Requested interface names
    #[serde(default)]
    pub masters: Vec<String>,
}

/// Allocate response entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpResponse {
    /// Interface name
    pub interface: String,

    /// Allocated address
    pub ip: String,

    /// VLAN block prefix length
    pub block: String,
}

/// One address handed out for one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAssignment {
    /// Interface the address belongs to
    pub interface_name: String,

    /// Allocated address
    pub address: String,

    /// Prefix length of the parent VLAN block
    pub block_size_bits: u8,
}

impl From<&AddressAssignment> for IpResponse {
    fn from(assignment: &AddressAssignment) -> Self {
        Self {
            interface: assignment.interface_name.clone(),
            ip: assignment.address.clone(),
            block: assignment.block_size_bits.to_string(),
        }
    }
}

/// Per-interface result of an allocate request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationOutcome {
    /// Interfaces that received an address
    pub assigned: Vec<AddressAssignment>,

    /// Interfaces that did not, with the reason
    pub failed: Vec<(String, IpamError)>,
}

impl AllocationOutcome {
    /// Response bodies for the assigned interfaces
    pub fn responses(&self) -> Vec<IpResponse> {
        self.assigned.iter().map(IpResponse::from).collect()
    }
}

#[derive(Debug, Clone)]
struct FreedOffset {
    pool: String,
    offset: u32,
    freed_at: Instant,
}

#[derive(Debug, Clone)]
struct HistoryRecord {
    /// Time of the latest deallocation of the name
    recorded_at: Instant,
    last_offset: u32,
    freed: Vec<FreedOffset>,
}

/// Short-lived record of deallocated workload names
#[derive(Debug, Clone)]
pub struct DeallocationHistory {
    expiry: Duration,
    records: HashMap<String, HistoryRecord>,
}

impl DeallocationHistory {
    /// Create an empty history whose records live for `expiry`
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            records: HashMap::new(),
        }
    }

    /// Drop freed offsets and names older than the expiry.
    ///
    /// Every freed offset expires on its own clock; a name lives for the
    /// window after its latest deallocation.
    pub fn prune(&mut self, now: Instant) {
        let expiry = self.expiry;
        self.records.retain(|pod, record| {
            record
                .freed
                .retain(|freed| now.saturating_duration_since(freed.freed_at) < expiry);
            let keep = now.saturating_duration_since(record.recorded_at) < expiry;
            if !keep {
                debug!("Flushing expired deallocation history of {}", pod);
            }
            keep
        });
    }

    /// Remember a deallocation and the pool offsets it freed
    pub fn record(&mut self, pod: &str, freed: Vec<(String, u32)>, now: Instant) {
        let record = self.records.entry(pod.to_string()).or_insert_with(|| HistoryRecord {
            recorded_at: now,
            last_offset: 1,
            freed: Vec::new(),
        });
        record.recorded_at = now;
        record.freed.extend(freed.into_iter().map(|(pool, offset)| FreedOffset {
            pool,
            offset,
            freed_at: now,
        }));
    }

    /// Offset step for a new allocation of `pod`.
    ///
    /// 1 for unknown names; grows by one on every call for a remembered name.
    pub fn next_offset(&mut self, pod: &str) -> u32 {
        match self.records.get_mut(pod) {
            Some(record) => {
                record.last_offset = record.last_offset.saturating_add(1);
                record.last_offset
            }
            None => 1,
        }
    }

    /// Offsets of `pool` freed within the window
    pub fn reserved(&self, pool: &str) -> Vec<u32> {
        self.records
            .values()
            .flat_map(|record| record.freed.iter())
            .filter(|freed| freed.pool == pool)
            .map(|freed| freed.offset)
            .collect()
    }

    /// Number of remembered names
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no name is remembered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
struct AllocatorState {
    history: DeallocationHistory,
    recent: HashMap<(String, String), Instant>,
}

/// Sorted, duplicate-free offsets within `[1, max]`
fn normalize(mut offsets: Vec<u32>, max: u32) -> Vec<u32> {
    offsets.retain(|o| (1..=max).contains(o));
    offsets.sort_unstable();
    offsets.dedup();
    offsets
}

/// `last + step` while it fits, then the lowest gap, then `last + 1`
fn pick_offset(occupied: &[u32], max: u32, step: u32) -> Option<u32> {
    if max == 0 {
        return None;
    }
    let candidate = occupied.last().map_or(step, |last| last.saturating_add(step));
    if (1..=max).contains(&candidate) {
        return Some(candidate);
    }
    find_gap(occupied, 0, 1)
        .filter(|gap| *gap <= max)
        .or_else(|| match occupied.last() {
            None => Some(1),
            Some(&last) => (last < max).then(|| last + 1),
        })
}

/// Node-local pod address allocator
#[derive(Debug)]
pub struct PodIpAllocator<S> {
    store: S,
    expiry: Duration,
    state: Mutex<AllocatorState>,
}

impl<S: PoolStore> PodIpAllocator<S> {
    /// Create an allocator over `store` with the given history window
    pub fn new(store: S, history_timeout: Duration) -> Self {
        Self {
            store,
            expiry: history_timeout,
            state: Mutex::new(AllocatorState {
                history: DeallocationHistory::new(history_timeout),
                recent: HashMap::new(),
            }),
        }
    }

    /// Pool store backing this allocator
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Allocate one address per requested interface
    pub async fn allocate(&self, request: &IpRequest) -> Result<AllocationOutcome, IpamError> {
        self.allocate_at(request, Instant::now()).await
    }

    /// Allocate as of `now`.
    ///
    /// Each requested interface is consumed by at most one pool. Failures
    /// are reported per interface; only a failed pool listing fails the
    /// whole request.
    pub async fn allocate_at(&self, request: &IpRequest, now: Instant) -> Result<AllocationOutcome, IpamError> {
        let mut state = self.state.lock().await;
        state.history.prune(now);
        let expiry = self.expiry;
        state
            .recent
            .retain(|_, at| now.saturating_duration_since(*at) < expiry);

        let step = state.history.next_offset(&request.pod);
        if step > 1 {
            info!("Found recently deallocated {}, allocating with offset {}", request.pod, step);
        }

        let pools = self.store.list_pools(&request.host, Some(&request.def)).await?;
        let mut remaining: Vec<&str> = request.masters.iter().map(String::as_str).collect();
        let mut outcome = AllocationOutcome::default();

        for (name, spec) in &pools {
            if remaining.is_empty() {
                break;
            }
            let Some(position) = remaining.iter().position(|m| *m == spec.interface_name) else {
                debug!("Interface {} is not requested by {}", spec.interface_name, request.pod);
                continue;
            };
            remaining.remove(position);

            match self.allocate_in_pool(name, spec, request, step, &state.history).await {
                Ok(assignment) => {
                    info!(
                        "Allocated {} on {} to {}/{}",
                        assignment.address, assignment.interface_name, request.namespace, request.pod
                    );
                    outcome.assigned.push(assignment);
                }
                Err(e) => {
                    warn!("Failed to allocate on {} for {}/{}: {}", spec.interface_name, request.namespace, request.pod, e);
                    outcome.failed.push((spec.interface_name.clone(), e));
                }
            }
        }

        for interface in remaining {
            warn!("No pool for interface {} on host {}", interface, request.host);
            outcome
                .failed
                .push((interface.to_string(), IpamError::NoMatchingPool(interface.to_string())));
        }

        if !outcome.assigned.is_empty() {
            state
                .recent
                .insert((request.pod.clone(), request.namespace.clone()), now);
        }
        Ok(outcome)
    }

    async fn allocate_in_pool(
        &self,
        name: &str,
        spec: &IPPoolSpec,
        request: &IpRequest,
        step: u32,
        history: &DeallocationHistory,
    ) -> Result<AddressAssignment, IpamError> {
        let block_size_bits = parse_cidr(&spec.vlan_cidr)?.prefix_len();

        if let Some(existing) = spec
            .allocations
            .iter()
            .find(|a| a.is_owned_by(&request.pod, &request.namespace))
        {
            debug!("{}/{} already holds {} in {}", request.namespace, request.pod, existing.address, name);
            return Ok(AddressAssignment {
                interface_name: spec.interface_name.clone(),
                address: existing.address.clone(),
                block_size_bits,
            });
        }

        let block = parse_cidr(&spec.pod_cidr)?.trunc();
        let max = max_pod_offset(&block);
        let excludes: Vec<Ipv4Net> = spec
            .excludes
            .iter()
            .filter_map(|cidr| match parse_cidr(cidr) {
                Ok(net) => Some(net.trunc()),
                Err(e) => {
                    warn!("Ignoring exclude of pool {}: {}", name, e);
                    None
                }
            })
            .collect();

        let mut occupied: Vec<u32> = spec.allocations.iter().map(|a| a.index).collect();
        occupied.extend(excluded_offsets(&block, &excludes, max));
        let reserved = history.reserved(name);

        let with_reserved = normalize(occupied.iter().chain(reserved.iter()).copied().collect(), max);
        let offset = match pick_offset(&with_reserved, max, step) {
            Some(offset) => offset,
            None if !reserved.is_empty() => {
                debug!("Pool {} is full with reservations, reusing freed offsets", name);
                pick_offset(&normalize(occupied, max), max, step)
                    .ok_or_else(|| IpamError::NoFreeAddress(name.to_string()))?
            }
            None => return Err(IpamError::NoFreeAddress(name.to_string())),
        };
        let address = address_at(&block, offset).ok_or_else(|| IpamError::NoFreeAddress(name.to_string()))?;

        let mut allocations = spec.allocations.clone();
        let position = allocations.partition_point(|a| a.index < offset);
        allocations.insert(
            position,
            Allocation {
                pod: request.pod.clone(),
                namespace: request.namespace.clone(),
                index: offset,
                address: address.to_string(),
            },
        );
        self.store.update_allocations(name, &allocations).await?;

        Ok(AddressAssignment {
            interface_name: spec.interface_name.clone(),
            address: address.to_string(),
            block_size_bits,
        })
    }

    /// Release every address of a workload on the request's host and network
    pub async fn deallocate(&self, request: &IpRequest) -> Result<usize, IpamError> {
        self.deallocate_at(request, Instant::now()).await
    }

    /// Deallocate as of `now`; returns the number of released addresses
    pub async fn deallocate_at(&self, request: &IpRequest, now: Instant) -> Result<usize, IpamError> {
        let mut state = self.state.lock().await;
        let pools = self.store.list_pools(&request.host, Some(&request.def)).await?;

        let mut freed = Vec::new();
        for (name, spec) in &pools {
            let Some(position) = spec
                .allocations
                .iter()
                .position(|a| a.is_owned_by(&request.pod, &request.namespace))
            else {
                continue;
            };
            let mut allocations = spec.allocations.clone();
            let removed = allocations.remove(position);
            match self.store.update_allocations(name, &allocations).await {
                Ok(()) => {
                    info!("Released {} of {}/{} from {}", removed.address, request.namespace, request.pod, name);
                    freed.push((name.clone(), removed.index));
                }
                Err(e) => warn!("Failed to release {} from {}: {}", removed.address, name, e),
            }
        }

        let released = freed.len();
        state.history.record(&request.pod, freed, now);
        state
            .recent
            .remove(&(request.pod.clone(), request.namespace.clone()));
        Ok(released)
    }

    /// Drop allocations of workloads that no longer exist.
    ///
    /// Workloads are looked up before taking the lock; a failed lookup keeps
    /// the allocation. Returns the number of removed allocations.
    pub async fn reap_stale<O>(&self, host: &str, oracle: &O) -> Result<usize, IpamError>
    where
        O: WorkloadOracle + ?Sized,
    {
        let pools = self.store.list_pools(host, None).await?;
        let owners: BTreeSet<(String, String)> = pools
            .values()
            .flat_map(|spec| spec.allocations.iter())
            .map(|a| (a.pod.clone(), a.namespace.clone()))
            .collect();

        let mut gone: HashSet<(String, String)> = HashSet::new();
        for (pod, namespace) in owners {
            match oracle.workload_exists(&pod, &namespace).await {
                Ok(true) => {}
                Ok(false) => {
                    gone.insert((pod, namespace));
                }
                Err(e) => warn!("Failed to look up {}/{}, keeping its allocations: {}", namespace, pod, e),
            }
        }
        if gone.is_empty() {
            return Ok(0);
        }

        let _state = self.state.lock().await;
        let pools = self.store.list_pools(host, None).await?;
        let mut removed = 0;
        for (name, spec) in &pools {
            let remains: Vec<Allocation> = spec
                .allocations
                .iter()
                .filter(|a| !gone.contains(&(a.pod.clone(), a.namespace.clone())))
                .cloned()
                .collect();
            let dropped = spec.allocations.len() - remains.len();
            if dropped == 0 {
                continue;
            }
            match self.store.update_allocations(name, &remains).await {
                Ok(()) => {
                    info!("Removed {} hanging allocations from {}", dropped, name);
                    removed += dropped;
                }
                Err(e) => warn!("Failed to clean hanging allocations of {}: {}", name, e),
            }
        }
        Ok(removed)
    }

    /// Synchronize every pool of `host` against live workload addresses
    pub async fn synchronize<O>(&self, host: &str, oracle: &O) -> Result<usize, IpamError>
    where
        O: WorkloadOracle + ?Sized,
    {
        self.synchronize_at(host, oracle, Instant::now()).await
    }

    /// Synchronize as of `now`; returns the number of rewritten pools.
    ///
    /// Live addresses are fetched before taking the lock. Allocations made
    /// within the history window count as live so a workload whose address
    /// is not reported yet keeps it. A network whose live addresses cannot
    /// be fetched is skipped.
    pub async fn synchronize_at<O>(&self, host: &str, oracle: &O, now: Instant) -> Result<usize, IpamError>
    where
        O: WorkloadOracle + ?Sized,
    {
        let pools = self.store.list_pools(host, None).await?;
        let networks: BTreeSet<String> = pools.values().map(|spec| spec.network_name.clone()).collect();

        let mut live_by_network: HashMap<String, Vec<LiveAddress>> = HashMap::new();
        for network in networks {
            match oracle.live_addresses(&network).await {
                Ok(live) => {
                    live_by_network.insert(network, live);
                }
                Err(e) => warn!("Failed to get live addresses of {}, skipping: {}", network, e),
            }
        }

        let mut state = self.state.lock().await;
        let expiry = self.expiry;
        state
            .recent
            .retain(|_, at| now.saturating_duration_since(*at) < expiry);

        let pools = self.store.list_pools(host, None).await?;
        let mut rewritten = 0;
        for (name, spec) in &pools {
            let Some(live) = live_by_network.get(&spec.network_name) else {
                continue;
            };
            let mut observed: Vec<LiveAddress> = spec
                .allocations
                .iter()
                .filter(|a| state.recent.contains_key(&(a.pod.clone(), a.namespace.clone())))
                .map(|a| LiveAddress::new(a.pod.as_str(), a.namespace.as_str(), a.address.as_str()))
                .collect();
            observed.extend(live.iter().cloned());

            match sync_allocations(spec, &spec.allocations, &observed) {
                Ok(outcome) if outcome.changed => {
                    match self.store.update_allocations(name, &outcome.survivors).await {
                        Ok(()) => {
                            info!(
                                "Synchronized {}: {} -> {} allocations",
                                name,
                                spec.allocations.len(),
                                outcome.survivors.len()
                            );
                            rewritten += 1;
                        }
                        Err(e) => warn!("Failed to update synchronized allocations of {}: {}", name, e),
                    }
                }
                Ok(_) => debug!("{} is in sync", name),
                Err(e) => warn!("Failed to synchronize {}: {}", name, e),
            }
        }
        Ok(rewritten)
    }

    /// Number of workload names in the deallocation history
    pub async fn history_len(&self) -> usize {
        self.state.lock().await.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_offset_sequential() {
        assert_eq!(pick_offset(&[], 254, 1), Some(1));
        assert_eq!(pick_offset(&[1, 2, 3], 254, 1), Some(4));
        assert_eq!(pick_offset(&[1, 2, 3], 254, 3), Some(6));
    }

    #[test]
    fn test_pick_offset_falls_back_to_gap() {
        assert_eq!(pick_offset(&[1, 3, 6], 6, 1), Some(2));
        assert_eq!(pick_offset(&[1, 2, 3, 4, 5, 6], 6, 1), None);
    }

    #[test]
    fn test_pick_offset_large_step_near_capacity() {
        assert_eq!(pick_offset(&[1, 2, 3], 6, 5), Some(4));
        assert_eq!(pick_offset(&[], 2, 5), Some(1));
        assert_eq!(pick_offset(&[], 0, 1), None);
    }

    #[test]
    fn test_history_offset_grows_per_name() {
        let now = Instant::now();
        let mut history = DeallocationHistory::new(Duration::from_secs(60));
        assert_eq!(history.next_offset("p1"), 1);

        history.record("p1", vec![("pool".to_string(), 4)], now);
        assert_eq!(history.next_offset("p1"), 2);
        assert_eq!(history.next_offset("p1"), 3);
        assert_eq!(history.next_offset("p2"), 1);
        assert_eq!(history.reserved("pool"), vec![4]);
        assert!(history.reserved("other").is_empty());
    }

    #[test]
    fn test_history_prune() {
        let start = Instant::now();
        let mut history = DeallocationHistory::new(Duration::from_secs(60));
        history.record("p1", vec![], start);
        history.prune(start + Duration::from_secs(59));
        assert_eq!(history.len(), 1);
        history.prune(start + Duration::from_secs(60));
        assert!(history.is_empty());
    }

    #[test]
    fn test_history_freed_offsets_expire_individually() {
        let start = Instant::now();
        let mut history = DeallocationHistory::new(Duration::from_secs(60));
        history.record("p1", vec![("pool".to_string(), 2)], start);
        history.record("p1", vec![("pool".to_string(), 4)], start + Duration::from_secs(50));

        history.prune(start + Duration::from_secs(65));
        assert_eq!(history.reserved("pool"), vec![4]);
        assert_eq!(history.len(), 1);

        history.prune(start + Duration::from_secs(110));
        assert!(history.reserved("pool").is_empty());
        assert!(history.is_empty());
    }

    #[test]
    fn test_response_body_field_names() {
        let assignment = AddressAssignment {
            interface_name: "eth1".to_string(),
            address: "192.168.0.1".to_string(),
            block_size_bits: 18,
        };
        let value = serde_json::to_value(IpResponse::from(&assignment)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"interface": "eth1", "ip": "192.168.0.1", "block": "18"})
        );

        let request: IpRequest = serde_json::from_value(serde_json::json!({
            "pod": "p1", "namespace": "default", "host": "node-a",
            "def": "net", "masters": ["eth1", "eth2"]
        }))
        .unwrap();
        assert_eq!(request.masters, vec!["eth1".to_string(), "eth2".to_string()]);
    }
}
