//! # CIDR Assignment Engine
//!
//! Assigns interface indices (VLAN blocks) and host indices (pod blocks)
//! for one address plan, given a snapshot of the host interface inventory.
//!
//! Index probing prefers `last + 1` and only falls back to gap search once
//! that candidate exceeds the bit-field capacity. Existing assignments keep
//! their index across passes as long as the recomputed block stays valid.

use crate::compute::{compute_sub_block, find_gap, is_excluded, max_index, parse_address, parse_cidr, project_excludes};
use crate::error::IpamError;
use crds::{AddressPlanSpec, HostBlockAssignment, HostInterfaceSpec, IPPoolSpec, InterfaceBlockEntry, pool_name};
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Validated, typed view of an `AddressPlanSpec`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanLayout {
    /// Base subnet, `None` in borrow-subnet mode
    pub subnet: Option<Ipv4Net>,

    /// Interface index bit width
    pub interface_bits: u8,

    /// Host index bit width
    pub host_bits: u8,

    /// Parsed exclude CIDRs
    pub excludes: Vec<Ipv4Net>,

    /// Master network addresses, in configured order
    pub master_nets: Vec<String>,
}

impl PlanLayout {
    /// Whether VLAN blocks are the host network addresses themselves
    pub fn borrows_subnet(&self) -> bool {
        self.subnet.is_none()
    }

    /// Whether `net_address` belongs to this plan
    pub fn allows_net_address(&self, net_address: &str) -> bool {
        self.master_nets.is_empty() || self.master_nets.iter().any(|m| m == net_address)
    }

    fn is_master_net(&self, net_address: &str) -> bool {
        self.master_nets.iter().any(|m| m == net_address)
    }
}

/// Validate a plan spec.
///
/// Bit widths must fit the subnet and every exclude must parse as an IPv4
/// CIDR. An invalid plan is rejected as a whole.
pub fn validate_plan(plan: &AddressPlanSpec) -> Result<PlanLayout, IpamError> {
    let subnet = if plan.is_borrowed_subnet() {
        None
    } else {
        let subnet = parse_cidr(&plan.subnet).map_err(|e| IpamError::InvalidPlan(e.to_string()))?;
        let total = u32::from(subnet.prefix_len()) + u32::from(plan.interface_block) + u32::from(plan.host_block);
        if total > 32 {
            return Err(IpamError::InvalidPlan(format!(
                "subnet {} with interfaceBlock {} and hostBlock {} needs {} prefix bits",
                plan.subnet, plan.interface_block, plan.host_block, total
            )));
        }
        Some(subnet.trunc())
    };

    if plan.host_block > 32 {
        return Err(IpamError::InvalidPlan(format!("hostBlock {} exceeds 32 bits", plan.host_block)));
    }

    let excludes = plan
        .exclude_cidrs
        .iter()
        .map(|cidr| parse_cidr(cidr).map(|net| net.trunc()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| IpamError::InvalidPlan(e.to_string()))?;

    for master in &plan.master_nets {
        parse_cidr(master).map_err(|e| IpamError::InvalidPlan(e.to_string()))?;
    }

    Ok(PlanLayout {
        subnet,
        interface_bits: plan.interface_block,
        host_bits: plan.host_block,
        excludes,
        master_nets: plan.master_nets.clone(),
    })
}

/// Probe candidate indices: `last + 1` while it fits, then the lowest gap.
///
/// `occupied` must be sorted and duplicate-free. Rejected candidates are
/// marked occupied and probing continues until `usable` accepts one.
fn probe_index(
    occupied: &[u32],
    max: u32,
    what: &str,
    mut usable: impl FnMut(u32) -> bool,
) -> Result<u32, IpamError> {
    let mut taken = occupied.to_vec();
    loop {
        let candidate = match taken.last() {
            None => 0,
            Some(&last) if last < max => last + 1,
            Some(_) => find_gap(&taken, 0, 0)
                .filter(|gap| *gap <= max)
                .ok_or_else(|| IpamError::CapacityExhausted(format!("no free {} index (max {})", what, max)))?,
        };
        if usable(candidate) {
            return Ok(candidate);
        }
        let position = taken.partition_point(|v| *v < candidate);
        taken.insert(position, candidate);
    }
}

fn sorted_indices(indices: impl Iterator<Item = u32>) -> Vec<u32> {
    let mut indices: Vec<u32> = indices.collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Assign a new interface entry for `net_address`.
///
/// In borrow-subnet mode the VLAN block is the network address itself and
/// the index is the next sequential one. Otherwise the first usable index
/// whose sub-block of the subnet is not excluded wins.
pub fn assign_interface_index(
    layout: &PlanLayout,
    existing: &[InterfaceBlockEntry],
    net_address: &str,
) -> Result<InterfaceBlockEntry, IpamError> {
    let (interface_index, vlan) = match layout.subnet {
        None => {
            let vlan = parse_cidr(net_address)?.trunc();
            let next = match existing.iter().map(|e| e.interface_index).max() {
                None => 0,
                Some(max) => max
                    .checked_add(1)
                    .ok_or_else(|| IpamError::CapacityExhausted("no free interface index".to_string()))?,
            };
            (next, vlan)
        }
        Some(subnet) => {
            let occupied = sorted_indices(existing.iter().map(|e| e.interface_index));
            let index = probe_index(&occupied, max_index(layout.interface_bits), "interface", |candidate| {
                compute_sub_block(&subnet, candidate, layout.interface_bits).is_ok()
                    && !is_excluded(&subnet, candidate, layout.interface_bits, &layout.excludes)
            })?;
            (index, compute_sub_block(&subnet, index, layout.interface_bits)?)
        }
    };

    debug!("Assigned interface index {} ({}) to {}", interface_index, vlan, net_address);
    Ok(InterfaceBlockEntry {
        net_address: net_address.to_string(),
        interface_index,
        vlan_cidr: vlan.to_string(),
        hosts: Vec::new(),
    })
}

/// Whether a pod block is valid in `entry`'s VLAN block for the plan
fn pod_block_allowed(layout: &PlanLayout, vlan: &Ipv4Net, index: u32, host_ips: &[Ipv4Addr]) -> bool {
    let Ok(block) = compute_sub_block(vlan, index, layout.host_bits) else {
        return false;
    };
    if is_excluded(vlan, index, layout.host_bits, &layout.excludes) {
        return false;
    }
    !(layout.borrows_subnet() && host_ips.iter().any(|ip| block.contains(ip)))
}

/// Assign a host index and pod block in `entry` for a host interface.
///
/// `host_ips` are the primary IPs of every known host; in borrow-subnet
/// mode no pod block may contain one of them.
pub fn assign_host_index(
    entry: &InterfaceBlockEntry,
    layout: &PlanLayout,
    host_name: &str,
    interface_name: &str,
    host_ip: &str,
    host_ips: &[Ipv4Addr],
) -> Result<HostBlockAssignment, IpamError> {
    let vlan = parse_cidr(&entry.vlan_cidr)?.trunc();
    if u32::from(vlan.prefix_len()) + u32::from(layout.host_bits) > 32 {
        return Err(IpamError::CapacityExhausted(format!(
            "{} cannot hold {} host bits",
            entry.vlan_cidr, layout.host_bits
        )));
    }

    let occupied = sorted_indices(entry.hosts.iter().map(|h| h.host_index));
    let host_index = probe_index(&occupied, max_index(layout.host_bits), "host", |candidate| {
        pod_block_allowed(layout, &vlan, candidate, host_ips)
    })
    .map_err(|e| match e {
        IpamError::CapacityExhausted(_) => {
            IpamError::CapacityExhausted(format!("no free host index in {} for {}", entry.vlan_cidr, host_name))
        }
        other => other,
    })?;
    let pod_block = compute_sub_block(&vlan, host_index, layout.host_bits)?;

    debug!("Assigned host index {} ({}) to {}/{}", host_index, pod_block, host_name, interface_name);
    Ok(HostBlockAssignment {
        host_index,
        host_name: host_name.to_string(),
        interface_name: interface_name.to_string(),
        host_ip: host_ip.to_string(),
        pod_cidr: pod_block.to_string(),
    })
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Entries ordered by interface index, hosts ordered by host index
    pub entries: Vec<InterfaceBlockEntry>,

    /// Whether `entries` differ from the input
    pub changed: bool,
}

/// One (host, interface) pair taken from inventory
struct InventoryInterface<'a> {
    host_name: &'a str,
    interface_name: &'a str,
    net_address: &'a str,
    host_ip: &'a str,
}

fn inventory_interfaces<'a>(
    layout: &PlanLayout,
    inventory: &'a BTreeMap<String, HostInterfaceSpec>,
) -> Vec<InventoryInterface<'a>> {
    let mut pairs = Vec::new();
    for (host_name, spec) in inventory {
        let mut seen: Vec<&str> = Vec::new();
        for iface in &spec.interfaces {
            let net = iface.net_address.as_str();
            if net.is_empty() || !layout.allows_net_address(net) {
                continue;
            }
            if seen.contains(&net) {
                debug!("Host {} has several interfaces on {}, using the first", host_name, net);
                continue;
            }
            seen.push(net);
            pairs.push(InventoryInterface {
                host_name,
                interface_name: &iface.interface_name,
                net_address: net,
                host_ip: &iface.host_ip,
            });
        }
    }
    pairs
}

/// Recompute the full assignment of a plan against an inventory snapshot.
///
/// Never fails as a whole: a host or interface that cannot be assigned is
/// logged and skipped, and retried on the next pass. Idempotent for an
/// unchanged inventory.
pub fn reconcile_entries(
    layout: &PlanLayout,
    current: &[InterfaceBlockEntry],
    inventory: &BTreeMap<String, HostInterfaceSpec>,
) -> ReconcileOutcome {
    let pairs = inventory_interfaces(layout, inventory);
    let host_ips: Vec<Ipv4Addr> = inventory
        .values()
        .flat_map(|spec| spec.interfaces.iter())
        .filter_map(|iface| parse_address(&iface.host_ip).ok())
        .collect();

    let mut working: BTreeMap<String, InterfaceBlockEntry> = current
        .iter()
        .map(|entry| (entry.net_address.clone(), entry.clone()))
        .collect();

    // Drop hosts that left, then entries that lost every host
    for entry in working.values_mut() {
        entry.hosts.retain(|host| {
            pairs
                .iter()
                .any(|p| p.host_name == host.host_name && p.net_address == entry.net_address)
        });
    }
    working.retain(|net, entry| {
        layout.allows_net_address(net) && (layout.is_master_net(net) || !entry.hosts.is_empty())
    });

    // VLAN blocks follow the subnet (or the network itself when borrowing);
    // re-home entries whose block became invalid
    if let Some(subnet) = layout.subnet {
        let nets: Vec<String> = working.keys().cloned().collect();
        for net in nets {
            let Some(entry) = working.get(&net) else { continue };
            let index = entry.interface_index;
            let valid = !is_excluded(&subnet, index, layout.interface_bits, &layout.excludes);
            match compute_sub_block(&subnet, index, layout.interface_bits) {
                Ok(vlan) if valid => {
                    if let Some(entry) = working.get_mut(&net) {
                        entry.vlan_cidr = vlan.to_string();
                    }
                }
                _ => {
                    let Some(stale) = working.remove(&net) else { continue };
                    let others: Vec<InterfaceBlockEntry> = working.values().cloned().collect();
                    match assign_interface_index(layout, &others, &net) {
                        Ok(mut entry) => {
                            entry.hosts = stale.hosts;
                            working.insert(net, entry);
                        }
                        Err(e) => warn!("Failed to reassign interface index for {}: {}", net, e),
                    }
                }
            }
        }
    } else {
        working.retain(|net, entry| match parse_cidr(net) {
            Ok(block) => {
                entry.vlan_cidr = block.trunc().to_string();
                true
            }
            Err(e) => {
                warn!("Dropping entry for {}: {}", net, e);
                false
            }
        });
    }

    // Master networks get entries in configured order, even without hosts
    for master in &layout.master_nets {
        if working.contains_key(master) {
            continue;
        }
        let existing: Vec<InterfaceBlockEntry> = working.values().cloned().collect();
        match assign_interface_index(layout, &existing, master) {
            Ok(entry) => {
                working.insert(master.clone(), entry);
            }
            Err(e) => warn!("Failed to assign interface index for {}: {}", master, e),
        }
    }

    for pair in &pairs {
        if !working.contains_key(pair.net_address) {
            let existing: Vec<InterfaceBlockEntry> = working.values().cloned().collect();
            match assign_interface_index(layout, &existing, pair.net_address) {
                Ok(entry) => {
                    working.insert(pair.net_address.to_string(), entry);
                }
                Err(e) => {
                    warn!("Failed to assign interface index for {}: {}", pair.net_address, e);
                    continue;
                }
            }
        }
        let Some(entry) = working.get_mut(pair.net_address) else { continue };
        reconcile_host(layout, entry, pair, &host_ips);
    }

    let mut entries: Vec<InterfaceBlockEntry> = working.into_values().collect();
    for entry in &mut entries {
        entry.hosts.sort_by_key(|h| h.host_index);
    }
    entries.sort_by_key(|e| e.interface_index);

    let changed = entries.as_slice() != current;
    ReconcileOutcome { entries, changed }
}

/// Keep, refresh or (re)assign the pod block of one host interface
fn reconcile_host(layout: &PlanLayout, entry: &mut InterfaceBlockEntry, pair: &InventoryInterface<'_>, host_ips: &[Ipv4Addr]) {
    let vlan = parse_cidr(&entry.vlan_cidr).map(|net| net.trunc());

    if let Some(position) = entry.hosts.iter().position(|h| h.host_name == pair.host_name) {
        let index = entry.hosts[position].host_index;
        let recomputed = match &vlan {
            Ok(vlan) if pod_block_allowed(layout, vlan, index, host_ips) => {
                compute_sub_block(vlan, index, layout.host_bits).ok()
            }
            _ => None,
        };

        match recomputed {
            Some(pod_block) => {
                let host = &mut entry.hosts[position];
                host.pod_cidr = pod_block.to_string();
                host.interface_name = pair.interface_name.to_string();
                host.host_ip = pair.host_ip.to_string();
                return;
            }
            None => {
                debug!(
                    "Pod block of {} in {} is no longer valid, reassigning",
                    pair.host_name, entry.net_address
                );
                entry.hosts.remove(position);
            }
        }
    }

    match assign_host_index(entry, layout, pair.host_name, pair.interface_name, pair.host_ip, host_ips) {
        Ok(host) => entry.hosts.push(host),
        Err(e) => warn!(
            "Failed to assign pod block for {}/{} on {}: {}",
            pair.host_name, pair.interface_name, pair.net_address, e
        ),
    }
}

/// Pool specs the assignment calls for, one per host block, keyed by pool name.
///
/// Pools start without allocations; plan excludes are projected into each
/// pod block.
pub fn desired_pools(
    plan_name: &str,
    layout: &PlanLayout,
    entries: &[InterfaceBlockEntry],
) -> BTreeMap<String, IPPoolSpec> {
    let mut pools = BTreeMap::new();
    for entry in entries {
        for host in &entry.hosts {
            let pod_block = match parse_cidr(&host.pod_cidr) {
                Ok(block) => block,
                Err(e) => {
                    warn!("Skipping pool for {} on {}: {}", host.host_name, entry.net_address, e);
                    continue;
                }
            };
            let excludes = project_excludes(&layout.excludes, &pod_block)
                .iter()
                .map(ToString::to_string)
                .collect();
            pools.insert(
                pool_name(plan_name, &host.pod_cidr),
                IPPoolSpec {
                    pod_cidr: host.pod_cidr.clone(),
                    vlan_cidr: entry.vlan_cidr.clone(),
                    network_name: plan_name.to_string(),
                    host_name: host.host_name.clone(),
                    interface_name: host.interface_name.clone(),
                    excludes,
                    allocations: Vec::new(),
                },
            );
        }
    }
    pools
}

/// Stateful assignment engine of one plan.
///
/// Holds the last persisted entries. A [`PlanPass`] owns the engine for
/// the whole of one reconciliation, persistence included, so at most one
/// pass runs per plan and later triggers queue behind it.
#[derive(Debug, Default)]
pub struct PlanEngine {
    entries: Mutex<Vec<InterfaceBlockEntry>>,
}

impl PlanEngine {
    /// Create an engine seeded with previously persisted entries
    pub fn new(entries: Vec<InterfaceBlockEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Start a pass, waiting for any pass in progress to finish
    pub async fn begin(&self) -> PlanPass<'_> {
        PlanPass {
            entries: self.entries.lock().await,
        }
    }

    /// Run a single reconciliation in its own pass
    pub async fn reconcile(
        &self,
        plan: &AddressPlanSpec,
        inventory: &BTreeMap<String, HostInterfaceSpec>,
    ) -> Result<ReconcileOutcome, IpamError> {
        self.begin().await.reconcile(plan, inventory)
    }

    /// Snapshot of the current entries
    pub async fn entries(&self) -> Vec<InterfaceBlockEntry> {
        self.entries.lock().await.clone()
    }

    /// Roll back to previously persisted entries
    pub async fn restore(&self, entries: Vec<InterfaceBlockEntry>) {
        self.begin().await.restore(entries);
    }
}

/// Exclusive access to a plan's engine for one reconciliation
#[derive(Debug)]
pub struct PlanPass<'a> {
    entries: MutexGuard<'a, Vec<InterfaceBlockEntry>>,
}

impl PlanPass<'_> {
    /// Entries as of the start of this pass (or the last reconcile in it)
    pub fn entries(&self) -> &[InterfaceBlockEntry] {
        &self.entries
    }

    /// Validate the plan and recompute its assignment against `inventory`.
    ///
    /// The new entries replace the engine state when anything changed.
    pub fn reconcile(
        &mut self,
        plan: &AddressPlanSpec,
        inventory: &BTreeMap<String, HostInterfaceSpec>,
    ) -> Result<ReconcileOutcome, IpamError> {
        let layout = validate_plan(plan)?;
        let outcome = reconcile_entries(&layout, &self.entries, inventory);
        if outcome.changed {
            *self.entries = outcome.entries.clone();
        }
        Ok(outcome)
    }

    /// Roll back to previously persisted entries
    pub fn restore(&mut self, entries: Vec<InterfaceBlockEntry>) {
        *self.entries = entries;
    }
}
