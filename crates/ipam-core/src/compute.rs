//! # CIDR Arithmetic
//!
//! Pure functions over IPv4 blocks: the N-th sub-block of a base block,
//! tabu (excluded) sub-block detection, address/offset mapping and index
//! gap search. No I/O and no shared state.

use crate::error::IpamError;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Parse an IPv4 CIDR string (host bits are kept as given)
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, IpamError> {
    cidr.trim()
        .parse::<Ipv4Net>()
        .map_err(|e| IpamError::InvalidCidr(format!("{}: {}", cidr, e)))
}

/// Parse an IPv4 address, accepting an optional `/prefix` suffix
pub fn parse_address(address: &str) -> Result<Ipv4Addr, IpamError> {
    let ip = address.trim().split('/').next().unwrap_or_default();
    ip.parse::<Ipv4Addr>()
        .map_err(|e| IpamError::InvalidCidr(format!("{}: {}", address, e)))
}

/// Largest index representable in `bits` bits
pub fn max_index(bits: u8) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Computes the `index`-th sub-block of `base` using the `block_bits`-wide
/// field that follows the base prefix.
///
/// The base prefix bits are never touched; host bits of `base` are ignored.
///
/// # Errors
///
/// * `OutOfRange` if `index` does not fit in `block_bits`
/// * `MaskViolation` if the resulting prefix would exceed 32 bits or the
///   result left the base network
pub fn compute_sub_block(base: &Ipv4Net, index: u32, block_bits: u8) -> Result<Ipv4Net, IpamError> {
    let new_prefix = u32::from(base.prefix_len()) + u32::from(block_bits);
    if new_prefix > 32 {
        return Err(IpamError::MaskViolation(format!(
            "{} cannot be split by {} more bits",
            base, block_bits
        )));
    }

    let max = u64::from(max_index(block_bits));
    if u64::from(index) > max {
        return Err(IpamError::OutOfRange {
            index: u64::from(index),
            max,
        });
    }

    let shift = 32 - new_prefix;
    let value = u64::from(u32::from(base.network())) | (u64::from(index) << shift);
    let value = u32::try_from(value)
        .map_err(|_| IpamError::MaskViolation(format!("{} index {} overflows", base, index)))?;

    // new_prefix <= 32 was checked above
    let block = Ipv4Net::new(Ipv4Addr::from(value), new_prefix as u8)
        .map_err(|e| IpamError::MaskViolation(e.to_string()))?;

    if base.trunc().contains(&block.network()) {
        Ok(block)
    } else {
        Err(IpamError::MaskViolation(format!("{} escaped base {}", block, base)))
    }
}

/// Whether the `index`-th sub-block of `base` falls into an excluded range.
///
/// Only excludes at least as coarse as the sub-block count; finer excludes
/// are handled at address level inside the pool. A sub-block that cannot
/// be computed is reported as not excluded.
pub fn is_excluded(base: &Ipv4Net, index: u32, block_bits: u8, excludes: &[Ipv4Net]) -> bool {
    let Ok(block) = compute_sub_block(base, index, block_bits) else {
        return false;
    };
    let network = block.network();
    excludes
        .iter()
        .any(|exclude| exclude.prefix_len() <= block.prefix_len() && exclude.contains(&network))
}

/// Offset of `address` from the network address of `block`, if it lies inside
pub fn offset_of(block: &Ipv4Net, address: Ipv4Addr) -> Option<u32> {
    let block = block.trunc();
    block
        .contains(&address)
        .then(|| u32::from(address) - u32::from(block.network()))
}

/// Address at `offset` from the network address of `block`, if it lies inside
pub fn address_at(block: &Ipv4Net, offset: u32) -> Option<Ipv4Addr> {
    let block = block.trunc();
    let address = Ipv4Addr::from(u32::from(block.network()).checked_add(offset)?);
    block.contains(&address).then_some(address)
}

/// Highest usable pod offset of a block (network and broadcast excluded)
pub fn max_pod_offset(block: &Ipv4Net) -> u32 {
    let host_bits = 32 - u32::from(block.prefix_len());
    let size = 1u64 << host_bits;
    u32::try_from(size.saturating_sub(2)).unwrap_or(u32::MAX)
}

/// Smallest free value `>= left_bound + base` in a sorted, duplicate-free
/// slice of occupied indices.
///
/// Returns `None` when the slice is empty or packed from that point on;
/// callers then append after the last occupied value. Runs in O(log n).
pub fn find_gap(occupied: &[u32], left_bound: u32, base: u32) -> Option<u32> {
    let (&first, &last) = (occupied.first()?, occupied.last()?);
    let start = i64::from(left_bound) + i64::from(base);
    let span = i64::from(last) - i64::from(left_bound);
    if span == occupied.len() as i64 - 1 + i64::from(base) {
        return None;
    }
    if i64::from(first) != start {
        return u32::try_from(start).ok();
    }

    let mid = occupied.len() / 2;
    find_gap(&occupied[..mid], left_bound, base)
        .or_else(|| find_gap(&occupied[mid..], left_bound + mid as u32, base))
}

/// Plan excludes that are strictly finer than `pod_block` and start inside it
pub fn project_excludes(excludes: &[Ipv4Net], pod_block: &Ipv4Net) -> Vec<Ipv4Net> {
    let pod_block = pod_block.trunc();
    excludes
        .iter()
        .filter(|exclude| {
            exclude.prefix_len() > pod_block.prefix_len() && pod_block.contains(&exclude.network())
        })
        .map(Ipv4Net::trunc)
        .collect()
}

/// Offsets of `pod_block` covered by `excludes`, capped at `max_offset`
pub fn excluded_offsets(pod_block: &Ipv4Net, excludes: &[Ipv4Net], max_offset: u32) -> Vec<u32> {
    let mut offsets = Vec::new();
    for exclude in excludes {
        let Some(start) = offset_of(pod_block, exclude.network()) else {
            continue;
        };
        let end = offset_of(pod_block, exclude.broadcast()).unwrap_or(max_offset);
        offsets.extend(start..=end.min(max_offset));
    }
    offsets
}
