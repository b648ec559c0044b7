//! CIDR prefix arithmetic for prefix allocation and loopback derivation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// A network: address plus prefix length.
pub type CidrNetwork = (IpAddr, u8);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrefixError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

fn addr_width(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn to_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u32::from(*a) as u128,
        IpAddr::V6(a) => u128::from(*a),
    }
}

fn from_bits(bits: u128, template: &IpAddr) -> IpAddr {
    match template {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

fn network_bits(net: &CidrNetwork) -> u128 {
    let width = addr_width(&net.0);
    let bits = to_bits(&net.0);
    if net.1 == 0 {
        0
    } else {
        // Left-justified mask of net.1 bits within the address width.
        let mask = (u128::MAX << (128 - net.1 as u32)) >> (128 - width as u32);
        bits & mask
    }
}

/// Carve the `index`-th sub-prefix of length `alloc_len` out of
/// `seed`, placing `index` in the bits between the seed length and
/// `alloc_len`.
///
/// Fails when `alloc_len` does not leave room below the seed prefix,
/// exceeds the address width, or when `index` does not fit in the
/// available bits.
pub fn nth_prefix(
    seed: &CidrNetwork,
    alloc_len: u8,
    index: u32,
) -> Result<CidrNetwork, PrefixError> {
    let width = addr_width(&seed.0);
    if seed.1 > width {
        return Err(PrefixError::InvalidArgument(format!(
            "seed prefix length {} exceeds address width {}",
            seed.1, width
        )));
    }
    if alloc_len <= seed.1 || alloc_len > width {
        return Err(PrefixError::InvalidArgument(format!(
            "allocation length {} outside ({}, {}]",
            alloc_len, seed.1, width
        )));
    }

    let free_bits = (alloc_len - seed.1) as u32;
    if free_bits < 32 && u64::from(index) >= 1u64 << free_bits {
        return Err(PrefixError::InvalidArgument(format!(
            "prefix index {} does not fit in {} bits",
            index, free_bits
        )));
    }

    let base = network_bits(seed);
    let bits = base | ((index as u128) << (width - alloc_len) as u32);
    Ok((from_bits(bits, &seed.0), alloc_len))
}

/// The address used for a node loopback inside `net`: the network
/// address itself for host routes, the network address plus one
/// otherwise.
pub fn loopback_address(net: &CidrNetwork) -> IpAddr {
    let width = addr_width(&net.0);
    let base = network_bits(net);
    if net.1 >= width {
        from_bits(base, &net.0)
    } else {
        from_bits(base + 1, &net.0)
    }
}

/// Count the leading set bits of a contiguous, left-justified netmask.
///
/// Behavior on non-contiguous masks is undefined; callers must not
/// supply them.
pub fn mask_to_prefix_len(mask: &IpAddr) -> u8 {
    match mask {
        IpAddr::V4(a) => u32::from(*a).leading_ones() as u8,
        IpAddr::V6(a) => u128::from(*a).leading_ones() as u8,
    }
}
