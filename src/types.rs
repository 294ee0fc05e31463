//! Type-safe primitives shared by the IP and TCP layers.
//!
//! Addresses are [`std::net::Ipv4Addr`]; subnet masks travel as host-order
//! `u32` values so the prefix math reads as plain bit operations.  An
//! [`Endpoint`] pairs an address with a port and orders by address first,
//! then port.

use std::fmt;
use std::net::Ipv4Addr;

// =============================================================================
// IP protocol numbers
// =============================================================================

/// IP protocol number field values carried by this internetwork.
///
/// Pattern matching on this enum replaces raw `0` / `6` / `200` comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpProtocol {
    /// Test protocol (`0`); the payload is a human-readable message.
    Test = 0,
    /// TCP (`6`).
    Tcp = 6,
    /// RIP (`200`).
    Rip = 200,
}

impl IpProtocol {
    /// Parse from a raw `u8` value.  Returns `None` for unknown protocols.
    #[inline]
    pub const fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::Test),
            6 => Some(Self::Tcp),
            200 => Some(Self::Rip),
            _ => None,
        }
    }

    /// Return the raw `u8` value.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => write!(f, "TEST"),
            Self::Tcp => write!(f, "TCP"),
            Self::Rip => write!(f, "RIP"),
        }
    }
}

// =============================================================================
// Endpoint
// =============================================================================

/// A virtual address plus port, identifying one side of a TCP session.
///
/// Ordering compares the address first and the port second, which keeps
/// neighbor tables and session tuples deterministic.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    #[inline]
    pub const fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

// =============================================================================
// Subnet math
// =============================================================================

/// Convert a prefix length (0–32) to a host-order `u32` network mask.
///
/// E.g. `prefix_len_to_mask(24)` → `0xFFFF_FF00`.
#[inline]
pub fn prefix_len_to_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

/// Number of leading one bits in a host-order mask.
#[inline]
pub fn mask_to_prefix_len(mask: u32) -> u8 {
    mask.leading_ones() as u8
}

/// `true` if `a` and `b` fall in the same subnet under `mask` (host order).
#[inline]
pub fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, mask: u32) -> bool {
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

/// Parse `a.b.c.d/n` into `(address, mask, prefix_len)`.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u32, u8), String> {
    let (addr_str, len_str) = cidr
        .split_once('/')
        .ok_or_else(|| format!("invalid CIDR {cidr:?}: missing '/'"))?;
    let addr: Ipv4Addr = addr_str
        .parse()
        .map_err(|_| format!("invalid CIDR {cidr:?}: bad address"))?;
    let prefix_len: u8 = len_str
        .parse()
        .map_err(|_| format!("invalid CIDR {cidr:?}: bad prefix length"))?;
    if prefix_len > 32 {
        return Err(format!("invalid CIDR {cidr:?}: prefix length > 32"));
    }
    Ok((addr, prefix_len_to_mask(prefix_len), prefix_len))
}
