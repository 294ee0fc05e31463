//! IPv4 datagram codec.
//!
//! A datagram is a 20-byte header naked of options plus a payload.  All
//! multi-byte fields are stored in host byte order after parsing; the wire
//! form is big-endian.  The checksum is the RFC 791 one's-complement sum
//! over the header with the checksum field zeroed.

use std::net::Ipv4Addr;

use crate::error::IpError;
use crate::types::IpProtocol;

/// Length of the IPv4 header (no options).
pub const IPV4_HEADER_LEN: usize = 20;

/// Maximum size of a whole datagram on an emulated link.
pub const MAX_DATAGRAM_SIZE: usize = 1400;

/// Maximum payload a datagram can carry.
pub const MAX_IP_PAYLOAD: usize = MAX_DATAGRAM_SIZE - IPV4_HEADER_LEN;

/// Initial TTL for every datagram this node originates.
pub const INIT_TTL: u8 = 16;

// =============================================================================
// Header
// =============================================================================

/// Parsed IPv4 header.
///
/// `version` is always 4 and `ihl` always 5 on the wire; parse rejects
/// anything else, so they are not stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub total_len: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Serialize into `out[..IPV4_HEADER_LEN]` with the stored checksum.
    pub fn write(&self, out: &mut [u8]) {
        out[0] = 0x45; // version 4, ihl 5
        out[1] = 0; // TOS
        out[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        out[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
        out[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags + fragment offset
        out[8] = self.ttl;
        out[9] = self.protocol;
        out[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
    }

    /// Compute the header checksum (checksum field treated as zero).
    pub fn compute_checksum(&self) -> u16 {
        let mut bytes = [0u8; IPV4_HEADER_LEN];
        let mut zeroed = *self;
        zeroed.checksum = 0;
        zeroed.write(&mut bytes);
        header_checksum(&bytes)
    }
}

/// One's-complement sum over a 20-byte header slice.
pub fn header_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut i = 0usize;
    while i + 1 < header.len() {
        let word = u16::from_be_bytes([header[i], header[i + 1]]) as u32;
        sum = sum.wrapping_add(word);
        i += 2;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

// =============================================================================
// Datagram
// =============================================================================

/// An IPv4 datagram: header plus owned payload.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub header: Ipv4Header,
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Build an outbound datagram with TTL [`INIT_TTL`] and a valid checksum.
    ///
    /// Fails if the payload exceeds [`MAX_IP_PAYLOAD`].
    pub fn new(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        payload: Vec<u8>,
    ) -> Result<Self, IpError> {
        if payload.len() > MAX_IP_PAYLOAD {
            return Err(IpError::Malformed(format!(
                "payload of {} bytes exceeds the {MAX_IP_PAYLOAD}-byte limit",
                payload.len()
            )));
        }
        let mut header = Ipv4Header {
            total_len: (IPV4_HEADER_LEN + payload.len()) as u16,
            ttl: INIT_TTL,
            protocol: protocol.as_u8(),
            checksum: 0,
            src,
            dst,
        };
        header.checksum = header.compute_checksum();
        Ok(Self { header, payload })
    }

    /// Parse a datagram from raw link bytes.
    ///
    /// Validates version, header length, and total length; the checksum is
    /// *not* validated here; the worker calls [`checksum_ok`](Self::checksum_ok)
    /// so a corrupt datagram can be logged with its parsed addresses.
    pub fn decode(data: &[u8]) -> Result<Self, IpError> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(IpError::Malformed(format!(
                "datagram of {} bytes is shorter than the header",
                data.len()
            )));
        }
        let version = data[0] >> 4;
        let ihl = data[0] & 0x0F;
        if version != 4 {
            return Err(IpError::Malformed(format!("version {version} is not 4")));
        }
        if ihl != 5 {
            return Err(IpError::Malformed(format!(
                "header length {ihl} (options are not supported)"
            )));
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]);
        if (total_len as usize) < IPV4_HEADER_LEN || (total_len as usize) > data.len() {
            return Err(IpError::Malformed(format!(
                "total length {total_len} does not fit the {}-byte read",
                data.len()
            )));
        }

        let header = Ipv4Header {
            total_len,
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        };
        let payload = data[IPV4_HEADER_LEN..total_len as usize].to_vec();
        Ok(Self { header, payload })
    }

    /// Serialize header + payload into one contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; IPV4_HEADER_LEN + self.payload.len()];
        self.header.write(&mut out[..IPV4_HEADER_LEN]);
        out[IPV4_HEADER_LEN..].copy_from_slice(&self.payload);
        out
    }

    /// `true` if the stored checksum matches the header contents.
    pub fn checksum_ok(&self) -> bool {
        self.header.checksum == self.header.compute_checksum()
    }

    /// Recompute the checksum after a header mutation (TTL decrement).
    pub fn update_checksum(&mut self) {
        self.header.checksum = self.header.compute_checksum();
    }

    #[inline]
    pub fn ttl(&self) -> u8 {
        self.header.ttl
    }

    #[inline]
    pub fn src(&self) -> Ipv4Addr {
        self.header.src
    }

    #[inline]
    pub fn dst(&self) -> Ipv4Addr {
        self.header.dst
    }

    /// The parsed protocol, or `None` for numbers this node does not carry.
    #[inline]
    pub fn protocol(&self) -> Option<IpProtocol> {
        IpProtocol::from_u8(self.header.protocol)
    }
}
