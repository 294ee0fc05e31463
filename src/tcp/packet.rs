//! TCP segment codec and the session tuple.
//!
//! Segments carry a 20-byte header naked of options; a received header
//! advertising options is accepted only if every option byte is zero, and
//! rejected otherwise.  The checksum covers the 12-byte IPv4 pseudo-header
//! (src, dst, protocol 6, segment length) plus header and payload, per
//! RFC 793.

use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;

use crate::error::IpError;
use crate::types::Endpoint;

use super::{TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_SYN};

/// Length of the TCP header (no options).
pub const TCP_HEADER_LEN: usize = 20;

/// Initial advertised window before a receive buffer exists.
pub const INIT_WINDOW_SIZE: u16 = u16::MAX;

const ACK_DONT_CARE: u32 = 0;

// =============================================================================
// Session tuple
// =============================================================================

/// The pair of endpoints identifying one non-listening connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionTuple {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl SessionTuple {
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    /// The same session as seen from the other end.
    pub const fn swapped(&self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

/// Boost-style mixer; the default derived tuple hash is deliberately not
/// relied on.
fn hash_combine(seed: &mut u64, value: u64) {
    *seed ^= value
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

impl Hash for SessionTuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut seed = 0u64;
        hash_combine(&mut seed, u32::from(self.local.addr) as u64);
        hash_combine(&mut seed, u32::from(self.remote.addr) as u64);
        let ports = ((self.local.port as u64) << 16) | self.remote.port as u64;
        hash_combine(&mut seed, ports);
        state.write_u64(seed);
    }
}

// =============================================================================
// Header
// =============================================================================

/// Parsed TCP header, host byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
}

impl TcpHeader {
    #[inline]
    pub const fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    #[inline]
    pub const fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    #[inline]
    pub const fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }
}

// =============================================================================
// Packet
// =============================================================================

/// A TCP segment: header plus owned payload.
#[derive(Clone, Debug)]
pub struct TcpPacket {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

impl TcpPacket {
    // --- Constructors for the segments this stack emits ---------------------

    /// `SYN` opening a connection.
    pub fn syn(tuple: &SessionTuple, seq: u32, window: u16) -> Self {
        Self::build(tuple, TCP_FLAG_SYN, seq, ACK_DONT_CARE, window, Vec::new())
    }

    /// `SYN|ACK` answering a connection request.
    pub fn syn_ack(tuple: &SessionTuple, seq: u32, ack: u32, window: u16) -> Self {
        Self::build(
            tuple,
            TCP_FLAG_SYN | TCP_FLAG_ACK,
            seq,
            ack,
            window,
            Vec::new(),
        )
    }

    /// `ACK`, optionally carrying data.
    pub fn ack(tuple: &SessionTuple, seq: u32, ack: u32, window: u16, payload: Vec<u8>) -> Self {
        Self::build(tuple, TCP_FLAG_ACK, seq, ack, window, payload)
    }

    /// `FIN` closing our side.
    pub fn fin(tuple: &SessionTuple, seq: u32, window: u16) -> Self {
        Self::build(tuple, TCP_FLAG_FIN, seq, ACK_DONT_CARE, window, Vec::new())
    }

    fn build(
        tuple: &SessionTuple,
        flags: u8,
        seq: u32,
        ack: u32,
        window: u16,
        payload: Vec<u8>,
    ) -> Self {
        let mut packet = Self {
            header: TcpHeader {
                src_port: tuple.local.port,
                dst_port: tuple.remote.port,
                seq,
                ack,
                flags,
                window,
                checksum: 0,
            },
            payload,
        };
        packet.header.checksum = packet.compute_checksum(tuple.local.addr, tuple.remote.addr);
        packet
    }

    // --- Accessors ----------------------------------------------------------

    #[inline]
    pub fn seq(&self) -> u32 {
        self.header.seq
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// One past the last sequence number this segment's payload occupies.
    #[inline]
    pub fn end_seq(&self) -> u32 {
        self.header.seq.wrapping_add(self.payload.len() as u32)
    }

    // --- Codec --------------------------------------------------------------

    /// Serialize header + payload with the stored checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; TCP_HEADER_LEN + self.payload.len()];
        let h = &self.header;
        out[0..2].copy_from_slice(&h.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&h.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&h.seq.to_be_bytes());
        out[8..12].copy_from_slice(&h.ack.to_be_bytes());
        out[12] = 5 << 4; // data offset 5, no options
        out[13] = h.flags & 0x3F;
        out[14..16].copy_from_slice(&h.window.to_be_bytes());
        out[16..18].copy_from_slice(&h.checksum.to_be_bytes());
        // urgent pointer stays zero
        out[TCP_HEADER_LEN..].copy_from_slice(&self.payload);
        out
    }

    /// Parse a segment delivered inside an IP payload.
    ///
    /// `src` and `dst` are the IP-layer addresses, needed for the
    /// pseudo-header.  Rejects short headers, nonzero option bytes, and
    /// checksum mismatches.
    pub fn decode(src: Ipv4Addr, dst: Ipv4Addr, data: &[u8]) -> Result<Self, IpError> {
        if data.len() < TCP_HEADER_LEN {
            return Err(IpError::Malformed(format!(
                "TCP segment of {} bytes is shorter than the header",
                data.len()
            )));
        }
        let data_offset = (data[12] >> 4) as usize;
        if !(5..=15).contains(&data_offset) {
            return Err(IpError::Malformed(format!(
                "invalid TCP data offset {data_offset}"
            )));
        }
        let header_len = data_offset * 4;
        if data.len() < header_len {
            return Err(IpError::Malformed(
                "TCP data offset exceeds the segment".into(),
            ));
        }
        // Options are unsupported; a header longer than 20 bytes must be all
        // zero padding.
        if data[TCP_HEADER_LEN..header_len].iter().any(|&b| b != 0) {
            return Err(IpError::Malformed("TCP options are not supported".into()));
        }

        let header = TcpHeader {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: data[13] & 0x3F,
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
        };

        if !verify_checksum(src, dst, data) {
            return Err(IpError::Malformed("bad TCP checksum".into()));
        }

        Ok(Self {
            header,
            payload: data[header_len..].to_vec(),
        })
    }

    /// Compute the checksum this packet should carry between `src` and `dst`.
    pub fn compute_checksum(&self, src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
        let mut zeroed = self.clone();
        zeroed.header.checksum = 0;
        tcp_checksum(src, dst, &zeroed.encode())
    }
}

// =============================================================================
// Checksum
// =============================================================================

/// One's-complement sum over a byte slice.
fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut i = 0usize;
    while i + 1 < data.len() {
        sum = sum.wrapping_add(u16::from_be_bytes([data[i], data[i + 1]]) as u32);
        i += 2;
    }
    if i < data.len() {
        sum = sum.wrapping_add((data[i] as u32) << 8);
    }
    sum
}

fn fold_checksum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, tcp_len: usize) -> u32 {
    let s = src.octets();
    let d = dst.octets();
    let mut sum = 0u32;
    sum = sum.wrapping_add(u16::from_be_bytes([s[0], s[1]]) as u32);
    sum = sum.wrapping_add(u16::from_be_bytes([s[2], s[3]]) as u32);
    sum = sum.wrapping_add(u16::from_be_bytes([d[0], d[1]]) as u32);
    sum = sum.wrapping_add(u16::from_be_bytes([d[2], d[3]]) as u32);
    sum = sum.wrapping_add(6); // protocol
    sum.wrapping_add(tcp_len as u32)
}

/// Checksum over pseudo-header + segment (checksum field must be zero).
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, segment.len()).wrapping_add(ones_complement_sum(segment));
    fold_checksum(sum)
}

/// `true` if a received segment's checksum folds to zero.
pub fn verify_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    let sum = pseudo_header_sum(src, dst, segment.len()).wrapping_add(ones_complement_sum(segment));
    fold_checksum(sum) == 0
}
