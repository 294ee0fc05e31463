//! The TCP stack: packet codec, buffers, retransmission, sockets, demux.

pub mod buffers;
pub mod intervals;
pub mod packet;
pub mod retransmit;
pub mod ring;
pub mod socket;
pub mod stack;

use std::time::Duration;

// =============================================================================
// Constants
// =============================================================================

/// Size of the per-connection send ring.
pub const SEND_BUFFER_SIZE: usize = u16::MAX as usize;

/// Size of the per-connection receive ring.
pub const RECV_BUFFER_SIZE: usize = u16::MAX as usize;

/// Maximum TCP payload per segment: 1400 (link) − 20 (IP) − 20 (TCP).
pub const MAX_TCP_PAYLOAD: usize = 1360;

/// Retransmissions allowed before the connection is abandoned.
pub const MAX_RETRANSMISSIONS: u32 = 5;

/// Period of the per-connection retransmission scan.
pub const RETRANSMIT_SCAN_PERIOD: Duration = Duration::from_millis(250);

/// Period of the socket reaper.
pub const REAPER_PERIOD: Duration = Duration::from_secs(1);

/// How long a socket lingers in TIME_WAIT.
pub const TIME_WAIT_DURATION: Duration = Duration::from_secs(10);

/// Largest socket id; ids are drawn from `1..=MAX_SOCKET_ID`.
pub const MAX_SOCKET_ID: u32 = 128;

/// Capacity of a listener's pending (SYN_RECEIVED) list.
pub const MAX_PENDING_CONNS: usize = 64;

/// Lowest ephemeral port the allocator draws.
pub const EPHEMERAL_PORT_MIN: u16 = 1024;

// ---------------------------------------------------------------------------
// TCP flag bits
// ---------------------------------------------------------------------------

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

// =============================================================================
// Sequence-number arithmetic (mod 2^32)
// =============================================================================

/// `a < b` in sequence space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// `a > b` in sequence space.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// `a >= b` in sequence space.
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    a == b || seq_gt(a, b)
}

#[cfg(test)]
mod intervals_tests;
#[cfg(test)]
mod retransmit_tests;
#[cfg(test)]
mod stack_tests;
