//! Error taxonomy shared across the node.
//!
//! The TCP side uses [`SocketError`] exclusively; every blocking socket API
//! reports shutdown as `Closing`, retransmit exhaustion as `Timeout`, and an
//! abort observed from `connect` as `Reset`.  The IP side carries a small
//! string-keyed [`IpError`] for wire malformations and routing misses.

use std::net::Ipv4Addr;

use thiserror::Error;

/// Errors surfaced by the socket API.
///
/// One variant per caller-visible condition.  Wire-level malformations never
/// reach applications; they are dropped with a log line at the IP/TCP demux
/// layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SocketError {
    /// The connection is closing or the socket was shut down mid-call.
    #[error("connection closing")]
    Closing,
    /// Retransmission limit exceeded.
    #[error("operation timed out")]
    Timeout,
    /// The connection was aborted.
    #[error("connection reset")]
    Reset,
    /// No socket with the given id / session / port exists.
    #[error("connection does not exist")]
    NotFound,
    /// A socket for the given session or port already exists.
    #[error("connection already exists")]
    Duplicate,
    /// The socket id pool is exhausted.
    #[error("insufficient resources")]
    Exhausted,
    /// The operation is not valid in the socket's current state.
    #[error("operation not allowed")]
    NotAllowed,
    /// Reserved for states the deployed stack never services.
    #[error("not yet implemented")]
    Unimplemented,
}

/// Errors on the IP side: parse failures, routing misses, link I/O.
#[derive(Debug, Error)]
pub enum IpError {
    /// A datagram or payload failed structural validation.
    #[error("malformed datagram: {0}")]
    Malformed(String),
    /// The routing table has no entry covering the destination.
    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),
    /// The next hop is not a known neighbor of the chosen interface.
    #[error("no neighbor for next hop {0}")]
    UnknownNextHop(Ipv4Addr),
    /// The underlying UDP socket failed.
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
}
