//! Link-layer emulation: one UDP socket per virtual interface.
//!
//! An interface owns its bound socket, the subnet it fronts, and a neighbor
//! table sorted by virtual address.  Sending resolves the next hop with a
//! binary search and transmits the serialized datagram in a single
//! `send_to`; receiving is a blocking loop that hands each parsed datagram
//! to the node's worker queue tagged with this interface's address.
//!
//! While an interface is down, the receive loop silently discards and
//! `send` is a no-op.  Shutdown raises a flag and pokes the socket with a
//! zero-length datagram so the blocked `recv_from` wakes and the thread can
//! exit.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::config::{InterfaceConfig, NeighborConfig};
use crate::error::IpError;
use crate::ip::datagram::{Datagram, MAX_DATAGRAM_SIZE};
use crate::types::prefix_len_to_mask;

/// A peer interface reachable on this link.
#[derive(Clone, Debug)]
pub struct Neighbor {
    /// Virtual address of the remote interface.
    pub vip: Ipv4Addr,
    /// UDP endpoint emulating the remote interface.
    pub udp: SocketAddrV4,
}

/// One virtual network interface.
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
    /// Subnet mask in host byte order.
    pub mask: u32,
    /// UDP endpoint this interface is bound to.
    pub udp_bind: SocketAddrV4,
    neighbors: Vec<Neighbor>,
    socket: UdpSocket,
    up: AtomicBool,
    stopping: AtomicBool,
}

impl Interface {
    /// Bind the UDP socket and build the sorted neighbor table.
    pub fn new(config: &InterfaceConfig, peers: &[NeighborConfig]) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.udp_bind)?;
        let mut neighbors: Vec<Neighbor> = peers
            .iter()
            .filter(|p| p.iface == config.name)
            .map(|p| Neighbor {
                vip: p.vip,
                udp: p.udp,
            })
            .collect();
        neighbors.sort_by_key(|n| n.vip);

        Ok(Self {
            name: config.name.clone(),
            addr: config.addr,
            prefix_len: config.prefix_len,
            mask: prefix_len_to_mask(config.prefix_len),
            udp_bind: config.udp_bind,
            neighbors,
            socket,
            up: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
        })
    }

    /// Transmit `datagram` to the neighbor owning `next_hop`.
    ///
    /// A no-op while the interface is down.  An unknown next hop is logged
    /// and reported as [`IpError::UnknownNextHop`].
    pub fn send(&self, datagram: &Datagram, next_hop: Ipv4Addr) -> Result<usize, IpError> {
        if !self.is_up() {
            return Ok(0);
        }
        let index = match self.neighbors.binary_search_by_key(&next_hop, |n| n.vip) {
            Ok(index) => index,
            Err(_) => {
                warn!("iface {}: no neighbor for next hop {next_hop}, dropping", self.name);
                return Err(IpError::UnknownNextHop(next_hop));
            }
        };
        let wire = datagram.encode();
        let sent = self.socket.send_to(&wire, self.neighbors[index].udp)?;
        Ok(sent)
    }

    /// Spawn the blocking receive loop.
    ///
    /// Every parsed datagram is handed to `submit` together with this
    /// interface's virtual address.
    pub fn start<F>(self: &Arc<Self>, submit: F) -> JoinHandle<()>
    where
        F: Fn(Datagram, Ipv4Addr) + Send + 'static,
    {
        let iface = Arc::clone(self);
        thread::Builder::new()
            .name(format!("iface-{}", iface.name))
            .spawn(move || {
                let mut buf = [0u8; MAX_DATAGRAM_SIZE];
                loop {
                    let n = match iface.socket.recv_from(&mut buf) {
                        Ok((n, _)) => n,
                        Err(e) => {
                            if !iface.stopping.load(Ordering::Acquire) {
                                warn!("iface {}: recv error: {e}", iface.name);
                            }
                            break;
                        }
                    };
                    if iface.stopping.load(Ordering::Acquire) {
                        break;
                    }
                    if !iface.is_up() {
                        continue; // silently discard while down
                    }
                    match Datagram::decode(&buf[..n]) {
                        Ok(datagram) => submit(datagram, iface.addr),
                        Err(e) => debug!("iface {}: dropping unparsable datagram: {e}", iface.name),
                    }
                }
            })
            .expect("failed to spawn interface thread")
    }

    /// Administratively raise or lower the interface.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
        info!("iface {} is {}", self.name, if up { "up" } else { "down" });
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Neighbor table, sorted by virtual address.
    pub fn neighbors(&self) -> &[Neighbor] {
        &self.neighbors
    }

    /// Unblock and terminate the receive loop.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);
        // A zero-length datagram to our own endpoint wakes the blocked recv.
        let _ = self.socket.send_to(&[], self.udp_bind);
    }
}
