//! RIP: wire codec and the router's distance-vector engine.
//!
//! The wire form is big-endian: `{u16 command, u16 n_entries,
//! n x {u32 cost, u32 addr, u32 mask}}`.  Decoding charges the link cost by
//! incrementing every received cost by one, clamped at [`RIP_INFINITY`].
//! Encoding applies split horizon with poisoned reverse: a route whose
//! recorded gateway equals the destination peer goes out with cost 16.
//!
//! The engine owns the router's periodic threads: a full-table broadcast
//! every 5 s and a cleaner every 500 ms that expires routes not refreshed
//! for 12 s.  Route changes from any source (receive, expiry, interface
//! toggles) are broadcast immediately as triggered updates.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::IpError;
use crate::ip::datagram::Datagram;
use crate::node::Node;
use crate::types::IpProtocol;
use crate::util::PeriodicTask;

/// Cost denoting an unreachable route.
pub const RIP_INFINITY: u32 = 16;

/// Full-table broadcast period.
pub const RIP_BROADCAST_PERIOD: Duration = Duration::from_secs(5);

/// Period of the stale-route cleaner.
pub const RIP_CLEANER_PERIOD: Duration = Duration::from_millis(500);

/// A RIP route is dropped when not refreshed for this long.
pub const RIP_EXPIRY: Duration = Duration::from_secs(12);

/// Delay before the initial request broadcast.
pub const RIP_STARTUP_DELAY: Duration = Duration::from_millis(200);

const RIP_HEADER_LEN: usize = 4;
const RIP_ENTRY_LEN: usize = 12;

// =============================================================================
// Wire format
// =============================================================================

/// RIP command field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RipCommand {
    Request = 1,
    Response = 2,
}

/// One advertised route.  All fields are host byte order; `addr`/`mask` are
/// the raw 32-bit subnet values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RipEntry {
    pub cost: u32,
    pub addr: u32,
    pub mask: u32,
}

/// A RIP message plus, on the send side, the gateway each entry was learned
/// from.  The encoder poisons entry `i` when `learned_from[i]` equals the
/// destination peer.
#[derive(Clone, Debug)]
pub struct RipMessage {
    pub command: RipCommand,
    pub entries: Vec<RipEntry>,
    pub learned_from: Vec<Option<Ipv4Addr>>,
}

impl RipMessage {
    /// An empty request for the peers' full tables.
    pub fn request() -> Self {
        Self {
            command: RipCommand::Request,
            entries: Vec::new(),
            learned_from: Vec::new(),
        }
    }

    /// A response advertising `entries`.  `learned_from` must be parallel to
    /// `entries`.
    pub fn response(entries: Vec<RipEntry>, learned_from: Vec<Option<Ipv4Addr>>) -> Self {
        debug_assert_eq!(entries.len(), learned_from.len());
        Self {
            command: RipCommand::Response,
            entries,
            learned_from,
        }
    }

    /// `true` if a response carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a received payload, charging the one-hop link cost.
    pub fn decode(payload: &[u8]) -> Result<Self, IpError> {
        if payload.len() < RIP_HEADER_LEN {
            return Err(IpError::Malformed("RIP payload shorter than header".into()));
        }
        let command = match u16::from_be_bytes([payload[0], payload[1]]) {
            1 => RipCommand::Request,
            2 => RipCommand::Response,
            other => {
                return Err(IpError::Malformed(format!("unknown RIP command {other}")));
            }
        };
        let n_entries = u16::from_be_bytes([payload[2], payload[3]]) as usize;
        if payload.len() < RIP_HEADER_LEN + n_entries * RIP_ENTRY_LEN {
            return Err(IpError::Malformed(format!(
                "RIP payload truncated: {} bytes for {n_entries} entries",
                payload.len()
            )));
        }

        let mut entries = Vec::with_capacity(n_entries);
        for i in 0..n_entries {
            let base = RIP_HEADER_LEN + i * RIP_ENTRY_LEN;
            let field = |off: usize| {
                u32::from_be_bytes([
                    payload[base + off],
                    payload[base + off + 1],
                    payload[base + off + 2],
                    payload[base + off + 3],
                ])
            };
            entries.push(RipEntry {
                cost: field(0).saturating_add(1).min(RIP_INFINITY),
                addr: field(4),
                mask: field(8),
            });
        }
        let learned_from = vec![None; entries.len()];
        Ok(Self {
            command,
            entries,
            learned_from,
        })
    }

    /// Serialize for transmission to `dest`, applying poisoned reverse.
    pub fn encode_for(&self, dest: Ipv4Addr) -> Vec<u8> {
        let mut out = Vec::with_capacity(RIP_HEADER_LEN + self.entries.len() * RIP_ENTRY_LEN);
        out.extend_from_slice(&(self.command as u16).to_be_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let poisoned = self.learned_from.get(i).copied().flatten() == Some(dest);
            let cost = if poisoned { RIP_INFINITY } else { entry.cost };
            out.extend_from_slice(&cost.to_be_bytes());
            out.extend_from_slice(&entry.addr.to_be_bytes());
            out.extend_from_slice(&entry.mask.to_be_bytes());
        }
        out
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The router's RIP driver: periodic broadcasts, expiry, triggered updates.
pub struct RipEngine {
    node: Weak<Node>,
    neighbors: Vec<Ipv4Addr>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl RipEngine {
    /// Spawn the engine for `node`, advertising to `neighbors`.
    ///
    /// Sends the initial request roughly [`RIP_STARTUP_DELAY`] after start,
    /// then runs the 5 s broadcaster and the 500 ms cleaner until dropped.
    pub fn start(node: &Arc<Node>, neighbors: Vec<Ipv4Addr>) -> Arc<Self> {
        let engine = Arc::new(Self {
            node: Arc::downgrade(node),
            neighbors,
            tasks: Mutex::new(Vec::new()),
        });

        let starter = Arc::clone(&engine);
        thread::Builder::new()
            .name("rip-request".into())
            .spawn(move || {
                thread::sleep(RIP_STARTUP_DELAY);
                starter.broadcast(&RipMessage::request());
            })
            .expect("failed to spawn RIP request thread");

        let broadcaster = Arc::clone(&engine);
        let broadcast_task = PeriodicTask::spawn("rip-broadcast", RIP_BROADCAST_PERIOD, move || {
            broadcaster.broadcast_full_table();
        });

        let cleaner = Arc::clone(&engine);
        let cleaner_task = PeriodicTask::spawn("rip-cleaner", RIP_CLEANER_PERIOD, move || {
            let Some(node) = cleaner.node.upgrade() else {
                return;
            };
            let expired = node.routing().remove_stale_rip_entries(RIP_EXPIRY);
            cleaner.broadcast(&expired);
        });

        engine
            .tasks
            .lock()
            .unwrap()
            .extend([broadcast_task, cleaner_task]);
        engine
    }

    /// Stop the periodic threads.
    pub fn stop(&self) {
        self.tasks.lock().unwrap().clear();
    }

    /// Protocol-200 handler: feed a received datagram into the table.
    pub fn handle_datagram(&self, datagram: Datagram) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let peer = datagram.src();
        let message = match RipMessage::decode(&datagram.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("rip: dropping malformed message from {peer}: {e}");
                return;
            }
        };

        match message.command {
            RipCommand::Request => {
                debug!("rip: request from {peer}, answering with full table");
                self.send_to(&node.routing().generate_rip_entries(), peer);
            }
            RipCommand::Response => {
                let triggered = node.routing().handle_rip_entries(&message.entries, peer);
                self.broadcast(&triggered);
            }
        }
    }

    /// Send the whole table to every peer (5 s tick).
    pub fn broadcast_full_table(&self) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        self.broadcast(&node.routing().generate_rip_entries());
    }

    /// Send `message` to every RIP peer.  Empty responses are skipped.
    pub fn broadcast(&self, message: &RipMessage) {
        if message.command == RipCommand::Response && message.is_empty() {
            return;
        }
        for peer in &self.neighbors {
            self.send_to(message, *peer);
        }
    }

    fn send_to(&self, message: &RipMessage, dest: Ipv4Addr) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        if let Err(e) = node.send_ip(dest, IpProtocol::Rip, message.encode_for(dest)) {
            debug!("rip: send to {dest} failed: {e}");
        }
    }
}
