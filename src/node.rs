//! The node core shared by `vhost` and `vrouter`.
//!
//! Owns the interfaces, the routing table, a small fixed worker pool, and
//! the per-protocol dispatch table.  Inbound datagrams from every interface
//! land on the worker queue; a worker verifies the checksum and either
//! delivers locally or, on a router, decrements the TTL and forwards.
//!
//! # Dispatch
//!
//! The handler table maps an IP protocol number to a [`ProtocolHandler`]
//! discriminant; the `match` in [`Node::deliver`] is the data-driven
//! alternative to boxed callbacks.  Handlers are installed during
//! initialization, before any interface thread starts, and never after.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::config::{NodeConfig, RoutingMode};
use crate::error::IpError;
use crate::ip::datagram::Datagram;
use crate::ip::rip::RipEngine;
use crate::ip::routing::{QueryStrategy, Route, RoutingTable};
use crate::link::Interface;
use crate::tcp::stack::TcpStack;
use crate::types::{prefix_len_to_mask, IpProtocol};
use crate::util::WorkerPool;

/// Number of worker threads handling inbound datagrams.
pub const NUM_WORKERS: usize = 8;

/// Whether this node forwards datagrams and runs RIP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Host,
    Router,
}

/// Typed protocol dispatch: which subsystem consumes a delivered datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolHandler {
    /// Protocol 0: print src/dst/TTL/message.
    Test,
    /// Protocol 6: hand to the TCP stack.
    Tcp,
    /// Protocol 200: hand to the RIP engine.
    Rip,
}

/// The IP node: interfaces, routing table, worker pool, protocol dispatch.
pub struct Node {
    kind: NodeKind,
    interfaces: Vec<Arc<Interface>>,
    by_name: HashMap<String, usize>,
    by_addr: BTreeMap<Ipv4Addr, usize>,
    routing: RoutingTable,
    pool: WorkerPool,
    handlers: RwLock<HashMap<u8, ProtocolHandler>>,
    tcp: OnceLock<Arc<TcpStack>>,
    rip: OnceLock<Arc<RipEngine>>,
    recv_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build a node from a parsed configuration.
    ///
    /// Binds every interface, installs the connected-subnet routes, and (on
    /// hosts or static-mode nodes) the configured static routes.  The TEST
    /// protocol handler is installed unconditionally.
    pub fn new(config: &NodeConfig, kind: NodeKind) -> Result<Arc<Self>, IpError> {
        let mut interfaces = Vec::new();
        let mut by_name = HashMap::new();
        let mut by_addr = BTreeMap::new();
        let routing = RoutingTable::new();

        for iface_config in &config.interfaces {
            let iface = Arc::new(Interface::new(iface_config, &config.neighbors)?);
            let mask = prefix_len_to_mask(iface_config.prefix_len);
            let prefix = Ipv4Addr::from(u32::from(iface_config.addr) & mask);
            routing.add_local(prefix, mask, &iface_config.name);
            by_name.insert(iface_config.name.clone(), interfaces.len());
            by_addr.insert(iface_config.addr, interfaces.len());
            interfaces.push(iface);
        }

        if config.routing == RoutingMode::Static {
            for route in &config.static_routes {
                routing.add_static(
                    route.prefix,
                    prefix_len_to_mask(route.prefix_len),
                    route.next_hop,
                );
            }
        }

        let mut handlers = HashMap::new();
        handlers.insert(IpProtocol::Test.as_u8(), ProtocolHandler::Test);

        info!(
            "node: created {} with {} interface(s)",
            match kind {
                NodeKind::Host => "host",
                NodeKind::Router => "router",
            },
            interfaces.len()
        );

        Ok(Arc::new(Self {
            kind,
            interfaces,
            by_name,
            by_addr,
            routing,
            pool: WorkerPool::new(NUM_WORKERS),
            handlers: RwLock::new(handlers),
            tcp: OnceLock::new(),
            rip: OnceLock::new(),
            recv_threads: Mutex::new(Vec::new()),
        }))
    }

    // =========================================================================
    // Initialization wiring
    // =========================================================================

    /// Install a protocol handler.  Initialization-time only.
    pub fn register_handler(&self, protocol: IpProtocol, handler: ProtocolHandler) {
        self.handlers
            .write()
            .unwrap()
            .insert(protocol.as_u8(), handler);
    }

    /// Attach the TCP stack and install its protocol handler.
    pub fn attach_tcp(&self, stack: Arc<TcpStack>) {
        self.tcp.set(stack).ok().expect("TCP stack attached twice");
        self.register_handler(IpProtocol::Tcp, ProtocolHandler::Tcp);
    }

    /// Attach the RIP engine and install its protocol handler.
    pub fn attach_rip(&self, engine: Arc<RipEngine>) {
        self.rip.set(engine).ok().expect("RIP engine attached twice");
        self.register_handler(IpProtocol::Rip, ProtocolHandler::Rip);
    }

    /// Spawn the receive thread of every interface.
    pub fn start(self: &Arc<Self>) {
        let mut threads = self.recv_threads.lock().unwrap();
        for iface in &self.interfaces {
            let node = Arc::clone(self);
            threads.push(iface.start(move |datagram, iface_addr| {
                let worker = Arc::clone(&node);
                node.pool.submit(move || worker.dispatch(datagram, iface_addr));
            }));
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn interfaces(&self) -> &[Arc<Interface>] {
        &self.interfaces
    }

    /// `true` if `addr` belongs to one of our interfaces.
    pub fn is_local_addr(&self, addr: Ipv4Addr) -> bool {
        self.by_addr.contains_key(&addr)
    }

    /// Virtual address of the interface that would carry traffic to `dst`.
    pub fn source_addr_for(&self, dst: Ipv4Addr) -> Result<Ipv4Addr, IpError> {
        let (iface_index, _) = self.resolve(dst)?;
        Ok(self.interfaces[iface_index].addr)
    }

    // =========================================================================
    // Outbound path
    // =========================================================================

    /// Send `payload` to `dst` as one datagram of the given protocol.
    pub fn send_ip(
        &self,
        dst: Ipv4Addr,
        protocol: IpProtocol,
        payload: Vec<u8>,
    ) -> Result<usize, IpError> {
        let (iface_index, next_hop) = self.resolve(dst)?;
        let iface = &self.interfaces[iface_index];
        let datagram = Datagram::new(iface.addr, dst, protocol, payload)?;
        iface.send(&datagram, next_hop)
    }

    /// Send a TEST (protocol 0) message.
    pub fn send_test(&self, dst: Ipv4Addr, message: &str) -> Result<usize, IpError> {
        self.send_ip(dst, IpProtocol::Test, message.as_bytes().to_vec())
    }

    /// Routing lookup with the bounded two-step gateway indirection.
    ///
    /// Returns the interface index and the next-hop address.
    fn resolve(&self, dst: Ipv4Addr) -> Result<(usize, Ipv4Addr), IpError> {
        let entry = self
            .routing
            .query(dst, QueryStrategy::LongestPrefixMatch)
            .ok_or(IpError::NoRoute(dst))?;

        let (entry, next_hop): (Route, Ipv4Addr) = match entry.gateway {
            Some(gateway) => {
                let via = self
                    .routing
                    .query(gateway, QueryStrategy::LongestPrefixMatch)
                    .ok_or(IpError::NoRoute(gateway))?;
                (via, gateway)
            }
            None => (entry, dst),
        };

        let iface_name = entry.iface.as_deref().ok_or(IpError::NoRoute(dst))?;
        let iface_index = *self
            .by_name
            .get(iface_name)
            .ok_or_else(|| IpError::NoRoute(dst))?;
        Ok((iface_index, next_hop))
    }

    // =========================================================================
    // Inbound path (worker pool)
    // =========================================================================

    /// Process one inbound datagram on a worker thread.
    fn dispatch(&self, mut datagram: Datagram, iface_addr: Ipv4Addr) {
        if !datagram.checksum_ok() {
            warn!(
                "node: dropping datagram {} -> {} with bad checksum",
                datagram.src(),
                datagram.dst()
            );
            return;
        }
        if datagram.ttl() == 0 {
            warn!(
                "node: dropping datagram {} -> {} with expired TTL",
                datagram.src(),
                datagram.dst()
            );
            return;
        }

        let dst = datagram.dst();
        match self.kind {
            NodeKind::Host => {
                if dst == iface_addr {
                    self.deliver(datagram);
                } else {
                    // RFC 1122 3.3.4.2 (A): a host may silently discard a
                    // datagram whose destination does not match the interface
                    // it arrived on.
                    debug!("node: discarding datagram for {dst} (not this host)");
                }
            }
            NodeKind::Router => {
                if self.is_local_addr(dst) {
                    self.deliver(datagram);
                } else {
                    if datagram.ttl() <= 1 {
                        warn!(
                            "node: TTL expired forwarding {} -> {}, dropping",
                            datagram.src(),
                            dst
                        );
                        return;
                    }
                    datagram.header.ttl -= 1;
                    datagram.update_checksum();
                    self.forward(datagram);
                }
            }
        }
    }

    /// Hand a locally-addressed datagram to its protocol handler.
    fn deliver(&self, datagram: Datagram) {
        let handler = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(&datagram.header.protocol).copied()
        };
        match handler {
            Some(ProtocolHandler::Test) => test_protocol_handler(&datagram),
            Some(ProtocolHandler::Tcp) => {
                if let Some(stack) = self.tcp.get() {
                    stack.handle_datagram(datagram);
                }
            }
            Some(ProtocolHandler::Rip) => {
                if let Some(engine) = self.rip.get() {
                    engine.handle_datagram(datagram);
                }
            }
            None => {
                debug!(
                    "node: no handler for protocol {}, dropping datagram from {}",
                    datagram.header.protocol,
                    datagram.src()
                );
            }
        }
    }

    /// Forward a transit datagram out the interface its route names.
    fn forward(&self, datagram: Datagram) {
        match self.resolve(datagram.dst()) {
            Ok((iface_index, next_hop)) => {
                if let Err(e) = self.interfaces[iface_index].send(&datagram, next_hop) {
                    debug!("node: forward to {} failed: {e}", datagram.dst());
                }
            }
            Err(e) => {
                warn!("node: cannot forward {} -> {}: {e}", datagram.src(), datagram.dst());
            }
        }
    }

    // =========================================================================
    // Interface administration
    // =========================================================================

    /// Bring an interface up: flip the flag, re-enable the Local route, and
    /// (router) broadcast the triggered update.
    pub fn enable_interface(&self, name: &str) -> bool {
        let Some(&index) = self.by_name.get(name) else {
            warn!("node: no interface named {name:?}");
            return false;
        };
        self.interfaces[index].set_up(true);
        let update = self.routing.enable_local_route(name);
        if let Some(engine) = self.rip.get() {
            engine.broadcast(&update);
        }
        true
    }

    /// Bring an interface down, poisoning its Local route.
    pub fn disable_interface(&self, name: &str) -> bool {
        let Some(&index) = self.by_name.get(name) else {
            warn!("node: no interface named {name:?}");
            return false;
        };
        self.interfaces[index].set_up(false);
        let update = self.routing.disable_local_route(name);
        if let Some(engine) = self.rip.get() {
            engine.broadcast(&update);
        }
        true
    }

    // =========================================================================
    // Listings (REPL)
    // =========================================================================

    /// `li`: interfaces with address, prefix, and state.
    pub fn list_interfaces(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Name  Addr/Prefix State")?;
        for iface in &self.interfaces {
            writeln!(
                out,
                "{}  {}/{} {}",
                iface.name,
                iface.addr,
                iface.prefix_len,
                if iface.is_up() { "up" } else { "down" }
            )?;
        }
        Ok(())
    }

    /// `ln`: neighbors of every up interface.
    pub fn list_neighbors(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Iface          VIP          UDPAddr")?;
        for iface in &self.interfaces {
            if !iface.is_up() {
                continue;
            }
            for neighbor in iface.neighbors() {
                writeln!(out, "{}  {:>11}  {}", iface.name, neighbor.vip, neighbor.udp)?;
            }
        }
        Ok(())
    }

    /// `lr`: the routing table.
    pub fn list_routes(&self, out: &mut dyn Write) -> std::io::Result<()> {
        self.routing.list(out)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the RIP engine, interface threads, and worker pool.
    pub fn shutdown(&self) {
        if let Some(engine) = self.rip.get() {
            engine.stop();
        }
        for iface in &self.interfaces {
            iface.shutdown();
        }
        let mut threads = self.recv_threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.pool.shutdown();
    }
}

/// Protocol 0 handler: print the test message.
fn test_protocol_handler(datagram: &Datagram) {
    let message = String::from_utf8_lossy(&datagram.payload);
    println!(
        "Received test packet: Src: {}, Dst: {}, TTL: {}, Data: {}",
        datagram.src(),
        datagram.dst(),
        datagram.ttl(),
        message
    );
}
