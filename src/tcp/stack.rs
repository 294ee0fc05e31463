//! The TCP stack: socket table, inbound demultiplexing, id/ISN/port
//! allocation, the reaper, and the FSM transition handlers.
//!
//! # Demux
//!
//! An inbound segment is parsed (bad checksums and option-carrying headers
//! are dropped with a log line), its session tuple formed by swapping the
//! wire endpoints, and looked up in the session index.  A hit dispatches
//! into the connection's FSM; a miss falls back to the listener bound to
//! the destination port for SYN handling; anything else is logged and
//! discarded.  No RST is ever generated.
//!
//! # Allocation
//!
//! Socket ids come from a pool of `1..=128`.  ISNs and ephemeral ports are
//! drawn from PRNGs seeded with 0 so test runs are reproducible; the port
//! draw does not consult the session index, so a collision surfaces as
//! `Duplicate` from `connect` and the caller retries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use log::{debug, info, warn};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{IpError, SocketError};
use crate::ip::datagram::Datagram;
use crate::types::Endpoint;
use crate::util::PeriodicTask;

use super::packet::{SessionTuple, TcpPacket};
use super::socket::{Connection, ListenSocket, PacketTx, Rendezvous, SocketId, TcpState};
use super::{
    EPHEMERAL_PORT_MIN, MAX_SOCKET_ID, REAPER_PERIOD, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_SYN,
};

/// How the stack pushes serialized segments into the IP layer.
pub type IpSender = Arc<dyn Fn(Ipv4Addr, Vec<u8>) -> Result<(), IpError> + Send + Sync>;

/// A socket-table slot: the two-variant socket sum.
#[derive(Clone)]
pub enum Socket {
    Listen(Arc<ListenSocket>),
    Normal(Arc<Connection>),
}

struct StackInner {
    sockets: BTreeMap<SocketId, Socket>,
    by_session: HashMap<SessionTuple, Arc<Connection>>,
    listeners: HashMap<u16, Arc<ListenSocket>>,
}

/// The node-wide TCP stack.
pub struct TcpStack {
    inner: RwLock<StackInner>,
    free_ids: Mutex<BTreeSet<SocketId>>,
    isn_rng: Mutex<StdRng>,
    port_rng: Mutex<StdRng>,
    ip_tx: OnceLock<IpSender>,
    reaper: Mutex<Option<PeriodicTask>>,
}

impl TcpStack {
    /// A stack with every socket id free and seeded PRNGs.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(StackInner {
                sockets: BTreeMap::new(),
                by_session: HashMap::new(),
                listeners: HashMap::new(),
            }),
            free_ids: Mutex::new((1..=MAX_SOCKET_ID).collect()),
            // Seeded for reproducible tests; real deployments reseed.
            isn_rng: Mutex::new(StdRng::seed_from_u64(0)),
            port_rng: Mutex::new(StdRng::seed_from_u64(0)),
            ip_tx: OnceLock::new(),
            reaper: Mutex::new(None),
        })
    }

    /// Wire the IP-layer send callback.  Must happen before any socket is
    /// created.
    pub fn register_ip_sender(&self, sender: IpSender) {
        self.ip_tx
            .set(sender)
            .ok()
            .expect("IP sender registered twice");
    }

    /// Start the reaper.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = PeriodicTask::spawn("tcp-reaper", REAPER_PERIOD, move || {
            if let Some(stack) = weak.upgrade() {
                stack.reap();
            }
        });
        *self.reaper.lock().unwrap() = Some(task);
    }

    /// Stop the reaper (shutdown path).
    pub fn stop(&self) {
        self.reaper.lock().unwrap().take();
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    fn alloc_id(&self) -> Result<SocketId, SocketError> {
        self.free_ids
            .lock()
            .unwrap()
            .pop_first()
            .ok_or(SocketError::Exhausted)
    }

    fn release_id(&self, id: SocketId) {
        self.free_ids.lock().unwrap().insert(id);
    }

    fn generate_isn(&self) -> u32 {
        let mut rng = self.isn_rng.lock().unwrap();
        Uniform::new_inclusive(0u32, u32::MAX).sample(&mut *rng)
    }

    fn generate_port(&self) -> u16 {
        let mut rng = self.port_rng.lock().unwrap();
        Uniform::new_inclusive(EPHEMERAL_PORT_MIN, u16::MAX).sample(&mut *rng)
    }

    fn packet_sender(&self) -> PacketTx {
        let ip_tx = Arc::clone(self.ip_tx.get().expect("IP sender not registered"));
        Arc::new(move |packet: &TcpPacket, dst: Ipv4Addr| {
            if let Err(e) = ip_tx(dst, packet.encode()) {
                debug!("tcp: send to {dst} failed: {e}");
            }
        })
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Find any socket by id.
    pub fn find_socket(&self, id: SocketId) -> Result<Socket, SocketError> {
        self.inner
            .read()
            .unwrap()
            .sockets
            .get(&id)
            .cloned()
            .ok_or(SocketError::NotFound)
    }

    fn find_session(&self, tuple: &SessionTuple) -> Option<Arc<Connection>> {
        self.inner.read().unwrap().by_session.get(tuple).cloned()
    }

    fn find_listener(&self, port: u16) -> Option<Arc<ListenSocket>> {
        self.inner.read().unwrap().listeners.get(&port).cloned()
    }

    // =========================================================================
    // Socket API
    // =========================================================================

    /// Active open: allocate a connection, send the SYN, and block until
    /// the handshake completes or fails.
    pub fn connect(
        self: &Arc<Self>,
        local_addr: Ipv4Addr,
        remote: Endpoint,
    ) -> Result<Arc<Connection>, SocketError> {
        let local = Endpoint::new(local_addr, self.generate_port());
        let tuple = SessionTuple::new(local, remote);
        let id = self.alloc_id()?;
        let isn = self.generate_isn();

        let conn = Connection::new(
            id,
            tuple,
            isn,
            u16::MAX as u32, // trusted window until the SYN|ACK advertises one
            0,               // receive side is reseeded from the SYN|ACK
            self.packet_sender(),
        );

        {
            let mut inner = self.inner.write().unwrap();
            if inner.by_session.contains_key(&tuple) {
                drop(inner);
                self.release_id(id);
                return Err(SocketError::Duplicate);
            }
            inner.sockets.insert(id, Socket::Normal(Arc::clone(&conn)));
            inner.by_session.insert(tuple, Arc::clone(&conn));
        }

        let rendezvous = Rendezvous::new();
        *conn.lock_state() = TcpState::SynSent(Arc::clone(&rendezvous));

        let wnd = conn.recv_buf.free() as u16;
        conn.send_buf.consume_one_seq(); // the SYN occupies ISN
        conn.send_queued(TcpPacket::syn(&tuple, isn, wnd));
        conn.start_threads();
        info!("tcp {id}: SYN sent to {remote}, waiting for handshake");

        match rendezvous.wait() {
            None => Ok(conn),
            Some(error) => Err(error),
        }
    }

    /// Passive open: bind a listener to `port`.
    pub fn listen(&self, port: u16) -> Result<Arc<ListenSocket>, SocketError> {
        let id = self.alloc_id()?;
        let mut inner = self.inner.write().unwrap();
        if inner.listeners.contains_key(&port) {
            drop(inner);
            self.release_id(id);
            return Err(SocketError::Duplicate);
        }
        let listener = ListenSocket::new(id, port);
        inner.sockets.insert(id, Socket::Listen(Arc::clone(&listener)));
        inner.listeners.insert(port, Arc::clone(&listener));
        info!("tcp {id}: listening on port {port}");
        Ok(listener)
    }

    /// Write to a connection by id.
    pub fn send(&self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        match self.find_socket(id)? {
            Socket::Normal(conn) => conn.write(data),
            Socket::Listen(_) => Err(SocketError::NotAllowed),
        }
    }

    /// Read from a connection by id.
    pub fn recv(&self, id: SocketId, buf: &mut [u8], n: usize) -> Result<usize, SocketError> {
        match self.find_socket(id)? {
            Socket::Normal(conn) => conn.read(buf, n),
            Socket::Listen(_) => Err(SocketError::NotAllowed),
        }
    }

    /// Orderly close by id.  Closing a listener aborts its pending
    /// connections and wakes every accepter.
    pub fn close(&self, id: SocketId) -> Result<(), SocketError> {
        match self.find_socket(id)? {
            Socket::Normal(conn) => conn.close(),
            Socket::Listen(listener) => {
                for pending in listener.close() {
                    let _ = pending.abort();
                }
                Ok(())
            }
        }
    }

    /// Abort by id.
    pub fn abort(&self, id: SocketId) -> Result<(), SocketError> {
        match self.find_socket(id)? {
            Socket::Normal(conn) => conn.abort(),
            Socket::Listen(listener) => {
                for pending in listener.close() {
                    let _ = pending.abort();
                }
                Ok(())
            }
        }
    }

    // =========================================================================
    // Inbound demux
    // =========================================================================

    /// Protocol-6 handler: parse, demultiplex, and run the FSM.
    pub fn handle_datagram(&self, datagram: Datagram) {
        let src = datagram.src();
        let dst = datagram.dst();
        let packet = match TcpPacket::decode(src, dst, &datagram.payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("tcp: dropping segment from {src}: {e}");
                return;
            }
        };

        // Our tuple is the wire tuple swapped.
        let tuple = SessionTuple::new(
            Endpoint::new(dst, packet.header.dst_port),
            Endpoint::new(src, packet.header.src_port),
        );

        if let Some(conn) = self.find_session(&tuple) {
            self.handle_connection_packet(&conn, packet);
            return;
        }

        if packet.header.flags == TCP_FLAG_SYN {
            if let Some(listener) = self.find_listener(packet.header.dst_port) {
                self.handle_listener_syn(&listener, tuple, &packet);
                return;
            }
        }

        debug!(
            "tcp: no socket for {}:{} -> {}:{}, dropping segment",
            src, packet.header.src_port, dst, packet.header.dst_port
        );
    }

    /// SYN at a listener: create the passive connection, answer SYN|ACK,
    /// and park it on the pending list.
    fn handle_listener_syn(
        &self,
        listener: &Arc<ListenSocket>,
        tuple: SessionTuple,
        packet: &TcpPacket,
    ) {
        let id = match self.alloc_id() {
            Ok(id) => id,
            Err(_) => {
                warn!("tcp: socket ids exhausted, dropping SYN on port {}", listener.port);
                return;
            }
        };
        let isn = self.generate_isn();
        let client_isn = packet.header.seq;

        let conn = Connection::new(
            id,
            tuple,
            isn,
            packet.header.window as u32,
            client_isn.wrapping_add(1),
            self.packet_sender(),
        );
        *conn.lock_state() = TcpState::SynReceived(Arc::downgrade(listener));

        {
            let mut inner = self.inner.write().unwrap();
            if inner.by_session.contains_key(&tuple) {
                // A duplicate SYN raced us; the first socket answers it.
                drop(inner);
                self.release_id(id);
                return;
            }
            inner.sockets.insert(id, Socket::Normal(Arc::clone(&conn)));
            inner.by_session.insert(tuple, Arc::clone(&conn));
        }

        if let Err(e) = listener.add_pending(tuple, Arc::clone(&conn)) {
            warn!("tcp: pending list full on port {}: {e}", listener.port);
            let mut inner = self.inner.write().unwrap();
            inner.sockets.remove(&id);
            inner.by_session.remove(&tuple);
            drop(inner);
            self.release_id(id);
            return;
        }

        let wnd = conn.recv_buf.free() as u16;
        conn.send_buf.consume_one_seq(); // the SYN|ACK occupies ISN
        conn.send_queued(TcpPacket::syn_ack(
            &tuple,
            isn,
            client_isn.wrapping_add(1),
            wnd,
        ));
        conn.start_threads();

        info!(
            "tcp {}: SYN from {} -> SYN_RECEIVED (listener {})",
            id, tuple.remote, listener.id
        );
    }

    // =========================================================================
    // Connection FSM
    // =========================================================================

    /// Dispatch one segment into a connection's state machine.
    ///
    /// Transitions follow the classical diagram; violations (unexpected
    /// flags, wrong numbers) are logged and ignored.
    fn handle_connection_packet(&self, conn: &Arc<Connection>, packet: TcpPacket) {
        let header = packet.header;
        let flags = header.flags;
        let state = conn.state();

        const SYN_ACK: u8 = TCP_FLAG_SYN | TCP_FLAG_ACK;
        const FIN_ACK: u8 = TCP_FLAG_FIN | TCP_FLAG_ACK;

        match (state, flags) {
            (TcpState::SynSent(rendezvous), SYN_ACK) => {
                self.on_syn_sent_syn_ack(conn, &rendezvous, &packet);
            }
            (TcpState::SynReceived(listener), TCP_FLAG_ACK) => {
                self.on_syn_received_ack(conn, &listener, &packet);
            }
            (TcpState::Established, TCP_FLAG_ACK)
            | (TcpState::CloseWait, TCP_FLAG_ACK)
            | (TcpState::FinWait2, TCP_FLAG_ACK) => {
                self.on_data_ack(conn, &packet);
            }
            (TcpState::Established, SYN_ACK) => {
                // Our handshake ACK was lost; re-ack the retransmitted
                // SYN|ACK.
                let (_, nxt) = conn.send_buf.on_ack(header.ack, header.window as u32);
                let (ack, wnd) = conn.recv_buf.ack_wnd();
                let reply = TcpPacket::ack(&conn.tuple, nxt, ack, wnd as u16, Vec::new());
                conn.send_unqueued(&reply);
            }
            (TcpState::Established, TCP_FLAG_FIN) | (TcpState::Established, FIN_ACK) => {
                self.on_fin(conn, &packet, TcpState::CloseWait, true);
            }
            (TcpState::CloseWait, TCP_FLAG_FIN) | (TcpState::CloseWait, FIN_ACK) => {
                // Retransmitted FIN: our ACK was lost; answer again.
                self.re_ack_fin(conn, &packet);
            }
            (TcpState::FinWait1, TCP_FLAG_ACK) => {
                self.on_fin_wait1_ack(conn, &packet);
            }
            (TcpState::FinWait2, TCP_FLAG_FIN) | (TcpState::FinWait2, FIN_ACK) => {
                self.on_fin(conn, &packet, TcpState::TimeWait(std::time::Instant::now()), false);
            }
            (TcpState::TimeWait(_), TCP_FLAG_FIN) | (TcpState::TimeWait(_), FIN_ACK) => {
                self.re_ack_fin(conn, &packet);
            }
            (TcpState::LastAck, TCP_FLAG_ACK) => {
                self.on_last_ack(conn, &packet);
            }
            (state, flags) => {
                debug!(
                    "tcp {}: ignoring segment with flags {flags:#04x} in {}",
                    conn.id,
                    state.name()
                );
            }
        }
    }

    /// SYN_SENT + SYN|ACK: complete the active handshake.
    fn on_syn_sent_syn_ack(
        &self,
        conn: &Arc<Connection>,
        rendezvous: &Arc<Rendezvous>,
        packet: &TcpPacket,
    ) {
        let header = packet.header;
        let (una, nxt) = conn.send_buf.on_ack(header.ack, header.window as u32);
        if una != nxt {
            warn!(
                "tcp {}: SYN|ACK acks {} but {nxt} expected, ignoring",
                conn.id, header.ack
            );
            return;
        }

        let rcv_nxt = header.seq.wrapping_add(1);
        conn.recv_buf.set_initial(rcv_nxt);

        let wnd = conn.recv_buf.free() as u16;
        let reply = TcpPacket::ack(&conn.tuple, nxt, rcv_nxt, wnd, Vec::new());
        conn.send_unqueued(&reply);

        *conn.lock_state() = TcpState::Established;
        rendezvous.notify_ok();
        info!("tcp {}: connection to {} established", conn.id, conn.tuple.remote);
    }

    /// SYN_RECEIVED + ACK: complete the passive handshake and hand the
    /// socket to the accept queue.
    fn on_syn_received_ack(
        &self,
        conn: &Arc<Connection>,
        listener: &Weak<ListenSocket>,
        packet: &TcpPacket,
    ) {
        let header = packet.header;
        let (expected_seq, _) = conn.recv_buf.ack_wnd();
        if header.seq != expected_seq {
            warn!(
                "tcp {}: handshake ACK seq {} but {expected_seq} expected, ignoring",
                conn.id, header.seq
            );
            return;
        }
        let (una, nxt) = conn.send_buf.on_ack(header.ack, header.window as u32);
        if una != nxt {
            warn!(
                "tcp {}: handshake ACK acks {} but {nxt} expected, ignoring",
                conn.id, header.ack
            );
            return;
        }

        debug_assert!(conn.send_buf.at_start() && conn.recv_buf.at_start());
        *conn.lock_state() = TcpState::Established;

        if let Some(listener) = listener.upgrade() {
            if listener.remove_pending(&conn.tuple).is_some() {
                listener.push_established(Arc::clone(conn));
            }
        }
        info!("tcp {}: connection from {} established", conn.id, conn.tuple.remote);
    }

    /// The steady-state data path: process the ack, and answer any payload
    /// with a pure ACK carrying the updated receive advertisement.
    fn on_data_ack(&self, conn: &Arc<Connection>, packet: &TcpPacket) {
        let header = packet.header;
        let (_, nxt) = conn.send_buf.on_ack(header.ack, header.window as u32);

        if !packet.payload.is_empty() {
            let (ack, wnd) = conn.recv_buf.on_recv(header.seq, &packet.payload);
            let reply = TcpPacket::ack(&conn.tuple, nxt, ack, wnd as u16, Vec::new());
            conn.send_unqueued(&reply);
        }
    }

    /// A FIN that may advance the close sequence: acknowledge it and, when
    /// it arrived in order, transition to `next` (shutting the receive
    /// side down on the passive-close path).
    fn on_fin(
        &self,
        conn: &Arc<Connection>,
        packet: &TcpPacket,
        next: TcpState,
        shutdown_recv: bool,
    ) {
        let seq = packet.header.seq;
        let (ack, wnd) = conn.recv_buf.on_ctrl(seq);
        let (_, nxt) = conn.send_buf.una_nxt();
        let reply = TcpPacket::ack(&conn.tuple, nxt, ack, wnd as u16, Vec::new());
        conn.send_unqueued(&reply);

        // An early-arrival FIN (gap outstanding) does not move the state.
        if ack == seq.wrapping_add(1) {
            let next_name = next.name();
            if shutdown_recv {
                conn.shutdown_recv();
            }
            *conn.lock_state() = next;
            info!("tcp {}: peer FIN, transitioned to {next_name}", conn.id);
        }
    }

    /// A retransmitted FIN in CLOSE_WAIT/TIME_WAIT: the peer missed our
    /// ACK; send it again.
    fn re_ack_fin(&self, conn: &Arc<Connection>, packet: &TcpPacket) {
        let (ack, wnd) = conn.recv_buf.on_ctrl(packet.header.seq);
        let (_, nxt) = conn.send_buf.una_nxt();
        let reply = TcpPacket::ack(&conn.tuple, nxt, ack, wnd as u16, Vec::new());
        conn.send_unqueued(&reply);
    }

    /// FIN_WAIT_1 + ACK: data still flows; a clean ack of our FIN moves to
    /// FIN_WAIT_2.
    fn on_fin_wait1_ack(&self, conn: &Arc<Connection>, packet: &TcpPacket) {
        let header = packet.header;
        let (una, nxt) = conn.send_buf.on_ack(header.ack, header.window as u32);

        if !packet.payload.is_empty() {
            let (ack, wnd) = conn.recv_buf.on_recv(header.seq, &packet.payload);
            let reply = TcpPacket::ack(&conn.tuple, nxt, ack, wnd as u16, Vec::new());
            conn.send_unqueued(&reply);
            return;
        }

        let (expected_seq, _) = conn.recv_buf.ack_wnd();
        if header.seq != expected_seq {
            debug!(
                "tcp {}: FIN_WAIT_1 ack with seq {} but {expected_seq} expected",
                conn.id, header.seq
            );
            return;
        }
        if una != nxt {
            debug!(
                "tcp {}: FIN not yet fully acked ({} of {nxt})",
                conn.id, header.ack
            );
            return;
        }

        *conn.lock_state() = TcpState::FinWait2;
        info!("tcp {}: transitioned to FIN_WAIT_2", conn.id);
    }

    /// LAST_ACK + ACK: the final ack of our FIN closes the socket.
    fn on_last_ack(&self, conn: &Arc<Connection>, packet: &TcpPacket) {
        let header = packet.header;
        let (una, nxt) = conn.send_buf.on_ack(header.ack, header.window as u32);
        if una != nxt {
            debug!(
                "tcp {}: LAST_ACK ack {} but {nxt} expected, ignoring",
                conn.id, header.ack
            );
            return;
        }
        conn.shutdown_buffers();
        *conn.lock_state() = TcpState::Closed;
        info!("tcp {}: transitioned to CLOSED", conn.id);
    }

    // =========================================================================
    // Reaper
    // =========================================================================

    /// Collect sockets that reached `Closed` or whose TIME_WAIT expired,
    /// returning their ids to the pool.
    pub fn reap(&self) {
        let mut removed: Vec<Socket> = Vec::new();
        {
            let mut inner = self.inner.write().unwrap();
            let dead: Vec<SocketId> = inner
                .sockets
                .iter()
                .filter(|(_, socket)| match socket {
                    Socket::Normal(conn) => conn.state().is_reapable(),
                    Socket::Listen(listener) => listener.is_closed(),
                })
                .map(|(&id, _)| id)
                .collect();

            for id in dead {
                let Some(socket) = inner.sockets.remove(&id) else {
                    continue;
                };
                match &socket {
                    Socket::Normal(conn) => {
                        inner.by_session.remove(&conn.tuple);
                        debug!("tcp: reaped socket {id} ({})", conn.state_name());
                    }
                    Socket::Listen(listener) => {
                        inner.listeners.remove(&listener.port);
                        debug!("tcp: reaped listener {id} (port {})", listener.port);
                    }
                }
                self.release_id(id);
                removed.push(socket);
            }
        }
        // Dropped here, outside the table lock: a connection drop joins its
        // threads.
        drop(removed);
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// `ls`: every socket with its session and state.
    pub fn list_sockets(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "SID      LAddr LPort       RAddr RPort     Status")?;
        let inner = self.inner.read().unwrap();
        for (id, socket) in inner.sockets.iter() {
            match socket {
                Socket::Listen(listener) => writeln!(
                    out,
                    "{:>3}  {:>9} {:>5}  {:>10} {:>5}  {:>9}",
                    id, "0.0.0.0", listener.port, "0.0.0.0", 0, "LISTEN"
                )?,
                Socket::Normal(conn) => writeln!(
                    out,
                    "{:>3}  {:>9} {:>5}  {:>10} {:>5}  {:>9}",
                    id,
                    conn.tuple.local.addr,
                    conn.tuple.local.port,
                    conn.tuple.remote.addr,
                    conn.tuple.remote.port,
                    conn.state_name()
                )?,
            }
        }
        Ok(())
    }
}
