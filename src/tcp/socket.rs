//! Sockets: the two-variant socket sum, per-connection FSM state, and the
//! threads each connection owns.
//!
//! A socket is either a [`ListenSocket`] or a [`Connection`]; there is no
//! common trait object.  FSM state is a tagged enum with per-state payload:
//! `SynSent` carries the rendezvous that wakes the `connect` caller,
//! `SynReceived` a non-owning handle back to the listener (live only for
//! the window between SYN|ACK and the accept-queue hand-off), and
//! `TimeWait` its entry timestamp.
//!
//! Each connection runs three private threads: a sender blocked on the send
//! buffer, a zero-window probe driver, and a 250 ms retransmission scan.
//! The threads hold the buffers, never the connection itself, so dropping
//! the last `Connection` handle can join them without deadlocking.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, warn};

use crate::error::SocketError;

use super::buffers::{RecvBuffer, SendBuffer};
use super::packet::{SessionTuple, TcpPacket};
use super::{
    MAX_PENDING_CONNS, MAX_TCP_PAYLOAD, RETRANSMIT_SCAN_PERIOD, TIME_WAIT_DURATION,
};
use crate::util::PeriodicTask;

/// Identifier the stack hands to applications.
pub type SocketId = u32;

/// How connection-bound segments reach the IP layer.
pub type PacketTx = Arc<dyn Fn(&TcpPacket, Ipv4Addr) + Send + Sync>;

// =============================================================================
// Rendezvous
// =============================================================================

/// One-shot wakeup for the thread blocked in `connect`.
pub struct Rendezvous {
    state: Mutex<RendezvousState>,
    cv: Condvar,
}

struct RendezvousState {
    notified: bool,
    error: Option<SocketError>,
}

impl Rendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RendezvousState {
                notified: false,
                error: None,
            }),
            cv: Condvar::new(),
        })
    }

    /// Wake the caller with success (the SYN|ACK arrived).
    pub fn notify_ok(&self) {
        let mut state = self.state.lock().unwrap();
        state.notified = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Wake the caller with an error.
    pub fn notify_err(&self, error: SocketError) {
        let mut state = self.state.lock().unwrap();
        state.error = Some(error);
        state.notified = true;
        drop(state);
        self.cv.notify_all();
    }

    /// Block until notified; `None` means the handshake completed.
    pub fn wait(&self) -> Option<SocketError> {
        let state = self.state.lock().unwrap();
        let state = self.cv.wait_while(state, |s| !s.notified).unwrap();
        state.error
    }
}

// =============================================================================
// FSM state
// =============================================================================

/// Connection FSM state, with per-state payload.
#[derive(Clone)]
pub enum TcpState {
    Closed,
    SynSent(Arc<Rendezvous>),
    SynReceived(Weak<ListenSocket>),
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait(Instant),
}

impl TcpState {
    /// Display name used by `ls` and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::SynSent(_) => "SYN_SENT",
            Self::SynReceived(_) => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait(_) => "TIME_WAIT",
        }
    }

    /// `true` once the reaper may collect the socket.
    pub fn is_reapable(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::TimeWait(since) => since.elapsed() > TIME_WAIT_DURATION,
            _ => false,
        }
    }
}

// =============================================================================
// Listen socket
// =============================================================================

struct AcceptQueue {
    queue: VecDeque<Arc<Connection>>,
    closed: bool,
}

/// A passive socket bound to one port.
pub struct ListenSocket {
    pub id: SocketId,
    pub port: u16,
    /// Connections in SYN_RECEIVED, keyed by session; bounded.
    pending: Mutex<Vec<(SessionTuple, Arc<Connection>)>>,
    accept_q: Mutex<AcceptQueue>,
    accept_cv: Condvar,
}

impl ListenSocket {
    pub fn new(id: SocketId, port: u16) -> Arc<Self> {
        Arc::new(Self {
            id,
            port,
            pending: Mutex::new(Vec::new()),
            accept_q: Mutex::new(AcceptQueue {
                queue: VecDeque::new(),
                closed: false,
            }),
            accept_cv: Condvar::new(),
        })
    }

    /// Block until an established connection is available.
    pub fn accept(&self) -> Result<Arc<Connection>, SocketError> {
        let queue = self.accept_q.lock().unwrap();
        let mut queue = self
            .accept_cv
            .wait_while(queue, |q| q.queue.is_empty() && !q.closed)
            .unwrap();
        match queue.queue.pop_front() {
            Some(conn) => Ok(conn),
            None => Err(SocketError::Closing),
        }
    }

    /// Track a half-open connection.  Fails with `Exhausted` at capacity.
    pub(crate) fn add_pending(
        &self,
        tuple: SessionTuple,
        conn: Arc<Connection>,
    ) -> Result<(), SocketError> {
        let mut pending = self.pending.lock().unwrap();
        if pending.len() >= MAX_PENDING_CONNS {
            return Err(SocketError::Exhausted);
        }
        pending.push((tuple, conn));
        Ok(())
    }

    /// Detach a half-open connection (handshake done, close, or abort).
    pub(crate) fn remove_pending(&self, tuple: &SessionTuple) -> Option<Arc<Connection>> {
        let mut pending = self.pending.lock().unwrap();
        let index = pending.iter().position(|(t, _)| t == tuple)?;
        Some(pending.swap_remove(index).1)
    }

    /// Queue an established connection and wake one accepter.
    pub(crate) fn push_established(&self, conn: Arc<Connection>) {
        let mut queue = self.accept_q.lock().unwrap();
        if queue.closed {
            return;
        }
        queue.queue.push_back(conn);
        drop(queue);
        self.accept_cv.notify_one();
    }

    /// `true` once closed; the reaper collects closed listeners.
    pub fn is_closed(&self) -> bool {
        self.accept_q.lock().unwrap().closed
    }

    /// Close the listener: wake every accepter and hand back the pending
    /// connections so the stack can abort them.
    pub(crate) fn close(&self) -> Vec<Arc<Connection>> {
        let mut queue = self.accept_q.lock().unwrap();
        queue.closed = true;
        queue.queue.clear();
        drop(queue);
        self.accept_cv.notify_all();

        let mut pending = self.pending.lock().unwrap();
        pending.drain(..).map(|(_, conn)| conn).collect()
    }
}

// =============================================================================
// Connection
// =============================================================================

struct ConnThreads {
    sender: Option<JoinHandle<()>>,
    zwp: Option<JoinHandle<()>>,
    retransmit: Option<PeriodicTask>,
}

/// An active (non-listening) socket.
pub struct Connection {
    pub id: SocketId,
    pub tuple: SessionTuple,
    state: Mutex<TcpState>,
    pub send_buf: Arc<SendBuffer>,
    pub recv_buf: Arc<RecvBuffer>,
    packet_tx: PacketTx,
    threads: Mutex<ConnThreads>,
}

impl Connection {
    /// Build a connection in `Closed` with fresh buffers.
    ///
    /// `isn` seeds the send counters, `peer_wnd` the trusted window until
    /// the first real advertisement, and `rcv_nxt` the receive side (the
    /// active opener resets it once the peer's ISN is known).
    pub(crate) fn new(
        id: SocketId,
        tuple: SessionTuple,
        isn: u32,
        peer_wnd: u32,
        rcv_nxt: u32,
        packet_tx: PacketTx,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            tuple,
            state: Mutex::new(TcpState::Closed),
            send_buf: Arc::new(SendBuffer::new(isn, peer_wnd)),
            recv_buf: Arc::new(RecvBuffer::new(rcv_nxt)),
            packet_tx,
            threads: Mutex::new(ConnThreads {
                sender: None,
                zwp: None,
                retransmit: None,
            }),
        })
    }

    /// Spawn the sender, probe driver, and retransmission scan.
    pub(crate) fn start_threads(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap();
        debug_assert!(threads.sender.is_none(), "threads started twice");

        let send_buf = Arc::clone(&self.send_buf);
        let recv_buf = Arc::clone(&self.recv_buf);
        let tx = Arc::clone(&self.packet_tx);
        let tuple = self.tuple;
        threads.sender = Some(
            thread::Builder::new()
                .name(format!("tcp-sender-{}", self.id))
                .spawn(move || sender_loop(&send_buf, &recv_buf, &tuple, &tx))
                .expect("failed to spawn sender thread"),
        );

        let send_buf = Arc::clone(&self.send_buf);
        let recv_buf = Arc::clone(&self.recv_buf);
        let tx = Arc::clone(&self.packet_tx);
        let tuple = self.tuple;
        threads.zwp = Some(
            thread::Builder::new()
                .name(format!("tcp-zwp-{}", self.id))
                .spawn(move || zwp_loop(&send_buf, &recv_buf, &tuple, &tx))
                .expect("failed to spawn probe thread"),
        );

        let weak = Arc::downgrade(self);
        threads.retransmit = Some(PeriodicTask::spawn(
            &format!("tcp-rtx-{}", self.id),
            RETRANSMIT_SCAN_PERIOD,
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.retransmit_tick();
                }
            },
        ));
    }

    // =========================================================================
    // State access
    // =========================================================================

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, TcpState> {
        self.state.lock().unwrap()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> TcpState {
        self.state.lock().unwrap().clone()
    }

    pub fn state_name(&self) -> &'static str {
        self.state.lock().unwrap().name()
    }

    // =========================================================================
    // Application API
    // =========================================================================

    /// Write stream data.  Allowed from the handshake onwards until our
    /// side has sent a FIN.
    pub fn write(&self, data: &[u8]) -> Result<usize, SocketError> {
        match self.state() {
            TcpState::SynSent(_)
            | TcpState::SynReceived(_)
            | TcpState::Established
            | TcpState::CloseWait => self.send_buf.write(data),
            TcpState::Closed => Err(SocketError::NotFound),
            _ => Err(SocketError::Closing),
        }
    }

    /// Read up to `n` bytes of stream data.
    ///
    /// In `CloseWait` the remaining buffered bytes drain first; after that
    /// every read reports `Closing`.
    pub fn read(&self, buf: &mut [u8], n: usize) -> Result<usize, SocketError> {
        match self.state() {
            TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::TimeWait(_) => self.recv_buf.read_at_most(buf, n),
            TcpState::CloseWait => {
                if self.recv_buf.to_read() > 0 {
                    self.recv_buf.read_at_most(buf, n)
                } else {
                    Err(SocketError::Closing)
                }
            }
            TcpState::SynSent(_) | TcpState::SynReceived(_) => Err(SocketError::Unimplemented),
            TcpState::Closed => Err(SocketError::NotFound),
            _ => Err(SocketError::Closing),
        }
    }

    /// Orderly close: send a FIN where the FSM allows one.
    pub fn close(&self) -> Result<(), SocketError> {
        let mut state = self.lock_state();
        match state.clone() {
            TcpState::SynSent(rendezvous) => {
                *state = TcpState::Closed;
                drop(state);
                rendezvous.notify_err(SocketError::Closing);
                self.shutdown_buffers();
                Ok(())
            }
            TcpState::SynReceived(listener) => {
                *state = TcpState::FinWait1;
                drop(state);
                if let Some(listener) = listener.upgrade() {
                    listener.remove_pending(&self.tuple);
                }
                self.send_fin();
                Ok(())
            }
            TcpState::Established => {
                *state = TcpState::FinWait1;
                drop(state);
                self.send_fin();
                Ok(())
            }
            TcpState::CloseWait => {
                *state = TcpState::LastAck;
                drop(state);
                self.send_fin();
                Ok(())
            }
            TcpState::Closed => Err(SocketError::NotFound),
            _ => Err(SocketError::Closing),
        }
    }

    /// Abort: flush the retransmission queue, shut both buffers, go to
    /// `Closed`.  A blocked `connect` caller observes `Reset`.
    pub fn abort(&self) -> Result<(), SocketError> {
        self.abort_with(SocketError::Reset)
    }

    /// Abort with a chosen error for a `SynSent` rendezvous (`Timeout` when
    /// the SYN retransmission limit is exceeded).
    pub(crate) fn abort_with(&self, syn_sent_error: SocketError) -> Result<(), SocketError> {
        let mut state = self.lock_state();
        match state.clone() {
            TcpState::Closed => return Err(SocketError::NotFound),
            TcpState::SynSent(rendezvous) => {
                rendezvous.notify_err(syn_sent_error);
            }
            TcpState::SynReceived(listener) => {
                if let Some(listener) = listener.upgrade() {
                    listener.remove_pending(&self.tuple);
                }
            }
            _ => {}
        }
        *state = TcpState::Closed;
        drop(state);

        self.send_buf.retransmit.clear();
        self.shutdown_buffers();
        Ok(())
    }

    // =========================================================================
    // Segment emission
    // =========================================================================

    /// Transmit with retransmission tracking.
    pub(crate) fn send_queued(&self, packet: TcpPacket) {
        let remote = self.tuple.remote.addr;
        let tx = self.packet_tx.as_ref();
        self.send_buf
            .retransmit
            .enqueue_and_send(packet, |p| tx(p, remote));
    }

    /// Transmit without retransmission tracking (pure acks).
    pub(crate) fn send_unqueued(&self, packet: &TcpPacket) {
        self.packet_tx.as_ref()(packet, self.tuple.remote.addr);
    }

    /// Emit our FIN, consuming one sequence number.
    pub(crate) fn send_fin(&self) {
        let seq = self.send_buf.nxt();
        let wnd = self.recv_buf.free() as u16;
        self.send_buf.consume_one_seq();
        debug!("tcp {}: sending FIN seq={seq}", self.id);
        self.send_queued(TcpPacket::fin(&self.tuple, seq, wnd));
    }

    // =========================================================================
    // Shutdown plumbing
    // =========================================================================

    pub(crate) fn shutdown_recv(&self) {
        self.recv_buf.shutdown();
    }

    pub(crate) fn shutdown_buffers(&self) {
        self.send_buf.shutdown();
        self.recv_buf.shutdown();
    }

    /// One pass of the 250 ms retransmission scan.
    fn retransmit_tick(&self) {
        let edge = self.send_buf.window_edge();
        let remote = self.tuple.remote.addr;
        let tx = self.packet_tx.as_ref();
        let result = self
            .send_buf
            .retransmit
            .collect_expired(edge, |p| tx(p, remote));
        if result.is_err() {
            warn!("tcp {}: retransmission limit reached, aborting", self.id);
            let _ = self.abort_with(SocketError::Timeout);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Stop order: retransmission scan, then wake and join the sender
        // and probe threads via buffer shutdown.
        let mut threads = self.threads.lock().unwrap();
        let retransmit = threads.retransmit.take();
        drop(retransmit);
        self.send_buf.shutdown();
        self.recv_buf.shutdown();
        if let Some(sender) = threads.sender.take() {
            let _ = sender.join();
        }
        if let Some(zwp) = threads.zwp.take() {
            let _ = zwp.join();
        }
    }
}

// =============================================================================
// Connection threads
// =============================================================================

/// Pull sendable bytes and emit data segments, preserving order (this is
/// the only thread that moves `NXT` forward with payload).
fn sender_loop(
    send_buf: &SendBuffer,
    recv_buf: &RecvBuffer,
    tuple: &SessionTuple,
    tx: &PacketTx,
) {
    let tx = tx.as_ref();
    let remote = tuple.remote.addr;
    let mut buf = [0u8; MAX_TCP_PAYLOAD];
    loop {
        let (seq, n) = match send_buf.take_ready(&mut buf) {
            Ok(taken) => taken,
            Err(_) => break, // shutdown
        };
        let (ack, wnd) = recv_buf.ack_wnd();
        let packet = TcpPacket::ack(tuple, seq, ack, wnd as u16, buf[..n].to_vec());
        send_buf.retransmit.enqueue_and_send(packet, |p| tx(p, remote));
    }
}

/// Drive zero-window probing: each cycle waits for a closed window, probes
/// with one byte, and blocks until the probe is covered.
fn zwp_loop(
    send_buf: &SendBuffer,
    recv_buf: &RecvBuffer,
    tuple: &SessionTuple,
    tx: &PacketTx,
) {
    let tx = tx.as_ref();
    let remote = tuple.remote.addr;
    loop {
        let probe = match send_buf.probe_byte() {
            Ok(probe) => probe,
            Err(_) => break, // shutdown
        };
        let Some((seq, byte)) = probe else {
            continue; // window reopened without a probe
        };

        let (ack, wnd) = recv_buf.ack_wnd();
        let packet = TcpPacket::ack(tuple, seq, ack, wnd as u16, vec![byte]);
        send_buf
            .retransmit
            .enqueue_zwp_and_send(packet, |p| tx(p, remote));

        if send_buf.wait_probe_ack().is_err() {
            break; // shutdown
        }
    }
}
