//! Send and receive buffers: sliding windows over the byte rings.
//!
//! # Send side
//!
//! Three counters advance monotonically in sequence space:
//!
//! ```text
//! [UNA, NXT)  in flight, eligible for retransmission
//! [NXT, NBW)  written by the application, not yet sent
//! free      = N - (NBW - UNA)
//! ```
//!
//! The peer's advertised window caps `NXT - UNA`.  Writers and the single
//! sender thread block on distinct condition variables: an ack that frees
//! space wakes writers without spuriously waking the sender, and a write
//! that adds bytes wakes only the sender.
//!
//! # Receive side
//!
//! `[NBR, NXT)` is contiguous and readable; the advertised window is
//! `N - (NXT - NBR)`.  Early arrivals are written in place and tracked as
//! merged intervals, so one in-order segment can complete a large span.
//!
//! # Shutdown
//!
//! Both buffers carry a `stopped` flag; `shutdown` sets it and broadcasts
//! every condition variable the buffer owns.  Every blocked call returns
//! [`SocketError::Closing`] on wake.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::debug;

use crate::error::SocketError;

use super::intervals::IntervalSet;
use super::retransmit::RetransmissionQueue;
use super::ring::RingBuffer;
use super::{seq_gt, seq_le, RECV_BUFFER_SIZE, SEND_BUFFER_SIZE};

/// How long the probe driver waits in `Countdown` for a window to reopen.
pub const ZWP_TIMEOUT: Duration = Duration::from_millis(4 * 500); // 4 x MIN_RTO

// =============================================================================
// Send buffer
// =============================================================================

/// Zero-window-probe driver phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ZwpPhase {
    /// Waiting for the window to close.
    Pause,
    /// Window is zero; waiting up to [`ZWP_TIMEOUT`] for it to reopen.
    Countdown,
    /// A probe byte is outstanding; waiting for an ack covering it.
    WaitAck,
}

struct SendState {
    ring: RingBuffer,
    /// Oldest sent-but-unacknowledged sequence number.
    una: u32,
    /// Next sequence number to send.
    nxt: u32,
    /// Next byte the application will write.
    nbw: u32,
    /// Peer-advertised window.
    wnd: u32,
    zwp_phase: ZwpPhase,
    zwp_seq: u32,
    stopped: bool,
}

impl SendState {
    #[inline]
    fn unacked(&self) -> usize {
        self.nxt.wrapping_sub(self.una) as usize
    }

    #[inline]
    fn not_sent(&self) -> usize {
        self.nbw.wrapping_sub(self.nxt) as usize
    }

    /// Bytes the sender may emit now: window headroom capped by what the
    /// application has written.
    #[inline]
    fn can_send(&self) -> usize {
        let wnd = self.wnd as usize;
        if wnd > self.unacked() {
            (wnd - self.unacked()).min(self.not_sent())
        } else {
            0
        }
    }

    #[inline]
    fn free(&self) -> usize {
        self.ring.capacity() - self.nbw.wrapping_sub(self.una) as usize
    }
}

/// The send side of one connection.
pub struct SendBuffer {
    state: Mutex<SendState>,
    /// Wakes blocked `write` callers when an ack frees space.
    writer_cv: Condvar,
    /// Wakes the sender thread when bytes become sendable.
    sender_cv: Condvar,
    /// Wakes the probe driver out of `Pause` when the window closes.
    zwp_pause_cv: Condvar,
    /// Wakes the probe driver in `Countdown`/`WaitAck` on any ack.
    zwp_countdown_cv: Condvar,
    /// In-flight segments awaiting acknowledgment.
    pub retransmit: RetransmissionQueue,
}

impl SendBuffer {
    /// A send buffer whose counters all start at `isn`, trusting an initial
    /// peer window of `wnd`.
    pub fn new(isn: u32, wnd: u32) -> Self {
        Self {
            state: Mutex::new(SendState {
                ring: RingBuffer::new(SEND_BUFFER_SIZE),
                una: isn,
                nxt: isn,
                nbw: isn,
                wnd,
                zwp_phase: ZwpPhase::Pause,
                zwp_seq: 0,
                stopped: false,
            }),
            writer_cv: Condvar::new(),
            sender_cv: Condvar::new(),
            zwp_pause_cv: Condvar::new(),
            zwp_countdown_cv: Condvar::new(),
            retransmit: RetransmissionQueue::new(),
        }
    }

    // =========================================================================
    // Application write
    // =========================================================================

    /// Copy all of `data` into the buffer, blocking whenever it is full.
    ///
    /// Returns the total written, or `Closing` if the buffer shuts down
    /// while any bytes remain.
    pub fn write(&self, data: &[u8]) -> Result<usize, SocketError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut state = self.state.lock().unwrap();
            state = self
                .writer_cv
                .wait_while(state, |s| s.free() == 0 && !s.stopped)
                .unwrap();
            if state.stopped {
                return Err(SocketError::Closing);
            }

            let last = state.una.wrapping_add(state.ring.capacity() as u32 - 1);
            let at = state.nbw;
            let n = state.ring.write(remaining, at, last);
            state.nbw = state.nbw.wrapping_add(n as u32);
            remaining = &remaining[n..];

            if state.can_send() > 0 {
                self.sender_cv.notify_one();
            }
        }
        Ok(data.len())
    }

    // =========================================================================
    // Ack processing
    // =========================================================================

    /// Process an acknowledgment carrying an advertised window.
    ///
    /// The window is believed from any segment whose ack is at or past
    /// `UNA`; out-of-order window reports are a known (accepted) wrinkle.
    /// An acceptable ack (`UNA < ack <= NXT`) advances `UNA`, wakes blocked
    /// writers, and prunes the retransmission queue.
    ///
    /// Returns the `(UNA, NXT)` pair after processing.
    pub fn on_ack(&self, ack: u32, wnd: u32) -> (u32, u32) {
        let (una, nxt) = {
            let mut state = self.state.lock().unwrap();
            let prev_una = state.una;

            if seq_le(prev_una, ack) {
                if wnd > state.wnd {
                    self.sender_cv.notify_one();
                }
                state.wnd = wnd;

                match state.zwp_phase {
                    ZwpPhase::Pause => {
                        if state.wnd == 0 {
                            self.zwp_pause_cv.notify_one();
                        }
                    }
                    ZwpPhase::Countdown => {
                        self.zwp_countdown_cv.notify_one();
                    }
                    ZwpPhase::WaitAck => {
                        if seq_gt(ack, state.zwp_seq) {
                            // The probe byte is covered: probing is over.
                            state.zwp_phase = ZwpPhase::Pause;
                            self.zwp_countdown_cv.notify_one();
                        } else if state.wnd > 0 {
                            self.retransmit.reset_zwp_counter();
                        }
                    }
                }
            }

            // Unacceptable ack: nothing to advance.
            if seq_le(ack, prev_una) || seq_gt(ack, state.nxt) {
                return (prev_una, state.nxt);
            }

            state.una = ack;
            (ack, state.nxt)
        };

        self.writer_cv.notify_all();
        self.retransmit.on_ack(ack);
        (una, nxt)
    }

    // =========================================================================
    // Sender thread
    // =========================================================================

    /// Block until bytes are sendable, then move up to `buf.len()` of them
    /// from "not yet sent" to "in flight".
    ///
    /// Returns the starting sequence number and count.  The window is
    /// charged here, before the ack arrives, so the sender can never
    /// overrun a shrinking advertisement.
    pub fn take_ready(&self, buf: &mut [u8]) -> Result<(u32, usize), SocketError> {
        let mut state = self.state.lock().unwrap();
        state = self
            .sender_cv
            .wait_while(state, |s| s.can_send() == 0 && !s.stopped)
            .unwrap();
        if state.stopped {
            return Err(SocketError::Closing);
        }

        let seq = state.nxt;
        let n = state.can_send().min(buf.len());
        let _read = state.ring.read(&mut buf[..n], seq, seq.wrapping_add(n as u32 - 1));
        debug_assert_eq!(_read, n, "send ring returned short read");

        state.wnd -= n as u32;
        state.nxt = state.nxt.wrapping_add(n as u32);
        Ok((seq, n))
    }

    // =========================================================================
    // Zero-window probing
    // =========================================================================

    /// Drive one cycle of the probe FSM up to the probe transmission.
    ///
    /// Blocks in `Pause` until the window closes, then in `Countdown` for
    /// [`ZWP_TIMEOUT`] hoping it reopens.  On timeout with unsent data, one
    /// byte is consumed (advancing `NXT` past it) and returned for
    /// transmission; `Ok(None)` means the cycle ended without needing a
    /// probe.
    pub fn probe_byte(&self) -> Result<Option<(u32, u8)>, SocketError> {
        let mut state = self.state.lock().unwrap();

        state.zwp_phase = ZwpPhase::Pause;
        state = self
            .zwp_pause_cv
            .wait_while(state, |s| s.wnd != 0 && !s.stopped)
            .unwrap();
        if state.stopped {
            return Err(SocketError::Closing);
        }

        state.zwp_phase = ZwpPhase::Countdown;
        let (mut state, timeout) = self
            .zwp_countdown_cv
            .wait_timeout_while(state, ZWP_TIMEOUT, |s| s.wnd == 0 && !s.stopped)
            .unwrap();
        if state.stopped {
            return Err(SocketError::Closing);
        }
        if !timeout.timed_out() {
            // The window reopened; no probe needed this round.
            state.zwp_phase = ZwpPhase::Pause;
            return Ok(None);
        }
        if state.not_sent() == 0 {
            state.zwp_phase = ZwpPhase::Pause;
            return Ok(None);
        }

        state.zwp_phase = ZwpPhase::WaitAck;
        let seq = state.nxt;
        state.zwp_seq = seq;
        let byte = state.ring.at(seq);
        state.nxt = state.nxt.wrapping_add(1);
        debug!("tcp: zero-window timeout, probing with byte at seq {seq}");
        Ok(Some((seq, byte)))
    }

    /// Block until the outstanding probe is acknowledged (phase returns to
    /// `Pause`) or the buffer shuts down.
    pub fn wait_probe_ack(&self) -> Result<(), SocketError> {
        let state = self.state.lock().unwrap();
        let state = self
            .zwp_countdown_cv
            .wait_while(state, |s| s.zwp_phase != ZwpPhase::Pause && !s.stopped)
            .unwrap();
        if state.stopped {
            return Err(SocketError::Closing);
        }
        Ok(())
    }

    // =========================================================================
    // Handshake bookkeeping and snapshots
    // =========================================================================

    /// Account for a segment that occupies one sequence number but carries
    /// no buffer bytes (SYN, FIN): advance `NBW` and `NXT` together.
    pub fn consume_one_seq(&self) {
        let mut state = self.state.lock().unwrap();
        state.nbw = state.nbw.wrapping_add(1);
        state.nxt = state.nxt.wrapping_add(1);
    }

    /// Next sequence number to send.
    pub fn nxt(&self) -> u32 {
        self.state.lock().unwrap().nxt
    }

    /// `(UNA, NXT)` snapshot.
    pub fn una_nxt(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap();
        (state.una, state.nxt)
    }

    /// Exclusive right edge of the send window, `UNA + WND`.
    pub fn window_edge(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state.una.wrapping_add(state.wnd)
    }

    /// Bytes of buffer space not yet written by the application.
    pub fn free(&self) -> usize {
        self.state.lock().unwrap().free()
    }

    /// `true` while all three counters coincide (fresh connection).
    pub fn at_start(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.una == state.nxt && state.nxt == state.nbw
    }

    /// Stop every waiter; all blocked calls return `Closing`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        drop(state);
        self.writer_cv.notify_all();
        self.sender_cv.notify_all();
        self.zwp_pause_cv.notify_all();
        self.zwp_countdown_cv.notify_all();
    }
}

// =============================================================================
// Receive buffer
// =============================================================================

struct RecvState {
    ring: RingBuffer,
    /// Next byte the application will read.
    nbr: u32,
    /// Next in-order sequence number expected from the peer.
    nxt: u32,
    early_arrivals: IntervalSet,
    stopped: bool,
}

impl RecvState {
    #[inline]
    fn to_read(&self) -> usize {
        self.nxt.wrapping_sub(self.nbr) as usize
    }

    /// The advertised receive window.
    #[inline]
    fn free(&self) -> usize {
        self.ring.capacity() - self.to_read()
    }
}

/// The receive side of one connection.
pub struct RecvBuffer {
    state: Mutex<RecvState>,
    reader_cv: Condvar,
}

impl RecvBuffer {
    /// A receive buffer expecting `rcv_nxt` as the next in-order byte.
    pub fn new(rcv_nxt: u32) -> Self {
        Self {
            state: Mutex::new(RecvState {
                ring: RingBuffer::new(RECV_BUFFER_SIZE),
                nbr: rcv_nxt,
                nxt: rcv_nxt,
                early_arrivals: IntervalSet::new(),
                stopped: false,
            }),
            reader_cv: Condvar::new(),
        }
    }

    /// Reset both pointers once the peer's ISN is known (active open learns
    /// it from the SYN|ACK).
    pub fn set_initial(&self, rcv_nxt: u32) {
        let mut state = self.state.lock().unwrap();
        state.nbr = rcv_nxt;
        state.nxt = rcv_nxt;
    }

    // =========================================================================
    // Application read
    // =========================================================================

    /// Read up to `n` bytes, blocking while `[NBR, NXT)` is empty.
    ///
    /// A shutdown buffer still drains its remaining contiguous bytes;
    /// `Closing` is reported once nothing is left.
    pub fn read_at_most(&self, buf: &mut [u8], n: usize) -> Result<usize, SocketError> {
        if n == 0 {
            return Ok(0);
        }
        let mut state = self.state.lock().unwrap();
        state = self
            .reader_cv
            .wait_while(state, |s| s.to_read() == 0 && !s.stopped)
            .unwrap();
        if state.to_read() == 0 {
            return Err(SocketError::Closing);
        }

        let n = n.min(state.to_read()).min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        let at = state.nbr;
        let _read = state.ring.read(&mut buf[..n], at, at.wrapping_add(n as u32 - 1));
        debug_assert_eq!(_read, n, "recv ring returned short read");
        state.nbr = state.nbr.wrapping_add(n as u32);
        Ok(n)
    }

    // =========================================================================
    // Segment arrival
    // =========================================================================

    /// Handle a data segment.
    ///
    /// Three cases on `seq` versus `NXT`: an old-overlap segment has its
    /// stale prefix skipped; an in-order segment is written and merged with
    /// any early arrivals it connects to; an early segment is stored in
    /// place and recorded as an interval.  Returns the `(ack, window)` pair
    /// to advertise back.
    pub fn on_recv(&self, seq: u32, payload: &[u8]) -> (u32, u32) {
        debug_assert!(!payload.is_empty(), "data segments carry payload");

        let mut state = self.state.lock().unwrap();
        let ack = state.nxt;
        let wnd = state.free() as u32;

        // Early arrival: store it, remember the gap.
        if seq_gt(seq, state.nxt) {
            let last = state.nbr.wrapping_add(state.ring.capacity() as u32 - 1);
            let written = state.ring.write(payload, seq, last) as u32;
            if written > 0 {
                state
                    .early_arrivals
                    .emplace_merge(seq, seq.wrapping_add(written));
            }
            return (ack, wnd);
        }

        // Skip whatever prefix of the payload is already received.
        let offset = state.nxt.wrapping_sub(seq) as usize;
        if offset >= payload.len() {
            return (ack, wnd);
        }

        let at = state.nxt;
        let last = state.nbr.wrapping_add(state.ring.capacity() as u32 - 1);
        let written = state.ring.write(&payload[offset..], at, last) as u32;
        if written == 0 {
            return (ack, wnd);
        }

        // Connect with early arrivals; the cluster's right edge is the new
        // NXT.
        let merged_end = state
            .early_arrivals
            .merge_remove(at, at.wrapping_add(written));
        state.nxt = merged_end;

        let ack = state.nxt;
        let wnd = state.free() as u32;
        drop(state);

        self.reader_cv.notify_one();
        (ack, wnd)
    }

    /// Handle a sequence-consuming control segment (FIN): advance `NXT` by
    /// one when it arrives in order.  Returns `(ack, window)`.
    pub fn on_ctrl(&self, seq: u32) -> (u32, u32) {
        let mut state = self.state.lock().unwrap();
        if seq == state.nxt {
            state.nxt = state.nxt.wrapping_add(1);
        }
        (state.nxt, state.free() as u32)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Current `(ack, window)` advertisement.
    pub fn ack_wnd(&self) -> (u32, u32) {
        let state = self.state.lock().unwrap();
        (state.nxt, state.free() as u32)
    }

    /// Bytes available for reading.
    pub fn to_read(&self) -> usize {
        self.state.lock().unwrap().to_read()
    }

    /// The advertised window.
    pub fn free(&self) -> usize {
        self.state.lock().unwrap().free()
    }

    /// `true` while nothing has been received (fresh connection).
    pub fn at_start(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.nbr == state.nxt
    }

    /// Stop every waiter; blocked reads return `Closing`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        drop(state);
        self.reader_cv.notify_all();
    }
}
