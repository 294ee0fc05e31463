//! Retransmission queue and the adaptive RTO estimator.
//!
//! Regular segments sit in a FIFO whose `seq + len` is non-decreasing, so
//! an ack prunes entirely-acknowledged entries from the front.  One extra
//! slot holds the current zero-window probe, which retransmits on an
//! exponential schedule instead of the flat RTO.
//!
//! RTT samples feed the estimator only from entries that were never
//! retransmitted, so a retransmission ambiguity cannot skew the RTO.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::SocketError;

use super::packet::TcpPacket;
use super::{seq_ge, seq_le, MAX_RETRANSMISSIONS};

// =============================================================================
// RTO estimator
// =============================================================================

/// Smoothed-RTT estimator: `SRTT <- a*SRTT + (1-a)*RTT`,
/// `RTO = clamp(b*SRTT, 500 ms, 1 s)`.
pub struct RtoEstimator {
    srtt: Duration,
    rto: Duration,
}

impl RtoEstimator {
    /// Lower clamp of the RTO.
    pub const MIN_RTO: Duration = Duration::from_millis(500);
    /// Upper clamp of the RTO.
    pub const MAX_RTO: Duration = Duration::from_millis(1000);
    const ALPHA: f64 = 0.875;
    const BETA: f64 = 1.5;

    pub fn new() -> Self {
        Self {
            srtt: Duration::from_millis(300),
            rto: Duration::from_millis(500),
        }
    }

    /// The current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Fold one round-trip sample into the estimate.
    pub fn add_sample(&mut self, rtt: Duration) {
        self.srtt = self.srtt.mul_f64(Self::ALPHA) + rtt.mul_f64(1.0 - Self::ALPHA);
        self.rto = self
            .srtt
            .mul_f64(Self::BETA)
            .clamp(Self::MIN_RTO, Self::MAX_RTO);
    }
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Queue
// =============================================================================

struct Entry {
    packet: TcpPacket,
    last_sent: Instant,
    counter: u32,
}

impl Entry {
    #[inline]
    fn end_seq(&self) -> u32 {
        self.packet.end_seq()
    }
}

struct QueueInner {
    deque: VecDeque<Entry>,
    zwp: Option<Entry>,
    rto: RtoEstimator,
}

/// The per-connection retransmission queue.
pub struct RetransmissionQueue {
    inner: Mutex<QueueInner>,
}

impl RetransmissionQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                deque: VecDeque::new(),
                zwp: None,
                rto: RtoEstimator::new(),
            }),
        }
    }

    /// Current RTO estimate.
    pub fn rto(&self) -> Duration {
        self.inner.lock().unwrap().rto.rto()
    }

    /// Number of queued regular entries (diagnostic).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().deque.is_empty()
    }

    /// Append a segment and transmit it while the queue lock is held, so
    /// segments enter the IP layer in queue order.
    pub fn enqueue_and_send<F: FnOnce(&TcpPacket)>(&self, packet: TcpPacket, send: F) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(
            inner
                .deque
                .back()
                .map(|back| seq_ge(packet.seq(), back.end_seq()))
                .unwrap_or(true),
            "segment enqueued out of order"
        );
        inner.deque.push_back(Entry {
            packet,
            last_sent: Instant::now(),
            counter: 0,
        });
        send(&inner.deque.back().unwrap().packet);
    }

    /// Install the zero-window probe and transmit it under the lock.
    pub fn enqueue_zwp_and_send<F: FnOnce(&TcpPacket)>(&self, packet: TcpPacket, send: F) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.zwp.is_none(), "a zero-window probe is already queued");
        inner.zwp = Some(Entry {
            packet,
            last_sent: Instant::now(),
            counter: 0,
        });
        send(&inner.zwp.as_ref().unwrap().packet);
    }

    /// Drop every entry fully covered by `ack`, sampling RTTs from entries
    /// that were never retransmitted.
    pub fn on_ack(&self, ack: u32) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        while let Some(front) = inner.deque.front() {
            if !seq_le(front.end_seq(), ack) {
                break;
            }
            let entry = inner.deque.pop_front().unwrap();
            if entry.counter == 0 {
                let rtt = now.duration_since(entry.last_sent);
                inner.rto.add_sample(rtt);
            }
        }
        let probe_covered = inner
            .zwp
            .as_ref()
            .map_or(false, |zwp| seq_le(zwp.end_seq(), ack));
        if probe_covered {
            inner.zwp = None;
        }
    }

    /// Retransmit every entry inside the send window whose RTO elapsed.
    ///
    /// `window_edge` is `SND.UNA + WND`; entries beyond it are left alone
    /// (a shrunk window must not time the connection out).  Transmission
    /// happens under the queue lock.  Returns the number of segments resent
    /// or `Timeout` once any entry exceeds the retransmission limit.
    pub fn collect_expired<F: FnMut(&TcpPacket)>(
        &self,
        window_edge: u32,
        mut send: F,
    ) -> Result<usize, SocketError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let rto = inner.rto.rto();
        let mut resent = 0usize;

        for entry in inner.deque.iter_mut() {
            if !seq_le(entry.end_seq(), window_edge) {
                continue;
            }
            if now.duration_since(entry.last_sent) <= rto {
                continue;
            }
            entry.counter += 1;
            if entry.counter > MAX_RETRANSMISSIONS {
                warn!(
                    "tcp: segment seq={} len={} exceeded {} retransmissions, giving up",
                    entry.packet.seq(),
                    entry.packet.payload_len(),
                    MAX_RETRANSMISSIONS
                );
                return Err(SocketError::Timeout);
            }
            debug!(
                "tcp: retransmitting seq={} len={} (retry #{}, rto {:?})",
                entry.packet.seq(),
                entry.packet.payload_len(),
                entry.counter,
                rto
            );
            entry.last_sent = now;
            send(&entry.packet);
            resent += 1;
        }

        // The probe backs off exponentially instead of using the flat RTO.
        if let Some(zwp) = inner.zwp.as_mut() {
            let backoff = rto.saturating_mul(1u32 << zwp.counter.min(16));
            if now.duration_since(zwp.last_sent) > backoff {
                zwp.counter += 1;
                debug!(
                    "tcp: retransmitting zero-window probe seq={} (retry #{})",
                    zwp.packet.seq(),
                    zwp.counter
                );
                zwp.last_sent = now;
                send(&zwp.packet);
                resent += 1;
            }
        }

        Ok(resent)
    }

    /// Restart the probe's exponential countdown (a window advertisement
    /// arrived that does not yet cover the probe byte).
    pub fn reset_zwp_counter(&self) {
        if let Some(zwp) = self.inner.lock().unwrap().zwp.as_mut() {
            zwp.counter = 0;
        }
    }

    /// Drop everything (abort path).
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.deque.clear();
        inner.zwp = None;
    }
}

impl Default for RetransmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}
