//! TCP stack tests: two stacks joined by an in-memory wire, exercising the
//! three-way handshake, stream transfer, teardown, and failure paths.

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::packet::{TcpHeader, TcpPacket};
use super::socket::TcpState;
use super::stack::{IpSender, Socket, TcpStack};
use super::{TCP_FLAG_ACK, TCP_FLAG_SYN};
use crate::error::{IpError, SocketError};
use crate::ip::datagram::Datagram;
use crate::types::{Endpoint, IpProtocol};

const ADDR_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const ADDR_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Every segment observed on the wire, with its source address.
type WireLog = Arc<Mutex<Vec<(Ipv4Addr, TcpHeader)>>>;

/// Build two stacks whose IP senders feed a shared queue; a pump thread
/// moves datagrams between them and records each header.
fn linked_stacks() -> (Arc<TcpStack>, Arc<TcpStack>, WireLog) {
    let (tx, rx) = mpsc::channel::<(Ipv4Addr, Ipv4Addr, Vec<u8>)>();
    let tx = Arc::new(Mutex::new(tx));

    let make_sender = |src: Ipv4Addr| -> IpSender {
        let tx = Arc::clone(&tx);
        Arc::new(move |dst, payload| {
            tx.lock()
                .unwrap()
                .send((src, dst, payload))
                .map_err(|_| IpError::Malformed("wire closed".into()))
        })
    };

    let stack_a = TcpStack::new();
    stack_a.register_ip_sender(make_sender(ADDR_A));
    let stack_b = TcpStack::new();
    stack_b.register_ip_sender(make_sender(ADDR_B));

    let log: WireLog = Arc::new(Mutex::new(Vec::new()));

    let pump_a = Arc::clone(&stack_a);
    let pump_b = Arc::clone(&stack_b);
    let pump_log = Arc::clone(&log);
    thread::spawn(move || {
        while let Ok((src, dst, payload)) = rx.recv() {
            if let Ok(packet) = TcpPacket::decode(src, dst, &payload) {
                pump_log.lock().unwrap().push((src, packet.header));
            }
            let datagram = Datagram::new(src, dst, IpProtocol::Tcp, payload).unwrap();
            if dst == ADDR_B {
                pump_b.handle_datagram(datagram);
            } else {
                pump_a.handle_datagram(datagram);
            }
        }
    });

    (stack_a, stack_b, log)
}

// =============================================================================
// Handshake
// =============================================================================

#[test]
fn test_three_way_handshake() {
    let (stack_a, stack_b, log) = linked_stacks();

    let listener = stack_b.listen(5555).unwrap();
    let accepter = thread::spawn(move || listener.accept());

    let conn = stack_a
        .connect(ADDR_A, Endpoint::new(ADDR_B, 5555))
        .unwrap();
    let accepted = accepter.join().unwrap().unwrap();
    thread::sleep(Duration::from_millis(100));

    // Exactly one SYN, one SYN|ACK, one plain ACK; numbers chain.
    let log = log.lock().unwrap();
    let syns: Vec<_> = log
        .iter()
        .filter(|(_, h)| h.flags == TCP_FLAG_SYN)
        .collect();
    let syn_acks: Vec<_> = log
        .iter()
        .filter(|(_, h)| h.flags == (TCP_FLAG_SYN | TCP_FLAG_ACK))
        .collect();
    let acks: Vec<_> = log
        .iter()
        .filter(|(_, h)| h.flags == TCP_FLAG_ACK)
        .collect();
    assert_eq!(syns.len(), 1, "no SYN retransmission expected");
    assert_eq!(syn_acks.len(), 1);
    assert_eq!(acks.len(), 1);

    let (syn_src, syn) = syns[0];
    let (_, syn_ack) = syn_acks[0];
    let (_, ack) = acks[0];
    assert_eq!(*syn_src, ADDR_A);
    assert_eq!(syn_ack.ack, syn.seq.wrapping_add(1));
    assert_eq!(ack.seq, syn.seq.wrapping_add(1));
    assert_eq!(ack.ack, syn_ack.seq.wrapping_add(1));

    // Both ends established; the accepted session is the mirror image.
    assert_eq!(conn.state_name(), "ESTABLISHED");
    assert_eq!(accepted.state_name(), "ESTABLISHED");
    assert_eq!(accepted.tuple, conn.tuple.swapped());
}

#[test]
fn test_duplicate_listen_rejected() {
    let (_, stack_b, _) = linked_stacks();
    stack_b.listen(6000).unwrap();
    assert!(matches!(
        stack_b.listen(6000),
        Err(SocketError::Duplicate)
    ));
}

#[test]
fn test_listener_close_wakes_accepter() {
    let (_, stack_b, _) = linked_stacks();
    let listener = stack_b.listen(6100).unwrap();
    let id = listener.id;

    let accepter = {
        let listener = Arc::clone(&listener);
        thread::spawn(move || listener.accept())
    };
    thread::sleep(Duration::from_millis(50));
    stack_b.close(id).unwrap();
    assert!(matches!(
        accepter.join().unwrap(),
        Err(SocketError::Closing)
    ));

    // The reaper collects the closed listener and frees its port.
    stack_b.reap();
    assert!(matches!(
        stack_b.find_socket(id),
        Err(SocketError::NotFound)
    ));
    assert!(stack_b.listen(6100).is_ok());
}

// =============================================================================
// Data transfer
// =============================================================================

#[test]
fn test_stream_transfer_integrity() {
    let (stack_a, stack_b, _) = linked_stacks();

    let listener = stack_b.listen(7000).unwrap();
    let accepter = thread::spawn(move || listener.accept());
    let conn = stack_a
        .connect(ADDR_A, Endpoint::new(ADDR_B, 7000))
        .unwrap();
    let accepted = accepter.join().unwrap().unwrap();

    const TOTAL: usize = 200_000;
    let data: Vec<u8> = (0..TOTAL).map(|i| (i % 256) as u8).collect();
    let (una_start, _) = conn.send_buf.una_nxt();

    let writer = {
        let payload = data.clone();
        let conn = Arc::clone(&conn);
        thread::spawn(move || conn.write(&payload))
    };

    let mut received = Vec::with_capacity(TOTAL);
    let mut buf = vec![0u8; 8192];
    let buf_len = buf.len();
    while received.len() < TOTAL {
        let n = accepted.read(&mut buf, buf_len).unwrap();
        received.extend_from_slice(&buf[..n]);
    }

    assert_eq!(writer.join().unwrap(), Ok(TOTAL));
    assert_eq!(received, data);

    // Give the last ack a moment to come back, then the window must be
    // fully acknowledged: UNA == NXT == ISN + 1 + TOTAL.
    thread::sleep(Duration::from_millis(200));
    let (una, nxt) = conn.send_buf.una_nxt();
    assert_eq!(una, nxt);
    assert_eq!(una, una_start.wrapping_add(TOTAL as u32));
}

// =============================================================================
// Teardown
// =============================================================================

#[test]
fn test_active_close_then_passive_close() {
    let (stack_a, stack_b, _) = linked_stacks();

    let listener = stack_b.listen(8000).unwrap();
    let accepter = thread::spawn(move || listener.accept());
    let conn = stack_a
        .connect(ADDR_A, Endpoint::new(ADDR_B, 8000))
        .unwrap();
    let accepted = accepter.join().unwrap().unwrap();

    // Active close on A: FIN flies, B acks and lands in CLOSE_WAIT.
    conn.close().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(accepted.state_name(), "CLOSE_WAIT");
    assert_eq!(conn.state_name(), "FIN_WAIT_2");

    // B's reader drains nothing and observes the close.
    let mut buf = [0u8; 8];
    assert_eq!(accepted.read(&mut buf, 8), Err(SocketError::Closing));

    // Passive close on B: LAST_ACK then CLOSED; A enters TIME_WAIT.
    accepted.close().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(accepted.state_name(), "CLOSED");
    assert_eq!(conn.state_name(), "TIME_WAIT");

    // The reaper collects B's closed socket and returns its id.
    let id = accepted.id;
    stack_b.reap();
    assert!(matches!(
        stack_b.find_socket(id),
        Err(SocketError::NotFound)
    ));
}

#[test]
fn test_close_wait_drains_buffered_data_before_closing() {
    let (stack_a, stack_b, _) = linked_stacks();

    let listener = stack_b.listen(8100).unwrap();
    let accepter = thread::spawn(move || listener.accept());
    let conn = stack_a
        .connect(ADDR_A, Endpoint::new(ADDR_B, 8100))
        .unwrap();
    let accepted = accepter.join().unwrap().unwrap();

    conn.write(b"last words").unwrap();
    thread::sleep(Duration::from_millis(100));
    conn.close().unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(accepted.state_name(), "CLOSE_WAIT");

    // Buffered bytes are still readable in CLOSE_WAIT; after the drain the
    // reader sees Closing.
    let mut buf = [0u8; 32];
    let n = accepted.read(&mut buf, 32).unwrap();
    assert_eq!(&buf[..n], b"last words");
    assert_eq!(accepted.read(&mut buf, 32), Err(SocketError::Closing));
}

// =============================================================================
// Failure paths
// =============================================================================

#[test]
fn test_connect_with_no_listener_times_out() {
    let (stack_a, _stack_b, _) = linked_stacks();

    // Nothing listens on the port: the SYN is retransmitted to its limit
    // and the caller observes Timeout.
    let result = stack_a.connect(ADDR_A, Endpoint::new(ADDR_B, 9999));
    assert!(matches!(result, Err(SocketError::Timeout)));
}

#[test]
fn test_abort_wakes_blocked_connect_with_reset() {
    let (stack_a, _stack_b, _) = linked_stacks();

    let connector = {
        let stack_a = Arc::clone(&stack_a);
        thread::spawn(move || stack_a.connect(ADDR_A, Endpoint::new(ADDR_B, 9998)))
    };
    thread::sleep(Duration::from_millis(100));

    // The first allocated socket id is 1.
    stack_a.abort(1).unwrap();
    assert!(matches!(
        connector.join().unwrap(),
        Err(SocketError::Reset)
    ));
}

#[test]
fn test_send_recv_on_listener_not_allowed() {
    let (_, stack_b, _) = linked_stacks();
    let listener = stack_b.listen(9000).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(
        stack_b.send(listener.id, b"nope"),
        Err(SocketError::NotAllowed)
    );
    assert_eq!(
        stack_b.recv(listener.id, &mut buf, 4),
        Err(SocketError::NotAllowed)
    );
}

#[test]
fn test_unknown_socket_id_not_found() {
    let (stack_a, _, _) = linked_stacks();
    let mut buf = [0u8; 4];
    assert_eq!(stack_a.send(42, b"x"), Err(SocketError::NotFound));
    assert_eq!(stack_a.recv(42, &mut buf, 4), Err(SocketError::NotFound));
    assert_eq!(stack_a.close(42), Err(SocketError::NotFound));
    assert!(matches!(
        stack_a.find_socket(42),
        Err(SocketError::NotFound)
    ));
}

#[test]
fn test_listing_shows_listener_and_connection() {
    let (stack_a, stack_b, _) = linked_stacks();

    let listener = stack_b.listen(9100).unwrap();
    let accepter = thread::spawn(move || listener.accept());
    let conn = stack_a
        .connect(ADDR_A, Endpoint::new(ADDR_B, 9100))
        .unwrap();
    accepter.join().unwrap().unwrap();

    let mut out_b = Vec::new();
    stack_b.list_sockets(&mut out_b).unwrap();
    let listing_b = String::from_utf8(out_b).unwrap();
    assert!(listing_b.contains("LISTEN"));
    assert!(listing_b.contains("ESTABLISHED"));

    let mut out_a = Vec::new();
    stack_a.list_sockets(&mut out_a).unwrap();
    let listing_a = String::from_utf8(out_a).unwrap();
    assert!(listing_a.contains("ESTABLISHED"));
    assert!(listing_a.contains(&conn.tuple.local.port.to_string()));

    // The socket table slot is the two-variant sum.
    match stack_a.find_socket(conn.id).unwrap() {
        Socket::Normal(found) => assert_eq!(found.tuple, conn.tuple),
        Socket::Listen(_) => panic!("expected a connection"),
    }
}

#[test]
fn test_states_carry_payload() {
    // TcpState's tagged variants expose their payload where it matters.
    let now = std::time::Instant::now();
    let state = TcpState::TimeWait(now);
    assert_eq!(state.name(), "TIME_WAIT");
    assert!(!state.is_reapable(), "fresh TIME_WAIT must linger");
    assert!(TcpState::Closed.is_reapable());
}
