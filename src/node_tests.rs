//! Node integration tests over real UDP loopback links: routing
//! resolution, end-to-end TCP between hosts, forwarding through a router,
//! and RIP convergence.
//!
//! Each test uses its own fixed loopback port range so the fixtures never
//! collide when tests run in parallel.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::NodeConfig;
use crate::ip::rip::{RipEngine, RIP_INFINITY};
use crate::ip::routing::QueryStrategy;
use crate::node::{Node, NodeKind};
use crate::tcp::stack::TcpStack;
use crate::types::{Endpoint, IpProtocol};

/// Build a host node with its TCP stack wired the way `vhost` does it.
fn make_host(lnx: &str) -> (Arc<Node>, Arc<TcpStack>) {
    let config = NodeConfig::parse(lnx).unwrap();
    let node = Node::new(&config, NodeKind::Host).unwrap();

    let stack = TcpStack::new();
    let ip_node = Arc::downgrade(&node);
    stack.register_ip_sender(Arc::new(move |dst, payload| {
        match ip_node.upgrade() {
            Some(node) => node.send_ip(dst, IpProtocol::Tcp, payload).map(|_| ()),
            None => Ok(()),
        }
    }));
    node.attach_tcp(Arc::clone(&stack));
    node.start();
    (node, stack)
}

/// Build a router node with its RIP engine, the way `vrouter` does it.
fn make_router(lnx: &str) -> Arc<Node> {
    let config = NodeConfig::parse(lnx).unwrap();
    let node = Node::new(&config, NodeKind::Router).unwrap();
    let engine = RipEngine::start(&node, config.rip_neighbors.clone());
    node.attach_rip(engine);
    node.start();
    node
}

// =============================================================================
// Routing resolution
// =============================================================================

#[test]
fn test_source_addr_follows_default_route() {
    let (node, _stack) = make_host(
        "\
interface if0 10.0.0.5/24 127.0.0.1:17401
routing static
route 0.0.0.0/0 via 10.0.0.1
",
    );

    // Any destination resolves through the default route's gateway onto if0.
    let src = node.source_addr_for(Ipv4Addr::new(99, 9, 9, 9)).unwrap();
    assert_eq!(src, Ipv4Addr::new(10, 0, 0, 5));
    assert!(node.is_local_addr(Ipv4Addr::new(10, 0, 0, 5)));
    assert!(!node.is_local_addr(Ipv4Addr::new(10, 0, 0, 1)));
}

#[test]
fn test_no_route_is_an_error() {
    let (node, _stack) = make_host(
        "\
interface if0 10.0.0.5/24 127.0.0.1:17402
routing static
",
    );
    assert!(node.source_addr_for(Ipv4Addr::new(99, 9, 9, 9)).is_err());
}

#[test]
fn test_interface_toggle_flips_local_metric() {
    let (node, _stack) = make_host(
        "\
interface if0 10.0.0.5/24 127.0.0.1:17403
routing static
",
    );

    node.disable_interface("if0");
    let route = node
        .routing()
        .query(Ipv4Addr::new(10, 0, 0, 9), QueryStrategy::LongestPrefixMatch)
        .unwrap();
    assert_eq!(route.metric, Some(RIP_INFINITY));

    node.enable_interface("if0");
    let route = node
        .routing()
        .query(Ipv4Addr::new(10, 0, 0, 9), QueryStrategy::LongestPrefixMatch)
        .unwrap();
    assert_eq!(route.metric, Some(0));

    assert!(!node.enable_interface("if9"), "unknown interface rejected");
}

// =============================================================================
// End-to-end TCP
// =============================================================================

#[test]
fn test_tcp_end_to_end_over_direct_link() {
    let (_node_a, stack_a) = make_host(
        "\
interface if0 10.0.0.1/24 127.0.0.1:17411
neighbor 10.0.0.2 at 127.0.0.1:17412 via if0
routing static
",
    );
    let (_node_b, stack_b) = make_host(
        "\
interface if0 10.0.0.2/24 127.0.0.1:17412
neighbor 10.0.0.1 at 127.0.0.1:17411 via if0
routing static
",
    );

    let listener = stack_b.listen(5555).unwrap();
    let accepter = thread::spawn(move || listener.accept());

    let conn = stack_a
        .connect(Ipv4Addr::new(10, 0, 0, 1), Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 5555))
        .unwrap();
    let accepted = accepter.join().unwrap().unwrap();

    conn.write(b"across the wire").unwrap();
    let mut buf = [0u8; 64];
    let n = accepted.read(&mut buf, 64).unwrap();
    assert_eq!(&buf[..n], b"across the wire");

    // Echo back the other way.
    accepted.write(b"and back").unwrap();
    let n = conn.read(&mut buf, 64).unwrap();
    assert_eq!(&buf[..n], b"and back");
}

#[test]
fn test_tcp_through_forwarding_router() {
    let (_h1, stack_1) = make_host(
        "\
interface if0 10.0.0.5/24 127.0.0.1:17421
neighbor 10.0.0.1 at 127.0.0.1:17422 via if0
routing static
route 0.0.0.0/0 via 10.0.0.1
",
    );
    let router_config = NodeConfig::parse(
        "\
interface if0 10.0.0.1/24 127.0.0.1:17422
interface if1 10.1.0.1/24 127.0.0.1:17423
neighbor 10.0.0.5 at 127.0.0.1:17421 via if0
neighbor 10.1.0.5 at 127.0.0.1:17424 via if1
routing rip
",
    )
    .unwrap();
    let router = Node::new(&router_config, NodeKind::Router).unwrap();
    router.start();
    let (_h2, stack_2) = make_host(
        "\
interface if0 10.1.0.5/24 127.0.0.1:17424
neighbor 10.1.0.1 at 127.0.0.1:17423 via if0
routing static
route 0.0.0.0/0 via 10.1.0.1
",
    );

    let listener = stack_2.listen(8080).unwrap();
    let accepter = thread::spawn(move || listener.accept());

    // The SYN crosses two links; the router decrements TTL and forwards.
    let conn = stack_1
        .connect(Ipv4Addr::new(10, 0, 0, 5), Endpoint::new(Ipv4Addr::new(10, 1, 0, 5), 8080))
        .unwrap();
    let accepted = accepter.join().unwrap().unwrap();

    const TOTAL: usize = 50_000;
    let data: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
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
}

// =============================================================================
// RIP convergence
// =============================================================================

#[test]
fn test_rip_convergence_and_triggered_poison() {
    // R1 --(10.0.0.0/24)-- R2 --(10.1.0.0/24)-- R3, with a stub subnet
    // 10.2.0.0/24 behind R3.
    let r1 = make_router(
        "\
interface if0 10.0.0.1/24 127.0.0.1:17431
neighbor 10.0.0.2 at 127.0.0.1:17432 via if0
routing rip
rip advertise-to 10.0.0.2
",
    );
    let r2 = make_router(
        "\
interface if0 10.0.0.2/24 127.0.0.1:17432
interface if1 10.1.0.1/24 127.0.0.1:17433
neighbor 10.0.0.1 at 127.0.0.1:17431 via if0
neighbor 10.1.0.2 at 127.0.0.1:17434 via if1
routing rip
rip advertise-to 10.0.0.1
rip advertise-to 10.1.0.2
",
    );
    let _r3 = make_router(
        "\
interface if0 10.1.0.2/24 127.0.0.1:17434
interface if1 10.2.0.1/24 127.0.0.1:17435
neighbor 10.1.0.1 at 127.0.0.1:17433 via if0
routing rip
rip advertise-to 10.1.0.1
",
    );

    // Within a couple of seconds R1 must know the middle link at metric 1
    // and the stub subnet behind R3 at metric 2, via R2.
    let deadline = Instant::now() + Duration::from_secs(8);
    let stub = Ipv4Addr::new(10, 2, 0, 7);
    let remote_route = loop {
        if let Some(route) = r1.routing().query(stub, QueryStrategy::LongestPrefixMatch) {
            break route;
        }
        assert!(Instant::now() < deadline, "R1 never learned the stub subnet");
        thread::sleep(Duration::from_millis(100));
    };
    assert_eq!(remote_route.metric, Some(2));
    assert_eq!(remote_route.gateway, Some(Ipv4Addr::new(10, 0, 0, 2)));

    let middle = Ipv4Addr::new(10, 1, 0, 9);
    let middle_route = r1
        .routing()
        .query(middle, QueryStrategy::LongestPrefixMatch)
        .unwrap();
    assert_eq!(middle_route.metric, Some(1));

    // Downing R2's far link triggers an immediate cost-16 update for the
    // middle subnet; R1 poisons the route and its cleaner purges it.
    r2.disable_interface("if1");
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match r1.routing().query(middle, QueryStrategy::LongestPrefixMatch) {
            None => break,
            Some(route) if route.metric == Some(RIP_INFINITY) => break,
            Some(_) => {
                assert!(Instant::now() < deadline, "poison never reached R1");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}
