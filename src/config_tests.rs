//! `.lnx` parser tests.

use std::net::Ipv4Addr;

use crate::config::{NodeConfig, RoutingMode};

const HOST_LNX: &str = "\
# host with one interface and a default route
interface if0 10.0.0.5/24 127.0.0.1:5003
neighbor 10.0.0.1 at 127.0.0.1:5000 via if0
routing static
route 0.0.0.0/0 via 10.0.0.1
";

const ROUTER_LNX: &str = "\
interface if0 10.0.0.1/24 127.0.0.1:5000
interface if1 10.1.0.1/24 127.0.0.1:5001
neighbor 10.0.0.5 at 127.0.0.1:5003 via if0
neighbor 10.1.0.2 at 127.0.0.1:5002 via if1
routing rip
rip advertise-to 10.1.0.2
";

#[test]
fn test_parse_host_config() {
    let config = NodeConfig::parse(HOST_LNX).unwrap();
    assert_eq!(config.interfaces.len(), 1);
    assert_eq!(config.interfaces[0].name, "if0");
    assert_eq!(config.interfaces[0].addr, Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(config.interfaces[0].prefix_len, 24);
    assert_eq!(config.routing, RoutingMode::Static);
    assert_eq!(config.static_routes.len(), 1);
    assert_eq!(config.static_routes[0].next_hop, Ipv4Addr::new(10, 0, 0, 1));
}

#[test]
fn test_parse_router_config() {
    let config = NodeConfig::parse(ROUTER_LNX).unwrap();
    assert_eq!(config.interfaces.len(), 2);
    assert_eq!(config.neighbors.len(), 2);
    assert_eq!(config.routing, RoutingMode::Rip);
    assert_eq!(config.rip_neighbors, vec![Ipv4Addr::new(10, 1, 0, 2)]);
}

#[test]
fn test_comments_and_blank_lines_skipped() {
    let text = "\n# nothing\ninterface if0 10.0.0.1/24 127.0.0.1:5000  # trailing\n\n";
    let config = NodeConfig::parse(text).unwrap();
    assert_eq!(config.interfaces.len(), 1);
}

#[test]
fn test_rejects_unknown_directive() {
    let text = "interface if0 10.0.0.1/24 127.0.0.1:5000\nfrobnicate yes\n";
    assert!(NodeConfig::parse(text).is_err());
}

#[test]
fn test_rejects_neighbor_on_unknown_interface() {
    let text = "\
interface if0 10.0.0.1/24 127.0.0.1:5000
neighbor 10.0.0.2 at 127.0.0.1:5001 via if9
";
    assert!(NodeConfig::parse(text).is_err());
}

#[test]
fn test_rejects_empty_config() {
    assert!(NodeConfig::parse("routing static\n").is_err());
}
