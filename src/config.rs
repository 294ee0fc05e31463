//! `.lnx` configuration: the parsed view consumed by the node core.
//!
//! The grammar is line-oriented; `#` starts a comment and blank lines are
//! skipped:
//!
//! ```text
//! interface if0 10.0.0.1/24 127.0.0.1:5000
//! neighbor 10.0.0.2 at 127.0.0.1:5001 via if0
//! routing static | routing rip
//! rip advertise-to 10.0.0.2
//! route 0.0.0.0/0 via 10.0.0.1
//! ```

use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use thiserror::Error;

use crate::types::parse_cidr;

/// A configuration file failed to parse.
#[derive(Debug, Error)]
#[error("config: {0}")]
pub struct ConfigError(pub String);

/// One `interface` line: a virtual interface and its UDP bind address.
#[derive(Clone, Debug)]
pub struct InterfaceConfig {
    pub name: String,
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
    pub udp_bind: SocketAddrV4,
}

/// One `neighbor` line: a peer interface reachable on the same link.
#[derive(Clone, Debug)]
pub struct NeighborConfig {
    pub vip: Ipv4Addr,
    pub udp: SocketAddrV4,
    pub iface: String,
}

/// One `route` line: a static route.
#[derive(Clone, Debug)]
pub struct StaticRouteConfig {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
    pub next_hop: Ipv4Addr,
}

/// Routing mode of the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingMode {
    Static,
    Rip,
}

/// The full parsed view of a `.lnx` file.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub interfaces: Vec<InterfaceConfig>,
    pub neighbors: Vec<NeighborConfig>,
    pub routing: RoutingMode,
    pub rip_neighbors: Vec<Ipv4Addr>,
    pub static_routes: Vec<StaticRouteConfig>,
}

impl NodeConfig {
    /// Load and parse a `.lnx` file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = NodeConfig {
            interfaces: Vec::new(),
            neighbors: Vec::new(),
            routing: RoutingMode::Static,
            rip_neighbors: Vec::new(),
            static_routes: Vec::new(),
        };

        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            let err = |msg: &str| ConfigError(format!("line {}: {msg}", lineno + 1));

            match fields[0] {
                "interface" => {
                    // interface <name> <cidr> <host:port>
                    if fields.len() != 4 {
                        return Err(err("expected `interface <name> <cidr> <udp-addr>`"));
                    }
                    let (addr, _, prefix_len) = parse_cidr(fields[2]).map_err(ConfigError)?;
                    let udp_bind: SocketAddrV4 = fields[3]
                        .parse()
                        .map_err(|_| err("bad UDP bind address"))?;
                    config.interfaces.push(InterfaceConfig {
                        name: fields[1].to_string(),
                        addr,
                        prefix_len,
                        udp_bind,
                    });
                }
                "neighbor" => {
                    // neighbor <vip> at <host:port> via <iface>
                    if fields.len() != 6 || fields[2] != "at" || fields[4] != "via" {
                        return Err(err("expected `neighbor <vip> at <udp-addr> via <iface>`"));
                    }
                    let vip: Ipv4Addr = fields[1].parse().map_err(|_| err("bad neighbor address"))?;
                    let udp: SocketAddrV4 = fields[3].parse().map_err(|_| err("bad UDP address"))?;
                    config.neighbors.push(NeighborConfig {
                        vip,
                        udp,
                        iface: fields[5].to_string(),
                    });
                }
                "routing" => {
                    if fields.len() != 2 {
                        return Err(err("expected `routing static|rip`"));
                    }
                    config.routing = match fields[1] {
                        "static" => RoutingMode::Static,
                        "rip" => RoutingMode::Rip,
                        _ => return Err(err("expected `routing static|rip`")),
                    };
                }
                "rip" => {
                    // rip advertise-to <addr>
                    if fields.len() != 3 || fields[1] != "advertise-to" {
                        return Err(err("expected `rip advertise-to <addr>`"));
                    }
                    let peer: Ipv4Addr = fields[2].parse().map_err(|_| err("bad RIP peer"))?;
                    config.rip_neighbors.push(peer);
                }
                "route" => {
                    // route <cidr> via <next-hop>
                    if fields.len() != 4 || fields[2] != "via" {
                        return Err(err("expected `route <cidr> via <next-hop>`"));
                    }
                    let (prefix, _, prefix_len) = parse_cidr(fields[1]).map_err(ConfigError)?;
                    let next_hop: Ipv4Addr = fields[3].parse().map_err(|_| err("bad next hop"))?;
                    config.static_routes.push(StaticRouteConfig {
                        prefix,
                        prefix_len,
                        next_hop,
                    });
                }
                other => {
                    return Err(err(&format!("unknown directive {other:?}")));
                }
            }
        }

        if config.interfaces.is_empty() {
            return Err(ConfigError("no interfaces defined".to_string()));
        }
        for neighbor in &config.neighbors {
            if !config.interfaces.iter().any(|i| i.name == neighbor.iface) {
                return Err(ConfigError(format!(
                    "neighbor {} references unknown interface {:?}",
                    neighbor.vip, neighbor.iface
                )));
            }
        }

        Ok(config)
    }
}
