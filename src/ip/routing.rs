//! Routing table with longest-prefix-match lookup and RIP update logic.
//!
//! # Architecture
//!
//! Entries live in one flat vector behind a readers-writer lock; queries
//! take the lock shared, every mutation takes it exclusive.  Lookup walks
//! all entries and keeps the match with the longest mask; route counts on
//! this internetwork are single-digit, so a scan beats maintaining any
//! index.
//!
//! # Integration
//!
//! - **Node core**: calls [`RoutingTable::query`] for every outbound or
//!   forwarded datagram; a matched gateway triggers one bounded re-query.
//! - **RIP engine**: feeds received entries through
//!   [`RoutingTable::handle_rip_entries`] and periodically drains expired
//!   routes via [`RoutingTable::remove_stale_rip_entries`].  Both return the
//!   triggered update to broadcast.
//! - **Interface toggles**: flip the Local route metric between 0 and 16
//!   through [`RoutingTable::enable_local_route`] /
//!   [`RoutingTable::disable_local_route`].

use std::fmt;
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use log::debug;

use crate::ip::rip::{RipEntry, RipMessage, RIP_INFINITY};
use crate::types::mask_to_prefix_len;

// =============================================================================
// Route entries
// =============================================================================

/// How a route entered the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteKind {
    /// A directly connected subnet of one of our interfaces.
    Local,
    /// Learned from a RIP response.
    Rip,
    /// Configured statically (hosts only).
    Static,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "L"),
            Self::Rip => write!(f, "R"),
            Self::Static => write!(f, "S"),
        }
    }
}

/// A single routing entry.
///
/// Invariants: `Local` has an interface name, no gateway, and metric 0 (up)
/// or 16 (down).  `Static` has a gateway and no metric.  `Rip` has a gateway
/// and a metric in `1..=16`.
#[derive(Clone, Debug)]
pub struct Route {
    pub kind: RouteKind,
    pub prefix: Ipv4Addr,
    /// Subnet mask in host byte order.
    pub mask: u32,
    pub gateway: Option<Ipv4Addr>,
    pub iface: Option<String>,
    pub metric: Option<u32>,
    pub last_refresh: Instant,
}

impl Route {
    /// `true` if `dst` falls within this route's subnet.
    #[inline]
    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        (u32::from(dst) & self.mask) == (u32::from(self.prefix) & self.mask)
    }

    /// Prefix length derived from the mask.
    #[inline]
    pub fn prefix_len(&self) -> u8 {
        mask_to_prefix_len(self.mask)
    }
}

/// Lookup strategy for [`RoutingTable::query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    /// First entry whose subnet contains the destination.
    FirstMatch,
    /// Entry with the most-specific matching prefix.
    LongestPrefixMatch,
}

// =============================================================================
// RoutingTable
// =============================================================================

/// The routing table of one node.
pub struct RoutingTable {
    entries: RwLock<Vec<Route>>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Add the connected-subnet route for an interface.
    pub fn add_local(&self, prefix: Ipv4Addr, mask: u32, iface: &str) {
        self.add(Route {
            kind: RouteKind::Local,
            prefix,
            mask,
            gateway: None,
            iface: Some(iface.to_string()),
            metric: Some(0),
            last_refresh: Instant::now(),
        });
    }

    /// Add a static route through `gateway`.
    pub fn add_static(&self, prefix: Ipv4Addr, mask: u32, gateway: Ipv4Addr) {
        self.add(Route {
            kind: RouteKind::Static,
            prefix,
            mask,
            gateway: Some(gateway),
            iface: None,
            metric: None,
            last_refresh: Instant::now(),
        });
    }

    /// Add a RIP-learned route.
    pub fn add_rip(&self, prefix: Ipv4Addr, mask: u32, gateway: Ipv4Addr, metric: u32) {
        self.add(Route {
            kind: RouteKind::Rip,
            prefix,
            mask,
            gateway: Some(gateway),
            iface: None,
            metric: Some(metric.min(RIP_INFINITY)),
            last_refresh: Instant::now(),
        });
    }

    /// Insert an entry verbatim.  Duplicates on `(prefix, mask)` are not
    /// deduplicated here; RIP update logic mutates matching entries in place.
    pub fn add(&self, route: Route) {
        debug!("route: added {} {}/{}", route.kind, route.prefix, route.prefix_len());
        self.entries.write().unwrap().push(route);
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Find a route for `dst` using the given strategy.
    pub fn query(&self, dst: Ipv4Addr, strategy: QueryStrategy) -> Option<Route> {
        let entries = self.entries.read().unwrap();
        match strategy {
            QueryStrategy::FirstMatch => entries.iter().find(|e| e.matches(dst)).cloned(),
            QueryStrategy::LongestPrefixMatch => entries
                .iter()
                .filter(|e| e.matches(dst))
                .max_by_key(|e| e.mask)
                .cloned(),
        }
    }

    /// Number of entries (diagnostic).
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Snapshot of all routes, for listings.
    pub fn routes(&self) -> Vec<Route> {
        self.entries.read().unwrap().clone()
    }

    // =========================================================================
    // RIP receive
    // =========================================================================

    /// Apply a batch of received RIP entries (costs already incremented and
    /// clamped by the decoder).  Returns the triggered update to broadcast;
    /// it is empty when nothing changed.
    pub fn handle_rip_entries(
        &self,
        rip_entries: &[RipEntry],
        learned_from: Ipv4Addr,
    ) -> RipMessage {
        let mut changed = Vec::new();
        let mut gateways = Vec::new();

        let mut entries = self.entries.write().unwrap();
        for incoming in rip_entries {
            if self.apply_rip_entry(&mut entries, incoming, learned_from) {
                changed.push(*incoming);
                gateways.push(Some(learned_from));
            }
        }

        RipMessage::response(changed, gateways)
    }

    /// Apply one entry to the locked table.  Returns `true` if the route
    /// changed in a way that warrants a triggered update.
    fn apply_rip_entry(
        &self,
        entries: &mut Vec<Route>,
        incoming: &RipEntry,
        learned_from: Ipv4Addr,
    ) -> bool {
        let prefix = Ipv4Addr::from(incoming.addr & incoming.mask);
        let existing = entries.iter().position(|e| {
            e.mask == incoming.mask && (u32::from(e.prefix) & e.mask) == u32::from(prefix)
        });

        if let Some(index) = existing {
            let route = &mut entries[index];
            if route.kind == RouteKind::Local {
                return false;
            }
            let current = route.metric.unwrap_or(0);
            let same_gateway = route.gateway == Some(learned_from);
            return if incoming.cost < current {
                // Better path: adopt it no matter who advertised it.
                debug!(
                    "route: {}/{} improves {} -> {} via {}",
                    prefix,
                    mask_to_prefix_len(incoming.mask),
                    current,
                    incoming.cost,
                    learned_from
                );
                route.metric = Some(incoming.cost);
                route.gateway = Some(learned_from);
                route.last_refresh = Instant::now();
                true
            } else if incoming.cost == current && same_gateway {
                // Same news from the same gateway: just keep it alive.
                route.last_refresh = Instant::now();
                false
            } else if incoming.cost > current && same_gateway {
                // The path we are using got worse; believe the gateway.
                debug!(
                    "route: {}/{} degrades {} -> {} via {}",
                    prefix,
                    mask_to_prefix_len(incoming.mask),
                    current,
                    incoming.cost,
                    learned_from
                );
                route.metric = Some(incoming.cost);
                route.last_refresh = Instant::now();
                true
            } else {
                false
            };
        }

        if incoming.cost < RIP_INFINITY {
            debug!(
                "route: learned {}/{} cost {} via {}",
                prefix,
                mask_to_prefix_len(incoming.mask),
                incoming.cost,
                learned_from
            );
            entries.push(Route {
                kind: RouteKind::Rip,
                prefix,
                mask: incoming.mask,
                gateway: Some(learned_from),
                iface: None,
                metric: Some(incoming.cost),
                last_refresh: Instant::now(),
            });
            true
        } else {
            false
        }
    }

    // =========================================================================
    // RIP send
    // =========================================================================

    /// Serialize every metric-carrying route into a RIP response.
    ///
    /// Each entry records the gateway it was learned from so the sender can
    /// apply poisoned reverse against the destination peer.
    pub fn generate_rip_entries(&self) -> RipMessage {
        let entries = self.entries.read().unwrap();
        let mut out = Vec::new();
        let mut gateways = Vec::new();
        for route in entries.iter() {
            if let Some(metric) = route.metric {
                out.push(RipEntry {
                    cost: metric,
                    addr: u32::from(route.prefix),
                    mask: route.mask,
                });
                gateways.push(route.gateway);
            }
        }
        RipMessage::response(out, gateways)
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Drop RIP routes not refreshed within `max_age`, returning a cost-16
    /// triggered update for them.  Routes already at infinite cost are purged
    /// silently.
    pub fn remove_stale_rip_entries(&self, max_age: Duration) -> RipMessage {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut gateways = Vec::new();

        let mut entries = self.entries.write().unwrap();
        entries.retain(|route| {
            if route.kind != RouteKind::Rip {
                return true;
            }
            if route.metric == Some(RIP_INFINITY) {
                debug!("route: purged poisoned {}/{}", route.prefix, route.prefix_len());
                return false;
            }
            if now.duration_since(route.last_refresh) > max_age {
                debug!("route: expired {}/{}", route.prefix, route.prefix_len());
                expired.push(RipEntry {
                    cost: RIP_INFINITY,
                    addr: u32::from(route.prefix),
                    mask: route.mask,
                });
                gateways.push(None);
                return false;
            }
            true
        });

        RipMessage::response(expired, gateways)
    }

    // =========================================================================
    // Local route toggles
    // =========================================================================

    /// Mark the Local route of `iface` as reachable (metric 0).  Returns the
    /// triggered update advertising it.
    pub fn enable_local_route(&self, iface: &str) -> RipMessage {
        self.set_local_metric(iface, 0)
    }

    /// Mark the Local route of `iface` as unreachable (metric 16).  Returns
    /// the triggered update poisoning it.
    pub fn disable_local_route(&self, iface: &str) -> RipMessage {
        self.set_local_metric(iface, RIP_INFINITY)
    }

    fn set_local_metric(&self, iface: &str, metric: u32) -> RipMessage {
        let mut entries = self.entries.write().unwrap();
        let mut changed = Vec::new();
        let mut gateways = Vec::new();
        for route in entries.iter_mut() {
            if route.kind == RouteKind::Local && route.iface.as_deref() == Some(iface) {
                route.metric = Some(metric);
                route.last_refresh = Instant::now();
                changed.push(RipEntry {
                    cost: metric,
                    addr: u32::from(route.prefix),
                    mask: route.mask,
                });
                gateways.push(None);
            }
        }
        RipMessage::response(changed, gateways)
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// Write the `lr` listing.
    pub fn list(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "T       Prefix   Next hop   Cost")?;
        for route in self.routes() {
            let prefix = format!("{}/{}", route.prefix, route.prefix_len());
            let (next_hop, cost) = match route.kind {
                RouteKind::Local => (
                    format!("LOCAL:{}", route.iface.as_deref().unwrap_or("?")),
                    route.metric.unwrap_or(0).to_string(),
                ),
                RouteKind::Rip => (
                    route.gateway.map(|g| g.to_string()).unwrap_or_default(),
                    route.metric.unwrap_or(0).to_string(),
                ),
                RouteKind::Static => (
                    route.gateway.map(|g| g.to_string()).unwrap_or_default(),
                    "-".to_string(),
                ),
            };
            writeln!(out, "{}  {:>14}  {:>10}  {:>4}", route.kind, prefix, next_hop, cost)?;
        }
        Ok(())
    }
}
