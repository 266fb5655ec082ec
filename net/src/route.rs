//! Prefix-length-bucketed routing table for IPv4.
//!
//! Routes are stored in a fixed-size array of 33 buckets (one per possible
//! prefix length, /0 through /32). Lookup iterates from the longest prefix
//! (/32) to the shortest (/0), checking only routes at each prefix length.
//! This gives O(32) worst-case lookup regardless of the total number of
//! routes.
//!
//! Within each bucket, the most recently added route is kept first, so
//! that ties at the same prefix length resolve to the newest entry.
//!
//! # Concurrency
//!
//! All mutable state is behind a [`Mutex`]. The lock is held briefly for
//! lookups and modifications — a handful of routes is the expected case.
//!
//! # Integration
//!
//! - Startup configuration calls [`RouteTable::add`] to install the
//!   connected-subnet route and default gateway for each configured
//!   interface (see [`super::netstack::NetStack::configure`]).
//! - IPv4 egress calls [`RouteTable::lookup`] to determine the outgoing
//!   device and next-hop address for each packet.
//! - The loopback device's `127.0.0.0/8` connected route is added at
//!   startup.

use std::fmt;
use std::sync::Mutex;

use super::types::{DevIndex, Ipv4Addr};

/// Maximum number of routes per prefix-length bucket.
const MAX_ROUTES_PER_BUCKET: usize = 16;

/// A single entry in the routing table.
///
/// Routes are compared by `(prefix, dev)` for equality.
#[derive(Clone, Copy)]
pub struct RouteEntry {
    /// Network prefix (e.g. `192.168.1.0` for a /24 route).
    pub prefix: Ipv4Addr,
    /// Prefix length in bits (0-32).
    pub prefix_len: u8,
    /// Gateway address. [`Ipv4Addr::UNSPECIFIED`] means directly connected
    /// — the destination is on the local subnet and no gateway hop is
    /// needed.
    pub gateway: Ipv4Addr,
    /// Outgoing device index.
    pub dev: DevIndex,
}

impl RouteEntry {
    /// Returns `true` if `dst` falls within this route's prefix/prefix_len.
    #[inline]
    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = prefix_len_to_mask(self.prefix_len);
        (dst.to_u32_be() & mask) == (self.prefix.to_u32_be() & mask)
    }

    /// Returns the next-hop address for a destination matching this route.
    #[inline]
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.gateway.is_unspecified() {
            dst
        } else {
            self.gateway
        }
    }
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.gateway.is_unspecified() {
            write!(f, "{}/{} dev {} (connected)", self.prefix, self.prefix_len, self.dev)
        } else {
            write!(f, "{}/{} via {} dev {}", self.prefix, self.prefix_len, self.gateway, self.dev)
        }
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct RouteTableInner {
    /// Routes bucketed by prefix length. Index 0 = /0 (default routes),
    /// index 32 = /32 (host routes). Within each bucket, the
    /// most-recently-added route is kept at the front.
    buckets: [Vec<RouteEntry>; 33],
}

impl RouteTableInner {
    const fn new() -> Self {
        Self {
            buckets: [const { Vec::new() }; 33],
        }
    }
}

/// Prefix-length-bucketed IPv4 routing table with longest-prefix-match
/// lookup.
///
/// See [module documentation](self) for architecture details.
pub struct RouteTable {
    inner: Mutex<RouteTableInner>,
}

/// The global routing table.
pub static ROUTE_TABLE: RouteTable = RouteTable::new();

impl RouteTable {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RouteTableInner::new()),
        }
    }

    /// Add a route to the table.
    ///
    /// Inserted at the front of `buckets[prefix_len]`, so that a tie
    /// between routes matching at the same prefix length resolves to
    /// whichever was added most recently. If a route with the same
    /// `(prefix, dev)` already exists in that bucket, it is updated in
    /// place instead.
    ///
    /// Returns `true` if a new route was added, `false` if an existing
    /// route was updated.
    pub fn add(&self, entry: RouteEntry) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let bucket = &mut inner.buckets[entry.prefix_len as usize];

        for existing in bucket.iter_mut() {
            if existing.prefix == entry.prefix && existing.dev == entry.dev {
                log::debug!("route: updated {:?}", entry);
                existing.gateway = entry.gateway;
                return false;
            }
        }

        if bucket.len() >= MAX_ROUTES_PER_BUCKET {
            log::debug!(
                "route: bucket /{} full ({} routes), dropping add",
                entry.prefix_len,
                bucket.len(),
            );
            return false;
        }

        log::debug!("route: added {:?}", entry);
        bucket.insert(0, entry);
        true
    }

    /// Remove a route matching `(prefix, prefix_len)`.
    ///
    /// If multiple routes match (different devices), removes the first
    /// match. Returns `true` if a route was removed.
    pub fn remove(&self, prefix: Ipv4Addr, prefix_len: u8) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let bucket = &mut inner.buckets[prefix_len as usize];
        if let Some(pos) = bucket.iter().position(|r| r.prefix == prefix) {
            let removed = bucket.remove(pos);
            log::debug!("route: removed {:?}", removed);
            true
        } else {
            false
        }
    }

    /// Remove all routes associated with a specific device.
    pub fn remove_device_routes(&self, dev: DevIndex) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut count = 0usize;
        for bucket in inner.buckets.iter_mut() {
            let before = bucket.len();
            bucket.retain(|r| r.dev != dev);
            count += before - bucket.len();
        }
        if count > 0 {
            log::debug!("route: removed {} routes for dev {}", count, dev);
        }
    }

    /// Longest-prefix-match lookup.
    ///
    /// Iterates from /32 (host routes) down to /0 (default routes).
    /// Returns the `(DevIndex, next_hop)` for the first matching route.
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<(DevIndex, Ipv4Addr)> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for prefix_len in (0..=32u8).rev() {
            for route in &inner.buckets[prefix_len as usize] {
                if route.matches(dst) {
                    return Some((route.dev, route.next_hop(dst)));
                }
            }
        }
        None
    }

    /// Number of routes in the table (diagnostic).
    pub fn route_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.buckets.iter().map(|b| b.len()).sum()
    }

    /// Dump all routes for debugging.
    pub fn dump(&self) {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for (prefix_len, bucket) in inner.buckets.iter().enumerate() {
            for route in bucket {
                log::debug!("  /{}: {:?}", prefix_len, route);
            }
        }
    }

    /// Collect all routes into a Vec (for diagnostic display).
    pub fn all_routes(&self) -> Vec<RouteEntry> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut routes = Vec::new();
        for bucket in inner.buckets.iter() {
            routes.extend_from_slice(bucket);
        }
        routes
    }
}

/// Convert a prefix length (0-32) to a u32 network mask in host byte order.
#[inline]
fn prefix_len_to_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    }
}
