//! Per-interface IPv4 configuration and centralized network stack state.
//!
//! Every registered network device gets an [`IfaceConfig`] describing its
//! IPv4 address, netmask, and gateway. The [`NetStack`] struct aggregates
//! all interface configs behind a [`Mutex`] and serves as the single source
//! of truth for "our IP" queries.
//!
//! # Concurrency
//!
//! All mutable state is behind a [`Mutex`]. Reads and writes are
//! serialized; the lock is held only briefly (no blocking I/O under lock).
//!
//! # Integration
//!
//! - Startup configuration calls [`NetStack::configure`] once per
//!   interface, which also installs the connected-subnet and
//!   default-gateway routes in [`RouteTable`](super::route::RouteTable).
//! - ARP calls [`NetStack::our_ip`]/[`NetStack::is_our_addr`] to decide
//!   whether to answer a request.
//! - UDP/TCP bind/listen use [`NetStack::our_ip`] for source address
//!   selection.

use std::fmt;
use std::sync::Mutex;

use super::route::{RouteEntry, ROUTE_TABLE};
use super::types::{DevIndex, Ipv4Addr};

/// Per-interface IPv4 configuration.
///
/// One `IfaceConfig` exists per registered network device that has been
/// configured via [`NetStack::configure`].
#[derive(Clone, Copy)]
pub struct IfaceConfig {
    /// Device index this config belongs to.
    pub dev_index: DevIndex,
    /// IPv4 address assigned to this interface.
    pub ipv4_addr: Ipv4Addr,
    /// Subnet mask (e.g. `255.255.255.0`).
    pub netmask: Ipv4Addr,
    /// Default gateway for this interface (`UNSPECIFIED` if none).
    pub gateway: Ipv4Addr,
    /// Whether the interface is administratively up.
    pub up: bool,
}

impl IfaceConfig {
    /// Compute the broadcast address from `ipv4_addr` and `netmask`.
    #[inline]
    pub fn broadcast(&self) -> Ipv4Addr {
        let addr = self.ipv4_addr.to_u32_be();
        let mask = self.netmask.to_u32_be();
        Ipv4Addr::from_u32_be(addr | !mask)
    }

    /// Returns `true` if `ip` is on the directly connected subnet defined by
    /// this interface's address and netmask.
    #[inline]
    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        Ipv4Addr::in_subnet(ip, self.ipv4_addr, self.netmask)
    }

    /// Count the number of leading 1-bits in the netmask (prefix length).
    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.netmask.to_u32_be().leading_ones() as u8
    }
}

impl fmt::Debug for IfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IfaceConfig {{ dev={}, ip={}/{}, gw={}, up={} }}",
            self.dev_index,
            self.ipv4_addr,
            self.prefix_len(),
            self.gateway,
            self.up,
        )
    }
}

impl fmt::Display for IfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dev{}: {}/{} gw {}",
            self.dev_index,
            self.ipv4_addr,
            self.prefix_len(),
            self.gateway,
        )
    }
}

struct NetStackInner {
    /// Per-interface configurations. One entry per configured device.
    ifaces: Vec<IfaceConfig>,
}

/// Centralized network stack state — the single source of truth for
/// per-interface IPv4 configuration.
pub struct NetStack {
    inner: Mutex<NetStackInner>,
}

/// The global network stack instance.
pub static NET_STACK: NetStack = NetStack::new();

impl NetStack {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(NetStackInner { ifaces: Vec::new() }),
        }
    }

    /// Configure (or reconfigure) an interface with the given IPv4
    /// parameters, and install its routes.
    ///
    /// Adds the connected-subnet route (`addr/prefix_len` via `dev`) and,
    /// if `gateway` is not [`Ipv4Addr::UNSPECIFIED`], a default route
    /// (`0.0.0.0/0` via `gateway`).
    pub fn configure(&self, dev: DevIndex, addr: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let config = if let Some(iface) = inner.ifaces.iter_mut().find(|c| c.dev_index == dev) {
            iface.ipv4_addr = addr;
            iface.netmask = netmask;
            iface.gateway = gateway;
            iface.up = true;
            *iface
        } else {
            let config = IfaceConfig {
                dev_index: dev,
                ipv4_addr: addr,
                netmask,
                gateway,
                up: true,
            };
            inner.ifaces.push(config);
            config
        };
        drop(inner);

        log::info!(
            "netstack: configured dev {} -> {}/{} gw {}",
            dev,
            addr,
            config.prefix_len(),
            gateway,
        );

        ROUTE_TABLE.remove_device_routes(dev);
        let network = Ipv4Addr::from_u32_be(addr.to_u32_be() & netmask.to_u32_be());
        ROUTE_TABLE.add(RouteEntry {
            prefix: network,
            prefix_len: config.prefix_len(),
            gateway: Ipv4Addr::UNSPECIFIED,
            dev,
        });
        if !gateway.is_unspecified() {
            ROUTE_TABLE.add(RouteEntry {
                prefix: Ipv4Addr::UNSPECIFIED,
                prefix_len: 0,
                gateway,
                dev,
            });
        }
    }

    /// Look up the interface configuration for a device.
    pub fn iface_for_dev(&self, dev: DevIndex) -> Option<IfaceConfig> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.ifaces.iter().find(|c| c.dev_index == dev).copied()
    }

    /// Convenience: return the IPv4 address assigned to `dev`, or `None`.
    pub fn our_ip(&self, dev: DevIndex) -> Option<Ipv4Addr> {
        self.iface_for_dev(dev).map(|c| c.ipv4_addr)
    }

    /// Check if `ip` is a local destination: assigned to one of our
    /// configured interfaces, that interface's subnet broadcast address, or
    /// the limited broadcast address `255.255.255.255`.
    ///
    /// Used by the RX path to decide whether a packet is addressed to us.
    pub fn is_our_addr(&self, ip: Ipv4Addr) -> bool {
        if ip.is_broadcast() {
            return true;
        }
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.ifaces.iter().any(|c| c.up && (c.ipv4_addr == ip || c.broadcast() == ip))
    }

    /// Return the first configured interface's IPv4 address.
    pub fn first_ipv4(&self) -> Option<Ipv4Addr> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .ifaces
            .iter()
            .find(|c| c.up && !c.ipv4_addr.is_unspecified())
            .map(|c| c.ipv4_addr)
    }

    /// Return the first configured interface's full config.
    pub fn first_iface(&self) -> Option<IfaceConfig> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.ifaces.iter().find(|c| c.up).copied()
    }

    /// Number of configured interfaces (diagnostic).
    pub fn iface_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ifaces
            .len()
    }

    /// Dump all interface configs (diagnostic).
    pub fn dump(&self) {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for iface in &inner.ifaces {
            log::debug!("  {:?}", iface);
        }
    }
}
