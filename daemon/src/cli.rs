//! Command-line configuration.
//!
//! `spec.md` §6 leaves environment/CLI to the test harness; this is the
//! ambient replacement every daemon in this corpus carries instead of a
//! hardcoded fixture.

use clap::Parser;
use netstackd_net::types::{Ipv4Addr, MacAddr};
use netstackd_runtime::logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "netstackd", about = "Userspace TCP/IP stack over a tap device")]
pub struct Args {
    /// Tap interface name passed to TUNSETIFF.
    #[arg(long, default_value = "tap0")]
    pub tap_name: String,

    /// MAC address assigned to the tap device.
    #[arg(long, default_value = "bb:bb:bb:bb:bb:bb")]
    pub mac: MacAddr,

    /// IPv4 address assigned to the tap interface.
    #[arg(long, default_value = "192.0.2.2")]
    pub address: Ipv4Addr,

    /// Netmask for the tap interface.
    #[arg(long, default_value = "255.255.255.0")]
    pub netmask: Ipv4Addr,

    /// Default gateway reachable through the tap interface.
    #[arg(long, default_value = "192.0.2.1")]
    pub gateway: Ipv4Addr,

    /// Tap device MTU.
    #[arg(long, default_value_t = 1500)]
    pub mtu: u16,

    /// Log verbosity (overridden by `RUST_LOG` if set).
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}
