//! Loopback network device (`lo`).
//!
//! The loopback device implements [`NetDevice`] with a trivial internal
//! queue: `tx()` pushes packets onto a [`VecDeque`], `poll_rx()` drains them
//! back out. Packets transmitted on loopback are delivered to the local
//! ingress pipeline on the next poll — no wire, no checksums, no ARP.
//!
//! The loopback device is registered at `DevIndex(0)` by convention, before
//! the tap device. It is configured with `127.0.0.1/8` and a connected
//! route for `127.0.0.0/8`.
//!
//! # Concurrency
//!
//! The internal queue is protected by a [`Mutex`] since both `tx()` (from
//! any socket context) and `poll_rx()` (from the loopback's own reader
//! thread) access it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::netdev::{NetDevice, NetDeviceFeatures, NetDeviceStats};
use super::packetbuf::PacketBuf;
use super::pool::PacketPool;
use super::types::{MacAddr, NetError};

/// Maximum number of packets queued in the loopback device.
const LOOPBACK_QUEUE_CAPACITY: usize = 16;

struct LoopbackInner {
    /// Packets waiting to be "received" by the ingress pipeline.
    queue: VecDeque<PacketBuf>,
    /// Cumulative statistics.
    stats: NetDeviceStats,
}

/// The loopback network device (`lo`).
///
/// Registered at `DevIndex(0)` during startup. All packets sent to
/// `127.0.0.0/8` are routed here and immediately available for local
/// delivery.
pub struct LoopbackDev {
    inner: Mutex<LoopbackInner>,
}

impl LoopbackDev {
    /// Create a new loopback device with an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LoopbackInner {
                queue: VecDeque::with_capacity(LOOPBACK_QUEUE_CAPACITY),
                stats: NetDeviceStats::new(),
            }),
        }
    }
}

impl Default for LoopbackDev {
    fn default() -> Self {
        Self::new()
    }
}

impl NetDevice for LoopbackDev {
    fn tx(&self, pkt: PacketBuf) -> Result<(), NetError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.queue.len() >= LOOPBACK_QUEUE_CAPACITY {
            inner.stats.tx_dropped += 1;
            return Err(NetError::NoBufferSpace);
        }
        let len = pkt.len();
        inner.queue.push_back(pkt);
        inner.stats.tx_packets += 1;
        inner.stats.tx_bytes += len as u64;
        Ok(())
    }

    fn poll_rx(&self, budget: usize, _pool: &'static PacketPool) -> Vec<PacketBuf> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let count = budget.min(inner.queue.len());
        let mut packets = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(pkt) = inner.queue.pop_front() {
                inner.stats.rx_packets += 1;
                inner.stats.rx_bytes += pkt.len() as u64;
                packets.push(pkt);
            }
        }
        packets
    }

    fn set_up(&self) {}

    fn set_down(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.queue.clear();
    }

    fn mtu(&self) -> u16 {
        65535
    }

    fn mac(&self) -> MacAddr {
        MacAddr::ZERO
    }

    fn stats(&self) -> NetDeviceStats {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).stats
    }

    fn features(&self) -> NetDeviceFeatures {
        // Loopback never needs checksum computation — packets stay in memory.
        NetDeviceFeatures::CHECKSUM_TX | NetDeviceFeatures::CHECKSUM_RX
    }
}

/// Register the loopback device in the global device registry and
/// configure its IPv4 address and route.
///
/// Must be called before the tap device is registered so that loopback
/// gets `DevIndex(0)` by convention.
pub fn init_loopback() {
    use super::netdev::DEVICE_REGISTRY;
    use super::netstack::NET_STACK;
    use super::route::ROUTE_TABLE;
    use super::types::Ipv4Addr;

    let dev: Arc<dyn NetDevice> = Arc::new(LoopbackDev::new());
    let Some(handle) = DEVICE_REGISTRY.register(dev) else {
        log::error!("loopback: failed to register in device registry");
        return;
    };

    let lo_index = handle.index();
    log::info!("loopback: registered as dev {}", lo_index);

    NET_STACK.configure(
        lo_index,
        Ipv4Addr::LOCALHOST,
        Ipv4Addr::from_bytes([255, 0, 0, 0]),
        Ipv4Addr::UNSPECIFIED,
    );

    if let Some((dev, _next_hop)) = ROUTE_TABLE.lookup(Ipv4Addr::LOCALHOST) {
        log::info!("loopback: route 127.0.0.0/8 -> dev {} confirmed", dev);
    } else {
        log::warn!("loopback: no route for 127.0.0.1");
    }
}
