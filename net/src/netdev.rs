//! Network device abstraction: `NetDevice` trait, device registry, and stable device handles.
//!
//! This module establishes the boundary between devices (which move bytes)
//! and the protocol stack (which understands protocols). Only [`PacketBuf`]
//! crosses this boundary.
//!
//! - **[`NetDevice`] trait**: implemented by every device (the tap device,
//!   loopback).
//! - **[`NetDeviceRegistry`]**: `Mutex`-protected storage, accessed only on
//!   the control plane (register/unregister/enumerate).
//! - **[`DeviceHandle`]**: stable reference for data-plane TX/RX that never
//!   touches the registry lock.
//!
//! # Concurrency model
//!
//! The registry lock serializes registration/unregistration/enumeration.
//! The data plane goes through [`DeviceHandle`] instead:
//!
//! - `tx()` acquires a per-device lock (serializes concurrent senders).
//! - `poll_rx()` requires no lock — each device has exactly one reader
//!   thread in the daemon's worker model.
//!
//! All trait methods take `&self`; implementations use interior mutability
//! for their internal state, so a [`DeviceHandle`] can be cloned and shared
//! across threads without `&mut` aliasing concerns.

use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use super::packetbuf::PacketBuf;
use super::pool::PacketPool;
use super::types::{DevIndex, MacAddr, NetError};

// =============================================================================
// NetDevice trait
// =============================================================================

/// Abstraction for a network device (the tap device, loopback).
///
/// # Concurrency
///
/// - `tx()`: may be called from multiple socket contexts concurrently; the
///   [`DeviceHandle`] serializes TX via a per-device lock.
/// - `poll_rx()`: single consumer only (the device's reader thread).
/// - `set_up()`/`set_down()`: control plane only, called under the registry
///   lock.
/// - `mtu()`, `mac()`, `stats()`, `features()`: read-only, safe from any
///   context.
pub trait NetDevice: Send + Sync {
    /// Transmit one packet. The packet is consumed.
    ///
    /// Returns `Err(NoBufferSpace)` if the device cannot accept it right now.
    fn tx(&self, pkt: PacketBuf) -> Result<(), NetError>;

    /// Drain up to `budget` received packets, allocating [`PacketBuf`] from
    /// `pool`.
    ///
    /// Returns the received packets. An empty `Vec` means none are pending.
    fn poll_rx(&self, budget: usize, pool: &'static PacketPool) -> Vec<PacketBuf>;

    /// Bring the link up.
    fn set_up(&self);

    /// Bring the link down. Must be called before unregistration.
    fn set_down(&self);

    /// Maximum transmission unit (payload bytes, excluding Ethernet header).
    fn mtu(&self) -> u16;

    /// Device MAC address.
    fn mac(&self) -> MacAddr;

    /// Read-only snapshot of device statistics.
    fn stats(&self) -> NetDeviceStats;

    /// Capability/feature flags advertised by the device.
    fn features(&self) -> NetDeviceFeatures;
}

// =============================================================================
// NetDeviceStats
// =============================================================================

/// Read-only snapshot of network device statistics.
///
/// Counters are monotonically increasing. The device increments
/// `rx_packets`/`tx_packets`/`rx_bytes`/`tx_bytes` on the data path; the
/// stack increments `rx_dropped` on demux failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetDeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl NetDeviceStats {
    pub const fn new() -> Self {
        Self {
            rx_packets: 0,
            tx_packets: 0,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_errors: 0,
            tx_errors: 0,
            rx_dropped: 0,
            tx_dropped: 0,
        }
    }

    #[inline]
    pub const fn total_packets(&self) -> u64 {
        self.rx_packets + self.tx_packets
    }

    #[inline]
    pub const fn total_bytes(&self) -> u64 {
        self.rx_bytes + self.tx_bytes
    }

    #[inline]
    pub const fn total_errors(&self) -> u64 {
        self.rx_errors + self.tx_errors
    }

    #[inline]
    pub const fn total_dropped(&self) -> u64 {
        self.rx_dropped + self.tx_dropped
    }
}

impl fmt::Display for NetDeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx: {} pkts/{} bytes, tx: {} pkts/{} bytes, err: {}/{}, drop: {}/{}",
            self.rx_packets,
            self.rx_bytes,
            self.tx_packets,
            self.tx_bytes,
            self.rx_errors,
            self.tx_errors,
            self.rx_dropped,
            self.tx_dropped
        )
    }
}

// =============================================================================
// NetDeviceFeatures
// =============================================================================

bitflags! {
    /// Capability flags advertised by a network device.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NetDeviceFeatures: u32 {
        /// Device can compute TX checksums.
        const CHECKSUM_TX = 1 << 0;
        /// Device has verified RX checksums; stack can skip verification.
        const CHECKSUM_RX = 1 << 1;
    }
}

impl Default for NetDeviceFeatures {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for NetDeviceFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(none)");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, " | ")?;
            }
            write!(f, "{name}")?;
            first = false;
        }
        Ok(())
    }
}

// =============================================================================
// DeviceHandle
// =============================================================================

/// Stable, cloneable reference to a registered network device for
/// data-plane operations.
///
/// Obtained once via [`NetDeviceRegistry::register`] and held for the
/// device's lifetime. Bypasses the registry lock entirely:
///
/// - `tx()` acquires only the per-device TX lock.
/// - `poll_rx()` takes no lock — each device has one reader thread.
/// - `mac()`, `mtu()`, `stats()`, `features()` are read-only.
#[derive(Clone)]
pub struct DeviceHandle {
    dev: Arc<dyn NetDevice>,
    index: DevIndex,
    /// Per-device TX serialization. Multiple sockets may transmit to the
    /// same device concurrently; this lock serializes their `tx()` calls
    /// without touching the global registry lock.
    tx_lock: Arc<Mutex<()>>,
}

impl DeviceHandle {
    /// Transmit a packet through this device.
    pub fn tx(&self, pkt: PacketBuf) -> Result<(), NetError> {
        let _guard = self.tx_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.dev.tx(pkt)
    }

    /// Poll for received packets.
    ///
    /// Must be called from this device's own reader thread only.
    pub fn poll_rx(&self, budget: usize, pool: &'static PacketPool) -> Vec<PacketBuf> {
        self.dev.poll_rx(budget, pool)
    }

    #[inline]
    pub fn index(&self) -> DevIndex {
        self.index
    }

    pub fn mac(&self) -> MacAddr {
        self.dev.mac()
    }

    pub fn mtu(&self) -> u16 {
        self.dev.mtu()
    }

    pub fn stats(&self) -> NetDeviceStats {
        self.dev.stats()
    }

    pub fn features(&self) -> NetDeviceFeatures {
        self.dev.features()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceHandle({})", self.index)
    }
}

// =============================================================================
// NetDeviceRegistry
// =============================================================================

/// Maximum number of simultaneously registered network devices.
const MAX_DEVICES: usize = 8;

/// Control-plane storage for registered network devices.
///
/// The registry lock is taken only for registration, unregistration, and
/// enumeration — never on the data path, which goes through
/// [`DeviceHandle`] instead.
pub struct NetDeviceRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistrySlot {
    dev: Arc<dyn NetDevice>,
    tx_lock: Arc<Mutex<()>>,
}

struct RegistryInner {
    slots: Vec<Option<RegistrySlot>>,
}

/// The global network device registry.
///
/// Devices call [`register`](NetDeviceRegistry::register) during startup to
/// add themselves, and receive a [`DeviceHandle`] for data-plane operations.
pub static DEVICE_REGISTRY: NetDeviceRegistry = NetDeviceRegistry::new();

impl NetDeviceRegistry {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner { slots: Vec::new() }),
        }
    }

    /// Register a network device and obtain a stable [`DeviceHandle`].
    ///
    /// Returns `None` if all `MAX_DEVICES` slots are occupied.
    pub fn register(&self, dev: Arc<dyn NetDevice>) -> Option<DeviceHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let tx_lock = Arc::new(Mutex::new(()));
        for (i, slot) in inner.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(RegistrySlot {
                    dev: dev.clone(),
                    tx_lock: tx_lock.clone(),
                });
                return Some(DeviceHandle {
                    dev,
                    index: DevIndex(i),
                    tx_lock,
                });
            }
        }
        if inner.slots.len() < MAX_DEVICES {
            let index = DevIndex(inner.slots.len());
            inner.slots.push(Some(RegistrySlot {
                dev: dev.clone(),
                tx_lock: tx_lock.clone(),
            }));
            return Some(DeviceHandle {
                dev,
                index,
                tx_lock,
            });
        }
        None
    }

    /// Unregister a network device.
    ///
    /// Calls [`set_down()`](NetDevice::set_down) and frees the slot. The
    /// caller must ensure no reader thread is still polling this device's
    /// [`DeviceHandle`].
    pub fn unregister(&self, index: DevIndex) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.slots.get_mut(index.0) {
            Some(slot @ Some(_)) => {
                let entry = slot.take().unwrap();
                entry.dev.set_down();
                true
            }
            _ => false,
        }
    }

    /// Enumerate all registered devices as `(DevIndex, MacAddr, is_up)`.
    pub fn enumerate(&self) -> Vec<(DevIndex, MacAddr, bool)> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (DevIndex(i), s.dev.mac(), true)))
            .collect()
    }

    /// Number of currently registered devices.
    pub fn device_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Transmit a packet through a device identified by index.
    ///
    /// For hot-path TX where a [`DeviceHandle`] is already available, prefer
    /// [`DeviceHandle::tx`], which bypasses the registry lock.
    pub fn tx_by_index(&self, index: DevIndex, pkt: PacketBuf) -> Result<(), NetError> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.slots.get(index.0) {
            Some(Some(slot)) => slot.dev.tx(pkt),
            _ => Err(NetError::NetworkUnreachable),
        }
    }

    /// Read the MAC address of a device by index.
    pub fn mac_by_index(&self, index: DevIndex) -> Option<MacAddr> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.slots.get(index.0)?.as_ref().map(|s| s.dev.mac())
    }

    /// Read the feature flags of a device by index.
    pub fn features_by_index(&self, index: DevIndex) -> Option<NetDeviceFeatures> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.slots.get(index.0)?.as_ref().map(|s| s.dev.features())
    }

    /// Reconstruct a [`DeviceHandle`] for an already-registered device.
    ///
    /// Returns a handle sharing the same per-device TX lock as the handle
    /// returned from [`register`](Self::register), so callers that only
    /// have a [`DevIndex`] (e.g. the routing table) can still serialize
    /// correctly with the device's original reader-thread handle.
    pub fn handle_for_index(&self, index: DevIndex) -> Option<DeviceHandle> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let slot = inner.slots.get(index.0)?.as_ref()?;
        Some(DeviceHandle {
            dev: slot.dev.clone(),
            index,
            tx_lock: slot.tx_lock.clone(),
        })
    }
}
