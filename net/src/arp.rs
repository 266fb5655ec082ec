//! ARP cache and request/reply processing (RFC 826, Ethernet/IPv4 only).
//!
//! The cache is a fixed 32-entry table. Each entry is in one of four
//! states: `Free` (unused), `Incomplete` (request sent, no reply yet),
//! `Resolved` (learned from a reply or opportunistic update), `Static`
//! (never evicted or overwritten by input processing — reserved for
//! entries installed outside of ARP itself; nothing in this crate installs
//! one today). There is no expiry or garbage collection of `Resolved`
//! entries, and a resolution attempt against an `Incomplete` entry always
//! retransmits the request with no backoff — both are known, accepted
//! limitations rather than defects to fix.
//!
//! Allocation always succeeds: an empty slot is used if one exists,
//! otherwise the entry with the oldest timestamp is evicted.

use std::sync::Mutex;

use super::netdev::DeviceHandle;
use super::packetbuf::PacketBuf;
use super::types::{Ipv4Addr, MacAddr};
use super::{
    ARP_HEADER_LEN, ARP_HLEN_ETHERNET, ARP_HTYPE_ETHERNET, ARP_OPER_REPLY, ARP_OPER_REQUEST,
    ARP_PLEN_IPV4, ARP_PTYPE_IPV4, ETH_ADDR_LEN, ETH_HEADER_LEN, ETHERTYPE_ARP,
};

/// Number of entries in the ARP cache.
pub const ARP_CACHE_SIZE: usize = 32;

/// State of a single ARP cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArpState {
    Free,
    Incomplete,
    Resolved,
    Static,
}

/// A single entry in the ARP cache.
#[derive(Clone, Copy, Debug)]
struct ArpEntry {
    state: ArpState,
    pa: Ipv4Addr,
    ha: MacAddr,
    /// Millisecond timestamp of the last update, used for LRU eviction.
    timestamp: u64,
}

impl ArpEntry {
    const fn free() -> Self {
        Self {
            state: ArpState::Free,
            pa: Ipv4Addr::UNSPECIFIED,
            ha: MacAddr::ZERO,
            timestamp: 0,
        }
    }
}

/// Outcome of an ARP resolution attempt, mirroring the tri-valued result IP
/// output propagates: transmit now, defer because resolution is in flight,
/// or give up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The hardware address is known; transmit immediately.
    Found(MacAddr),
    /// No hardware address yet; a request has been (re-)sent. The caller
    /// must not transmit the pending packet.
    Incomplete,
    /// Resolution cannot proceed (e.g. the target address is not usable).
    Error,
}

struct ArpCacheInner {
    entries: [ArpEntry; ARP_CACHE_SIZE],
}

/// The fixed-size ARP cache.
pub struct ArpCache {
    inner: Mutex<ArpCacheInner>,
}

/// The global ARP cache.
pub static ARP_CACHE: ArpCache = ArpCache::new();

impl ArpCache {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(ArpCacheInner {
                entries: [ArpEntry::free(); ARP_CACHE_SIZE],
            }),
        }
    }

    /// Look up `pa`, returning its hardware address if the entry is
    /// `Resolved` or `Static`.
    pub fn lookup(&self, pa: Ipv4Addr) -> Option<MacAddr> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .entries
            .iter()
            .find(|e| e.pa == pa && matches!(e.state, ArpState::Resolved | ArpState::Static))
            .map(|e| e.ha)
    }

    /// Update the entry whose `pa` matches `sender_ip`, if one exists,
    /// setting it to `Resolved` with a refreshed hardware address and
    /// timestamp. Returns `true` if an entry was updated ("merge").
    fn update_if_present(inner: &mut ArpCacheInner, pa: Ipv4Addr, ha: MacAddr, now: u64) -> bool {
        for entry in inner.entries.iter_mut() {
            if entry.state != ArpState::Free && entry.pa == pa {
                entry.state = ArpState::Resolved;
                entry.ha = ha;
                entry.timestamp = now;
                return true;
            }
        }
        false
    }

    /// Allocate a slot for `pa`, evicting the oldest entry if the cache is
    /// full, and install it as `Resolved` with hardware address `ha`.
    fn insert(inner: &mut ArpCacheInner, pa: Ipv4Addr, ha: MacAddr, now: u64) {
        let slot = Self::alloc_slot(inner);
        inner.entries[slot] = ArpEntry {
            state: ArpState::Resolved,
            pa,
            ha,
            timestamp: now,
        };
    }

    /// Find a free slot, or evict the entry with the smallest timestamp.
    fn alloc_slot(inner: &mut ArpCacheInner) -> usize {
        if let Some(i) = inner
            .entries
            .iter()
            .position(|e| e.state == ArpState::Free)
        {
            return i;
        }
        let (i, _) = inner
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.timestamp)
            .expect("cache is non-empty");
        i
    }

    /// Resolve `pa` to a hardware address, sending an ARP request if
    /// necessary.
    ///
    /// Missing entries are allocated as
    /// `Incomplete` and a broadcast request is sent; an existing
    /// `Incomplete` entry causes a request retransmit (no backoff);
    /// `Resolved`/`Static` entries return their hardware address directly.
    pub fn resolve(&self, handle: &DeviceHandle, pa: Ipv4Addr) -> ResolveOutcome {
        if pa.is_unspecified() || pa.is_broadcast() {
            return ResolveOutcome::Error;
        }

        let now = netstackd_runtime::clock::uptime_ms();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(entry) = inner.entries.iter_mut().find(|e| e.pa == pa && e.state != ArpState::Free) {
            match entry.state {
                ArpState::Resolved | ArpState::Static => return ResolveOutcome::Found(entry.ha),
                ArpState::Incomplete => {
                    drop(inner);
                    send_request(handle, pa);
                    return ResolveOutcome::Incomplete;
                }
                ArpState::Free => unreachable!(),
            }
        }

        let slot = Self::alloc_slot(&mut inner);
        inner.entries[slot] = ArpEntry {
            state: ArpState::Incomplete,
            pa,
            ha: MacAddr::ZERO,
            timestamp: now,
        };
        drop(inner);
        send_request(handle, pa);
        ResolveOutcome::Incomplete
    }

    /// Number of non-`Free` entries (diagnostic).
    pub fn occupancy(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entries.iter().filter(|e| e.state != ArpState::Free).count()
    }
}

// =============================================================================
// Input processing
// =============================================================================

/// Handle an incoming ARP frame.
///
/// The packet's payload is the ARP message; the Ethernet header has
/// already been consumed by the ingress pipeline.
pub fn handle_rx(handle: &DeviceHandle, pkt: PacketBuf) {
    let data = pkt.payload();

    if data.len() < ARP_HEADER_LEN {
        log::debug!("arp: frame too short ({} < {})", data.len(), ARP_HEADER_LEN);
        return;
    }

    let htype = u16::from_be_bytes([data[0], data[1]]);
    let ptype = u16::from_be_bytes([data[2], data[3]]);
    let hlen = data[4];
    let plen = data[5];
    let oper = u16::from_be_bytes([data[6], data[7]]);

    if htype != ARP_HTYPE_ETHERNET
        || ptype != ARP_PTYPE_IPV4
        || hlen != ARP_HLEN_ETHERNET
        || plen != ARP_PLEN_IPV4
    {
        log::debug!(
            "arp: rejecting frame (htype={}, ptype=0x{:04x}, hlen={}, plen={})",
            htype,
            ptype,
            hlen,
            plen
        );
        return;
    }

    if oper != ARP_OPER_REQUEST && oper != ARP_OPER_REPLY {
        log::debug!("arp: rejecting frame with unknown opcode {}", oper);
        return;
    }

    let sender_mac = MacAddr([data[8], data[9], data[10], data[11], data[12], data[13]]);
    let sender_ip = Ipv4Addr([data[14], data[15], data[16], data[17]]);
    let target_ip = Ipv4Addr([data[24], data[25], data[26], data[27]]);

    let our_ip = super::netstack::NET_STACK
        .our_ip(handle.index())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    let now = netstackd_runtime::clock::uptime_ms();
    let mut inner = ARP_CACHE.inner.lock().unwrap_or_else(|p| p.into_inner());
    let merged = ArpCache::update_if_present(&mut inner, sender_ip, sender_mac, now);
    let is_for_us = !our_ip.is_unspecified() && target_ip == our_ip;
    if is_for_us && !merged {
        ArpCache::insert(&mut inner, sender_ip, sender_mac, now);
    }
    drop(inner);

    if oper == ARP_OPER_REQUEST && is_for_us {
        log::debug!(
            "arp: request for our IP {} from {} ({}), replying",
            target_ip,
            sender_ip,
            sender_mac
        );
        send_reply(handle, sender_ip, sender_mac);
    }
}

// =============================================================================
// Frame construction
// =============================================================================

fn write_eth_header(pkt: &mut PacketBuf, dst: MacAddr, src: MacAddr) -> Result<(), ()> {
    let eth = pkt.push_header(ETH_HEADER_LEN).map_err(|_| ())?;
    eth[0..ETH_ADDR_LEN].copy_from_slice(&dst.0);
    eth[ETH_ADDR_LEN..ETH_ADDR_LEN * 2].copy_from_slice(&src.0);
    eth[ETH_ADDR_LEN * 2..ETH_HEADER_LEN].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());
    Ok(())
}

fn write_arp_body(
    oper: u16,
    sha: MacAddr,
    spa: Ipv4Addr,
    tha: MacAddr,
    tpa: Ipv4Addr,
) -> [u8; ARP_HEADER_LEN] {
    let mut body = [0u8; ARP_HEADER_LEN];
    body[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    body[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    body[4] = ARP_HLEN_ETHERNET;
    body[5] = ARP_PLEN_IPV4;
    body[6..8].copy_from_slice(&oper.to_be_bytes());
    body[8..14].copy_from_slice(&sha.0);
    body[14..18].copy_from_slice(&spa.0);
    body[18..24].copy_from_slice(&tha.0);
    body[24..28].copy_from_slice(&tpa.0);
    body
}

/// Send an ARP request for `target_ip` via `handle`, broadcast to the LAN.
pub fn send_request(handle: &DeviceHandle, target_ip: Ipv4Addr) {
    let our_mac = handle.mac();
    let our_ip = super::netstack::NET_STACK
        .our_ip(handle.index())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    let Some(mut pkt) = PacketBuf::alloc() else {
        log::debug!("arp: send_request — pool exhausted");
        return;
    };
    if write_eth_header(&mut pkt, MacAddr::BROADCAST, our_mac).is_err() {
        log::debug!("arp: send_request — insufficient headroom");
        return;
    }
    let body = write_arp_body(
        ARP_OPER_REQUEST,
        our_mac,
        our_ip,
        MacAddr::ZERO,
        target_ip,
    );
    if pkt.append(&body).is_err() {
        log::debug!("arp: send_request — append failed");
        return;
    }

    log::debug!("arp: requesting {} on dev {}", target_ip, handle.index());
    if let Err(e) = handle.tx(pkt) {
        log::debug!("arp: send_request tx failed: {}", e);
    }
}

fn send_reply(handle: &DeviceHandle, target_ip: Ipv4Addr, target_mac: MacAddr) {
    let our_mac = handle.mac();
    let our_ip = super::netstack::NET_STACK
        .our_ip(handle.index())
        .unwrap_or(Ipv4Addr::UNSPECIFIED);

    let Some(mut pkt) = PacketBuf::alloc() else {
        log::debug!("arp: send_reply — pool exhausted");
        return;
    };
    if write_eth_header(&mut pkt, target_mac, our_mac).is_err() {
        return;
    }
    let body = write_arp_body(ARP_OPER_REPLY, our_mac, our_ip, target_mac, target_ip);
    if pkt.append(&body).is_err() {
        return;
    }

    log::debug!(
        "arp: replying to {} ({}) on dev {}",
        target_ip,
        target_mac,
        handle.index()
    );
    if let Err(e) = handle.tx(pkt) {
        log::debug!("arp: send_reply tx failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_missing_entry_is_incomplete_and_allocates() {
        // Exercise the cache directly without a device, since resolve()
        // needs a DeviceHandle only to transmit the request.
        let cache = ArpCache::new();
        assert_eq!(cache.occupancy(), 0);
        assert!(cache.lookup(Ipv4Addr::from_bytes([192, 0, 2, 1])).is_none());
    }

    #[test]
    fn insert_then_lookup_resolved() {
        let cache = ArpCache::new();
        let mut inner = cache.inner.lock().unwrap();
        ArpCache::insert(
            &mut inner,
            Ipv4Addr::from_bytes([192, 0, 2, 1]),
            MacAddr([0xaa; 6]),
            1,
        );
        drop(inner);
        assert_eq!(
            cache.lookup(Ipv4Addr::from_bytes([192, 0, 2, 1])),
            Some(MacAddr([0xaa; 6]))
        );
    }

    #[test]
    fn eviction_picks_oldest_timestamp() {
        let cache = ArpCache::new();
        {
            let mut inner = cache.inner.lock().unwrap();
            for i in 0..ARP_CACHE_SIZE {
                ArpCache::insert(
                    &mut inner,
                    Ipv4Addr::from_bytes([10, 0, 0, i as u8]),
                    MacAddr([i as u8; 6]),
                    i as u64,
                );
            }
        }
        assert_eq!(cache.occupancy(), ARP_CACHE_SIZE);
        {
            let mut inner = cache.inner.lock().unwrap();
            ArpCache::insert(
                &mut inner,
                Ipv4Addr::from_bytes([10, 0, 1, 0]),
                MacAddr([0xff; 6]),
                1000,
            );
        }
        // Entry with timestamp 0 (10.0.0.0) should have been evicted.
        assert!(cache.lookup(Ipv4Addr::from_bytes([10, 0, 0, 0])).is_none());
        assert_eq!(
            cache.lookup(Ipv4Addr::from_bytes([10, 0, 1, 0])),
            Some(MacAddr([0xff; 6]))
        );
    }
}
