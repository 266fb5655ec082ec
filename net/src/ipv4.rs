//! IPv4 ingress and egress.
//!
//! [`handle_rx`] is the single entry point for all received IPv4 packets
//! after Ethernet demux. It validates the IP header (version, length,
//! checksum, TTL), sets the L4 layer offset on the [`PacketBuf`], and
//! dispatches to the appropriate transport handler (TCP, UDP, ICMP).
//!
//! [`send`] is the route-aware egress entry point used by every transport.
//! It performs a routing table lookup to determine the outgoing device and
//! next hop, then either transmits directly (loopback/broadcast/multicast)
//! or resolves the next hop's hardware address through the ARP cache.
//!
//! This stack never forwards — packets not addressed to a local interface
//! are dropped, and TTL=0 is always invalid rather than triggering an ICMP
//! time-exceeded reply.

use std::sync::Mutex;

use super::arp::{ARP_CACHE, ResolveOutcome};
use super::netdev::{DEVICE_REGISTRY, DeviceHandle};
use super::netstack::NET_STACK;
use super::packetbuf::PacketBuf;
use super::route::ROUTE_TABLE;
use super::types::{DevIndex, IpProtocol, Ipv4Addr, MacAddr, NetError};
use super::{ETH_HEADER_LEN, IPV4_HEADER_LEN, icmp, ipv4_header_checksum, tcp, udp};

/// TTL written on every packet this stack originates. The stack never
/// forwards, so a single fixed value (rather than per-route TTL) is
/// sufficient.
const OUTPUT_TTL: u8 = 255;

/// Monotonic IPv4 identification counter, starting at 128 and wrapping.
/// Guarded by its own lock, independent of the routing table or ARP cache.
static IP_ID: Mutex<u16> = Mutex::new(128);

fn next_ip_id() -> u16 {
    let mut id = IP_ID.lock().unwrap_or_else(|p| p.into_inner());
    let val = *id;
    *id = id.wrapping_add(1);
    val
}

/// Handle an incoming IPv4 packet.
///
/// Called from [`super::ingress::net_rx`] after Ethernet demux. The
/// packet's payload starts at the first byte of the IP header.
///
/// # Validation
///
/// 1. IP version must be 4.
/// 2. IHL >= 5 (header length >= 20 bytes).
/// 3. Total length <= packet size.
/// 4. Header checksum must verify (unless the device reports
///    `CHECKSUM_RX`).
/// 5. TTL > 0.
/// 6. Destination must be a local address: a configured interface's
///    unicast or subnet-broadcast address, or `255.255.255.255`. This
///    stack never forwards, so anything else is dropped rather than
///    handed to a transport handler.
///
/// Packets failing any check are silently dropped.
pub fn handle_rx(handle: &DeviceHandle, dev: DevIndex, mut pkt: PacketBuf, checksum_rx: bool) {
    let (proto, src_ip, dst_ip, ihl) = {
        let ip_data = pkt.payload();
        if ip_data.len() < IPV4_HEADER_LEN {
            log::debug!("ipv4: packet too short ({} < {})", ip_data.len(), IPV4_HEADER_LEN);
            return;
        }

        let version = (ip_data[0] >> 4) & 0x0F;
        if version != 4 {
            log::debug!("ipv4: bad version {}", version);
            return;
        }

        let ihl = ((ip_data[0] & 0x0F) as usize) * 4;
        if ihl < IPV4_HEADER_LEN || ip_data.len() < ihl {
            log::debug!("ipv4: bad IHL {} (packet len {})", ihl, ip_data.len());
            return;
        }

        let total_len = u16::from_be_bytes([ip_data[2], ip_data[3]]) as usize;
        if total_len > ip_data.len() {
            log::debug!("ipv4: total_len {} > packet len {}", total_len, ip_data.len());
            return;
        }

        if !checksum_rx && ipv4_header_checksum(&ip_data[..ihl]) != 0 {
            log::debug!("ipv4: bad header checksum");
            return;
        }

        // No fragmentation support: reject anything with DF, MF, or a
        // non-zero fragment offset set (bits 14..0 of this field).
        let flags_and_offset = u16::from_be_bytes([ip_data[6], ip_data[7]]);
        if flags_and_offset & 0x7FFF != 0 {
            log::debug!("ipv4: DF/MF/fragment-offset set, dropping");
            return;
        }

        let ttl = ip_data[8];
        if ttl == 0 {
            log::debug!("ipv4: TTL=0, dropping");
            return;
        }

        let proto = ip_data[9];
        let src_ip = Ipv4Addr([ip_data[12], ip_data[13], ip_data[14], ip_data[15]]);
        let dst_ip = Ipv4Addr([ip_data[16], ip_data[17], ip_data[18], ip_data[19]]);

        (proto, src_ip, dst_ip, ihl)
    };

    if !NET_STACK.is_our_addr(dst_ip) {
        log::debug!("ipv4: {} not a local address, dropping", dst_ip);
        return;
    }

    pkt.set_l4(pkt.head() + ihl as u16);
    if pkt.pull_header(ihl).is_err() {
        return;
    }

    match IpProtocol::from_u8(proto) {
        Some(IpProtocol::Tcp) => tcp::handle_rx(src_ip, dst_ip, &pkt),
        Some(IpProtocol::Udp) => udp::handle_rx(src_ip, dst_ip, &pkt),
        Some(IpProtocol::Icmp) => icmp::handle_rx(handle, src_ip, dst_ip, &pkt),
        None => {
            log::debug!("ipv4: unsupported protocol {}, dropping", proto);
        }
    }

    let _ = dev;
}

// =============================================================================
// Egress
// =============================================================================

/// Build an Ethernet+IPv4 frame around `payload`, with the destination MAC
/// left as all-zero (patched by [`send`] once the next hop is resolved).
///
/// Returns the fully assembled [`PacketBuf`] with L2/L3/L4 offsets set.
pub fn build_frame(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    proto: IpProtocol,
    src_mac: MacAddr,
    payload: &[u8],
) -> Result<PacketBuf, NetError> {
    let mut pkt = PacketBuf::alloc().ok_or(NetError::NoBufferSpace)?;
    pkt.append(payload)?;

    let total_len = (IPV4_HEADER_LEN + payload.len()) as u16;
    let id = next_ip_id();
    {
        let ip_hdr = pkt.push_header(IPV4_HEADER_LEN)?;
        ip_hdr[0] = 0x45;
        ip_hdr[1] = 0;
        ip_hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip_hdr[4..6].copy_from_slice(&id.to_be_bytes());
        ip_hdr[6..8].copy_from_slice(&0u16.to_be_bytes());
        ip_hdr[8] = OUTPUT_TTL;
        ip_hdr[9] = proto.as_u8();
        ip_hdr[10..12].copy_from_slice(&0u16.to_be_bytes());
        ip_hdr[12..16].copy_from_slice(src_ip.as_bytes());
        ip_hdr[16..20].copy_from_slice(dst_ip.as_bytes());
        let checksum = ipv4_header_checksum(ip_hdr);
        ip_hdr[10..12].copy_from_slice(&checksum.to_be_bytes());
    }

    {
        let eth_hdr = pkt.push_header(ETH_HEADER_LEN)?;
        eth_hdr[0..6].fill(0);
        eth_hdr[6..12].copy_from_slice(src_mac.as_bytes());
        eth_hdr[12..14].copy_from_slice(&super::ETHERTYPE_IPV4.to_be_bytes());
    }

    let head = pkt.head();
    pkt.set_l2(head);
    pkt.set_l3(head + ETH_HEADER_LEN as u16);
    pkt.set_l4(head + (ETH_HEADER_LEN + IPV4_HEADER_LEN) as u16);
    Ok(pkt)
}

fn patch_dst_mac(pkt: &mut PacketBuf, mac: MacAddr) {
    let frame = pkt.payload_mut();
    if frame.len() >= ETH_HEADER_LEN {
        frame[0..6].copy_from_slice(mac.as_bytes());
    }
}

/// Route-aware IPv4 send.
///
/// `pkt` must already hold a complete Ethernet+IPv4 frame built with
/// [`build_frame`] (or an equivalent), with the destination MAC left
/// unset. A routing table lookup determines the outgoing device and next
/// hop; loopback, broadcast, and multicast destinations transmit directly,
/// while other unicast destinations are resolved through the ARP cache.
///
/// Returns `Err` if there is no route, or if ARP resolution is still in
/// progress (the packet is dropped; the caller must not retry it — this
/// mirrors an incomplete resolution being treated as a send failure).
pub fn send(dst_ip: Ipv4Addr, mut pkt: PacketBuf) -> Result<(), NetError> {
    let (dev, next_hop) = ROUTE_TABLE.lookup(dst_ip).ok_or_else(|| {
        log::debug!("ipv4::send: no route to {}", dst_ip);
        NetError::NetworkUnreachable
    })?;

    if next_hop.is_loopback() || dst_ip.is_loopback() || dst_ip.is_broadcast() || dst_ip.is_multicast() {
        return DEVICE_REGISTRY.tx_by_index(dev, pkt);
    }

    let handle = DEVICE_REGISTRY
        .handle_for_index(dev)
        .ok_or(NetError::NetworkUnreachable)?;

    match ARP_CACHE.resolve(&handle, next_hop) {
        ResolveOutcome::Found(mac) => {
            patch_dst_mac(&mut pkt, mac);
            handle.tx(pkt)
        }
        ResolveOutcome::Incomplete => {
            log::debug!("ipv4::send: ARP resolution pending for {}, dropping packet", next_hop);
            Err(NetError::HostUnreachable)
        }
        ResolveOutcome::Error => {
            log::debug!("ipv4::send: ARP resolution error for {}", next_hop);
            Err(NetError::HostUnreachable)
        }
    }
}
