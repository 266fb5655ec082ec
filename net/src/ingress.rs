//! Ingress pipeline — single entry point for all received network packets.
//!
//! Every packet received from any network device passes through [`net_rx`],
//! which parses the Ethernet header, filters by destination MAC, and
//! dispatches to the appropriate protocol handler (ARP, IPv4).

use super::netdev::{DeviceHandle, NetDeviceFeatures};
use super::packetbuf::PacketBuf;
use super::types::{EtherType, MacAddr};
use super::{ETH_HEADER_LEN, arp, ipv4};

/// Process a received packet through the ingress pipeline.
///
/// This is the single entry point for all received packets, called from a
/// device's reader thread after [`DeviceHandle::poll_rx`] returns a packet.
///
/// # Processing steps
///
/// 1. Validate minimum Ethernet frame length.
/// 2. Parse destination MAC and EtherType from the Ethernet header.
/// 3. Filter: accept only packets addressed to our MAC, broadcast, or
///    multicast.
/// 4. Set L2/L3 layer offsets on the [`PacketBuf`].
/// 5. Pull the Ethernet header (advance `head` past 14 bytes).
/// 6. Dispatch by EtherType: ARP → [`arp::handle_rx`], IPv4 →
///    [`ipv4::handle_rx`].
///
/// Unknown EtherTypes are silently dropped.
pub fn net_rx(handle: &DeviceHandle, mut pkt: PacketBuf) {
    let frame = pkt.payload();
    if frame.len() < ETH_HEADER_LEN {
        log::debug!(
            "ingress: frame too short ({} < {})",
            frame.len(),
            ETH_HEADER_LEN
        );
        return;
    }

    let dst_mac = MacAddr([frame[0], frame[1], frame[2], frame[3], frame[4], frame[5]]);
    let ethertype_raw = u16::from_be_bytes([frame[12], frame[13]]);

    let our_mac = handle.mac();
    if dst_mac != our_mac && !dst_mac.is_broadcast() && !dst_mac.is_multicast() {
        return;
    }

    pkt.set_l2(pkt.head());
    pkt.set_l3(pkt.head() + ETH_HEADER_LEN as u16);

    if pkt.pull_header(ETH_HEADER_LEN).is_err() {
        return;
    }

    let dev = handle.index();
    let checksum_rx = handle.features().contains(NetDeviceFeatures::CHECKSUM_RX);

    match EtherType::from_u16(ethertype_raw) {
        Some(EtherType::Arp) => arp::handle_rx(handle, pkt),
        Some(EtherType::Ipv4) => ipv4::handle_rx(handle, dev, pkt, checksum_rx),
        Some(EtherType::Ipv6) => {
            // IPv6 is out of scope; silently drop.
        }
        None => {
            log::debug!("ingress: unknown EtherType 0x{:04x}, dropping", ethertype_raw);
        }
    }
}
