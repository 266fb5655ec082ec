//! Shared fixtures for the end-to-end scenario tests under `tests/`.
//!
//! Each scenario drives the stack through a [`FakeDevice`] standing in for
//! the wire: inbound frames are handed straight to
//! [`netstackd_net::ingress::net_rx`], and outbound frames land in the
//! device's transmit log for the test to inspect. No tap device, no
//! worker thread — this is the stack's protocol logic exercised directly,
//! under plain `cargo test`.
//!
//! Every scenario uses the same addressing: our interface at
//! `192.0.2.2/24`, gateway/peer at `192.0.2.1`, peer hardware address
//! `aa:aa:aa:aa:aa:aa`, our hardware address `bb:bb:bb:bb:bb:bb`.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use netstackd_net::netdev::{DeviceHandle, NetDevice, NetDeviceFeatures, NetDeviceStats, DEVICE_REGISTRY};
use netstackd_net::netstack::NET_STACK;
use netstackd_net::packetbuf::PacketBuf;
use netstackd_net::pool::{PacketPool, PACKET_POOL};
use netstackd_net::types::{Ipv4Addr, MacAddr};
use netstackd_net::{
    ARP_HEADER_LEN, ARP_HLEN_ETHERNET, ARP_HTYPE_ETHERNET, ARP_OPER_REPLY, ARP_OPER_REQUEST,
    ARP_PLEN_IPV4, ARP_PTYPE_IPV4, ETH_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4, ICMP_HEADER_LEN,
    ICMP_TYPE_ECHO_REQUEST, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, IPV4_HEADER_LEN,
    ipv4_header_checksum,
};

pub const OUR_MAC: MacAddr = MacAddr([0xbb, 0xbb, 0xbb, 0xbb, 0xbb, 0xbb]);
pub const PEER_MAC: MacAddr = MacAddr([0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
pub const OUR_IP: Ipv4Addr = Ipv4Addr([192, 0, 2, 2]);
pub const PEER_IP: Ipv4Addr = Ipv4Addr([192, 0, 2, 1]);
pub const NETMASK: Ipv4Addr = Ipv4Addr([255, 255, 255, 0]);

/// An in-process stand-in for the wire. Inbound frames are fed to the
/// stack by calling `ingress::net_rx` directly rather than through a
/// reader thread; outbound frames accumulate here for inspection.
pub struct FakeDevice {
    mac: MacAddr,
    mtu: u16,
    stats: Mutex<NetDeviceStats>,
    tx_log: Mutex<Vec<Vec<u8>>>,
}

impl FakeDevice {
    pub fn new(mac: MacAddr) -> Self {
        Self {
            mac,
            mtu: 1500,
            stats: Mutex::new(NetDeviceStats::new()),
            tx_log: Mutex::new(Vec::new()),
        }
    }

    /// Remove and return every frame transmitted since the last drain.
    pub fn take_tx(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.tx_log.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl NetDevice for FakeDevice {
    fn tx(&self, pkt: PacketBuf) -> Result<(), netstackd_net::types::NetError> {
        let frame = pkt.payload().to_vec();
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        stats.tx_packets += 1;
        stats.tx_bytes += frame.len() as u64;
        self.tx_log.lock().unwrap_or_else(|p| p.into_inner()).push(frame);
        Ok(())
    }

    fn poll_rx(&self, _budget: usize, _pool: &'static PacketPool) -> Vec<PacketBuf> {
        Vec::new()
    }

    fn set_up(&self) {}
    fn set_down(&self) {}

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn stats(&self) -> NetDeviceStats {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn features(&self) -> NetDeviceFeatures {
        NetDeviceFeatures::empty()
    }
}

/// Register a [`FakeDevice`] at `mac`, configure it with the scenarios'
/// standard addressing, and return the handle plus the underlying device
/// (for draining transmitted frames).
///
/// Safe to call more than once per test binary only if each call happens
/// in its own process — every scenario test file is its own integration
/// test binary, so each gets a fresh `DEVICE_REGISTRY`/`ARP_CACHE`/
/// `ROUTE_TABLE`/`TCP_TABLE`/`UDP_TABLE`.
pub fn setup() -> (DeviceHandle, Arc<FakeDevice>) {
    netstackd_runtime::logging::init(netstackd_runtime::logging::LogLevel::Debug);
    PACKET_POOL.init();
    log::debug!("harness: configuring {} as {}/{}, gateway {}", OUR_MAC, OUR_IP, NETMASK, PEER_IP);
    let dev = Arc::new(FakeDevice::new(OUR_MAC));
    let dyn_dev: Arc<dyn NetDevice> = dev.clone();
    let handle = DEVICE_REGISTRY
        .register(dyn_dev)
        .expect("device registry has room for one device");
    NET_STACK.configure(handle.index(), OUR_IP, NETMASK, PEER_IP);
    (handle, dev)
}

/// Feed a fake ARP reply from `PEER_MAC`/`PEER_IP` through the stack so the
/// ARP cache already holds the peer's hardware address, mirroring scenario
/// 1 having already run. Needed before any scenario that exercises an
/// egress path to the peer without first performing its own ARP exchange.
pub fn prime_arp_cache(handle: &DeviceHandle) {
    let frame = arp_reply(PEER_MAC, PEER_IP, OUR_MAC, OUR_IP);
    let pkt = PacketBuf::from_raw_copy(&frame).expect("pool has room");
    netstackd_net::ingress::net_rx(handle, pkt);
}

// =============================================================================
// Frame builders
// =============================================================================

fn eth_header(dst: MacAddr, src: MacAddr, ethertype: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(ETH_HEADER_LEN);
    out.extend_from_slice(dst.as_bytes());
    out.extend_from_slice(src.as_bytes());
    out.extend_from_slice(&ethertype.to_be_bytes());
    out
}

pub fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut frame = eth_header(MacAddr::BROADCAST, sender_mac, ETHERTYPE_ARP);
    frame.extend_from_slice(&arp_body(
        ARP_OPER_REQUEST,
        sender_mac,
        sender_ip,
        MacAddr::ZERO,
        target_ip,
    ));
    frame
}

pub fn arp_reply(
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut frame = eth_header(target_mac, sender_mac, ETHERTYPE_ARP);
    frame.extend_from_slice(&arp_body(
        ARP_OPER_REPLY,
        sender_mac,
        sender_ip,
        target_mac,
        target_ip,
    ));
    frame
}

fn arp_body(oper: u16, sha: MacAddr, spa: Ipv4Addr, tha: MacAddr, tpa: Ipv4Addr) -> [u8; ARP_HEADER_LEN] {
    let mut body = [0u8; ARP_HEADER_LEN];
    body[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    body[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    body[4] = ARP_HLEN_ETHERNET;
    body[5] = ARP_PLEN_IPV4;
    body[6..8].copy_from_slice(&oper.to_be_bytes());
    body[8..14].copy_from_slice(sha.as_bytes());
    body[14..18].copy_from_slice(spa.as_bytes());
    body[18..24].copy_from_slice(tha.as_bytes());
    body[24..28].copy_from_slice(tpa.as_bytes());
    body
}

/// RFC 1071 one's-complement checksum, used here to fill in the ICMP/UDP/TCP
/// checksum fields the production code validates on the way in.
fn inet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn ipv4_pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, len: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(src.as_bytes());
    out.extend_from_slice(dst.as_bytes());
    out.push(0);
    out.push(proto);
    out.extend_from_slice(&len.to_be_bytes());
    out
}

pub fn icmp_echo_request(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    msg.push(ICMP_TYPE_ECHO_REQUEST);
    msg.push(0);
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    let checksum = inet_checksum(&msg);
    msg[2..4].copy_from_slice(&checksum.to_be_bytes());
    msg
}

pub fn udp_datagram(src_port: u16, dst_port: u16, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let len = (8 + payload.len()) as u16;
    let mut msg = Vec::with_capacity(len as usize);
    msg.extend_from_slice(&src_port.to_be_bytes());
    msg.extend_from_slice(&dst_port.to_be_bytes());
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(payload);

    let mut pseudo = ipv4_pseudo_header(src_ip, dst_ip, IPPROTO_UDP, len);
    pseudo.extend_from_slice(&msg);
    let checksum = inet_checksum(&pseudo);
    msg[6..8].copy_from_slice(&checksum.to_be_bytes());
    msg
}

pub struct TcpSegmentSpec {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: Vec<u8>,
}

pub fn tcp_segment(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, spec: &TcpSegmentSpec) -> Vec<u8> {
    let len = (20 + spec.payload.len()) as u16;
    let mut msg = Vec::with_capacity(len as usize);
    msg.extend_from_slice(&spec.src_port.to_be_bytes());
    msg.extend_from_slice(&spec.dst_port.to_be_bytes());
    msg.extend_from_slice(&spec.seq.to_be_bytes());
    msg.extend_from_slice(&spec.ack.to_be_bytes());
    msg.push(5 << 4);
    msg.push(spec.flags);
    msg.extend_from_slice(&spec.window.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&spec.payload);

    let mut pseudo = ipv4_pseudo_header(src_ip, dst_ip, IPPROTO_TCP, len);
    pseudo.extend_from_slice(&msg);
    let checksum = inet_checksum(&pseudo);
    msg[16..18].copy_from_slice(&checksum.to_be_bytes());
    msg
}

pub fn ipv4_frame(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, dst_mac: MacAddr, src_mac: MacAddr, proto: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = (IPV4_HEADER_LEN + payload.len()) as u16;
    let mut ip_hdr = [0u8; IPV4_HEADER_LEN];
    ip_hdr[0] = 0x45;
    ip_hdr[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip_hdr[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
    ip_hdr[8] = 64;
    ip_hdr[9] = proto;
    ip_hdr[12..16].copy_from_slice(src_ip.as_bytes());
    ip_hdr[16..20].copy_from_slice(dst_ip.as_bytes());
    let checksum = ipv4_header_checksum(&ip_hdr);
    ip_hdr[10..12].copy_from_slice(&checksum.to_be_bytes());

    let mut frame = eth_header(dst_mac, src_mac, ETHERTYPE_IPV4);
    frame.extend_from_slice(&ip_hdr);
    frame.extend_from_slice(payload);
    frame
}

pub fn icmp_frame(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, dst_mac: MacAddr, src_mac: MacAddr, icmp_msg: &[u8]) -> Vec<u8> {
    ipv4_frame(src_ip, dst_ip, dst_mac, src_mac, IPPROTO_ICMP, icmp_msg)
}

pub fn udp_frame(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, dst_mac: MacAddr, src_mac: MacAddr, udp_msg: &[u8]) -> Vec<u8> {
    ipv4_frame(src_ip, dst_ip, dst_mac, src_mac, IPPROTO_UDP, udp_msg)
}

pub fn tcp_frame(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, dst_mac: MacAddr, src_mac: MacAddr, tcp_msg: &[u8]) -> Vec<u8> {
    ipv4_frame(src_ip, dst_ip, dst_mac, src_mac, IPPROTO_TCP, tcp_msg)
}

pub const LISTEN_PORT: netstackd_net::types::Port = netstackd_net::types::Port(7);

/// Block (with a timeout) until `pred` returns true, polling every 1ms.
/// Used to synchronize with the background thread driving a blocking
/// `tcp::open`/`tcp::receive` call.
fn wait_until(mut pred: impl FnMut() -> bool) {
    let start = Instant::now();
    while !pred() {
        assert!(start.elapsed() < Duration::from_secs(5), "condition not met within timeout");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Wait for at least one frame to appear in `dev`'s transmit log and
/// return the first one.
pub fn wait_for_tx(dev: &FakeDevice) -> Option<Vec<u8>> {
    let start = Instant::now();
    loop {
        let mut frames = dev.take_tx();
        if !frames.is_empty() {
            return Some(frames.remove(0));
        }
        if start.elapsed() > Duration::from_secs(5) {
            return None;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Drive a full passive-open three-way handshake: spawn the blocking
/// `tcp::open` call on a background thread, feed it the peer's SYN
/// (seq=1000) and final ACK once the resulting SYN|ACK is observed, and
/// return the established PCB id together with the connection's ISS (so
/// callers can continue the stream with correctly-numbered segments). The
/// handshake's own frames are drained from `dev` before returning.
pub fn establish_tcp(handle: &DeviceHandle, dev: &FakeDevice) -> (usize, u32) {
    let local_ip = OUR_IP;
    let port = LISTEN_PORT;
    let opener = thread::spawn(move || netstackd_net::tcp::open(local_ip, port, None, false));

    wait_until(|| netstackd_net::tcp::active_count() == 1);

    let syn = TcpSegmentSpec {
        src_port: 40001,
        dst_port: port.0,
        seq: 1000,
        ack: 0,
        flags: netstackd_net::tcp::TCP_FLAG_SYN,
        window: 65535,
        payload: Vec::new(),
    };
    let frame = tcp_frame(PEER_IP, OUR_IP, OUR_MAC, PEER_MAC, &tcp_segment(PEER_IP, OUR_IP, &syn));
    let pkt = PacketBuf::from_raw_copy(&frame).expect("pool has room");
    netstackd_net::ingress::net_rx(handle, pkt);

    let synack_frame = wait_for_tx(dev).expect("SYN|ACK transmitted in response to SYN");
    let (_, _, synack_hdr, _) = parse_tcp_frame(&synack_frame);
    assert!(synack_hdr.is_syn() && synack_hdr.is_ack(), "expected SYN|ACK, got flags {:#x}", synack_hdr.flags);
    let iss = synack_hdr.seq_num;

    let ack = TcpSegmentSpec {
        src_port: 40001,
        dst_port: port.0,
        seq: 1001,
        ack: iss.wrapping_add(1),
        flags: netstackd_net::tcp::TCP_FLAG_ACK,
        window: 65535,
        payload: Vec::new(),
    };
    let frame = tcp_frame(PEER_IP, OUR_IP, OUR_MAC, PEER_MAC, &tcp_segment(PEER_IP, OUR_IP, &ack));
    let pkt = PacketBuf::from_raw_copy(&frame).expect("pool has room");
    netstackd_net::ingress::net_rx(handle, pkt);

    let id = opener
        .join()
        .expect("listener thread did not panic")
        .expect("handshake reaches ESTABLISHED");
    (id, iss)
}

/// Parse the Ethernet+IPv4+TCP headers out of a transmitted frame, for
/// assertions. Panics on anything shorter than a bare TCP header — every
/// frame this stack transmits carries one.
pub fn parse_tcp_frame(frame: &[u8]) -> (Ipv4Addr, Ipv4Addr, netstackd_net::tcp::TcpHeader, Vec<u8>) {
    let ip = &frame[ETH_HEADER_LEN..];
    let ihl = ((ip[0] & 0x0F) as usize) * 4;
    let src_ip = Ipv4Addr([ip[12], ip[13], ip[14], ip[15]]);
    let dst_ip = Ipv4Addr([ip[16], ip[17], ip[18], ip[19]]);
    let tcp_data = &ip[ihl..];
    let header = netstackd_net::tcp::parse_header(tcp_data).expect("valid TCP header");
    let payload = tcp_data[header.header_len()..].to_vec();
    (src_ip, dst_ip, header, payload)
}
