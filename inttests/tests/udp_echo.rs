//! Server binds the wildcard address on port 7; peer sends a datagram,
//! the server receives it and echoes the payload back.

use netstackd_net::packetbuf::PacketBuf;
use netstackd_net::types::{Ipv4Addr, Port};
use netstackd_net::udp;
use netstackd_tests::{prime_arp_cache, setup, udp_datagram, udp_frame, wait_for_tx, OUR_IP, OUR_MAC, PEER_IP, PEER_MAC};

#[test]
fn udp_server_receives_and_echoes() {
    let (handle, dev) = setup();
    prime_arp_cache(&handle);

    let id = udp::UDP_TABLE.open().expect("PCB available");
    udp::UDP_TABLE
        .bind(id, Ipv4Addr::UNSPECIFIED, Port(7))
        .expect("wildcard bind on port 7 succeeds");

    let datagram = udp_datagram(40000, 7, PEER_IP, OUR_IP, b"hello\n");
    let frame = udp_frame(PEER_IP, OUR_IP, OUR_MAC, PEER_MAC, &datagram);
    let pkt = PacketBuf::from_raw_copy(&frame).expect("pool has room");
    netstackd_net::ingress::net_rx(&handle, pkt);

    let mut buf = [0u8; 64];
    let (n, from_ip, from_port) = udp::recvfrom(id, &mut buf, None).expect("datagram delivered");
    assert_eq!(&buf[..n], b"hello\n");
    assert_eq!(from_ip, PEER_IP);
    assert_eq!(from_port, Port(40000));

    udp::sendto(id, &buf[..n], from_ip, from_port).expect("echo send succeeds");
    let reply = wait_for_tx(&dev).expect("echoed datagram transmitted");

    assert_eq!(&reply[0..6], PEER_MAC.as_bytes());
    let ihl = ((reply[14] & 0x0F) as usize) * 4;
    let ip = &reply[14..];
    assert_eq!(&ip[16..20], PEER_IP.as_bytes());
    let udp_hdr = &ip[ihl..];
    assert_eq!(u16::from_be_bytes([udp_hdr[0], udp_hdr[1]]), 7, "echoed from port 7");
    assert_eq!(u16::from_be_bytes([udp_hdr[2], udp_hdr[3]]), 40000, "echoed to the peer's port");
    assert_eq!(&udp_hdr[8..], b"hello\n");

    udp::UDP_TABLE.close(id);
}
