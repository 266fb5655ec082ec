//! Peer sends an ICMP echo request; we must reply with a matching echo
//! reply (same id/seq/payload, type flipped to echo-reply).

use netstackd_net::packetbuf::PacketBuf;
use netstackd_tests::{icmp_echo_request, icmp_frame, prime_arp_cache, setup, wait_for_tx, OUR_IP, OUR_MAC, PEER_IP, PEER_MAC};

#[test]
fn peer_icmp_echo_gets_our_reply() {
    let (handle, dev) = setup();
    prime_arp_cache(&handle);

    let msg = icmp_echo_request(0x0001, 0x0001, b"abcd");
    let frame = icmp_frame(PEER_IP, OUR_IP, OUR_MAC, PEER_MAC, &msg);
    let pkt = PacketBuf::from_raw_copy(&frame).expect("pool has room");
    netstackd_net::ingress::net_rx(&handle, pkt);

    let reply = wait_for_tx(&dev).expect("ICMP echo reply transmitted");

    assert_eq!(&reply[0..6], PEER_MAC.as_bytes());
    assert_eq!(&reply[6..12], OUR_MAC.as_bytes());

    let ihl = ((reply[14] & 0x0F) as usize) * 4;
    let ip = &reply[14..];
    assert_eq!(&ip[12..16], OUR_IP.as_bytes(), "reply sourced from us");
    assert_eq!(&ip[16..20], PEER_IP.as_bytes(), "reply addressed to the peer");

    let icmp = &reply[14 + ihl..];
    assert_eq!(icmp[0], 0, "echo reply type");
    assert_eq!(icmp[1], 0, "code");
    assert_eq!(u16::from_be_bytes([icmp[4], icmp[5]]), 0x0001, "identifier echoed back");
    assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 0x0001, "sequence echoed back");
    assert_eq!(&icmp[8..12], b"abcd", "payload echoed back");
}
