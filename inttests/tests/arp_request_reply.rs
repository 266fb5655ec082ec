//! Peer sends an ARP request for our IP; we must reply with our MAC.

use netstackd_net::packetbuf::PacketBuf;
use netstackd_net::types::MacAddr;
use netstackd_tests::{arp_request, setup, wait_for_tx, OUR_IP, OUR_MAC, PEER_IP, PEER_MAC};

#[test]
fn peer_arp_request_gets_our_reply() {
    let (handle, dev) = setup();

    let frame = arp_request(PEER_MAC, PEER_IP, OUR_IP);
    let pkt = PacketBuf::from_raw_copy(&frame).expect("pool has room");
    netstackd_net::ingress::net_rx(&handle, pkt);

    let reply = wait_for_tx(&dev).expect("ARP reply transmitted");

    assert_eq!(&reply[0..6], PEER_MAC.as_bytes(), "reply destined to the peer");
    assert_eq!(&reply[6..12], OUR_MAC.as_bytes(), "reply sourced from us");
    assert_eq!(u16::from_be_bytes([reply[12], reply[13]]), 0x0806, "ARP ethertype");

    let body = &reply[14..];
    let oper = u16::from_be_bytes([body[6], body[7]]);
    assert_eq!(oper, 2, "ARP reply opcode");
    let sha = MacAddr([body[8], body[9], body[10], body[11], body[12], body[13]]);
    assert_eq!(sha, OUR_MAC, "sender hardware address is ours");
    let spa = &body[14..18];
    assert_eq!(spa, OUR_IP.as_bytes(), "sender protocol address is our IP");
    let tha = MacAddr([body[18], body[19], body[20], body[21], body[22], body[23]]);
    assert_eq!(tha, PEER_MAC, "target hardware address is the requester's");
}
