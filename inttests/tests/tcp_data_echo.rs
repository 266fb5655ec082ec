//! Continuing from an established connection: the peer sends a data
//! segment, we ACK it and make it available to `tcp::receive`, then
//! `tcp::send` on the same PCB transmits it back.

use netstackd_net::packetbuf::PacketBuf;
use netstackd_net::tcp;
use netstackd_tests::{
    establish_tcp, parse_tcp_frame, prime_arp_cache, setup, tcp_frame, tcp_segment, wait_for_tx,
    TcpSegmentSpec, OUR_IP, OUR_MAC, PEER_IP, PEER_MAC,
};

#[test]
fn established_connection_echoes_data() {
    let (handle, dev) = setup();
    prime_arp_cache(&handle);
    let (id, iss) = establish_tcp(&handle, &dev);

    let data = TcpSegmentSpec {
        src_port: 40001,
        dst_port: 7,
        seq: 1001,
        ack: iss.wrapping_add(1),
        flags: tcp::TCP_FLAG_ACK | tcp::TCP_FLAG_PSH,
        window: 65535,
        payload: b"xyz".to_vec(),
    };
    let frame = tcp_frame(PEER_IP, OUR_IP, OUR_MAC, PEER_MAC, &tcp_segment(PEER_IP, OUR_IP, &data));
    let pkt = PacketBuf::from_raw_copy(&frame).expect("pool has room");
    netstackd_net::ingress::net_rx(&handle, pkt);

    let ack_frame = wait_for_tx(&dev).expect("ACK transmitted for the data segment");
    let (_, _, ack_hdr, _) = parse_tcp_frame(&ack_frame);
    assert!(ack_hdr.is_ack() && !ack_hdr.is_syn());
    assert_eq!(ack_hdr.ack_num, 1004, "cumulative ack covers the 3-byte payload");

    let mut buf = [0u8; 16];
    let n = tcp::receive(id, &mut buf).expect("data already buffered, receive does not block");
    assert_eq!(&buf[..n], b"xyz");

    let sent = tcp::send(id, b"xyz").expect("send on an established connection");
    assert_eq!(sent, 3);

    let echoed = wait_for_tx(&dev).expect("echoed segment transmitted");
    let (src_ip, dst_ip, echoed_hdr, payload) = parse_tcp_frame(&echoed);
    assert_eq!(src_ip, OUR_IP);
    assert_eq!(dst_ip, PEER_IP);
    assert_eq!(echoed_hdr.seq_num, iss.wrapping_add(1));
    assert_eq!(echoed_hdr.ack_num, 1004);
    assert!(echoed_hdr.flags & tcp::TCP_FLAG_ACK != 0 && echoed_hdr.flags & tcp::TCP_FLAG_PSH != 0);
    assert_eq!(payload, b"xyz");

    tcp::close(id).ok();
}
