//! A passive-open listener completes a three-way handshake: peer SYN
//! seq=1000 gets SYN|ACK, peer's final ACK (seq=1001, ack=ISS+1) moves the
//! connection to ESTABLISHED and `tcp::open` returns its PCB id.

use netstackd_net::tcp;
use netstackd_tests::{establish_tcp, setup, prime_arp_cache};

#[test]
fn passive_open_completes_handshake() {
    let (handle, dev) = setup();
    prime_arp_cache(&handle);

    let (id, _iss) = establish_tcp(&handle, &dev);

    assert_eq!(tcp::active_count(), 1);

    tcp::close(id).ok();
}
