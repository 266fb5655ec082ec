//! A thread blocked in `tcp::receive` must return promptly, with an
//! interrupted-style error, once the process-wide cancellation broadcast
//! fires — the in-process equivalent of Ctrl+C unblocking every PCB.

use std::thread;
use std::time::{Duration, Instant};

use netstackd_net::tcp;
use netstackd_tests::{establish_tcp, prime_arp_cache, setup};

#[test]
fn blocked_receive_is_interrupted_by_cancellation() {
    let (handle, dev) = setup();
    prime_arp_cache(&handle);
    let (id, _iss) = establish_tcp(&handle, &dev);

    let receiver = thread::spawn(move || {
        let mut buf = [0u8; 16];
        tcp::receive(id, &mut buf)
    });

    // Give the receiver thread a moment to actually block in `receive`
    // before firing the broadcast, otherwise we'd just be testing that an
    // already-resolved future returns quickly.
    thread::sleep(Duration::from_millis(20));

    tcp::interrupt_all();

    let start = Instant::now();
    let result = loop {
        if receiver.is_finished() {
            break receiver.join().expect("receiver thread did not panic");
        }
        assert!(start.elapsed() < Duration::from_secs(5), "receive() did not return after interrupt_all");
        thread::sleep(Duration::from_millis(1));
    };

    assert_eq!(result, Err(netstackd_net::types::NetError::Interrupted));
}
