//! The single worker thread and its message channel.
//!
//! `spec.md` §4.1 names five signals the original design blocks on: one per
//! IRQ, one soft-IRQ, one "event" (cancellation), one "alarm" (periodic
//! timers), one "hangup" (shutdown). Each becomes a [`WorkerMsg`] variant
//! consumed from a bounded channel by the one thread that owns all packet
//! processing, per `spec.md` §9's sanctioned substitution of signal-driven
//! I/O with a reader-thread-per-device model.
//!
//! IRQ and soft-IRQ collapse into a single [`WorkerMsg::Frame`]: a reader
//! thread's bounded copy-and-enqueue (the ISR's job) is the `send` on the
//! channel, and the worker's `recv` loop dispatching straight into
//! [`ingress::net_rx`] is the soft-IRQ's deferred processing — there is only
//! one drain point in this stack's demux, so there is no second queue to
//! model separately.

use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

use netstackd_net::netdev::DeviceHandle;
use netstackd_net::packetbuf::PacketBuf;
use netstackd_net::pool::PacketPool;
use netstackd_net::{ingress, tcp, udp};

use crate::tap::TapDevice;

/// Depth of the frame-delivery channel. A handful of in-flight frames is
/// the expected case; a reader thread blocks on `send` if the worker falls
/// behind, which back-pressures the device's own read loop.
const CHANNEL_DEPTH: usize = 64;

/// Budget passed to [`DeviceHandle::poll_rx`] per wakeup for queue-backed
/// devices (loopback).
const POLL_BUDGET: usize = 16;

pub enum WorkerMsg {
    /// A frame arrived on some device and is ready for ingress processing.
    Frame { handle: DeviceHandle, pkt: PacketBuf },
    /// Process-wide cancellation broadcast (Ctrl+C): interrupt every
    /// blocked PCB so `send`/`receive`/`recvfrom` return promptly.
    Event,
    /// Periodic timer tick. Currently unused — the ARP cache has no
    /// expiry/GC (Open Question #1), and nothing else in this stack runs
    /// on a clock — but kept as a variant so a future timer-driven feature
    /// has somewhere to plug in without reshaping the worker loop.
    #[allow(dead_code)]
    Alarm,
    /// Worker termination. The worker interrupts every PCB one last time
    /// (in case `Event` raced with a PCB being created) and returns.
    Hangup,
}

pub fn channel() -> (SyncSender<WorkerMsg>, Receiver<WorkerMsg>) {
    sync_channel(CHANNEL_DEPTH)
}

/// Spawn the tap device's reader thread: blocking `read` on the tap fd,
/// copy into a pool buffer, post to the worker.
///
/// This is the one thread in the daemon that still does a raw blocking
/// syscall in place of the original's signal-delivered IRQ.
pub fn spawn_tap_reader(tap: std::sync::Arc<TapDevice>, handle: DeviceHandle, tx: SyncSender<WorkerMsg>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; netstackd_net::pool::BUF_SIZE];
        loop {
            let n = match tap.read_frame(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("tap: read failed: {}", e);
                    break;
                }
            };
            tap.record_rx(n);
            let Some(pkt) = PacketBuf::from_raw_copy(&buf[..n]) else {
                log::debug!("tap: dropping frame, pool exhausted");
                continue;
            };
            if tx.send(WorkerMsg::Frame { handle: handle.clone(), pkt }).is_err() {
                break;
            }
        }
    })
}

/// Spawn a reader thread for a queue-backed device (loopback): there is no
/// fd to block on, so this polls the device's internal queue, sleeping
/// briefly between empty polls.
pub fn spawn_polling_reader(handle: DeviceHandle, pool: &'static PacketPool, tx: SyncSender<WorkerMsg>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        loop {
            let packets = handle.poll_rx(POLL_BUDGET, pool);
            if packets.is_empty() {
                thread::sleep(std::time::Duration::from_millis(1));
                continue;
            }
            for pkt in packets {
                if tx.send(WorkerMsg::Frame { handle: handle.clone(), pkt }).is_err() {
                    return;
                }
            }
        }
    })
}

/// The worker's main loop: drain the channel, dispatch each message, until
/// `Hangup`.
pub fn run(rx: Receiver<WorkerMsg>) {
    for msg in rx {
        match msg {
            WorkerMsg::Frame { handle, pkt } => ingress::net_rx(&handle, pkt),
            WorkerMsg::Event => {
                log::info!("worker: event signal, interrupting all PCBs");
                tcp::interrupt_all();
                udp::interrupt_all();
            }
            WorkerMsg::Alarm => {}
            WorkerMsg::Hangup => {
                log::info!("worker: hangup, shutting down");
                tcp::interrupt_all();
                udp::interrupt_all();
                return;
            }
        }
    }
}
