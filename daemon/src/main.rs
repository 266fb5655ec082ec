//! `netstackd` — a userspace TCP/IP stack over a tap device.
//!
//! Startup sequence: parse CLI, install logging, initialize the packet
//! pool, register the loopback device, open and register the tap device,
//! configure both interfaces' IPv4 addresses and routes, spawn one reader
//! thread per device, install a Ctrl+C handler, then run the worker loop
//! on the main thread until shutdown.

mod cli;
mod tap;
mod worker;

use std::sync::Arc;

use clap::Parser;

use netstackd_net::netdev::{DEVICE_REGISTRY, NetDevice};
use netstackd_net::netstack::NET_STACK;
use netstackd_net::pool::PACKET_POOL;
use netstackd_net::route::ROUTE_TABLE;
use netstackd_net::{loopback, types::DevIndex};

use tap::TapDevice;
use worker::WorkerMsg;

fn main() {
    let args = cli::Args::parse();
    netstackd_runtime::logging::init(args.log_level);

    PACKET_POOL.init();
    log::info!("netstackd: packet pool initialized ({} slots)", netstackd_net::pool::POOL_SIZE);

    loopback::init_loopback();
    let lo_handle = DEVICE_REGISTRY
        .handle_for_index(DevIndex(0))
        .expect("loopback registered at dev 0");

    let tap_dev = match TapDevice::open(&args.tap_name, args.mac, args.mtu) {
        Ok(dev) => Arc::new(dev),
        Err(e) => {
            log::error!("netstackd: failed to open tap device {:?}: {}", args.tap_name, e);
            std::process::exit(1);
        }
    };
    let tap_dyn: Arc<dyn NetDevice> = tap_dev.clone();
    let tap_handle = DEVICE_REGISTRY.register(tap_dyn).unwrap_or_else(|| {
        log::error!("netstackd: device registry full, cannot register tap device");
        std::process::exit(1);
    });

    NET_STACK.configure(tap_handle.index(), args.address, args.netmask, args.gateway);
    NET_STACK.dump();
    ROUTE_TABLE.dump();
    log::info!(
        "netstackd: {} device(s) registered",
        DEVICE_REGISTRY.device_count()
    );

    let (tx, rx) = worker::channel();
    let _lo_reader = worker::spawn_polling_reader(lo_handle, &PACKET_POOL, tx.clone());
    let _tap_reader = worker::spawn_tap_reader(tap_dev, tap_handle, tx.clone());

    let ctrlc_tx = tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::info!("netstackd: received interrupt, shutting down");
        let _ = ctrlc_tx.send(WorkerMsg::Hangup);
    }) {
        log::warn!("netstackd: failed to install Ctrl+C handler: {}", e);
    }
    drop(tx);

    worker::run(rx);
    log::info!("netstackd: exiting");
}
