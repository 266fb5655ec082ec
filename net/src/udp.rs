//! UDP protocol control blocks and datagram I/O.
//!
//! A fixed pool of 16 PCBs, each in {`Free`, `Open`, `Closing`}. A bound PCB
//! owns a FIFO queue of received `(foreign endpoint, payload)` pairs and a
//! [`SchedCtx`] that [`recvfrom`] blocks on when the queue is empty.
//!
//! # Concurrency
//!
//! The whole table is behind one [`Mutex`] (module-scope, per the
//! concurrency model shared with ARP and TCP). `recvfrom` parks on the PCB's
//! own `SchedCtx` using that same lock, so a datagram delivered while a
//! reader is asleep is never missed between the queue check and the sleep.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use netstackd_runtime::sched::{SchedCtx, SleepOutcome, deadline_from};

use super::packetbuf::PacketBuf;
use super::types::{Ipv4Addr, NetError, Port};

/// Number of UDP PCBs in the fixed pool.
pub const UDP_PCB_POOL_SIZE: usize = 16;

/// Ephemeral port range scanned by [`sendto`] when the local port is
/// unset (0).
const EPHEMERAL_PORT_START: u16 = 49152;
const EPHEMERAL_PORT_END: u16 = 65535;

const MAX_RECV_QUEUE: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UdpPcbState {
    Free,
    Open,
    Closing,
}

struct UdpDatagram {
    foreign_ip: Ipv4Addr,
    foreign_port: Port,
    payload: Vec<u8>,
}

struct UdpPcb {
    state: UdpPcbState,
    local_ip: Ipv4Addr,
    local_port: Port,
    queue: VecDeque<UdpDatagram>,
    sched: SchedCtx,
}

impl UdpPcb {
    const fn new() -> Self {
        Self {
            state: UdpPcbState::Free,
            local_ip: Ipv4Addr::UNSPECIFIED,
            local_port: Port::new(0),
            queue: VecDeque::new(),
            sched: SchedCtx::new(),
        }
    }
}

struct UdpTableInner {
    pcbs: [UdpPcb; UDP_PCB_POOL_SIZE],
}

/// The fixed-size UDP PCB table.
pub struct UdpTable {
    inner: Mutex<UdpTableInner>,
}

/// The global UDP PCB table.
pub static UDP_TABLE: UdpTable = UdpTable::new();

impl UdpTable {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(UdpTableInner {
                pcbs: [const { UdpPcb::new() }; UDP_PCB_POOL_SIZE],
            }),
        }
    }

    /// Allocate a PCB. Returns its index, unbound (`0.0.0.0:0`).
    pub fn open(&self) -> Result<usize, NetError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for (i, pcb) in inner.pcbs.iter_mut().enumerate() {
            if pcb.state == UdpPcbState::Free {
                pcb.state = UdpPcbState::Open;
                pcb.local_ip = Ipv4Addr::UNSPECIFIED;
                pcb.local_port = Port::new(0);
                pcb.queue.clear();
                return Ok(i);
            }
        }
        Err(NetError::NoBufferSpace)
    }

    /// Bind a PCB to a local endpoint. Fails if another `Open` PCB already
    /// owns a non-wildcard-matching `(addr, port)` pair.
    pub fn bind(&self, id: usize, local_ip: Ipv4Addr, local_port: Port) -> Result<(), NetError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner
            .pcbs
            .iter()
            .enumerate()
            .any(|(i, p)| i != id && p.state == UdpPcbState::Open && endpoints_conflict(p.local_ip, p.local_port, local_ip, local_port))
        {
            return Err(NetError::AddressInUse);
        }
        let pcb = inner.pcbs.get_mut(id).ok_or(NetError::InvalidArgument)?;
        if pcb.state != UdpPcbState::Open {
            return Err(NetError::InvalidArgument);
        }
        pcb.local_ip = local_ip;
        pcb.local_port = local_port;
        Ok(())
    }

    /// Release a PCB: marks it `Closing`, wakes any blocked `recvfrom`, then
    /// frees the slot once no one is left waiting.
    pub fn close(&self, id: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(pcb) = inner.pcbs.get_mut(id) else {
            return;
        };
        if pcb.state == UdpPcbState::Free {
            return;
        }
        pcb.state = UdpPcbState::Closing;
        pcb.queue.clear();
        pcb.sched.interrupt();
        pcb.state = UdpPcbState::Free;
        pcb.local_ip = Ipv4Addr::UNSPECIFIED;
        pcb.local_port = Port::new(0);
    }

    /// Deliver a received datagram to whichever PCB matches `(dst_ip,
    /// dst_port)`, waking its sleeper.
    fn deliver(&self, src_ip: Ipv4Addr, src_port: Port, dst_ip: Ipv4Addr, dst_port: Port, payload: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(pcb) = inner.pcbs.iter_mut().find(|p| {
            p.state == UdpPcbState::Open
                && p.local_port == dst_port
                && (p.local_ip.is_unspecified() || p.local_ip == dst_ip)
        }) else {
            return false;
        };
        if pcb.queue.len() >= MAX_RECV_QUEUE {
            return false;
        }
        pcb.queue.push_back(UdpDatagram {
            foreign_ip: src_ip,
            foreign_port: src_port,
            payload: payload.to_vec(),
        });
        pcb.sched.wakeup();
        true
    }

    /// `recvfrom`: pop the oldest queued datagram, blocking on the PCB's
    /// sleep context if the queue is empty.
    pub fn recvfrom(
        &self,
        id: usize,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(usize, Ipv4Addr, Port), NetError> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let deadline = deadline_from(timeout);
        loop {
            let state = guard.pcbs.get(id).map(|p| p.state).ok_or(NetError::InvalidArgument)?;
            if state == UdpPcbState::Closing {
                return Err(NetError::ConnectionAborted);
            }

            if let Some(dg) = guard.pcbs[id].queue.pop_front() {
                let n = dg.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&dg.payload[..n]);
                return Ok((n, dg.foreign_ip, dg.foreign_port));
            }

            let sched_ptr: *const SchedCtx = &guard.pcbs[id].sched;
            // Safety: the SchedCtx lives inside the table guarded by the same
            // lock we're about to hand to `sleep`; it outlives the wait.
            let sched = unsafe { &*sched_ptr };
            let (new_guard, outcome) = sched.sleep(guard, deadline);
            guard = new_guard;
            match outcome {
                SleepOutcome::Woken => continue,
                SleepOutcome::TimedOut => return Err(NetError::TimedOut),
                SleepOutcome::Interrupted => return Err(NetError::Interrupted),
            }
        }
    }

    /// Resolve a PCB's current local endpoint (for `sendto` source
    /// selection).
    fn local_endpoint(&self, id: usize) -> Result<(Ipv4Addr, Port), NetError> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let pcb = inner.pcbs.get(id).ok_or(NetError::InvalidArgument)?;
        if pcb.state != UdpPcbState::Open {
            return Err(NetError::NotConnected);
        }
        Ok((pcb.local_ip, pcb.local_port))
    }

    /// Assign `(local_ip, local_port)` to a PCB that bound with a wildcard
    /// address/port, as part of `sendto`'s implicit bind.
    fn finish_implicit_bind(&self, id: usize, local_ip: Ipv4Addr, local_port: Port) -> Result<(), NetError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if local_port.as_u16() != 0
            && inner.pcbs.iter().enumerate().any(|(i, p)| {
                i != id && p.state == UdpPcbState::Open && p.local_ip == local_ip && p.local_port == local_port
            })
        {
            return Err(NetError::AddressInUse);
        }
        let pcb = inner.pcbs.get_mut(id).ok_or(NetError::InvalidArgument)?;
        if pcb.local_ip.is_unspecified() {
            pcb.local_ip = local_ip;
        }
        if pcb.local_port.as_u16() == 0 {
            pcb.local_port = local_port;
        }
        Ok(())
    }
}

fn endpoints_conflict(a_ip: Ipv4Addr, a_port: Port, b_ip: Ipv4Addr, b_port: Port) -> bool {
    if a_port != b_port {
        return false;
    }
    a_ip.is_unspecified() || b_ip.is_unspecified() || a_ip == b_ip
}

/// Interrupt every open PCB's sleep context — the UDP half of the "event"
/// signal's process-wide cancellation broadcast (see `tcp::interrupt_all`).
pub fn interrupt_all() {
    let inner = UDP_TABLE.inner.lock().unwrap_or_else(|p| p.into_inner());
    for pcb in inner.pcbs.iter() {
        if pcb.state != UdpPcbState::Free {
            pcb.sched.interrupt();
        }
    }
}

/// Number of PCBs not in the `Free` state (diagnostic).
pub fn occupancy() -> usize {
    let inner = UDP_TABLE.inner.lock().unwrap_or_else(|p| p.into_inner());
    inner.pcbs.iter().filter(|p| p.state != UdpPcbState::Free).count()
}

// =============================================================================
// Ingress
// =============================================================================

/// Handle an incoming UDP datagram.
///
/// `pkt`'s payload is the UDP datagram (header + data) — the IPv4 header has
/// already been pulled off by [`super::ipv4::handle_rx`].
pub fn handle_rx(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, pkt: &PacketBuf) {
    let data = pkt.payload();
    if data.len() < 8 {
        log::debug!("udp: datagram too short ({} < 8)", data.len());
        return;
    }

    let src_port = Port::new(u16::from_be_bytes([data[0], data[1]]));
    let dst_port = Port::new(u16::from_be_bytes([data[2], data[3]]));
    let udp_len = u16::from_be_bytes([data[4], data[5]]) as usize;

    if udp_len < 8 || udp_len > data.len() {
        log::debug!("udp: length mismatch (udp.len={}, ip payload={})", udp_len, data.len());
        return;
    }

    let checksum = pkt.compute_udp_checksum(src_ip, dst_ip);
    let recv_checksum = u16::from_be_bytes([data[6], data[7]]);
    if recv_checksum != 0 && checksum != 0 {
        log::debug!("udp: bad checksum");
        return;
    }

    let payload = &data[8..udp_len];
    if !UDP_TABLE.deliver(src_ip, src_port, dst_ip, dst_port, payload) {
        log::debug!("udp: no PCB for {}:{}", dst_ip, dst_port.as_u16());
    }
}

// =============================================================================
// Egress
// =============================================================================

/// `sendto`: resolve source address/port (performing an implicit bind if
/// the PCB is still wildcard-bound), build a UDP datagram, and hand it to
/// IP for routing.
pub fn sendto(id: usize, buf: &[u8], foreign_ip: Ipv4Addr, foreign_port: Port) -> Result<usize, NetError> {
    use super::ipv4;
    use super::netdev::DEVICE_REGISTRY;
    use super::netstack::NET_STACK;
    use super::route::ROUTE_TABLE;
    use super::types::IpProtocol;

    if buf.len() > 65507 {
        return Err(NetError::InvalidArgument);
    }

    let (mut local_ip, mut local_port) = UDP_TABLE.local_endpoint(id)?;

    if local_ip.is_unspecified() {
        let (dev, _next_hop) = ROUTE_TABLE.lookup(foreign_ip).ok_or(NetError::NetworkUnreachable)?;
        local_ip = NET_STACK.our_ip(dev).ok_or(NetError::AddressNotAvailable)?;
    }

    if local_port.as_u16() == 0 {
        local_port = allocate_ephemeral_port(local_ip)?;
    }

    UDP_TABLE.finish_implicit_bind(id, local_ip, local_port)?;

    let udp_len = (8 + buf.len()) as u16;
    let mut datagram = Vec::with_capacity(udp_len as usize);
    datagram.extend_from_slice(&local_port.to_network_bytes());
    datagram.extend_from_slice(&foreign_port.to_network_bytes());
    datagram.extend_from_slice(&udp_len.to_be_bytes());
    datagram.extend_from_slice(&0u16.to_be_bytes());
    datagram.extend_from_slice(buf);

    let (dev, _) = ROUTE_TABLE.lookup(foreign_ip).ok_or(NetError::NetworkUnreachable)?;
    let src_mac = DEVICE_REGISTRY.mac_by_index(dev).unwrap_or(super::types::MacAddr::ZERO);

    // Build the IPv4+Ethernet frame, then patch in the UDP checksum once
    // L3/L4 offsets and addresses are known.
    let mut frame = ipv4::build_frame(local_ip, foreign_ip, IpProtocol::Udp, src_mac, &datagram)?;

    let checksum = frame.compute_udp_checksum(local_ip, foreign_ip);
    let checksum = if checksum == 0 { 0xFFFF } else { checksum };
    let l4 = frame.l4_header_mut();
    l4[6..8].copy_from_slice(&checksum.to_be_bytes());

    ipv4::send(foreign_ip, frame)?;
    Ok(buf.len())
}

/// `recvfrom`: see [`UdpTable::recvfrom`].
pub fn recvfrom(
    id: usize,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<(usize, Ipv4Addr, Port), NetError> {
    UDP_TABLE.recvfrom(id, buf, timeout)
}

fn allocate_ephemeral_port(local_ip: Ipv4Addr) -> Result<Port, NetError> {
    let inner = UDP_TABLE.inner.lock().unwrap_or_else(|p| p.into_inner());
    for raw in EPHEMERAL_PORT_START..=EPHEMERAL_PORT_END {
        let candidate = Port::new(raw);
        let in_use = inner.pcbs.iter().any(|p| {
            p.state == UdpPcbState::Open
                && p.local_port == candidate
                && (p.local_ip.is_unspecified() || p.local_ip == local_ip || local_ip.is_unspecified())
        });
        if !in_use {
            return Ok(candidate);
        }
    }
    Err(NetError::AddressNotAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_bind_close_roundtrip() {
        let table = UdpTable::new();
        let id = table.open().unwrap();
        table.bind(id, Ipv4Addr::from_bytes([127, 0, 0, 1]), Port::new(9000)).unwrap();
        table.close(id);
        let id2 = table.open().unwrap();
        assert_eq!(id2, id);
    }

    #[test]
    fn bind_conflict_rejected() {
        let table = UdpTable::new();
        let a = table.open().unwrap();
        table.bind(a, Ipv4Addr::from_bytes([127, 0, 0, 1]), Port::new(9000)).unwrap();
        let b = table.open().unwrap();
        assert!(table.bind(b, Ipv4Addr::from_bytes([127, 0, 0, 1]), Port::new(9000)).is_err());
    }

    #[test]
    fn deliver_to_wildcard_bound_pcb() {
        let table = UdpTable::new();
        let id = table.open().unwrap();
        table.bind(id, Ipv4Addr::UNSPECIFIED, Port::new(5353)).unwrap();
        let delivered = table.deliver(
            Ipv4Addr::from_bytes([10, 0, 0, 1]),
            Port::new(1234),
            Ipv4Addr::from_bytes([192, 0, 2, 2]),
            Port::new(5353),
            b"hello",
        );
        assert!(delivered);
        let mut buf = [0u8; 16];
        let (n, foreign_ip, foreign_port) = table.recvfrom(id, &mut buf, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(foreign_ip, Ipv4Addr::from_bytes([10, 0, 0, 1]));
        assert_eq!(foreign_port, Port::new(1234));
    }
}
