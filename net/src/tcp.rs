//! TCP — passive open only, RFC 793 state machine, RST-only teardown.
//!
//! Active open, the FIN handshake, and retransmission are out of scope:
//! [`open`] rejects `active=true` and [`close`] always tears a connection
//! down with RST. A PCB is a single slot in [`TCP_TABLE`] — there is no
//! separate listen/accept split, so a LISTEN-state PCB transitions
//! in-place to SYN-RECEIVED and then ESTABLISHED as its one connection
//! comes up; a second SYN to the same local tuple while one is already
//! established is out-of-band for this PCB and gets a reset like any
//! other unmatched segment.

use std::sync::Mutex;

use netstackd_runtime::sched::{SchedCtx, SleepOutcome};

use super::netdev::DEVICE_REGISTRY;
use super::packetbuf::PacketBuf;
use super::route::ROUTE_TABLE;
use super::types::{IpProtocol, Ipv4Addr, MacAddr, NetError, Port};

pub const TCP_HEADER_LEN: usize = 20;

/// Fixed PCB pool size, matching the UDP pool.
pub const MAX_CONNECTIONS: usize = 16;

/// Inline per-connection receive buffer.
pub const RECV_BUF_SIZE: usize = 65536;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

// =============================================================================
// Header parsing (RX only — no options are parsed, per the wire format)
// =============================================================================

#[derive(Clone, Copy, Debug)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    pub data_offset: u8,
    pub flags: u8,
    pub window_size: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    #[inline]
    pub const fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    #[inline]
    pub const fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    #[inline]
    pub const fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    #[inline]
    pub const fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    #[inline]
    pub const fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }
}

pub fn parse_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }
    let data_offset = (data[12] >> 4) & 0x0F;
    if data_offset < 5 || data_offset > 15 || data.len() < (data_offset as usize) * 4 {
        return None;
    }
    Some(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13] & 0x3F,
        window_size: u16::from_be_bytes([data[14], data[15]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

// =============================================================================
// Sequence number arithmetic (RFC 793 §3.3)
// =============================================================================

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

// =============================================================================
// ISN generator
// =============================================================================

use core::sync::atomic::{AtomicU32, Ordering};

/// A monotonic counter standing in for RFC 6528's clock/hash-derived ISN —
/// this stack has no per-connection secret to hash over.
static ISN_COUNTER: AtomicU32 = AtomicU32::new(0x4F50_534C);

fn generate_isn() -> u32 {
    ISN_COUNTER.fetch_add(64000, Ordering::Relaxed)
}

// =============================================================================
// TCP state machine (RFC 793 §3.2)
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Free,
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }
}

// =============================================================================
// PCB
// =============================================================================

struct TcpPcb {
    state: TcpState,
    local_ip: Ipv4Addr,
    local_port: Port,
    remote_ip: Ipv4Addr,
    remote_port: Port,

    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    snd_wl1: u32,
    snd_wl2: u32,
    iss: u32,

    rcv_nxt: u32,
    rcv_wnd: u32,
    irs: u32,

    mss: u16,

    recv_buf: Box<[u8; RECV_BUF_SIZE]>,

    sched: SchedCtx,
}

impl TcpPcb {
    fn new() -> Self {
        Self {
            state: TcpState::Free,
            local_ip: Ipv4Addr::UNSPECIFIED,
            local_port: Port::new(0),
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: Port::new(0),
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            iss: 0,
            rcv_nxt: 0,
            rcv_wnd: RECV_BUF_SIZE as u32,
            irs: 0,
            mss: 0,
            recv_buf: Box::new([0u8; RECV_BUF_SIZE]),
            sched: SchedCtx::new(),
        }
    }

    fn reset_to_free(&mut self) {
        self.state = TcpState::Free;
        self.local_ip = Ipv4Addr::UNSPECIFIED;
        self.local_port = Port::new(0);
        self.remote_ip = Ipv4Addr::UNSPECIFIED;
        self.remote_port = Port::new(0);
        self.rcv_wnd = RECV_BUF_SIZE as u32;
        self.sched.interrupt();
    }

    /// Bytes currently buffered for `receive()`.
    fn buffered(&self) -> usize {
        RECV_BUF_SIZE - self.rcv_wnd as usize
    }

    /// `RCV.WND` clamped to what fits in the 16-bit wire window field.
    fn wire_window(&self) -> u16 {
        self.rcv_wnd.min(u16::MAX as u32) as u16
    }
}

struct TcpTableInner {
    pcbs: Vec<TcpPcb>,
}

pub struct TcpTable {
    inner: Mutex<Option<TcpTableInner>>,
}

/// The global TCP PCB table.
pub static TCP_TABLE: TcpTable = TcpTable::new();

impl TcpTable {
    pub const fn new() -> Self {
        Self { inner: Mutex::new(None) }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut TcpTableInner) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let inner = guard.get_or_insert_with(|| TcpTableInner {
            pcbs: (0..MAX_CONNECTIONS).map(|_| TcpPcb::new()).collect(),
        });
        f(inner)
    }

    /// Allocate a PCB bound to `local_ip:local_port`, optionally restricted
    /// to a single foreign endpoint, and move it to LISTEN.
    fn listen(&self, local_ip: Ipv4Addr, local_port: Port, foreign: Option<(Ipv4Addr, Port)>) -> Result<usize, NetError> {
        self.with_inner(|inner| {
            if inner.pcbs.iter().any(|p| {
                p.state != TcpState::Free
                    && p.local_port == local_port
                    && (p.local_ip.is_unspecified() || local_ip.is_unspecified() || p.local_ip == local_ip)
            }) {
                return Err(NetError::AddressInUse);
            }
            let idx = inner
                .pcbs
                .iter()
                .position(|p| p.state == TcpState::Free)
                .ok_or(NetError::NoBufferSpace)?;
            let (remote_ip, remote_port) = foreign.unwrap_or((Ipv4Addr::UNSPECIFIED, Port::new(0)));
            let pcb = &mut inner.pcbs[idx];
            pcb.state = TcpState::Listen;
            pcb.local_ip = local_ip;
            pcb.local_port = local_port;
            pcb.remote_ip = remote_ip;
            pcb.remote_port = remote_port;
            pcb.rcv_wnd = RECV_BUF_SIZE as u32;
            log::debug!("tcp: LISTEN on {}:{} idx={}", local_ip, local_port.as_u16(), idx);
            Ok(idx)
        })
    }

    /// Block until the PCB reaches ESTABLISHED, or fails.
    fn wait_established(&self, id: usize) -> Result<usize, NetError> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            let inner = guard.as_mut().expect("initialized by listen()");
            let pcb = inner.pcbs.get_mut(id).ok_or(NetError::InvalidArgument)?;
            match pcb.state {
                TcpState::Established => return Ok(id),
                TcpState::Listen | TcpState::SynReceived => {}
                _ => return Err(NetError::ConnectionAborted),
            }
            let sched_ptr: *const SchedCtx = &pcb.sched;
            // Safety: the PCB (and its SchedCtx) lives inside the table for
            // as long as the lock we're about to hand to `sleep` is held by
            // someone — `sleep` releases and reacquires that very lock.
            let sched = unsafe { &*sched_ptr };
            let (new_guard, outcome) = sched.sleep(guard, None);
            guard = new_guard;
            if outcome == SleepOutcome::Interrupted {
                if let Some(inner) = guard.as_mut() {
                    if let Some(pcb) = inner.pcbs.get_mut(id) {
                        pcb.reset_to_free();
                    }
                }
                return Err(NetError::Interrupted);
            }
        }
    }

    /// Exact-match, falling back to a LISTEN PCB with matching local tuple
    /// and a wildcard or matching foreign restriction.
    fn find(&self, inner: &TcpTableInner, local_ip: Ipv4Addr, local_port: Port, remote_ip: Ipv4Addr, remote_port: Port) -> Option<usize> {
        for (i, pcb) in inner.pcbs.iter().enumerate() {
            if pcb.state != TcpState::Free
                && pcb.local_ip == local_ip
                && pcb.local_port == local_port
                && pcb.remote_ip == remote_ip
                && pcb.remote_port == remote_port
            {
                return Some(i);
            }
        }
        for (i, pcb) in inner.pcbs.iter().enumerate() {
            if pcb.state == TcpState::Listen
                && pcb.local_port == local_port
                && (pcb.local_ip.is_unspecified() || pcb.local_ip == local_ip)
                && (pcb.remote_ip.is_unspecified() || pcb.remote_ip == remote_ip)
                && (pcb.remote_port.as_u16() == 0 || pcb.remote_port == remote_port)
            {
                return Some(i);
            }
        }
        None
    }
}

// =============================================================================
// Output segment
// =============================================================================

struct OutSegment {
    local_ip: Ipv4Addr,
    local_port: Port,
    remote_ip: Ipv4Addr,
    remote_port: Port,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
}

fn segment_bytes(seg: &OutSegment, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TCP_HEADER_LEN + payload.len());
    out.extend_from_slice(&seg.local_port.to_network_bytes());
    out.extend_from_slice(&seg.remote_port.to_network_bytes());
    out.extend_from_slice(&seg.seq.to_be_bytes());
    out.extend_from_slice(&seg.ack.to_be_bytes());
    out.push(5 << 4);
    out.push(seg.flags);
    out.extend_from_slice(&seg.window.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    out.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer, unused
    out.extend_from_slice(payload);
    out
}

fn send_segment(seg: &OutSegment, payload: &[u8]) -> Result<(), NetError> {
    let bytes = segment_bytes(seg, payload);
    let (dev, _) = ROUTE_TABLE.lookup(seg.remote_ip).ok_or(NetError::NetworkUnreachable)?;
    let src_mac = DEVICE_REGISTRY.mac_by_index(dev).unwrap_or(MacAddr::ZERO);

    let mut frame = super::ipv4::build_frame(seg.local_ip, seg.remote_ip, IpProtocol::Tcp, src_mac, &bytes)?;
    let checksum = frame.compute_tcp_checksum(seg.local_ip, seg.remote_ip);
    let l4 = frame.l4_header_mut();
    l4[16..18].copy_from_slice(&checksum.to_be_bytes());

    super::ipv4::send(seg.remote_ip, frame)
}

fn ack_segment(pcb: &TcpPcb) -> OutSegment {
    OutSegment {
        local_ip: pcb.local_ip,
        local_port: pcb.local_port,
        remote_ip: pcb.remote_ip,
        remote_port: pcb.remote_port,
        seq: pcb.snd_nxt,
        ack: pcb.rcv_nxt,
        flags: TCP_FLAG_ACK,
        window: pcb.wire_window(),
    }
}

// =============================================================================
// Ingress
// =============================================================================

/// Handle an incoming TCP segment.
///
/// `pkt`'s payload is the TCP segment (header + data) — the IPv4 header
/// has already been pulled off by [`super::ipv4::handle_rx`].
pub fn handle_rx(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, pkt: &PacketBuf) {
    if dst_ip.is_broadcast() || dst_ip.is_multicast() {
        log::debug!("tcp: dropping segment to broadcast/multicast {}", dst_ip);
        return;
    }

    let data = pkt.payload();
    let Some(hdr) = parse_header(data) else {
        log::debug!("tcp: malformed header");
        return;
    };

    if pkt.compute_tcp_checksum(src_ip, dst_ip) != 0 {
        log::debug!("tcp: bad checksum");
        return;
    }

    let payload = &data[hdr.header_len().min(data.len())..];
    let seg_len = payload.len() as u32 + hdr.is_syn() as u32 + hdr.is_fin() as u32;

    let local_ip = dst_ip;
    let local_port = Port::new(hdr.dst_port);
    let remote_ip = src_ip;
    let remote_port = Port::new(hdr.src_port);

    let response = TCP_TABLE.with_inner(|inner| {
        let Some(idx) = TCP_TABLE.find(inner, local_ip, local_port, remote_ip, remote_port) else {
            return no_pcb_response(&hdr, local_ip, local_port, remote_ip, remote_port);
        };

        match inner.pcbs[idx].state {
            TcpState::Listen => process_listen(inner, idx, &hdr, remote_ip, remote_port),
            TcpState::SynReceived | TcpState::Established => process_active(inner, idx, &hdr, payload, seg_len),
            _ => None,
        }
    });

    if let Some((seg, payload)) = response {
        if let Err(e) = send_segment(&seg, &payload) {
            log::debug!("tcp: failed to send response: {}", e);
        }
    }
}

/// RFC 793's response to a segment that matches no PCB at all.
fn no_pcb_response(hdr: &TcpHeader, local_ip: Ipv4Addr, local_port: Port, remote_ip: Ipv4Addr, remote_port: Port) -> Option<(OutSegment, Vec<u8>)> {
    if hdr.is_rst() {
        return None;
    }
    let (seq, ack, flags) = if !hdr.is_ack() {
        let seg_len = hdr.is_syn() as u32 + hdr.is_fin() as u32;
        (0u32, hdr.seq_num.wrapping_add(seg_len), TCP_FLAG_RST | TCP_FLAG_ACK)
    } else {
        (hdr.ack_num, 0u32, TCP_FLAG_RST)
    };
    Some((
        OutSegment {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            seq,
            ack,
            flags,
            window: 0,
        },
        Vec::new(),
    ))
}

/// LISTEN: only RST (drop), ACK (reset), and SYN (open) are meaningful.
fn process_listen(inner: &mut TcpTableInner, idx: usize, hdr: &TcpHeader, remote_ip: Ipv4Addr, remote_port: Port) -> Option<(OutSegment, Vec<u8>)> {
    if hdr.is_rst() {
        return None;
    }
    let pcb = &mut inner.pcbs[idx];
    if hdr.is_ack() {
        return Some((
            OutSegment {
                local_ip: pcb.local_ip,
                local_port: pcb.local_port,
                remote_ip,
                remote_port,
                seq: hdr.ack_num,
                ack: 0,
                flags: TCP_FLAG_RST,
                window: 0,
            },
            Vec::new(),
        ));
    }
    if !hdr.is_syn() {
        return None;
    }

    let (dev, _) = ROUTE_TABLE.lookup(remote_ip)?;
    let mtu = DEVICE_REGISTRY.handle_for_index(dev).map(|h| h.mtu()).unwrap_or(1500);

    let iss = generate_isn();
    pcb.remote_ip = remote_ip;
    pcb.remote_port = remote_port;
    pcb.irs = hdr.seq_num;
    pcb.rcv_nxt = hdr.seq_num.wrapping_add(1);
    pcb.rcv_wnd = RECV_BUF_SIZE as u32;
    pcb.iss = iss;
    pcb.snd_una = iss;
    pcb.snd_nxt = iss.wrapping_add(1);
    pcb.snd_wnd = hdr.window_size;
    pcb.mss = mtu.saturating_sub(40);
    pcb.state = TcpState::SynReceived;

    log::debug!("tcp: LISTEN -> SYN_RECEIVED idx={} ISS={} IRS={}", idx, iss, pcb.irs);

    Some((
        OutSegment {
            local_ip: pcb.local_ip,
            local_port: pcb.local_port,
            remote_ip,
            remote_port,
            seq: iss,
            ack: pcb.rcv_nxt,
            flags: TCP_FLAG_SYN | TCP_FLAG_ACK,
            window: pcb.wire_window(),
        },
        Vec::new(),
    ))
}

/// SYN-RECEIVED / ESTABLISHED: acceptability check, ACK processing (with
/// the RFC 793 SYN-RECEIVED → ESTABLISHED fall-through), then text.
fn process_active(inner: &mut TcpTableInner, idx: usize, hdr: &TcpHeader, payload: &[u8], seg_len: u32) -> Option<(OutSegment, Vec<u8>)> {
    let pcb = &mut inner.pcbs[idx];

    let acceptable = match (seg_len, pcb.rcv_wnd) {
        (0, 0) => hdr.seq_num == pcb.rcv_nxt,
        (0, wnd) => seq_le(pcb.rcv_nxt, hdr.seq_num) && seq_lt(hdr.seq_num, pcb.rcv_nxt.wrapping_add(wnd)),
        (_, 0) => false,
        (len, wnd) => {
            let end = hdr.seq_num.wrapping_add(len - 1);
            let win_end = pcb.rcv_nxt.wrapping_add(wnd);
            (seq_le(pcb.rcv_nxt, hdr.seq_num) && seq_lt(hdr.seq_num, win_end)) || (seq_le(pcb.rcv_nxt, end) && seq_lt(end, win_end))
        }
    };

    if !acceptable {
        if hdr.is_rst() {
            return None;
        }
        return Some((ack_segment(pcb), Vec::new()));
    }

    if hdr.is_rst() {
        log::debug!("tcp: idx={} reset by peer", idx);
        pcb.reset_to_free();
        return None;
    }

    if !hdr.is_ack() {
        return None;
    }

    if pcb.state == TcpState::SynReceived {
        if seq_le(pcb.snd_una, hdr.ack_num) && !seq_gt(hdr.ack_num, pcb.snd_nxt) {
            pcb.snd_una = hdr.ack_num;
            pcb.snd_wnd = hdr.window_size;
            pcb.snd_wl1 = hdr.seq_num;
            pcb.snd_wl2 = hdr.ack_num;
            pcb.state = TcpState::Established;
            pcb.sched.wakeup();
            log::debug!("tcp: idx={} SYN_RECEIVED -> ESTABLISHED", idx);
            // Falls through to ESTABLISHED handling below, per RFC 793.
        } else {
            return Some((
                OutSegment {
                    local_ip: pcb.local_ip,
                    local_port: pcb.local_port,
                    remote_ip: pcb.remote_ip,
                    remote_port: pcb.remote_port,
                    seq: hdr.ack_num,
                    ack: 0,
                    flags: TCP_FLAG_RST,
                    window: 0,
                },
                Vec::new(),
            ));
        }
    } else {
        if seq_lt(pcb.snd_una, hdr.ack_num) && !seq_gt(hdr.ack_num, pcb.snd_nxt) {
            pcb.snd_una = hdr.ack_num;
            if seq_lt(pcb.snd_wl1, hdr.seq_num) || (pcb.snd_wl1 == hdr.seq_num && !seq_gt(pcb.snd_wl2, hdr.ack_num)) {
                pcb.snd_wnd = hdr.window_size;
                pcb.snd_wl1 = hdr.seq_num;
                pcb.snd_wl2 = hdr.ack_num;
            }
            pcb.sched.wakeup();
        } else if seq_gt(hdr.ack_num, pcb.snd_nxt) {
            return Some((ack_segment(pcb), Vec::new()));
        }
        // Duplicate ACK (ack_num <= snd_una): no action.
    }

    if pcb.state == TcpState::Established && !payload.is_empty() {
        let offset = pcb.buffered();
        let end = offset + payload.len();
        if end <= RECV_BUF_SIZE {
            pcb.recv_buf[offset..end].copy_from_slice(payload);
            pcb.rcv_nxt = pcb.rcv_nxt.wrapping_add(payload.len() as u32);
            pcb.rcv_wnd -= payload.len() as u32;
            pcb.sched.wakeup();
        }
        return Some((ack_segment(pcb), Vec::new()));
    }

    None
}

// =============================================================================
// Public API
// =============================================================================

/// Open a connection. Only passive open (`active=false`) is supported;
/// requesting active open returns [`NetError::OperationNotSupported`]
/// rather than silently downgrading.
///
/// Blocks until the connection reaches ESTABLISHED or is interrupted.
pub fn open(local_ip: Ipv4Addr, local_port: Port, foreign: Option<(Ipv4Addr, Port)>, active: bool) -> Result<usize, NetError> {
    if active {
        return Err(NetError::OperationNotSupported);
    }
    let id = TCP_TABLE.listen(local_ip, local_port, foreign)?;
    TCP_TABLE.wait_established(id)
}

/// Send data on an ESTABLISHED connection, chunked to `iface.mtu - 40` and
/// gated by the peer's advertised window.
///
/// Returns the number of bytes sent. If interrupted partway through, the
/// partial count is returned; if nothing was sent yet, returns
/// [`NetError::Interrupted`].
pub fn send(id: usize, data: &[u8]) -> Result<usize, NetError> {
    let mut sent = 0usize;
    loop {
        if sent >= data.len() {
            return Ok(sent);
        }

        let mut guard = TCP_TABLE.inner.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            let inner = guard.as_mut().expect("initialized by listen()/open()");
            let pcb = inner.pcbs.get_mut(id).ok_or(NetError::InvalidArgument)?;
            if pcb.state != TcpState::Established {
                return if sent > 0 { Ok(sent) } else { Err(NetError::NotConnected) };
            }

            let cap = (pcb.snd_wnd as u32).saturating_sub(pcb.snd_nxt.wrapping_sub(pcb.snd_una));
            if cap > 0 {
                let remaining = data.len() - sent;
                let slen = remaining.min(pcb.mss.max(1) as usize).min(cap as usize);
                let seg = OutSegment {
                    local_ip: pcb.local_ip,
                    local_port: pcb.local_port,
                    remote_ip: pcb.remote_ip,
                    remote_port: pcb.remote_port,
                    seq: pcb.snd_nxt,
                    ack: pcb.rcv_nxt,
                    flags: TCP_FLAG_ACK | TCP_FLAG_PSH,
                    window: pcb.wire_window(),
                };
                pcb.snd_nxt = pcb.snd_nxt.wrapping_add(slen as u32);
                drop(guard);

                send_segment(&seg, &data[sent..sent + slen])?;
                sent += slen;
                break;
            }

            let sched_ptr: *const SchedCtx = &pcb.sched;
            // Safety: see wait_established — same table, same lock.
            let sched = unsafe { &*sched_ptr };
            let (new_guard, outcome) = sched.sleep(guard, None);
            guard = new_guard;
            if outcome == SleepOutcome::Interrupted {
                return if sent > 0 { Ok(sent) } else { Err(NetError::Interrupted) };
            }
        }
    }
}

/// Receive data from an ESTABLISHED connection's inline buffer, blocking
/// while it is empty.
pub fn receive(id: usize, buf: &mut [u8]) -> Result<usize, NetError> {
    let mut guard = TCP_TABLE.inner.lock().unwrap_or_else(|p| p.into_inner());
    loop {
        let inner = guard.as_mut().expect("initialized by listen()/open()");
        let pcb = inner.pcbs.get_mut(id).ok_or(NetError::InvalidArgument)?;
        if pcb.state != TcpState::Established {
            return Err(NetError::NotConnected);
        }

        let buffered = pcb.buffered();
        if buffered > 0 {
            let n = buffered.min(buf.len());
            buf[..n].copy_from_slice(&pcb.recv_buf[..n]);
            pcb.recv_buf.copy_within(n..buffered, 0);
            pcb.rcv_wnd += n as u32;
            return Ok(n);
        }

        let sched_ptr: *const SchedCtx = &pcb.sched;
        // Safety: see wait_established — same table, same lock.
        let sched = unsafe { &*sched_ptr };
        let (new_guard, outcome) = sched.sleep(guard, None);
        guard = new_guard;
        if outcome == SleepOutcome::Interrupted {
            return Err(NetError::Interrupted);
        }
    }
}

/// Tear down a connection with RST (or just release it, if never past
/// LISTEN) and free its PCB.
pub fn close(id: usize) -> Result<(), NetError> {
    let seg = TCP_TABLE.with_inner(|inner| {
        let pcb = inner.pcbs.get_mut(id)?;
        if pcb.state == TcpState::Free {
            return None;
        }
        let seg = if pcb.state != TcpState::Listen {
            Some(OutSegment {
                local_ip: pcb.local_ip,
                local_port: pcb.local_port,
                remote_ip: pcb.remote_ip,
                remote_port: pcb.remote_port,
                seq: pcb.snd_nxt,
                ack: 0,
                flags: TCP_FLAG_RST,
                window: 0,
            })
        } else {
            None
        };
        log::debug!("tcp: CLOSE idx={} from {}", id, pcb.state.name());
        pcb.reset_to_free();
        Some(seg)
    });

    match seg {
        None => Err(NetError::InvalidArgument),
        Some(None) => Ok(()),
        Some(Some(seg)) => send_segment(&seg, &[]),
    }
}

/// Interrupt every active PCB — used for process-wide cancellation (the
/// daemon's shutdown path).
pub fn interrupt_all() {
    TCP_TABLE.with_inner(|inner| {
        for pcb in inner.pcbs.iter_mut() {
            if pcb.state != TcpState::Free {
                pcb.sched.interrupt();
            }
        }
    });
}

pub fn active_count() -> usize {
    TCP_TABLE.with_inner(|inner| inner.pcbs.iter().filter(|p| p.state != TcpState::Free).count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_table() {
        let mut guard = TCP_TABLE.inner.lock().unwrap();
        *guard = None;
    }

    #[test]
    fn listen_rejects_duplicate_local_port() {
        reset_table();
        let a = Ipv4Addr::from_bytes([192, 0, 2, 2]);
        let id = TCP_TABLE.listen(a, Port::new(8080), None).unwrap();
        assert!(TCP_TABLE.listen(a, Port::new(8080), None).is_err());
        TCP_TABLE.with_inner(|inner| inner.pcbs[id].reset_to_free());
    }

    #[test]
    fn open_rejects_active() {
        reset_table();
        let a = Ipv4Addr::from_bytes([192, 0, 2, 2]);
        let b = Ipv4Addr::from_bytes([192, 0, 2, 3]);
        assert_eq!(open(a, Port::new(1), Some((b, Port::new(2))), true), Err(NetError::OperationNotSupported));
    }

    #[test]
    fn seq_wraparound_comparisons() {
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_gt(0, u32::MAX));
        assert!(seq_le(5, 5));
    }
}
