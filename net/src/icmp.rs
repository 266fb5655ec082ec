//! ICMP echo request/reply (RFC 792, type 8/0 only).
//!
//! This is the only ICMP message type handled — everything else (time
//! exceeded, destination unreachable generation, redirects) is out of
//! scope, since the stack never forwards and never fragments.

use super::netdev::DeviceHandle;
use super::packetbuf::PacketBuf;
use super::types::{IpProtocol, Ipv4Addr};
use super::{ICMP_HEADER_LEN, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};

/// RFC 1071 one's-complement checksum over `msg` as given. On transmit,
/// the caller zeroes the checksum field first and stores the result there;
/// on receive, the field still holds the sender's value, and the fold of
/// the unmodified message is zero exactly when the checksum is valid.
fn icmp_checksum(msg: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = msg.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Handle an incoming ICMP message.
///
/// `pkt`'s payload is the ICMP message (type, code, checksum, rest-of-header,
/// data) — the IPv4 header has already been pulled off by
/// [`super::ipv4::handle_rx`].
pub fn handle_rx(handle: &DeviceHandle, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, pkt: &PacketBuf) {
    let msg = pkt.payload();
    if msg.len() < ICMP_HEADER_LEN {
        log::debug!("icmp: message too short ({} < {})", msg.len(), ICMP_HEADER_LEN);
        return;
    }

    let ty = msg[0];
    let code = msg[1];

    if icmp_checksum(msg) != 0 {
        log::debug!("icmp: bad checksum");
        return;
    }

    if ty != ICMP_TYPE_ECHO_REQUEST || code != 0 {
        log::debug!("icmp: ignoring type {} code {}", ty, code);
        return;
    }

    let id = u16::from_be_bytes([msg[4], msg[5]]);
    let seq = u16::from_be_bytes([msg[6], msg[7]]);
    let data = &msg[ICMP_HEADER_LEN..];

    let mut reply = Vec::with_capacity(msg.len());
    reply.push(ICMP_TYPE_ECHO_REPLY);
    reply.push(0);
    reply.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    reply.extend_from_slice(&id.to_be_bytes());
    reply.extend_from_slice(&seq.to_be_bytes());
    reply.extend_from_slice(data);

    let checksum = icmp_checksum(&reply);
    reply[2..4].copy_from_slice(&checksum.to_be_bytes());

    let src_mac = handle.mac();
    let frame = match super::ipv4::build_frame(dst_ip, src_ip, IpProtocol::Icmp, src_mac, &reply) {
        Ok(pkt) => pkt,
        Err(e) => {
            log::debug!("icmp: failed to build echo reply: {}", e);
            return;
        }
    };

    log::debug!("icmp: echo reply to {} (id={}, seq={})", src_ip, id, seq);
    if let Err(e) = super::ipv4::send(src_ip, frame) {
        log::debug!("icmp: failed to send echo reply: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_valid_message_is_zero() {
        // type=8 code=0 checksum=0x????  id=0 seq=0, no data.
        let mut msg = vec![8u8, 0, 0, 0, 0, 0, 0, 0];
        let c = icmp_checksum(&msg);
        msg[2..4].copy_from_slice(&c.to_be_bytes());
        assert_eq!(icmp_checksum(&msg), 0);
    }
}
