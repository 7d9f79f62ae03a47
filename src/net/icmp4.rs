/*
 * ICMPv4 (RFC 792)
 *
 * Implemented inbound message types:
 *    0  - Echo Reply (handed to the ping callback with the RTT)
 *    3  - Destination Unreachable (logged)
 *    8  - Echo (reply synthesized)
 *    11 - Time Exceeded (logged)
 *
 * Outbound: Echo (ping, with an embedded send timestamp), Destination
 * Unreachable and Time Exceeded carrying the offending header + 8 bytes.
 */

use alloc::vec::Vec;
use spin::Mutex;

use crate::errno::Errno;
use crate::utils::timer;

use super::checksum;
use super::ipv4::{self, Ipv4Hdr, PROTO_ICMP};
use super::netif::NetIfRef;

/// Message types.
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

/// Destination Unreachable codes.
pub const UNREACH_NET: u8 = 0;
pub const UNREACH_HOST: u8 = 1;
pub const UNREACH_PROTOCOL: u8 = 2;
pub const UNREACH_PORT: u8 = 3;

/// ICMP header: type, code, checksum, 4 bytes of misc.
const ICMP_HLEN: usize = 8;

/// Ping reply callback: (source address, sequence, round-trip time if
/// the echo carried our timestamp, TTL, full payload).
pub type EchoCb = fn(&[u8; 4], u16, Option<u64>, u8, &[u8]);

static ECHO_CB: Mutex<Option<EchoCb>> = Mutex::new(None);

/// Install a ping reply callback; returns the old one.
pub fn set_echo_cb(cb: Option<EchoCb>) -> Option<EchoCb> {
    core::mem::replace(&mut *ECHO_CB.lock(), cb)
}

/* Handle Echo Reply (type 0) packets */
fn input_echo_reply(ip: &Ipv4Hdr, d: &[u8]) {
    let now = timer::uptime_us();
    let seq = u16::from_be_bytes([d[6], d[7]]);

    // Read back the send time if the payload carries one.
    let rtt = if d.len() >= ICMP_HLEN + 8 {
        let sent = u64::from_be_bytes([d[8], d[9], d[10], d[11], d[12], d[13], d[14], d[15]]);
        Some(now.saturating_sub(sent))
    } else {
        None
    };

    if let Some(cb) = *ECHO_CB.lock() {
        cb(&ip.src, seq, rtt, ip.ttl, d);
    }
}

/* Handle Echo (type 8) packets */
fn input_echo(nif: Option<&NetIfRef>, ip: &Ipv4Hdr, d: &[u8]) {
    let mut reply = d.to_vec();

    // Set type to echo reply and recompute the checksum.
    reply[0] = ICMP_ECHO_REPLY;
    reply[2] = 0;
    reply[3] = 0;
    let cs = checksum::checksum(&reply, 0);
    reply[2..4].copy_from_slice(&cs.to_be_bytes());

    // Swap the addresses; the original destination becomes our source,
    // which handles broadcast pings getting a sensible reply address.
    let _ = ipv4::send(
        nif,
        &reply,
        Some(ip.packet_id),
        255,
        PROTO_ICMP,
        ip.dest,
        ip.src,
    );
}

/// Accept one ICMP message.
pub fn input(nif: Option<&NetIfRef>, ip: &Ipv4Hdr, d: &[u8]) -> i32 {
    if d.len() < ICMP_HLEN {
        return -1;
    }

    // The stored checksum must verify over the whole message.
    if checksum::checksum(d, 0) != 0 {
        log::debug!("net_icmp: icmp with invalid checksum");
        return -1;
    }

    match d[0] {
        ICMP_ECHO_REPLY => input_echo_reply(ip, d),
        ICMP_DEST_UNREACHABLE => {
            log::warn!("net_icmp: Destination unreachable, code {}", d[1]);
        }
        ICMP_ECHO => input_echo(nif, ip, d),
        ICMP_TIME_EXCEEDED => {
            log::warn!("net_icmp: Time exceeded, code {}", d[1]);
        }
        other => {
            log::debug!("net_icmp: unknown icmp type: {}", other);
        }
    }

    0
}

/// Send an ICMP Echo (ping). The payload is prefixed with an 8-byte
/// send timestamp so the reply handler can compute the RTT.
pub fn send_echo(
    nif: Option<&NetIfRef>,
    dst: [u8; 4],
    ident: u16,
    seq: u16,
    data: &[u8],
) -> Result<(), Errno> {
    let mut pkt = Vec::with_capacity(ICMP_HLEN + 8 + data.len());
    pkt.extend_from_slice(&[ICMP_ECHO, 0, 0, 0]);
    pkt.extend_from_slice(&ident.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());

    // Put the time in now, at the latest possible moment (the checksum
    // still has to cover it).
    pkt.extend_from_slice(&timer::uptime_us().to_be_bytes());
    pkt.extend_from_slice(data);

    let cs = checksum::checksum(&pkt, 0);
    pkt[2..4].copy_from_slice(&cs.to_be_bytes());

    // Pings to the loopback use it as their source too.
    let src = if dst[0] == 127 {
        dst
    } else {
        super::dev_or_default(nif)?.lock().ip_addr
    };

    ipv4::send(nif, &pkt, Some(seq), 255, PROTO_ICMP, src, dst)
}

/// Common tail of the error senders: offending header + 8 payload bytes.
fn send_error(
    nif: Option<&NetIfRef>,
    mtype: u8,
    code: u8,
    orig: &Ipv4Hdr,
    orig_data: &[u8],
) -> Result<(), Errno> {
    let quoted = core::cmp::min(orig_data.len(), 8);

    let mut pkt = Vec::with_capacity(ICMP_HLEN + 20 + quoted);
    pkt.extend_from_slice(&[mtype, code, 0, 0, 0, 0, 0, 0]);
    pkt.extend_from_slice(&orig.encode());
    pkt.extend_from_slice(&orig_data[..quoted]);

    let cs = checksum::checksum(&pkt, 0);
    pkt[2..4].copy_from_slice(&cs.to_be_bytes());

    // Errors flow back toward the original source, from the original
    // destination.
    ipv4::send(nif, &pkt, None, 255, PROTO_ICMP, orig.dest, orig.src)
}

/// Send an ICMP Destination Unreachable about the given datagram.
pub fn send_dest_unreach(
    nif: Option<&NetIfRef>,
    code: u8,
    orig: &Ipv4Hdr,
    orig_data: &[u8],
) -> Result<(), Errno> {
    send_error(nif, ICMP_DEST_UNREACHABLE, code, orig, orig_data)
}

/// Send an ICMP Time Exceeded about the given datagram.
pub fn send_time_exceeded(
    nif: Option<&NetIfRef>,
    code: u8,
    orig: &Ipv4Hdr,
    orig_data: &[u8],
) -> Result<(), Errno> {
    send_error(nif, ICMP_TIME_EXCEEDED, code, orig, orig_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static REPLIES: AtomicU32 = AtomicU32::new(0);

    fn count_reply(_src: &[u8; 4], _seq: u16, rtt: Option<u64>, _ttl: u8, _data: &[u8]) {
        assert!(rtt.is_some());
        REPLIES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn loopback_ping_comes_back() {
        set_echo_cb(Some(count_reply));

        let before = REPLIES.load(Ordering::SeqCst);
        // Echo to 127.0.0.1 short-circuits through the input path: the
        // echo handler swaps addresses and replies, and the reply lands
        // back in input_echo_reply.
        send_echo(None, [127, 0, 0, 1], 77, 1, b"ping-payload").unwrap();
        assert_eq!(REPLIES.load(Ordering::SeqCst), before + 1);

        set_echo_cb(None);
    }

    #[test]
    fn bad_checksum_is_dropped() {
        let ip = Ipv4Hdr::new(64, PROTO_ICMP, [127, 0, 0, 1], [127, 0, 0, 1], 8);
        let msg = [ICMP_ECHO, 0, 0xde, 0xad, 0, 0, 0, 1];
        assert_eq!(input(None, &ip, &msg), -1);
    }
}
