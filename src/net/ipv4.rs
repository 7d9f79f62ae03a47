/*
 * IPv4 Layer
 *
 * Header handling, the routing decision (loopback / broadcast /
 * on-subnet / gateway), transmission through ARP, and inbound
 * verification and dispatch. Fragmentation and reassembly live in
 * ipv4_frag; this module hands oversized sends and all inbound
 * datagrams over to it.
 */

use alloc::vec::Vec;
use spin::Mutex;

use crate::errno::Errno;

use super::arp::{self, LookupResult};
use super::checksum;
use super::netif::{NetIfRef, ETH_TYPE_IPV4, MAC_BROADCAST};
use super::{icmp4, ipv4_frag, socket};

/// IP protocol numbers the stack knows.
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_UDPLITE: u8 = 136;

/// Minimum (and, for us, only) IPv4 header length.
pub const IPV4_HLEN: usize = 20;

/// Default TTL for locally generated packets.
pub const DEFAULT_TTL: u8 = 64;

/// Header flag bits within flags_frag_offs.
pub const IP_FLAG_DF: u16 = 0x4000;
pub const IP_FLAG_MF: u16 = 0x2000;
pub const IP_FRAG_MASK: u16 = 0x1FFF;

/// Parsed IPv4 header, host byte order.
#[derive(Debug, Clone)]
pub struct Ipv4Hdr {
    pub version_ihl: u8,
    pub tos: u8,
    pub length: u16,
    pub packet_id: u16,
    pub flags_frag_offs: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: [u8; 4],
    pub dest: [u8; 4],
}

impl Ipv4Hdr {
    /// A fresh header for a payload of `payload_len` bytes.
    pub fn new(ttl: u8, protocol: u8, src: [u8; 4], dest: [u8; 4], payload_len: u16) -> Self {
        Self {
            version_ihl: 0x45,
            tos: 0,
            length: payload_len + IPV4_HLEN as u16,
            packet_id: 0,
            flags_frag_offs: 0,
            ttl,
            protocol,
            checksum: 0,
            src,
            dest,
        }
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < IPV4_HLEN {
            return None;
        }
        Some(Self {
            version_ihl: buf[0],
            tos: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
            packet_id: u16::from_be_bytes([buf[4], buf[5]]),
            flags_frag_offs: u16::from_be_bytes([buf[6], buf[7]]),
            ttl: buf[8],
            protocol: buf[9],
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            src: [buf[12], buf[13], buf[14], buf[15]],
            dest: [buf[16], buf[17], buf[18], buf[19]],
        })
    }

    pub fn encode(&self) -> [u8; IPV4_HLEN] {
        let mut b = [0u8; IPV4_HLEN];
        b[0] = self.version_ihl;
        b[1] = self.tos;
        b[2..4].copy_from_slice(&self.length.to_be_bytes());
        b[4..6].copy_from_slice(&self.packet_id.to_be_bytes());
        b[6..8].copy_from_slice(&self.flags_frag_offs.to_be_bytes());
        b[8] = self.ttl;
        b[9] = self.protocol;
        b[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        b[12..16].copy_from_slice(&self.src);
        b[16..20].copy_from_slice(&self.dest);
        b
    }

    /// Header length in bytes, from the IHL nibble.
    pub fn hdr_len(&self) -> usize {
        ((self.version_ihl & 0x0F) as usize) * 4
    }

    /// Recompute the header checksum in place.
    pub fn fix_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = checksum::checksum(&self.encode(), 0);
    }
}

/// Per-protocol statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4Stats {
    pub pkt_sent: u32,
    pub pkt_send_failed: u32,
    pub pkt_recv: u32,
    pub pkt_recv_bad_size: u32,
    pub pkt_recv_bad_chksum: u32,
    pub pkt_recv_bad_proto: u32,
}

static STATS: Mutex<Ipv4Stats> = Mutex::new(Ipv4Stats {
    pkt_sent: 0,
    pkt_send_failed: 0,
    pkt_recv: 0,
    pkt_recv_bad_size: 0,
    pkt_recv_bad_chksum: 0,
    pkt_recv_bad_proto: 0,
});

pub fn stats() -> Ipv4Stats {
    *STATS.lock()
}

fn is_in_network(our: [u8; 4], dest: [u8; 4], netmask: [u8; 4]) -> bool {
    (0..4).all(|i| dest[i] & netmask[i] == our[i] & netmask[i])
}

/// Pack an address into a host-order u32 (a.b.c.d -> 0xaabbccdd).
pub fn addr_to_u32(addr: [u8; 4]) -> u32 {
    u32::from_be_bytes(addr)
}

pub fn u32_to_addr(addr: u32) -> [u8; 4] {
    addr.to_be_bytes()
}

/// Transmit a fully-formed datagram: pick the next hop, resolve it, and
/// put an ethernet frame on the wire. Loopback destinations short-circuit
/// straight into the input path.
pub fn send_packet(nif: Option<&NetIfRef>, hdr: &Ipv4Hdr, data: &[u8]) -> Result<(), Errno> {
    // Is this a loopback address (127/8)?
    if hdr.dest[0] == 127 {
        let mut pkt = Vec::with_capacity(IPV4_HLEN + data.len());
        pkt.extend_from_slice(&hdr.encode());
        pkt.extend_from_slice(data);

        STATS.lock().pkt_sent += 1;

        // Send it "away".
        input(None, &pkt);
        return Ok(());
    }

    let nif = super::dev_or_default(nif)?;

    let (our_ip, netmask, gateway, broadcast) = {
        let n = nif.lock();
        (n.ip_addr, n.netmask, n.gateway, n.broadcast)
    };

    // Are we sending a broadcast packet?
    let dest_mac = if hdr.dest == [255, 255, 255, 255] || hdr.dest == broadcast {
        MAC_BROADCAST
    } else {
        // Off-subnet traffic routes via the gateway.
        let next_hop = if is_in_network(our_ip, hdr.dest, netmask) {
            hdr.dest
        } else {
            gateway
        };

        match arp::lookup(&nif, next_hop, Some((hdr, data)))? {
            LookupResult::Found(mac) => mac,
            LookupResult::InProgress => {
                // It'll send when the ARP reply comes in (assuming one
                // does), so report success.
                return Ok(());
            }
            LookupResult::Unresolved => {
                STATS.lock().pkt_send_failed += 1;
                return Err(Errno::ENETUNREACH);
            }
        }
    };

    let mut payload = Vec::with_capacity(IPV4_HLEN + data.len());
    payload.extend_from_slice(&hdr.encode());
    payload.extend_from_slice(data);

    STATS.lock().pkt_sent += 1;
    nif.lock().tx_frame(&dest_mac, ETH_TYPE_IPV4, &payload)
}

/// Pseudo-random fragment identifier for callers that don't supply one.
fn pick_ident() -> u16 {
    (crate::utils::timer::uptime_us() ^ 0x5A5A) as u16
}

/// Build a datagram and send it, fragmenting if the MTU demands it.
///
/// `id == None` picks a pseudo-random identifier for reassembly.
pub fn send(
    nif: Option<&NetIfRef>,
    data: &[u8],
    id: Option<u16>,
    ttl: u8,
    proto: u8,
    src: [u8; 4],
    dst: [u8; 4],
) -> Result<(), Errno> {
    let mut hdr = Ipv4Hdr::new(ttl, proto, src, dst, data.len() as u16);
    hdr.packet_id = id.unwrap_or_else(pick_ident);
    hdr.fix_checksum();

    ipv4_frag::send(nif, hdr, data)
}

/// Verify and accept one inbound datagram (header + payload, no
/// ethernet framing). Bad packets are counted and dropped.
pub fn input(nif: Option<&NetIfRef>, pkt: &[u8]) -> i32 {
    let Some(mut hdr) = Ipv4Hdr::parse(pkt) else {
        STATS.lock().pkt_recv_bad_size += 1;
        return -1;
    };

    let hdrlen = hdr.hdr_len();
    if pkt.len() < hdrlen || (hdr.length as usize) < hdrlen || pkt.len() < hdr.length as usize {
        STATS.lock().pkt_recv_bad_size += 1;
        return -1;
    }

    // Check the header checksum: the stored value must verify.
    if checksum::checksum(&pkt[..hdrlen], 0) != 0 {
        STATS.lock().pkt_recv_bad_chksum += 1;
        return -1;
    }

    // Options, if present, have already been covered by the checksum;
    // they are skipped by the header-length arithmetic here.
    hdr.checksum = 0;

    let data = &pkt[hdrlen..hdr.length as usize];

    // Submit the packet for possible reassembly.
    ipv4_frag::reassemble(nif, &hdr, data)
}

/// Dispatch a complete datagram to the right protocol.
pub fn input_proto(nif: Option<&NetIfRef>, hdr: &Ipv4Hdr, data: &[u8]) -> i32 {
    match hdr.protocol {
        PROTO_ICMP => {
            STATS.lock().pkt_recv += 1;
            icmp4::input(nif, hdr, data)
        }
        _ => match socket::input_v4(nif, hdr, data) {
            socket::InputResult::Consumed => {
                STATS.lock().pkt_recv += 1;
                0
            }
            socket::InputResult::NoSocket => {
                STATS.lock().pkt_recv += 1;
                -1
            }
            socket::InputResult::NoProtocol => {
                // There's no handler for this packet type: ICMP
                // Destination Unreachable, and log the protocol.
                STATS.lock().pkt_recv_bad_proto += 1;
                let _ = icmp4::send_dest_unreach(
                    nif,
                    icmp4::UNREACH_PROTOCOL,
                    hdr,
                    data,
                );
                -1
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_and_checksum() {
        let mut hdr = Ipv4Hdr::new(64, PROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 100);
        hdr.packet_id = 0xBEEF;
        hdr.fix_checksum();

        let raw = hdr.encode();
        // A correct header sums to zero over its own bytes.
        assert_eq!(checksum::checksum(&raw, 0), 0);

        let back = Ipv4Hdr::parse(&raw).unwrap();
        assert_eq!(back.length, 120);
        assert_eq!(back.packet_id, 0xBEEF);
        assert_eq!(back.protocol, PROTO_UDP);
        assert_eq!(back.dest, [10, 0, 0, 2]);
        assert_eq!(back.hdr_len(), 20);
    }

    #[test]
    fn subnet_test() {
        assert!(is_in_network(
            [192, 168, 1, 10],
            [192, 168, 1, 20],
            [255, 255, 255, 0]
        ));
        assert!(!is_in_network(
            [192, 168, 1, 10],
            [192, 168, 2, 20],
            [255, 255, 255, 0]
        ));
    }

    #[test]
    fn short_packets_are_counted_and_dropped() {
        let before = stats().pkt_recv_bad_size;
        assert_eq!(input(None, &[0x45, 0x00]), -1);
        assert_eq!(stats().pkt_recv_bad_size, before + 1);
    }

    #[test]
    fn bad_checksum_is_counted_and_dropped() {
        let mut hdr = Ipv4Hdr::new(64, PROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 0);
        hdr.fix_checksum();
        let mut raw = hdr.encode().to_vec();
        raw[10] ^= 0xFF;

        let before = stats().pkt_recv_bad_chksum;
        assert_eq!(input(None, &raw), -1);
        assert_eq!(stats().pkt_recv_bad_chksum, before + 1);
    }
}
