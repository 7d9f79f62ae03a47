/*
 * IPv6 Layer
 *
 * Send-side routing (loopback, multicast MAC mapping, NDP resolution
 * with per-prefix on-link detection), v4-mapped address handoff to the
 * IPv4 layer, and inbound verification and next-header dispatch. An
 * unknown next-header draws an ICMPv6 Parameter Problem, code 1, with
 * the pointer at the next-header byte.
 */

use alloc::vec::Vec;
use core::net::Ipv6Addr;
use spin::Mutex;

use crate::errno::Errno;

use super::netif::{
    is_linklocal, is_v4_mapped, multicast_mac_v6, solicited_node_group, v4_of, NetIfRef,
    ETH_TYPE_IPV6,
};
use super::{icmp6, ipv4, ndp, socket};

/// IPv6 header length (no extension headers).
pub const IPV6_HLEN: usize = 40;

/// Next-header value for ICMPv6.
pub const IPV6_HDR_ICMP: u8 = 58;

/// All-nodes and all-routers link-local multicast groups.
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 1);
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xFF02, 0, 0, 0, 0, 0, 0, 2);

/// Parsed IPv6 header.
#[derive(Debug, Clone)]
pub struct Ipv6Hdr {
    pub version_class_flow: u32,
    pub length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
}

impl Ipv6Hdr {
    pub fn new(next_header: u8, hop_limit: u8, src: Ipv6Addr, dst: Ipv6Addr, len: u16) -> Self {
        Self {
            version_class_flow: 6 << 28,
            length: len,
            next_header,
            hop_limit,
            src_addr: src,
            dst_addr: dst,
        }
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < IPV6_HLEN {
            return None;
        }
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        dst.copy_from_slice(&buf[24..40]);
        Some(Self {
            version_class_flow: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            next_header: buf[6],
            hop_limit: buf[7],
            src_addr: Ipv6Addr::from(src),
            dst_addr: Ipv6Addr::from(dst),
        })
    }

    pub fn encode(&self) -> [u8; IPV6_HLEN] {
        let mut b = [0u8; IPV6_HLEN];
        b[0..4].copy_from_slice(&self.version_class_flow.to_be_bytes());
        b[4..6].copy_from_slice(&self.length.to_be_bytes());
        b[6] = self.next_header;
        b[7] = self.hop_limit;
        b[8..24].copy_from_slice(&self.src_addr.octets());
        b[24..40].copy_from_slice(&self.dst_addr.octets());
        b
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv6Stats {
    pub pkt_sent: u32,
    pub pkt_send_failed: u32,
    pub pkt_recv: u32,
    pub pkt_recv_bad_size: u32,
    pub pkt_recv_bad_proto: u32,
}

static STATS: Mutex<Ipv6Stats> = Mutex::new(Ipv6Stats {
    pkt_sent: 0,
    pkt_send_failed: 0,
    pkt_recv: 0,
    pkt_recv_bad_size: 0,
    pkt_recv_bad_proto: 0,
});

pub fn stats() -> Ipv6Stats {
    *STATS.lock()
}

/// Is the destination on-link for this interface? Link-local always is;
/// otherwise any matching /64 prefix we have says yes.
fn is_in_network(nif: &NetIfRef, ip: &Ipv6Addr) -> bool {
    if is_linklocal(ip) {
        return true;
    }

    let n = nif.lock();
    let want = &ip.octets()[..8];
    n.ip6_addrs.iter().any(|a| &a.octets()[..8] == want)
}

/// Transmit a fully-formed packet, resolving the next hop.
pub fn send_packet(nif: Option<&NetIfRef>, hdr: &Ipv6Hdr, data: &[u8]) -> Result<(), Errno> {
    // Are we sending a packet to loopback?
    if hdr.dst_addr.is_loopback() {
        let mut pkt = Vec::with_capacity(IPV6_HLEN + data.len());
        pkt.extend_from_slice(&hdr.encode());
        pkt.extend_from_slice(data);

        STATS.lock().pkt_sent += 1;

        // Send the packet "away".
        input(None, &pkt, None);
        return Ok(());
    }

    let nif = super::dev_or_default(nif)?;

    let dst_mac = if hdr.dst_addr.is_multicast() {
        multicast_mac_v6(&hdr.dst_addr)
    } else {
        let mut dst = hdr.dst_addr;
        if !is_in_network(&nif, &dst) {
            dst = nif.lock().ip6_gateway;
        }

        match ndp::lookup(&nif, &dst, Some((hdr, data)))? {
            ndp::LookupResult::Found(mac) => mac,
            ndp::LookupResult::InProgress => return Ok(()),
            ndp::LookupResult::Unresolved => {
                STATS.lock().pkt_send_failed += 1;
                return Err(Errno::ENETUNREACH);
            }
        }
    };

    let mut pkt = Vec::with_capacity(IPV6_HLEN + data.len());
    pkt.extend_from_slice(&hdr.encode());
    pkt.extend_from_slice(data);

    STATS.lock().pkt_sent += 1;
    nif.lock().tx_frame(&dst_mac, ETH_TYPE_IPV6, &pkt)
}

/// Build and send one upper-layer datagram. `hop_limit == 0` takes the
/// interface default. A v4-mapped source and destination pair drops
/// down to the IPv4 layer.
pub fn send(
    nif: Option<&NetIfRef>,
    data: &[u8],
    hop_limit: u8,
    proto: u8,
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
) -> Result<(), Errno> {
    // Loopback traffic doesn't require a device; everything else does.
    let dev = super::dev_or_default(nif).ok();

    let hops = if hop_limit != 0 {
        hop_limit
    } else {
        let configured = dev.as_ref().map(|d| d.lock().hop_limit).unwrap_or(0);
        if configured != 0 {
            configured
        } else {
            255
        }
    };

    if let (Some(s4), Some(d4)) = (v4_of(src), v4_of(dst)) {
        return ipv4::send(nif, data, None, hops, proto, s4, d4);
    }
    if is_v4_mapped(src) != is_v4_mapped(dst) {
        // Mixing a mapped and a native address cannot work.
        return Err(Errno::EINVAL);
    }

    let hdr = Ipv6Hdr::new(proto, hops, *src, *dst, data.len() as u16);
    send_packet(nif, &hdr, data)
}

/// Accept one inbound packet (header + payload). `src_mac` is the
/// ethernet source when the packet arrived off the wire; it feeds the
/// neighbor cache.
pub fn input(nif: Option<&NetIfRef>, pkt: &[u8], src_mac: Option<&[u8]>) -> i32 {
    let Some(hdr) = Ipv6Hdr::parse(pkt) else {
        STATS.lock().pkt_recv_bad_size += 1;
        return -1;
    };

    if pkt.len() < IPV6_HLEN + hdr.length as usize {
        STATS.lock().pkt_recv_bad_size += 1;
        return -1;
    }

    let data = &pkt[IPV6_HLEN..IPV6_HLEN + hdr.length as usize];

    if let (Some(nif), Some(mac)) = (nif, src_mac) {
        if mac.len() == 6 {
            let mut m = [0u8; 6];
            m.copy_from_slice(mac);
            let _ = ndp::insert(nif, m, &hdr.src_addr, true);
        }
    }

    match hdr.next_header {
        IPV6_HDR_ICMP => icmp6::input(nif, &hdr, data),
        _ => match socket::input_v6(nif, &hdr, data) {
            socket::InputResult::Consumed => {
                STATS.lock().pkt_recv += 1;
                0
            }
            socket::InputResult::NoSocket => {
                STATS.lock().pkt_recv += 1;
                -1
            }
            socket::InputResult::NoProtocol => {
                // We don't know what to do with this packet; say so with
                // a Parameter Problem pointing at the next-header byte.
                STATS.lock().pkt_recv_bad_proto += 1;
                let _ = icmp6::send_param_prob(
                    nif,
                    icmp6::PARAM_PROB_UNK_HEADER,
                    6,
                    pkt,
                );
                -1
            }
        },
    }
}

/// Join the groups every IPv6 node belongs to: all-nodes plus the
/// solicited-node group of the link-local address, then ask the routers
/// to identify themselves.
pub fn init() -> Result<(), Errno> {
    let Some(nif) = super::default_dev() else {
        return Ok(());
    };

    {
        let mut n = nif.lock();
        let lladdr = n.ip6_lladdr;
        n.multicast_add(multicast_mac_v6(&ALL_NODES))?;
        n.multicast_add(multicast_mac_v6(&solicited_node_group(&lladdr)))?;
    }

    let _ = icmp6::send_rsol(Some(&nif));
    Ok(())
}

pub fn shutdown() {
    let Some(nif) = super::default_dev() else {
        return;
    };

    let mut n = nif.lock();
    let lladdr = n.ip6_lladdr;
    let _ = n.multicast_del(multicast_mac_v6(&ALL_NODES));
    let _ = n.multicast_del(multicast_mac_v6(&solicited_node_group(&lladdr)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let dst: Ipv6Addr = "fe80::2".parse().unwrap();
        let hdr = Ipv6Hdr::new(IPV6_HDR_ICMP, 255, src, dst, 32);
        let raw = hdr.encode();
        assert_eq!(raw[0] >> 4, 6);
        let back = Ipv6Hdr::parse(&raw).unwrap();
        assert_eq!(back.length, 32);
        assert_eq!(back.next_header, IPV6_HDR_ICMP);
        assert_eq!(back.hop_limit, 255);
        assert_eq!(back.src_addr, src);
        assert_eq!(back.dst_addr, dst);
    }

    #[test]
    fn multicast_mac_mapping() {
        let g = ALL_NODES;
        assert_eq!(multicast_mac_v6(&g), [0x33, 0x33, 0, 0, 0, 1]);
    }

    #[test]
    fn truncated_packets_are_dropped() {
        let before = stats().pkt_recv_bad_size;
        assert_eq!(input(None, &[0x60, 0, 0, 0], None), -1);
        assert_eq!(stats().pkt_recv_bad_size, before + 1);
    }
}
