/*
 * ICMPv6 (RFC 4443) and the NDP messages (RFC 4861)
 *
 * Implemented message types:
 *     1   - Destination Unreachable -- sending only
 *     3   - Time Exceeded -- sending only
 *     4   - Parameter Problem -- sending only
 *     128 - Echo
 *     129 - Echo Reply
 *     133 - Router Solicitation -- sending only
 *     134 - Router Advertisement -- receiving only
 *     135 - Neighbor Solicitation
 *     136 - Neighbor Advertisement
 *     137 - Redirect -- partial
 *
 * Error synthesis obeys the RFC suppression rules: never in reply to an
 * unspecified or multicast source, and never to a multicast destination
 * except Parameter Problem code 2.
 */

use alloc::vec::Vec;
use core::net::Ipv6Addr;
use spin::Mutex;

use crate::errno::Errno;
use crate::utils::timer;

use super::checksum;
use super::ipv6::{self, Ipv6Hdr, ALL_NODES, ALL_ROUTERS, IPV6_HDR_ICMP};
use super::ndp;
use super::netif::{is_linklocal, is_mc_linklocal, solicited_node_group, NetIfRef};

/* Message types */
pub const ICMP6_DEST_UNREACHABLE: u8 = 1;
pub const ICMP6_TIME_EXCEEDED: u8 = 3;
pub const ICMP6_PARAM_PROBLEM: u8 = 4;
pub const ICMP6_ECHO: u8 = 128;
pub const ICMP6_ECHO_REPLY: u8 = 129;
pub const ICMP6_ROUTER_SOLICITATION: u8 = 133;
pub const ICMP6_ROUTER_ADVERTISEMENT: u8 = 134;
pub const ICMP6_NEIGHBOR_SOLICITATION: u8 = 135;
pub const ICMP6_NEIGHBOR_ADVERTISEMENT: u8 = 136;
pub const ICMP6_REDIRECT: u8 = 137;

/* Parameter Problem codes */
pub const PARAM_PROB_BAD_HEADER: u8 = 0;
pub const PARAM_PROB_UNK_HEADER: u8 = 1;
pub const PARAM_PROB_UNK_OPTION: u8 = 2;

/* Destination Unreachable upper code bound */
pub const DEST_UNREACH_BAD_ROUTE: u8 = 6;

/* Time Exceeded upper code bound */
pub const TIME_EXCEEDED_FRAGMENT: u8 = 1;

/* NDP option types */
const NDP_OPT_SOURCE_LINK_ADDR: u8 = 1;
const NDP_OPT_TARGET_LINK_ADDR: u8 = 2;
const NDP_OPT_PREFIX_INFO: u8 = 3;
const NDP_OPT_MTU: u8 = 5;

/// Error messages cap at the IPv6 minimum MTU minus headers.
const ERR_MAX: usize = 1240;

/// Ping reply callback.
pub type EchoCb = fn(&Ipv6Addr, u16, Option<u64>, u8, &[u8]);

static ECHO_CB: Mutex<Option<EchoCb>> = Mutex::new(None);

pub fn set_echo_cb(cb: Option<EchoCb>) -> Option<EchoCb> {
    core::mem::replace(&mut *ECHO_CB.lock(), cb)
}

fn finish_and_send(
    nif: Option<&NetIfRef>,
    mut pkt: Vec<u8>,
    hop_limit: u8,
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
) -> Result<(), Errno> {
    let cs = checksum::checksum(
        &pkt,
        checksum::pseudo_v6(src, dst, pkt.len() as u32, IPV6_HDR_ICMP),
    );
    pkt[2..4].copy_from_slice(&cs.to_be_bytes());
    ipv6::send(nif, &pkt, hop_limit, IPV6_HDR_ICMP, src, dst)
}

/* Handle Echo Reply (type 129) packets */
fn input_echo_reply(ip: &Ipv6Hdr, d: &[u8]) {
    let now = timer::uptime_us();
    let seq = u16::from_be_bytes([d[6], d[7]]);

    let rtt = if d.len() >= 16 {
        let sent = u64::from_be_bytes([d[8], d[9], d[10], d[11], d[12], d[13], d[14], d[15]]);
        Some(now.saturating_sub(sent))
    } else {
        None
    };

    if let Some(cb) = *ECHO_CB.lock() {
        cb(&ip.src_addr, seq, rtt, ip.hop_limit, d);
    }
}

/* Handle Echo (type 128) packets */
fn input_echo(nif: Option<&NetIfRef>, ip: &Ipv6Hdr, d: &[u8]) {
    let mut src = ip.dst_addr;
    let dst = ip.src_addr;

    // A ping to a link-local multicast group answers from our
    // link-local address.
    if is_mc_linklocal(&src) || src.is_multicast() {
        let Some(dev) = super::dev_or_default(nif).ok() else {
            return;
        };
        src = dev.lock().ip6_lladdr;
    }

    let mut reply = d.to_vec();
    reply[0] = ICMP6_ECHO_REPLY;
    reply[2] = 0;
    reply[3] = 0;

    let _ = finish_and_send(nif, reply, 0, &src, &dst);
}

/* Handle Router Advertisement (type 134) packets */
fn input_router_adv(nif: Option<&NetIfRef>, ip: &Ipv6Hdr, d: &[u8]) {
    // Fixed part: type, code, checksum, hop limit, flags, lifetime,
    // reachable, retrans = 16 bytes.
    if d.len() <= 16 {
        return;
    }

    let src = ip.src_addr;

    // Only a link-local router, at hop limit 255, code 0, counts.
    if !is_linklocal(&src) || ip.hop_limit != 255 || d[1] != 0 {
        return;
    }

    // If this router isn't offering itself as a default, we don't care.
    let router_lifetime = u16::from_be_bytes([d[6], d[7]]);
    if router_lifetime == 0 {
        return;
    }

    let Some(dev) = super::dev_or_default(nif).ok() else {
        return;
    };

    // First default router wins.
    if !dev.lock().ip6_gateway.is_unspecified() {
        return;
    }

    let mut dad_targets: Vec<Ipv6Addr> = Vec::new();

    {
        let mut n = dev.lock();

        // Parse the options that are in the advertisement.
        let mut pos = 16;
        while pos + 2 <= d.len() {
            let olen = (d[pos + 1] as usize) << 3;
            if olen == 0 || pos + olen > d.len() {
                return;
            }

            match d[pos] {
                NDP_OPT_MTU if olen >= 8 => {
                    n.mtu6 = u32::from_be_bytes([d[pos + 4], d[pos + 5], d[pos + 6], d[pos + 7]]);
                }

                NDP_OPT_PREFIX_INFO if olen == 32 => {
                    let prefix_len = d[pos + 2];
                    let flags = d[pos + 3];

                    // Only autonomous on-link /64 prefixes are usable.
                    if prefix_len == 64 && flags & 0xC0 == 0xC0 {
                        let mut o = [0u8; 16];
                        o[..8].copy_from_slice(&d[pos + 16..pos + 24]);
                        o[8..].copy_from_slice(&n.ip6_lladdr.octets()[8..]);
                        let addr = Ipv6Addr::from(o);

                        if !n.ip6_addrs.contains(&addr) {
                            n.ip6_addrs.push(addr);
                            dad_targets.push(addr);
                        }
                    }
                }

                NDP_OPT_SOURCE_LINK_ADDR if olen == 8 => {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(&d[pos + 2..pos + 8]);
                    drop(n);
                    let _ = ndp::insert(&dev, mac, &src, true);
                    n = dev.lock();
                }

                _ => {}
            }

            pos += olen;
        }

        n.ip6_gateway = src;
        n.hop_limit = d[4];
    }

    // Duplicate address detection for every address we just installed.
    for addr in dad_targets {
        let _ = send_nsol(Some(&dev), &solicited_node_group(&addr), &addr, true);
    }
}

/* Handle Neighbor Solicitation (type 135) packets */
fn input_neighbor_sol(nif: Option<&NetIfRef>, ip: &Ipv6Hdr, d: &[u8]) {
    // Fixed part: 4 header + 4 reserved + 16 target.
    if d.len() < 24 {
        return;
    }

    let mut t = [0u8; 16];
    t.copy_from_slice(&d[8..24]);
    let target = Ipv6Addr::from(t);

    if ip.hop_limit != 255 || target.is_multicast() || d[1] != 0 {
        return;
    }

    let Some(dev) = super::dev_or_default(nif).ok() else {
        return;
    };

    // Make sure they're asking about this machine.
    {
        let n = dev.lock();
        if target != n.ip6_lladdr && !n.ip6_addrs.contains(&target) {
            return;
        }
    }

    let src = ip.src_addr;
    let (reply_dst, solicited) = if src.is_unspecified() {
        // Duplicate address detection probe: answer all-nodes,
        // unsolicited.
        (ALL_NODES, false)
    } else {
        // Pick up the asker's link-layer address option on the way.
        let mut pos = 24;
        while pos + 2 <= d.len() {
            let olen = (d[pos + 1] as usize) << 3;
            if olen == 0 || pos + olen > d.len() {
                return;
            }
            if d[pos] == NDP_OPT_SOURCE_LINK_ADDR && olen == 8 {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(&d[pos + 2..pos + 8]);
                let _ = ndp::insert(&dev, mac, &src, true);
            }
            pos += olen;
        }
        (src, true)
    };

    let _ = send_nadv(Some(&dev), &reply_dst, &target, solicited);
}

/* Handle Neighbor Advertisement (type 136) packets */
fn input_neighbor_adv(nif: Option<&NetIfRef>, ip: &Ipv6Hdr, d: &[u8]) {
    // Fixed part 24 bytes plus the mandatory target link-layer option.
    if d.len() < 24 + 8 {
        return;
    }

    // The option must be the target link-layer address.
    if d[24] != NDP_OPT_TARGET_LINK_ADDR || d[25] != 1 {
        return;
    }

    let mut t = [0u8; 16];
    t.copy_from_slice(&d[8..24]);
    let target = Ipv6Addr::from(t);

    if ip.hop_limit != 255 || target.is_multicast() {
        return;
    }

    let flags = d[4];

    // A multicast-destination advertisement cannot claim solicited.
    if ip.dst_addr.is_multicast() && flags & 0x40 != 0 {
        return;
    }

    let Some(dev) = super::dev_or_default(nif).ok() else {
        return;
    };

    let mut mac = [0u8; 6];
    mac.copy_from_slice(&d[26..32]);
    let _ = ndp::insert(&dev, mac, &target, flags & 0x40 == 0);
}

/* Handle Redirect (type 137) packets */
fn input_redirect(nif: Option<&NetIfRef>, ip: &Ipv6Hdr, d: &[u8]) {
    // Fixed part: 4 header + 4 reserved + 16 target + 16 destination.
    if d.len() < 40 {
        return;
    }

    if ip.hop_limit != 255 {
        return;
    }

    let mut t = [0u8; 16];
    t.copy_from_slice(&d[8..24]);
    let target = Ipv6Addr::from(t);
    let mut dd = [0u8; 16];
    dd.copy_from_slice(&d[24..40]);
    let dest = Ipv6Addr::from(dd);

    log::debug!("net_icmp6: redirect {} -> {}", dest, target);

    // Target == destination means the destination is actually on-link;
    // pull the link-layer address out of the options.
    if target != dest {
        return;
    }

    let Some(dev) = super::dev_or_default(nif).ok() else {
        return;
    };

    let mut pos = 40;
    while pos + 2 <= d.len() {
        let olen = (d[pos + 1] as usize) << 3;
        if olen == 0 || pos + olen > d.len() {
            return;
        }
        if d[pos] == NDP_OPT_TARGET_LINK_ADDR && olen == 8 {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&d[pos + 2..pos + 8]);
            let _ = ndp::insert(&dev, mac, &target, false);
        }
        pos += olen;
    }
}

/// Accept one ICMPv6 message.
pub fn input(nif: Option<&NetIfRef>, ip: &Ipv6Hdr, d: &[u8]) -> i32 {
    // Fixed header plus the 4-byte message body every type carries.
    if d.len() < 8 {
        return -1;
    }

    let cs = checksum::pseudo_v6(&ip.src_addr, &ip.dst_addr, ip.length as u32, IPV6_HDR_ICMP);
    if checksum::checksum(d, cs) != 0 {
        log::debug!("net_icmp6: icmp with invalid checksum");
        return -1;
    }

    match d[0] {
        ICMP6_ECHO => input_echo(nif, ip, d),
        ICMP6_ECHO_REPLY => input_echo_reply(ip, d),
        ICMP6_ROUTER_ADVERTISEMENT => input_router_adv(nif, ip, d),
        ICMP6_NEIGHBOR_SOLICITATION => input_neighbor_sol(nif, ip, d),
        ICMP6_NEIGHBOR_ADVERTISEMENT => input_neighbor_adv(nif, ip, d),
        ICMP6_REDIRECT => input_redirect(nif, ip, d),
        other => {
            log::debug!("net_icmp6: unknown icmp6 type: {}", other);
        }
    }

    0
}

/// Pick the source address for a packet to `dst`.
fn pick_src(nif: &NetIfRef, dst: &Ipv6Addr) -> Result<Ipv6Addr, Errno> {
    if dst.is_loopback() {
        return Ok(Ipv6Addr::LOCALHOST);
    }

    let n = nif.lock();
    if is_linklocal(dst) || is_mc_linklocal(dst) {
        Ok(n.ip6_lladdr)
    } else if let Some(first) = n.ip6_addrs.first() {
        Ok(*first)
    } else {
        Err(Errno::EADDRNOTAVAIL)
    }
}

/// Send an ICMPv6 Echo (ping6) with an embedded send timestamp.
pub fn send_echo(
    nif: Option<&NetIfRef>,
    dst: &Ipv6Addr,
    ident: u16,
    seq: u16,
    data: &[u8],
) -> Result<(), Errno> {
    let src = if dst.is_loopback() {
        Ipv6Addr::LOCALHOST
    } else {
        pick_src(&super::dev_or_default(nif)?, dst)?
    };

    let mut pkt = Vec::with_capacity(16 + data.len());
    pkt.extend_from_slice(&[ICMP6_ECHO, 0, 0, 0]);
    pkt.extend_from_slice(&ident.to_be_bytes());
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&timer::uptime_us().to_be_bytes());
    pkt.extend_from_slice(data);

    finish_and_send(nif, pkt, 0, &src, dst)
}

/// Send a Neighbor Solicitation for `target` to `dst`. With `dupdet`
/// the probe goes out from the unspecified address and carries no
/// link-layer option, per duplicate address detection.
pub fn send_nsol(
    nif: Option<&NetIfRef>,
    dst: &Ipv6Addr,
    target: &Ipv6Addr,
    dupdet: bool,
) -> Result<(), Errno> {
    let dev = super::dev_or_default(nif)?;

    let (src, mac) = {
        let n = dev.lock();
        (n.ip6_lladdr, n.mac)
    };

    // Without a link-local address only duplicate detection may probe.
    if src.is_unspecified() && !dupdet {
        return Err(Errno::EADDRNOTAVAIL);
    }

    let mut pkt = Vec::with_capacity(32);
    pkt.extend_from_slice(&[ICMP6_NEIGHBOR_SOLICITATION, 0, 0, 0, 0, 0, 0, 0]);
    pkt.extend_from_slice(&target.octets());

    let src = if dupdet {
        Ipv6Addr::UNSPECIFIED
    } else {
        pkt.push(NDP_OPT_SOURCE_LINK_ADDR);
        pkt.push(1);
        pkt.extend_from_slice(&mac);
        if is_linklocal(target) {
            src
        } else {
            pick_src(&dev, target)?
        }
    };

    finish_and_send(Some(&dev), pkt, 255, &src, dst)
}

/// Send a Neighbor Advertisement for `target` to `dst`.
pub fn send_nadv(
    nif: Option<&NetIfRef>,
    dst: &Ipv6Addr,
    target: &Ipv6Addr,
    solicited: bool,
) -> Result<(), Errno> {
    let dev = super::dev_or_default(nif)?;
    let mac = dev.lock().mac;

    // R/S/O bits: solicited 0x40, override 0x20.
    let mut flags = 0x20u8;
    if solicited {
        flags |= 0x40;
    }

    let mut pkt = Vec::with_capacity(32);
    pkt.extend_from_slice(&[ICMP6_NEIGHBOR_ADVERTISEMENT, 0, 0, 0, flags, 0, 0, 0]);
    pkt.extend_from_slice(&target.octets());
    pkt.push(NDP_OPT_TARGET_LINK_ADDR);
    pkt.push(1);
    pkt.extend_from_slice(&mac);

    // Advertisements go out from the address they describe.
    finish_and_send(Some(&dev), pkt, 255, target, dst)
}

/// Send a Router Solicitation to all-routers.
pub fn send_rsol(nif: Option<&NetIfRef>) -> Result<(), Errno> {
    let dev = super::dev_or_default(nif)?;
    let (src, mac) = {
        let n = dev.lock();
        (n.ip6_lladdr, n.mac)
    };

    let mut pkt = Vec::with_capacity(16);
    pkt.extend_from_slice(&[ICMP6_ROUTER_SOLICITATION, 0, 0, 0, 0, 0, 0, 0]);

    // An unspecified source cannot claim a link-layer address.
    if !src.is_unspecified() {
        pkt.push(NDP_OPT_SOURCE_LINK_ADDR);
        pkt.push(1);
        pkt.extend_from_slice(&mac);
    }

    finish_and_send(Some(&dev), pkt, 255, &src, &ALL_ROUTERS)
}

/// Shared tail of the error senders: suppression rules, source pick,
/// truncation to the minimum MTU.
fn send_err_pkt(
    nif: Option<&NetIfRef>,
    mut pkt: Vec<u8>,
    offender: &[u8],
    mc_allow: bool,
) -> Result<(), Errno> {
    let Some(orig) = Ipv6Hdr::parse(offender) else {
        return Err(Errno::EINVAL);
    };

    // Never answer unspecified or multicast sources.
    if orig.src_addr.is_unspecified() || orig.src_addr.is_multicast() {
        return Ok(());
    }

    // Never answer multicast destinations unless explicitly allowed.
    if !mc_allow && orig.dst_addr.is_multicast() {
        return Ok(());
    }

    let dev = super::dev_or_default(nif)?;
    let src = if is_linklocal(&orig.dst_addr) || is_mc_linklocal(&orig.dst_addr) {
        dev.lock().ip6_lladdr
    } else {
        pick_src(&dev, &orig.src_addr)?
    };

    let quote = core::cmp::min(offender.len(), ERR_MAX - pkt.len());
    pkt.extend_from_slice(&offender[..quote]);

    finish_and_send(Some(&dev), pkt, 0, &src, &orig.src_addr)
}

/// Send an ICMPv6 Destination Unreachable about the given packet.
pub fn send_dest_unreach(nif: Option<&NetIfRef>, code: u8, offender: &[u8]) -> Result<(), Errno> {
    if code > DEST_UNREACH_BAD_ROUTE {
        return Err(Errno::EINVAL);
    }

    let pkt = alloc::vec![ICMP6_DEST_UNREACHABLE, code, 0, 0, 0, 0, 0, 0];
    send_err_pkt(nif, pkt, offender, false)
}

/// Send an ICMPv6 Time Exceeded about the given packet.
pub fn send_time_exceeded(nif: Option<&NetIfRef>, code: u8, offender: &[u8]) -> Result<(), Errno> {
    if code > TIME_EXCEEDED_FRAGMENT {
        return Err(Errno::EINVAL);
    }

    let pkt = alloc::vec![ICMP6_TIME_EXCEEDED, code, 0, 0, 0, 0, 0, 0];
    send_err_pkt(nif, pkt, offender, false)
}

/// Send an ICMPv6 Parameter Problem about the given packet; only the
/// unknown-option code may answer a multicast destination.
pub fn send_param_prob(
    nif: Option<&NetIfRef>,
    code: u8,
    pointer: u32,
    offender: &[u8],
) -> Result<(), Errno> {
    if code > PARAM_PROB_UNK_OPTION {
        return Err(Errno::EINVAL);
    }

    let mut pkt = alloc::vec![ICMP6_PARAM_PROBLEM, code, 0, 0];
    pkt.extend_from_slice(&pointer.to_be_bytes());
    send_err_pkt(nif, pkt, offender, code == PARAM_PROB_UNK_OPTION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    static REPLIES6: AtomicU32 = AtomicU32::new(0);

    fn count_reply(_src: &Ipv6Addr, _seq: u16, rtt: Option<u64>, _hlim: u8, _d: &[u8]) {
        assert!(rtt.is_some());
        REPLIES6.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn loopback_ping6_comes_back() {
        set_echo_cb(Some(count_reply));

        let before = REPLIES6.load(Ordering::SeqCst);
        send_echo(None, &Ipv6Addr::LOCALHOST, 3, 9, b"six").unwrap();
        assert_eq!(REPLIES6.load(Ordering::SeqCst), before + 1);

        set_echo_cb(None);
    }

    #[test]
    fn errors_suppressed_for_multicast_sources() {
        // Build an offending packet with a multicast source; no device
        // is required because suppression short-circuits first.
        let hdr = Ipv6Hdr::new(99, 64, ALL_NODES, Ipv6Addr::LOCALHOST, 0);
        let pkt = hdr.encode();
        assert!(send_dest_unreach(None, 0, &pkt).is_ok());
    }
}
