/*
 * UDP and UDP-Lite Sockets
 *
 * Datagram sockets with a FIFO receive queue per socket. UDP-Lite rides
 * the same code with the length field reinterpreted as checksum
 * coverage: a sender's configured coverage replaces the length, and a
 * receiver's coverage threshold silently drops under-covered arrivals -
 * silently meaning no statistics either, since a coverage mismatch is
 * configuration, not a protocol error.
 */

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use core::net::Ipv6Addr;
use spin::Mutex;

use crate::errno::Errno;
use crate::sched::{self, genwait};
use crate::vfs::PollEvents;

use super::checksum;
use super::ipv4::{PROTO_UDP, PROTO_UDPLITE};
use super::netif::{is_linklocal, is_mc_linklocal, is_v4_mapped, v4_mapped, NetIfRef};
use super::socket::{
    self, Domain, InputResult, IpHdrRef, SockAddr, SockId, SocketProto, IPPROTO_IP, IPPROTO_IPV6,
    IPV6_UNICAST_HOPS, IPV6_V6ONLY, IP_TTL, SHUT_RD, SHUT_RDWR, SHUT_WR, SOL_SOCKET, SO_ACCEPTCONN,
    SO_TYPE,
    UDPLITE_RECV_CSCOV, UDPLITE_SEND_CSCOV, UDP_NOCHECKSUM,
};
use super::ipv6;

/// Default hop limit (or ttl for IPv4) for new sockets.
const UDP_DEFAULT_HOPS: u8 = 64;

/// UDP header length.
const UDP_HLEN: usize = 8;

/// First ephemeral port.
const EPHEMERAL_BASE: u16 = 1024;

struct UdpPkt {
    from: SockAddr,
    data: Vec<u8>,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct UdpFlags: u32 {
        const NONBLOCK    = 1 << 0;
        const V6ONLY      = 1 << 1;
        const SHUT_RD     = 1 << 2;
        const SHUT_WR     = 1 << 3;
        const NO_CHECKSUM = 1 << 4;
        const LITE_RCVCOV = 1 << 5;
    }
}

struct UdpSock {
    domain: Domain,
    proto: u8,
    flags: UdpFlags,
    local: SockAddr,
    remote: SockAddr,
    hop_limit: u8,
    send_cscov: u16,
    recv_cscov: u16,
    packets: VecDeque<UdpPkt>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UdpStats {
    pub pkt_sent: u32,
    pub pkt_send_failed: u32,
    pub pkt_recv: u32,
    pub pkt_recv_bad_size: u32,
    pub pkt_recv_bad_chksum: u32,
    pub pkt_recv_no_sock: u32,
}

static SOCKS: Mutex<BTreeMap<SockId, UdpSock>> = Mutex::new(BTreeMap::new());
static STATS: Mutex<UdpStats> = Mutex::new(UdpStats {
    pkt_sent: 0,
    pkt_send_failed: 0,
    pkt_recv: 0,
    pkt_recv_bad_size: 0,
    pkt_recv_bad_chksum: 0,
    pkt_recv_no_sock: 0,
});

pub fn stats() -> UdpStats {
    *STATS.lock()
}

/// First unused port >= 1024 among the UDP sockets.
fn pick_ephemeral(socks: &BTreeMap<SockId, UdpSock>, skip: SockId) -> u16 {
    let mut port = EPHEMERAL_BASE;
    loop {
        let taken = socks
            .iter()
            .any(|(id, s)| *id != skip && s.local.port == port);
        if !taken {
            return port;
        }
        port += 1;
    }
}

pub struct UdpProto;

impl UdpProto {
    fn with_sock<R>(
        &self,
        id: SockId,
        f: impl FnOnce(&mut UdpSock) -> Result<R, Errno>,
    ) -> Result<R, Errno> {
        let mut socks = SOCKS.lock();
        let sock = socks.get_mut(&id).ok_or(Errno::EBADF)?;
        f(sock)
    }
}

impl SocketProto for UdpProto {
    fn socket(&self, id: SockId, domain: Domain) -> Result<(), Errno> {
        self.socket_with_proto(id, domain, PROTO_UDP)
    }

    fn close(&self, id: SockId) {
        SOCKS.lock().remove(&id);
        genwait::wake_all_err(socket::wait_token(id), Errno::EBADF);
    }

    fn bind(&self, id: SockId, addr: SockAddr) -> Result<(), Errno> {
        let mut socks = SOCKS.lock();

        // A specific port must not be taken by anyone else.
        if addr.port != 0 {
            if socks
                .iter()
                .any(|(oid, s)| *oid != id && s.local.port == addr.port)
            {
                return Err(Errno::EADDRINUSE);
            }
        }

        let port = if addr.port != 0 {
            addr.port
        } else {
            pick_ephemeral(&socks, id)
        };

        let sock = socks.get_mut(&id).ok_or(Errno::EBADF)?;

        // The bound address family has to match the socket's.
        if sock.domain == Domain::V4 && !addr.addr.is_unspecified() && !is_v4_mapped(&addr.addr) {
            return Err(Errno::EINVAL);
        }

        sock.local = SockAddr::new(addr.addr, port);
        Ok(())
    }

    fn connect(&self, id: SockId, addr: SockAddr) -> Result<(), Errno> {
        self.with_sock(id, |sock| {
            if !sock.remote.addr.is_unspecified() {
                return Err(Errno::EISCONN);
            }
            if addr.addr.is_unspecified() || addr.port == 0 {
                return Err(Errno::EADDRNOTAVAIL);
            }
            if sock.domain == Domain::V4 && !is_v4_mapped(&addr.addr) {
                return Err(Errno::EINVAL);
            }

            sock.remote = addr;
            Ok(())
        })
    }

    fn recvfrom(&self, id: SockId, buf: &mut [u8], peek: bool) -> Result<(usize, SockAddr), Errno> {
        loop {
            {
                let mut socks = SOCKS.lock();
                let sock = socks.get_mut(&id).ok_or(Errno::EBADF)?;

                if sock.flags.contains(UdpFlags::SHUT_RD) {
                    return Ok((0, SockAddr::ANY));
                }

                if let Some(pkt) = sock.packets.front() {
                    let n = core::cmp::min(buf.len(), pkt.data.len());
                    buf[..n].copy_from_slice(&pkt.data[..n]);
                    let from = pkt.from;

                    if !peek {
                        sock.packets.pop_front();
                    }
                    return Ok((n, from));
                }

                if sock.flags.contains(UdpFlags::NONBLOCK) || sched::in_irq() {
                    return Err(Errno::EWOULDBLOCK);
                }
            }

            genwait::wait(socket::wait_token(id), "net_udp_recvfrom", 0)?;
        }
    }

    fn sendto(&self, id: SockId, buf: &[u8], addr: Option<SockAddr>) -> Result<usize, Errno> {
        let (local, dst, hops, proto, cscov, no_cksum) = {
            let mut socks = SOCKS.lock();

            // An unbound sender picks its ephemeral port first.
            let port = {
                let sock = socks.get(&id).ok_or(Errno::EBADF)?;
                if sock.local.port == 0 {
                    Some(pick_ephemeral(&socks, id))
                } else {
                    None
                }
            };

            let sock = socks.get_mut(&id).ok_or(Errno::EBADF)?;
            if let Some(p) = port {
                sock.local.port = p;
            }

            if sock.flags.contains(UdpFlags::SHUT_WR) {
                return Err(Errno::EPIPE);
            }

            let connected = !sock.remote.addr.is_unspecified() && sock.remote.port != 0;
            let dst = match (connected, addr) {
                (true, Some(_)) => return Err(Errno::EISCONN),
                (true, None) => sock.remote,
                (false, Some(a)) => a,
                (false, None) => return Err(Errno::EINVAL),
            };

            if sock.domain == Domain::V4 && !is_v4_mapped(&dst.addr) {
                return Err(Errno::EAFNOSUPPORT);
            }

            (
                sock.local,
                dst,
                sock.hop_limit,
                sock.proto,
                sock.send_cscov,
                sock.flags.contains(UdpFlags::NO_CHECKSUM),
            )
        };

        send_raw(None, &local, &dst, buf, hops, proto, cscov, no_cksum)
    }

    fn shutdown(&self, id: SockId, how: u32) -> Result<(), Errno> {
        if how & !SHUT_RDWR != 0 || how == 0 {
            return Err(Errno::EINVAL);
        }

        self.with_sock(id, |sock| {
            if how & SHUT_RD != 0 {
                sock.flags.insert(UdpFlags::SHUT_RD);
            }
            if how & SHUT_WR != 0 {
                sock.flags.insert(UdpFlags::SHUT_WR);
            }
            Ok(())
        })?;

        // Release any blocked readers so they see the shutdown.
        genwait::wake_all(socket::wait_token(id));
        Ok(())
    }

    fn set_nonblock(&self, id: SockId, nb: bool) -> Result<(), Errno> {
        self.with_sock(id, |sock| {
            sock.flags.set(UdpFlags::NONBLOCK, nb);
            Ok(())
        })
    }

    fn getsockopt(&self, id: SockId, level: i32, opt: i32) -> Result<i32, Errno> {
        self.with_sock(id, |sock| match (level, opt) {
            (SOL_SOCKET, SO_ACCEPTCONN) => Ok(0),
            (SOL_SOCKET, SO_TYPE) => Ok(2), // SOCK_DGRAM
            (IPPROTO_IP, IP_TTL) if sock.domain == Domain::V4 => Ok(sock.hop_limit as i32),
            (IPPROTO_IPV6, IPV6_UNICAST_HOPS) if sock.domain == Domain::V6 => {
                Ok(sock.hop_limit as i32)
            }
            (IPPROTO_IPV6, IPV6_V6ONLY) if sock.domain == Domain::V6 => {
                Ok(sock.flags.contains(UdpFlags::V6ONLY) as i32)
            }
            (l, UDP_NOCHECKSUM) if l == PROTO_UDP as i32 && sock.proto == PROTO_UDP => {
                // UDP/IPv6 packets must always have a checksum.
                if sock.domain == Domain::V6 {
                    Ok(0)
                } else {
                    Ok(sock.flags.contains(UdpFlags::NO_CHECKSUM) as i32)
                }
            }
            (l, UDPLITE_SEND_CSCOV) if l == PROTO_UDPLITE as i32 && sock.proto == PROTO_UDPLITE => {
                Ok(sock.send_cscov as i32)
            }
            (l, UDPLITE_RECV_CSCOV) if l == PROTO_UDPLITE as i32 && sock.proto == PROTO_UDPLITE => {
                Ok(sock.recv_cscov as i32)
            }
            _ => Err(Errno::EINVAL),
        })
    }

    fn setsockopt(&self, id: SockId, level: i32, opt: i32, value: i32) -> Result<(), Errno> {
        self.with_sock(id, |sock| match (level, opt) {
            (IPPROTO_IP, IP_TTL) if sock.domain == Domain::V4 => {
                set_hops(sock, value)
            }
            (IPPROTO_IPV6, IPV6_UNICAST_HOPS) if sock.domain == Domain::V6 => {
                set_hops(sock, value)
            }
            (IPPROTO_IPV6, IPV6_V6ONLY) if sock.domain == Domain::V6 => {
                sock.flags.set(UdpFlags::V6ONLY, value != 0);
                Ok(())
            }
            (l, UDP_NOCHECKSUM) if l == PROTO_UDP as i32 && sock.proto == PROTO_UDP => {
                if sock.domain == Domain::V6 {
                    return Err(Errno::EINVAL);
                }
                sock.flags.set(UdpFlags::NO_CHECKSUM, value != 0);
                Ok(())
            }
            (l, UDPLITE_SEND_CSCOV) if l == PROTO_UDPLITE as i32 && sock.proto == PROTO_UDPLITE => {
                sock.send_cscov = check_cscov(value)?;
                Ok(())
            }
            (l, UDPLITE_RECV_CSCOV) if l == PROTO_UDPLITE as i32 && sock.proto == PROTO_UDPLITE => {
                sock.recv_cscov = check_cscov(value)?;
                sock.flags.insert(UdpFlags::LITE_RCVCOV);
                Ok(())
            }
            _ => Err(Errno::EINVAL),
        })
    }

    fn poll(&self, id: SockId, events: PollEvents) -> PollEvents {
        let socks = SOCKS.lock();
        let Some(sock) = socks.get(&id) else {
            return PollEvents::ERR;
        };

        let mut ready = PollEvents::OUT;
        if !sock.packets.is_empty() {
            ready |= PollEvents::IN;
        }
        ready & events
    }

    fn input(&self, _nif: Option<&NetIfRef>, ip: &IpHdrRef<'_>, data: &[u8]) -> InputResult {
        input_dgram(ip, data)
    }
}

impl UdpProto {
    fn socket_with_proto(&self, id: SockId, domain: Domain, proto: u8) -> Result<(), Errno> {
        SOCKS.lock().insert(
            id,
            UdpSock {
                domain,
                proto,
                flags: UdpFlags::empty(),
                local: SockAddr::ANY,
                remote: SockAddr::ANY,
                hop_limit: UDP_DEFAULT_HOPS,
                send_cscov: 0,
                recv_cscov: 0,
                packets: VecDeque::new(),
            },
        );
        Ok(())
    }
}

/// The UDP-Lite face: identical except for the protocol byte stamped on
/// new sockets.
pub struct UdpLiteProto(pub UdpProto);

impl SocketProto for UdpLiteProto {
    fn socket(&self, id: SockId, domain: Domain) -> Result<(), Errno> {
        self.0.socket_with_proto(id, domain, PROTO_UDPLITE)
    }

    fn close(&self, id: SockId) {
        self.0.close(id)
    }
    fn bind(&self, id: SockId, addr: SockAddr) -> Result<(), Errno> {
        self.0.bind(id, addr)
    }
    fn connect(&self, id: SockId, addr: SockAddr) -> Result<(), Errno> {
        self.0.connect(id, addr)
    }
    fn recvfrom(&self, id: SockId, buf: &mut [u8], peek: bool) -> Result<(usize, SockAddr), Errno> {
        self.0.recvfrom(id, buf, peek)
    }
    fn sendto(&self, id: SockId, buf: &[u8], addr: Option<SockAddr>) -> Result<usize, Errno> {
        self.0.sendto(id, buf, addr)
    }
    fn shutdown(&self, id: SockId, how: u32) -> Result<(), Errno> {
        self.0.shutdown(id, how)
    }
    fn set_nonblock(&self, id: SockId, nb: bool) -> Result<(), Errno> {
        self.0.set_nonblock(id, nb)
    }
    fn getsockopt(&self, id: SockId, level: i32, opt: i32) -> Result<i32, Errno> {
        self.0.getsockopt(id, level, opt)
    }
    fn setsockopt(&self, id: SockId, level: i32, opt: i32, value: i32) -> Result<(), Errno> {
        self.0.setsockopt(id, level, opt, value)
    }
    fn poll(&self, id: SockId, events: PollEvents) -> PollEvents {
        self.0.poll(id, events)
    }
    fn input(&self, nif: Option<&NetIfRef>, ip: &IpHdrRef<'_>, data: &[u8]) -> InputResult {
        self.0.input(nif, ip, data)
    }
}

fn set_hops(sock: &mut UdpSock, value: i32) -> Result<(), Errno> {
    match value {
        -1 => {
            sock.hop_limit = UDP_DEFAULT_HOPS;
            Ok(())
        }
        0..=255 => {
            sock.hop_limit = value as u8;
            Ok(())
        }
        _ => Err(Errno::EINVAL),
    }
}

fn check_cscov(value: i32) -> Result<u16, Errno> {
    if value != 0 && value < 8 {
        return Err(Errno::EINVAL);
    }
    Ok(core::cmp::min(value, 0xFFFF) as u16)
}

/// Pick the source address for an unbound sender, by destination scope.
fn pick_src(dst: &Ipv6Addr) -> Result<Ipv6Addr, Errno> {
    if let Some(d4) = super::netif::v4_of(dst) {
        // Loopback traffic needs no device at all.
        if d4[0] == 127 {
            return Ok(v4_mapped([127, 0, 0, 1]));
        }
        let dev = super::dev_or_default(None)?;
        let ip = dev.lock().ip_addr;
        if ip == [0; 4] {
            return Err(Errno::ENETDOWN);
        }
        return Ok(v4_mapped(ip));
    }

    if dst.is_loopback() {
        return Ok(Ipv6Addr::LOCALHOST);
    }

    let dev = super::dev_or_default(None)?;
    let n = dev.lock();
    if is_linklocal(dst) || is_mc_linklocal(dst) {
        Ok(n.ip6_lladdr)
    } else if let Some(first) = n.ip6_addrs.first() {
        Ok(*first)
    } else {
        Err(Errno::ENETDOWN)
    }
}

/// Build the datagram and push it into the IP layer.
#[allow(clippy::too_many_arguments)]
fn send_raw(
    nif: Option<&NetIfRef>,
    src: &SockAddr,
    dst: &SockAddr,
    data: &[u8],
    hops: u8,
    proto: u8,
    cscov: u16,
    no_cksum: bool,
) -> Result<usize, Errno> {
    let src_addr = if src.addr.is_unspecified() {
        match pick_src(&dst.addr) {
            Ok(a) => a,
            Err(e) => {
                STATS.lock().pkt_send_failed += 1;
                return Err(e);
            }
        }
    } else {
        src.addr
    };

    let total = data.len() + UDP_HLEN;
    let mut pkt = Vec::with_capacity(total);
    pkt.extend_from_slice(&src.port.to_be_bytes());
    pkt.extend_from_slice(&dst.port.to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0, 0]); // length + checksum below

    pkt.extend_from_slice(data);

    if proto == PROTO_UDP {
        pkt[4..6].copy_from_slice(&(total as u16).to_be_bytes());

        if !no_cksum {
            let cs = checksum::checksum(
                &pkt,
                checksum::pseudo_v6(&src_addr, &dst.addr, total as u32, proto),
            );
            pkt[6..8].copy_from_slice(&cs.to_be_bytes());
        }
    } else {
        // UDP-Lite: the length field carries the checksum coverage;
        // zero means the whole datagram.
        let cov = if cscov as usize <= total { cscov } else { 0 };
        pkt[4..6].copy_from_slice(&cov.to_be_bytes());

        let covered = if cov == 0 { total } else { cov as usize };
        let cs = checksum::checksum(
            &pkt[..covered],
            checksum::pseudo_v6(&src_addr, &dst.addr, total as u32, proto),
        );
        pkt[6..8].copy_from_slice(&cs.to_be_bytes());
    }

    match ipv6::send(nif, &pkt, hops, proto, &src_addr, &dst.addr) {
        Ok(()) => {
            STATS.lock().pkt_sent += 1;
            Ok(data.len())
        }
        Err(e) => {
            STATS.lock().pkt_send_failed += 1;
            Err(e)
        }
    }
}

/// Verify and deliver one inbound datagram.
fn input_dgram(ip: &IpHdrRef<'_>, data: &[u8]) -> InputResult {
    if data.len() <= UDP_HLEN {
        STATS.lock().pkt_recv_bad_size += 1;
        return InputResult::NoSocket;
    }

    let proto = ip.protocol();
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]);
    let cksum = u16::from_be_bytes([data[6], data[7]]);

    let src6 = ip.src();
    let dst6 = ip.dst();
    let size = data.len();

    // Checksum verification. Plain UDP over IPv4 may omit it (zero);
    // UDP-Lite reinterprets the length field as coverage.
    let mut partial_cov = false;
    let mut cscov = size;

    if proto == PROTO_UDP {
        let required = ip.domain() == Domain::V6;
        if cksum != 0 || required {
            let ps = checksum::pseudo_v6(&src6, &dst6, size as u32, proto);
            if checksum::checksum(data, ps) != 0 {
                STATS.lock().pkt_recv_bad_chksum += 1;
                return InputResult::NoSocket;
            }
        }
    } else {
        let cov = length as usize;
        if cov != 0 && (cov < 8 || cov > size) {
            STATS.lock().pkt_recv_bad_chksum += 1;
            return InputResult::NoSocket;
        }
        if cov != 0 && cov < size {
            partial_cov = true;
            cscov = cov;
        }

        let ps = checksum::pseudo_v6(&src6, &dst6, size as u32, proto);
        if checksum::checksum(&data[..cscov], ps) != 0 {
            STATS.lock().pkt_recv_bad_chksum += 1;
            return InputResult::NoSocket;
        }
    }

    // Queueing the datagram allocates; in interrupt context that needs
    // the platform's say-so.
    if !sched::alloc_ok() {
        return InputResult::NoSocket;
    }

    let mut socks = SOCKS.lock();

    // Find the socket this datagram belongs to.
    let mut target: Option<SockId> = None;
    let mut coverage_drop = false;

    for (id, sock) in socks.iter() {
        // Domain gate: v4 packets skip V6ONLY sockets; v6 packets skip
        // v4 sockets.
        match ip.domain() {
            Domain::V4 => {
                if sock.domain == Domain::V6 && sock.flags.contains(UdpFlags::V6ONLY) {
                    continue;
                }
            }
            Domain::V6 => {
                if sock.domain == Domain::V4 {
                    continue;
                }
            }
        }

        if sock.local.port != dst_port {
            continue;
        }

        // A connected socket takes only its peer's traffic.
        if sock.remote.port != 0 && sock.remote.port != src_port {
            continue;
        }
        if !sock.remote.addr.is_unspecified() && sock.remote.addr != src6 {
            continue;
        }

        // Transport protocol byte must match (UDP vs UDP-Lite).
        if sock.proto != proto {
            continue;
        }

        // UDP-Lite receive coverage: silently drop under-covered
        // arrivals. No statistics change, by design.
        if sock.flags.contains(UdpFlags::LITE_RCVCOV)
            && partial_cov
            && cscov < sock.recv_cscov as usize
        {
            coverage_drop = true;
        } else {
            target = Some(*id);
        }
        break;
    }

    if coverage_drop {
        return InputResult::Consumed;
    }

    let Some(id) = target else {
        STATS.lock().pkt_recv_no_sock += 1;
        return InputResult::NoSocket;
    };

    if let Some(sock) = socks.get_mut(&id) {
        sock.packets.push_back(UdpPkt {
            from: SockAddr::new(src6, src_port),
            data: data[UDP_HLEN..].to_vec(),
        });
    }

    STATS.lock().pkt_recv += 1;
    drop(socks);
    genwait::wake_one(socket::wait_token(id));
    InputResult::Consumed
}

/// Register the UDP and UDP-Lite records.
pub fn init() -> Result<(), Errno> {
    static REGISTERED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
    if REGISTERED.swap(true, core::sync::atomic::Ordering::AcqRel) {
        return Ok(());
    }

    socket::proto_add(
        socket::SockType::Dgram,
        PROTO_UDP,
        alloc::sync::Arc::new(UdpProto),
    );
    socket::proto_add(
        socket::SockType::Dgram,
        PROTO_UDPLITE,
        alloc::sync::Arc::new(UdpLiteProto(UdpProto)),
    );
    Ok(())
}

pub fn shutdown() {
    SOCKS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket as sockapi;
    use crate::net::socket::SockType;
    use crate::vfs;

    /// The socket table and statistics are global; one test at a time.
    static UDP_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn loop4(port: u16) -> SockAddr {
        SockAddr::v4([127, 0, 0, 1], port)
    }

    #[test]
    fn loopback_send_recv_roundtrip() {
        let _l = UDP_TEST_LOCK.lock();
        init().unwrap();

        let rx = sockapi::socket(Domain::V4, SockType::Dgram, PROTO_UDP).unwrap();
        sockapi::bind(rx, loop4(15001)).unwrap();

        let tx = sockapi::socket(Domain::V4, SockType::Dgram, PROTO_UDP).unwrap();
        let n = sockapi::sendto(tx, b"dreams", Some(loop4(15001))).unwrap();
        assert_eq!(n, 6);

        let mut buf = [0u8; 32];
        let (n, from) = sockapi::recvfrom(rx, &mut buf, false).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], b"dreams");
        assert_eq!(super::super::netif::v4_of(&from.addr), Some([127, 0, 0, 1]));

        vfs::close(rx).unwrap();
        vfs::close(tx).unwrap();
    }

    #[test]
    fn connected_socket_filters_and_nonblock_reports() {
        let _l = UDP_TEST_LOCK.lock();
        init().unwrap();

        let rx = sockapi::socket(Domain::V4, SockType::Dgram, PROTO_UDP).unwrap();
        sockapi::bind(rx, loop4(15002)).unwrap();
        // Connect to a peer that will never send.
        sockapi::connect(rx, loop4(15999)).unwrap();
        sockapi::setsockopt(rx, IPPROTO_IP, IP_TTL, 32).unwrap();
        assert_eq!(sockapi::getsockopt(rx, IPPROTO_IP, IP_TTL).unwrap(), 32);

        // A sender on a different port: filtered out by the connection.
        let tx = sockapi::socket(Domain::V4, SockType::Dgram, PROTO_UDP).unwrap();
        sockapi::bind(tx, loop4(15003)).unwrap();
        let _ = sockapi::sendto(tx, b"noise", Some(loop4(15002)));

        // Non-blocking read reports would-block instead of hanging.
        set_nonblock_for_test(rx);
        let mut buf = [0u8; 8];
        assert_eq!(
            sockapi::recvfrom(rx, &mut buf, false).unwrap_err(),
            Errno::EWOULDBLOCK
        );

        vfs::close(rx).unwrap();
        vfs::close(tx).unwrap();
    }

    fn set_nonblock_for_test(fd: i32) {
        use crate::vfs::{FcntlCmd, OpenMode};
        vfs::fcntl(fd, FcntlCmd::SetFl(OpenMode::NONBLOCK)).unwrap();
    }

    #[test]
    fn udplite_partial_coverage_gate() {
        let _l = UDP_TEST_LOCK.lock();
        init().unwrap();

        let rx = sockapi::socket(Domain::V4, SockType::Dgram, PROTO_UDPLITE).unwrap();
        sockapi::bind(rx, loop4(15004)).unwrap();
        // Demand at least 20 bytes of coverage.
        sockapi::setsockopt(rx, PROTO_UDPLITE as i32, UDPLITE_RECV_CSCOV, 20).unwrap();
        set_nonblock_for_test(rx);

        let tx = sockapi::socket(Domain::V4, SockType::Dgram, PROTO_UDPLITE).unwrap();

        // Coverage 16 (under threshold): silently dropped, stats frozen.
        sockapi::setsockopt(tx, PROTO_UDPLITE as i32, UDPLITE_SEND_CSCOV, 16).unwrap();
        let stats_before = stats();
        let payload = [7u8; 24]; // 32 bytes on the wire, partial coverage
        sockapi::sendto(tx, &payload, Some(loop4(15004))).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(
            sockapi::recvfrom(rx, &mut buf, false).unwrap_err(),
            Errno::EWOULDBLOCK
        );
        let stats_after = stats();
        assert_eq!(stats_before.pkt_recv, stats_after.pkt_recv);
        assert_eq!(stats_before.pkt_recv_bad_chksum, stats_after.pkt_recv_bad_chksum);
        assert_eq!(stats_before.pkt_recv_no_sock, stats_after.pkt_recv_no_sock);

        // Coverage 24 (over threshold): delivered.
        sockapi::setsockopt(tx, PROTO_UDPLITE as i32, UDPLITE_SEND_CSCOV, 24).unwrap();
        sockapi::sendto(tx, &payload, Some(loop4(15004))).unwrap();
        let (n, _) = sockapi::recvfrom(rx, &mut buf, false).unwrap();
        assert_eq!(n, 24);

        vfs::close(rx).unwrap();
        vfs::close(tx).unwrap();
    }
}
