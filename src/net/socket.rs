/*
 * Socket Framework
 *
 * The registry of transport protocols and the VFS face of sockets.
 * Protocols register a record keyed by (domain, type, protocol) whose
 * vtable handles the socket operations; socket() looks the record up,
 * creates a SocketFile bound to a fresh socket id, and installs it in
 * the kernel descriptor table. Inbound packets are offered to each
 * registered protocol by protocol number.
 *
 * Addresses are carried in IPv6 form everywhere; IPv4 peers appear as
 * v4-mapped addresses, exactly as they do on the wire-facing side.
 */

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv6Addr;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::errno::Errno;
use crate::vfs::{self, FcntlCmd, FileOps, PollEvents, Whence};

use super::ipv4::Ipv4Hdr;
use super::ipv6::Ipv6Hdr;
use super::netif::NetIfRef;

/// Address families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    V4,
    V6,
}

/// Socket types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Dgram,
    Stream,
}

/// Socket-level option levels and names, classic numbering.
pub const SOL_SOCKET: i32 = 1;
pub const IPPROTO_IP: i32 = 0;
pub const IPPROTO_IPV6: i32 = 41;

pub const SO_TYPE: i32 = 3;
pub const SO_ACCEPTCONN: i32 = 30;
pub const IP_TTL: i32 = 2;
pub const IPV6_UNICAST_HOPS: i32 = 16;
pub const IPV6_V6ONLY: i32 = 26;
pub const UDP_NOCHECKSUM: i32 = 1;
pub const UDPLITE_SEND_CSCOV: i32 = 10;
pub const UDPLITE_RECV_CSCOV: i32 = 11;

/// Shutdown directions.
pub const SHUT_RD: u32 = 1;
pub const SHUT_WR: u32 = 2;
pub const SHUT_RDWR: u32 = 3;

/// A socket endpoint address: IPv6 form (v4-mapped for IPv4 peers) and
/// a host-order port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
    pub addr: Ipv6Addr,
    pub port: u16,
}

impl SockAddr {
    pub const ANY: SockAddr = SockAddr {
        addr: Ipv6Addr::UNSPECIFIED,
        port: 0,
    };

    pub fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// An IPv4 endpoint; INADDR_ANY becomes the unspecified address so
    /// wildcard binds behave identically across both families.
    pub fn v4(addr: [u8; 4], port: u16) -> Self {
        Self {
            addr: if addr == [0; 4] {
                Ipv6Addr::UNSPECIFIED
            } else {
                super::netif::v4_mapped(addr)
            },
            port,
        }
    }
}

/// Per-socket id, unique for the life of the system.
pub type SockId = u64;

static NEXT_SOCK_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_id() -> SockId {
    NEXT_SOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// The genwait channel for a socket id: high half of the address space,
/// clear of heap addresses and the scheduler's own tokens.
pub fn wait_token(id: SockId) -> usize {
    (1usize << (usize::BITS - 1)) | (id as usize)
}

/// What became of an inbound packet offered to a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputResult {
    Consumed,
    NoSocket,
    NoProtocol,
}

/// Which IP header accompanied an inbound segment.
pub enum IpHdrRef<'a> {
    V4(&'a Ipv4Hdr),
    V6(&'a Ipv6Hdr),
}

impl IpHdrRef<'_> {
    pub fn src(&self) -> Ipv6Addr {
        match self {
            IpHdrRef::V4(h) => super::netif::v4_mapped(h.src),
            IpHdrRef::V6(h) => h.src_addr,
        }
    }

    pub fn dst(&self) -> Ipv6Addr {
        match self {
            IpHdrRef::V4(h) => super::netif::v4_mapped(h.dest),
            IpHdrRef::V6(h) => h.dst_addr,
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            IpHdrRef::V4(_) => Domain::V4,
            IpHdrRef::V6(_) => Domain::V6,
        }
    }

    pub fn protocol(&self) -> u8 {
        match self {
            IpHdrRef::V4(h) => h.protocol,
            IpHdrRef::V6(h) => h.next_header,
        }
    }
}

/// The protocol vtable. One implementor per transport.
pub trait SocketProto: Send + Sync {
    /// Create protocol state for a fresh socket.
    fn socket(&self, id: SockId, domain: Domain) -> Result<(), Errno>;
    /// Destroy the socket, with whatever wire-level goodbye it needs.
    fn close(&self, id: SockId);

    fn bind(&self, id: SockId, addr: SockAddr) -> Result<(), Errno>;
    fn connect(&self, id: SockId, addr: SockAddr) -> Result<(), Errno>;
    fn listen(&self, _id: SockId, _backlog: usize) -> Result<(), Errno> {
        Err(Errno::EOPNOTSUPP)
    }
    /// Accept one queued connection, returning the new socket's id and
    /// the peer address.
    fn accept(&self, _id: SockId) -> Result<(SockId, SockAddr), Errno> {
        Err(Errno::EOPNOTSUPP)
    }

    fn recvfrom(&self, id: SockId, buf: &mut [u8], peek: bool) -> Result<(usize, SockAddr), Errno>;
    fn sendto(&self, id: SockId, buf: &[u8], addr: Option<SockAddr>) -> Result<usize, Errno>;

    fn shutdown(&self, id: SockId, how: u32) -> Result<(), Errno>;
    fn set_nonblock(&self, id: SockId, nb: bool) -> Result<(), Errno>;

    fn getsockopt(&self, id: SockId, level: i32, opt: i32) -> Result<i32, Errno>;
    fn setsockopt(&self, id: SockId, level: i32, opt: i32, value: i32) -> Result<(), Errno>;

    fn poll(&self, id: SockId, events: PollEvents) -> PollEvents;

    /// Offer an inbound segment. The protocol checks its own tables.
    fn input(&self, nif: Option<&NetIfRef>, ip: &IpHdrRef<'_>, data: &[u8]) -> InputResult;
}

/// One registry record.
struct ProtoRecord {
    stype: SockType,
    protocol: u8,
    ops: Arc<dyn SocketProto>,
}

static PROTOCOLS: Mutex<Vec<ProtoRecord>> = Mutex::new(Vec::new());

/// Register a protocol record.
pub fn proto_add(stype: SockType, protocol: u8, ops: Arc<dyn SocketProto>) {
    PROTOCOLS.lock().push(ProtoRecord {
        stype,
        protocol,
        ops,
    });
}

/// Remove a protocol record.
pub fn proto_remove(protocol: u8) {
    PROTOCOLS.lock().retain(|p| p.protocol != protocol);
}

fn find_proto(stype: SockType, protocol: u8) -> Option<(u8, Arc<dyn SocketProto>)> {
    let protos = PROTOCOLS.lock();
    protos
        .iter()
        .find(|p| p.stype == stype && (protocol == 0 || p.protocol == protocol))
        .map(|p| (p.protocol, p.ops.clone()))
}

fn find_proto_by_number(protocol: u8) -> Option<Arc<dyn SocketProto>> {
    let protos = PROTOCOLS.lock();
    protos
        .iter()
        .find(|p| p.protocol == protocol)
        .map(|p| p.ops.clone())
}

/*****************************************************************************/
/* The VFS face */

/// An open socket descriptor.
pub struct SocketFile {
    pub id: SockId,
    pub domain: Domain,
    proto: Arc<dyn SocketProto>,
}

impl SocketFile {
    fn wrap(id: SockId, domain: Domain, proto: Arc<dyn SocketProto>) -> Arc<SocketFile> {
        Arc::new(SocketFile { id, domain, proto })
    }
}

impl FileOps for SocketFile {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        self.proto.recvfrom(self.id, buf, false).map(|(n, _)| n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        self.proto.sendto(self.id, buf, None)
    }

    fn seek(&self, _offset: i64, _whence: Whence) -> Result<i64, Errno> {
        Err(Errno::ESPIPE)
    }

    fn fcntl(&self, cmd: FcntlCmd) -> Result<u32, Errno> {
        match cmd {
            FcntlCmd::GetFl => Ok(vfs::OpenMode::RDWR.bits()),
            FcntlCmd::SetFl(mode) => {
                self.proto
                    .set_nonblock(self.id, mode.contains(vfs::OpenMode::NONBLOCK))?;
                Ok(0)
            }
        }
    }

    fn poll(&self, events: PollEvents) -> PollEvents {
        self.proto.poll(self.id, events)
    }

    fn as_socket(&self) -> Option<&SocketFile> {
        Some(self)
    }

    fn on_close(&self) -> Result<(), Errno> {
        self.proto.close(self.id);
        Ok(())
    }
}

fn socket_of(fd: i32) -> Result<(Arc<dyn FileOps>, SockId, Arc<dyn SocketProto>, Domain), Errno> {
    let file = vfs::fd::get(fd)?;
    let (id, proto, domain) = {
        let s = file.as_socket().ok_or(Errno::EBADF)?;
        (s.id, s.proto.clone(), s.domain)
    };
    Ok((file, id, proto, domain))
}

/*****************************************************************************/
/* Public socket API */

/// Create a socket descriptor.
pub fn socket(domain: Domain, stype: SockType, protocol: u8) -> Result<i32, Errno> {
    let (_, ops) = find_proto(stype, protocol).ok_or(Errno::EPROTONOSUPPORT)?;

    let id = next_id();
    ops.socket(id, domain)?;

    let file = SocketFile::wrap(id, domain, ops);
    match vfs::fd::alloc_fd(file.clone()) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            file.proto.close(id);
            Err(e)
        }
    }
}

pub fn bind(fd: i32, addr: SockAddr) -> Result<(), Errno> {
    let (_f, id, proto, _) = socket_of(fd)?;
    proto.bind(id, addr)
}

pub fn connect(fd: i32, addr: SockAddr) -> Result<(), Errno> {
    let (_f, id, proto, _) = socket_of(fd)?;
    proto.connect(id, addr)
}

pub fn listen(fd: i32, backlog: usize) -> Result<(), Errno> {
    let (_f, id, proto, _) = socket_of(fd)?;
    proto.listen(id, backlog)
}

/// Accept a queued connection; returns the new descriptor and the peer.
pub fn accept(fd: i32) -> Result<(i32, SockAddr), Errno> {
    let (_f, id, proto, domain) = socket_of(fd)?;
    let (new_id, peer) = proto.accept(id)?;

    let file = SocketFile::wrap(new_id, domain, proto.clone());
    match vfs::fd::alloc_fd(file) {
        Ok(new_fd) => Ok((new_fd, peer)),
        Err(e) => {
            proto.close(new_id);
            Err(e)
        }
    }
}

pub fn sendto(fd: i32, buf: &[u8], addr: Option<SockAddr>) -> Result<usize, Errno> {
    let (_f, id, proto, _) = socket_of(fd)?;
    proto.sendto(id, buf, addr)
}

pub fn recvfrom(fd: i32, buf: &mut [u8], peek: bool) -> Result<(usize, SockAddr), Errno> {
    let (_f, id, proto, _) = socket_of(fd)?;
    proto.recvfrom(id, buf, peek)
}

pub fn send(fd: i32, buf: &[u8]) -> Result<usize, Errno> {
    sendto(fd, buf, None)
}

pub fn recv(fd: i32, buf: &mut [u8]) -> Result<usize, Errno> {
    recvfrom(fd, buf, false).map(|(n, _)| n)
}

pub fn shutdown(fd: i32, how: u32) -> Result<(), Errno> {
    let (_f, id, proto, _) = socket_of(fd)?;
    proto.shutdown(id, how)
}

pub fn getsockopt(fd: i32, level: i32, opt: i32) -> Result<i32, Errno> {
    let (_f, id, proto, _) = socket_of(fd)?;
    proto.getsockopt(id, level, opt)
}

pub fn setsockopt(fd: i32, level: i32, opt: i32, value: i32) -> Result<(), Errno> {
    let (_f, id, proto, _) = socket_of(fd)?;
    proto.setsockopt(id, level, opt, value)
}

/*****************************************************************************/
/* Inbound dispatch from the IP layers */

fn offer(nif: Option<&NetIfRef>, ip: IpHdrRef<'_>, data: &[u8]) -> InputResult {
    let Some(ops) = find_proto_by_number(ip.protocol()) else {
        return InputResult::NoProtocol;
    };
    ops.input(nif, &ip, data)
}

pub fn input_v4(nif: Option<&NetIfRef>, hdr: &Ipv4Hdr, data: &[u8]) -> InputResult {
    offer(nif, IpHdrRef::V4(hdr), data)
}

pub fn input_v6(nif: Option<&NetIfRef>, hdr: &Ipv6Hdr, data: &[u8]) -> InputResult {
    offer(nif, IpHdrRef::V6(hdr), data)
}

/// Bring the framework up with an empty registry.
pub fn init() {
    PROTOCOLS.lock().clear();
}

/// Drop the registry. (The name dodges the socket-level shutdown().)
pub fn shutdown_framework() {
    PROTOCOLS.lock().clear();
}
