/*
 * TCP (RFC 793)
 *
 * The full connection state machine: three-way handshake in both the
 * active and passive roles, reliable delivery over circular send and
 * receive buffers, graceful close through the FIN states, TIME-WAIT
 * recycling, and RST handling including stateless resets for segments
 * that match no socket. No extensions beyond RFC 793 are implemented:
 * no window scaling, no SACK, no timestamps. The only option emitted is
 * MSS at connection setup; unknown incoming options are skipped by
 * their length.
 *
 * Locking is two-leveled, exactly as wide as it needs to be: a
 * reader/writer semaphore guards the list of sockets (writers are the
 * functions that change the list itself), and each socket carries its
 * own mutex. The acquire order is always list-then-socket. bind() takes
 * the write lock even though it only reads the list: duplicate-port
 * scanning under the read lock could interleave with another bind and
 * deadlock on the per-socket mutexes.
 *
 * Inbound segments are serialized per socket by that socket's mutex;
 * nothing orders segments across sockets.
 */

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv6Addr;
use spin::Mutex as SpinMutex;

use crate::errno::Errno;
use crate::sched;
use crate::sync::{Condvar, Mutex, RwSem};
use crate::utils::timer;
use crate::vfs::PollEvents;

use super::checksum;
use super::ipv4::PROTO_TCP;
use super::netif::{v4_mapped, NetIfRef};
use super::socket::{
    self, Domain, InputResult, IpHdrRef, SockAddr, SockId, SocketProto, IPPROTO_IPV6,
    IPV6_V6ONLY, SHUT_RD, SHUT_RDWR, SHUT_WR, SOL_SOCKET, SO_ACCEPTCONN, SO_TYPE,
};
use super::{ipv6, worker};

/// Default starting window / buffer size for connections.
const TCP_DEFAULT_WINDOW: u32 = 8192;

/// Default MSS (ethernet).
const TCP_DEFAULT_MSS: u16 = 1460;

/// Maximum Segment Lifetime; TIME-WAIT holds for twice this.
const TCP_DEFAULT_MSL_MS: u64 = 15000;

/// Retransmission timeout.
const TCP_DEFAULT_RTTO_MS: u64 = 2000;

/// Periodic timer tick driving retransmission and reaping.
const TCP_TICK_MS: u64 = 50;

/// Listen backlog cap.
const SOMAXCONN: usize = 10;

/* Header flag bits */
const TCP_FLAG_FIN: u16 = 0x01;
const TCP_FLAG_SYN: u16 = 0x02;
const TCP_FLAG_RST: u16 = 0x04;
#[allow(dead_code)]
const TCP_FLAG_PSH: u16 = 0x08;
const TCP_FLAG_ACK: u16 = 0x10;
const TCP_FLAG_URG: u16 = 0x20;

/* Option kinds */
const TCP_OPT_EOL: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;

/// TCP header length without options.
const TCP_HLEN: usize = 20;

/// Sequence-space comparisons, wraparound-correct.
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}
fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}
fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
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

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct SockFlags: u32 {
        const NONBLOCK = 1 << 0;
        const V6ONLY   = 1 << 1;
        const SHUT_RD  = 1 << 2;
        const SHUT_WR  = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct IntFlags: u32 {
        /// The descriptor is gone; the periodic tick may reap the
        /// socket once it reaches Closed.
        const CANBEDEL = 1 << 0;
        /// close() arrived while data was still in flight; the tick
        /// emits the FIN once the send buffer drains.
        const QUEUEDCLOSE = 1 << 1;
    }
}

/// Parsed TCP header (options kept as raw bytes).
struct TcpHdr<'a> {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    off_flags: u16,
    wnd: u16,
    urg: u16,
    options: &'a [u8],
}

impl<'a> TcpHdr<'a> {
    fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < TCP_HLEN {
            return None;
        }
        let off_flags = u16::from_be_bytes([data[12], data[13]]);
        let offset = (((off_flags & 0xF000) >> 12) * 4) as usize;
        if offset < TCP_HLEN || data.len() < offset {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            off_flags,
            wnd: u16::from_be_bytes([data[14], data[15]]),
            urg: u16::from_be_bytes([data[18], data[19]]),
            options: &data[TCP_HLEN..offset],
        })
    }

    fn flags(&self) -> u16 {
        self.off_flags & 0x003F
    }

    fn offset(&self) -> usize {
        (((self.off_flags & 0xF000) >> 12) * 4) as usize
    }

    /// Walk the options for an MSS value; malformed options poison the
    /// whole segment.
    fn mss_option(&self) -> Result<Option<u16>, ()> {
        let o = self.options;
        let mut j = 0;
        let mut mss = None;

        while j < o.len() {
            match o[j] {
                TCP_OPT_EOL => break,
                TCP_OPT_NOP => j += 1,
                TCP_OPT_MSS => {
                    if j + 4 > o.len() || o[j + 1] != 4 {
                        return Err(());
                    }
                    mss = Some(u16::from_be_bytes([o[j + 2], o[j + 3]]));
                    j += 4;
                }
                _ => {
                    // Skip unknown options by their length byte.
                    if j + 1 >= o.len() || o[j + 1] == 0 || j + o[j + 1] as usize > o.len() {
                        return Err(());
                    }
                    j += o[j + 1] as usize;
                }
            }
        }

        Ok(mss)
    }
}

/// One incoming connection parked on a listening socket.
struct Lsock {
    local: SockAddr,
    remote: SockAddr,
    isn: u32,
    wnd: u32,
    mss: u16,
}

/// Send-side sequence variables.
#[derive(Debug, Clone, Copy, Default)]
struct SndRec {
    una: u32,
    nxt: u32,
    wnd: u32,
    wl1: u32,
    wl2: u32,
    iss: u32,
    mss: u16,
}

/// Receive-side sequence variables.
#[derive(Debug, Clone, Copy, Default)]
struct RcvRec {
    nxt: u32,
    wnd: u32,
    up: u32,
    irs: u32,
}

/// State for a connected (or connecting) socket.
struct ConnData {
    snd: SndRec,
    rcv: RcvRec,

    rcvbuf: Vec<u8>,
    rcv_head: usize,
    rcv_tail: usize,
    rcv_cur: usize,

    sndbuf: Vec<u8>,
    snd_head: usize,
    snd_acked: usize,
    snd_tail: usize,
    snd_cur: usize,

    /// Last transmission attempt, for the retransmission tick.
    timer: u64,
}

impl ConnData {
    fn new() -> Box<ConnData> {
        Box::new(ConnData {
            snd: SndRec::default(),
            rcv: RcvRec {
                wnd: TCP_DEFAULT_WINDOW,
                ..RcvRec::default()
            },
            rcvbuf: alloc::vec![0u8; TCP_DEFAULT_WINDOW as usize],
            rcv_head: 0,
            rcv_tail: 0,
            rcv_cur: 0,
            sndbuf: alloc::vec![0u8; TCP_DEFAULT_WINDOW as usize],
            snd_head: 0,
            snd_acked: 0,
            snd_tail: 0,
            snd_cur: 0,
            timer: 0,
        })
    }
}

/// State for a listening socket.
struct ListenData {
    backlog: usize,
    queue: VecDeque<Lsock>,
    /// accept() is mid-construction of a socket; incoming SYNs for the
    /// listener are dropped until the new socket is visible.
    accepting: bool,
    /// accept() is parked on the condvar; close() must let it tear the
    /// socket down.
    accept_wait: bool,
}

/// The three socket shapes.
enum Kind {
    Fresh,
    Listen(ListenData),
    Data(Box<ConnData>),
}

struct TcpSock {
    domain: Domain,
    local: SockAddr,
    remote: SockAddr,
    flags: SockFlags,
    intflags: IntFlags,
    state: TcpState,
    /// The connection took an RST.
    reset: bool,
    kind: Kind,
}

impl TcpSock {
    fn data(&mut self) -> Option<&mut ConnData> {
        match &mut self.kind {
            Kind::Data(d) => Some(d),
            _ => None,
        }
    }

    fn listen_data(&mut self) -> Option<&mut ListenData> {
        match &mut self.kind {
            Kind::Listen(l) => Some(l),
            _ => None,
        }
    }
}

/// One socket: its sleeping mutex, its condvars, and the state cell.
struct TcpCell {
    id: SockId,
    mutex: Mutex,
    cv_send: Condvar,
    cv_recv: Condvar,
    cv_listen: Condvar,
    sock: SpinMutex<TcpSock>,
}

/// Guard pairing for the per-socket mutex.
struct CellGuard<'a> {
    cell: &'a TcpCell,
}

impl<'a> CellGuard<'a> {
    fn lock(cell: &'a TcpCell) -> Result<Self, Errno> {
        if sched::in_irq() {
            cell.mutex.try_lock()?;
        } else {
            cell.mutex.lock()?;
        }
        Ok(Self { cell })
    }
}

impl Drop for CellGuard<'_> {
    fn drop(&mut self) {
        let _ = self.cell.mutex.unlock();
    }
}

/// Guards for the socket-list semaphore.
struct ReadGuard;

impl ReadGuard {
    fn lock() -> Result<Self, Errno> {
        let s = sem();
        if sched::in_irq() {
            s.try_read_lock()?;
        } else {
            s.read_lock()?;
        }
        Ok(Self)
    }
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        let _ = sem().read_unlock();
    }
}

struct WriteGuard;

impl WriteGuard {
    fn lock() -> Result<Self, Errno> {
        let s = sem();
        if sched::in_irq() {
            s.try_write_lock()?;
        } else {
            s.write_lock()?;
        }
        Ok(Self)
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let _ = sem().write_unlock();
    }
}

lazy_static::lazy_static! {
    /// The socket-list lock (see the locking notes up top).
    static ref TCP_SEM: RwSem = RwSem::new();
}

fn sem() -> &'static RwSem {
    &TCP_SEM
}

/// The socket list. New sockets go at the head, so fully-established
/// sockets shadow the half-built listen entries on the same port during
/// matching.
static SOCKS: SpinMutex<Vec<Arc<TcpCell>>> = SpinMutex::new(Vec::new());

static CB_ID: SpinMutex<Option<i32>> = SpinMutex::new(None);

fn find_cell(id: SockId) -> Option<Arc<TcpCell>> {
    SOCKS.lock().iter().find(|c| c.id == id).cloned()
}

/// Match an incoming segment to a socket. Fully-specified sockets win
/// by virtue of sitting nearer the head of the list.
fn find_sock(src: &Ipv6Addr, dst: &Ipv6Addr, sport: u16, dport: u16, domain: Domain) -> Option<Arc<TcpCell>> {
    let socks = SOCKS.lock();

    for cell in socks.iter() {
        let s = cell.sock.lock();

        // Ignore closed sockets.
        if s.state == TcpState::Closed {
            continue;
        }

        // Domain gate.
        match domain {
            Domain::V4 => {
                if s.flags.contains(SockFlags::V6ONLY) {
                    continue;
                }
            }
            Domain::V6 => {
                if s.domain == Domain::V4 {
                    continue;
                }
            }
        }

        // Remote end, when pinned, must match.
        if !s.remote.addr.is_unspecified() && (s.remote.addr != *src || s.remote.port != sport) {
            continue;
        }

        // Local end.
        if (!s.local.addr.is_unspecified() && s.local.addr != *dst) || s.local.port != dport {
            continue;
        }

        drop(s);
        return Some(cell.clone());
    }

    None
}

/*****************************************************************************/
/* Wire output */

fn tx_segment(
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    seg: &mut Vec<u8>,
) -> Result<(), Errno> {
    let cs = checksum::checksum(
        seg,
        checksum::pseudo_v6(src, dst, seg.len() as u32, PROTO_TCP),
    );
    seg[16..18].copy_from_slice(&cs.to_be_bytes());
    ipv6::send(None, seg, 0, PROTO_TCP, src, dst)
}

fn build_header(
    seg: &mut Vec<u8>,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u16,
    offset_words: u16,
    wnd: u16,
) {
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.extend_from_slice(&((offset_words << 12) | flags).to_be_bytes());
    seg.extend_from_slice(&wnd.to_be_bytes());
    seg.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
}

/// Targeted RST, used when tearing down queued listen connections.
fn tcp_rst(
    src: &Ipv6Addr,
    dst: &Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    flags: u16,
    seq: u32,
    ack: u32,
) {
    let mut seg = Vec::with_capacity(TCP_HLEN);
    build_header(&mut seg, src_port, dst_port, seq, ack, flags, 5, 0);
    let _ = tx_segment(src, dst, &mut seg);
}

/// Stateless RST answering a segment that matched no socket: with an
/// incoming ACK, take its ack as our sequence; otherwise ACK everything
/// the segment covered from sequence zero.
fn tcp_bpkt_rst(src: &Ipv6Addr, dst: &Ipv6Addr, hdr: &TcpHdr<'_>, mut size: usize) {
    let flags = hdr.flags();

    if flags & TCP_FLAG_SYN != 0 {
        size += 1;
    }
    if flags & TCP_FLAG_FIN != 0 {
        size += 1;
    }

    let (seq, ack, out_flags) = if flags & TCP_FLAG_ACK != 0 {
        (hdr.ack, 0, TCP_FLAG_RST)
    } else {
        (0, hdr.seq.wrapping_add(size as u32), TCP_FLAG_RST | TCP_FLAG_ACK)
    };

    let mut seg = Vec::with_capacity(TCP_HLEN);
    build_header(&mut seg, hdr.dst_port, hdr.src_port, seq, ack, out_flags, 5, 0);
    let _ = tx_segment(dst, src, &mut seg);
}

/// <SYN> or <SYN,ACK> with the MSS option.
fn tcp_send_syn(s: &mut TcpSock, ack: bool) -> Result<(), Errno> {
    let (local, remote) = (s.local, s.remote);
    let Some(d) = s.data() else {
        return Err(Errno::EINVAL);
    };

    let flags = if ack {
        TCP_FLAG_SYN | TCP_FLAG_ACK
    } else {
        TCP_FLAG_SYN
    };

    let mut seg = Vec::with_capacity(TCP_HLEN + 4);
    build_header(
        &mut seg,
        local.port,
        remote.port,
        d.snd.iss,
        d.rcv.nxt,
        flags,
        6,
        d.rcv.wnd as u16,
    );
    seg.extend_from_slice(&[TCP_OPT_MSS, 4]);
    seg.extend_from_slice(&TCP_DEFAULT_MSS.to_be_bytes());

    tx_segment(&local.addr, &remote.addr, &mut seg)
}

fn tcp_send_fin_ack(s: &mut TcpSock) {
    let (local, remote) = (s.local, s.remote);
    let Some(d) = s.data() else { return };

    let mut seg = Vec::with_capacity(TCP_HLEN);
    build_header(
        &mut seg,
        local.port,
        remote.port,
        d.snd.nxt,
        d.rcv.nxt,
        TCP_FLAG_FIN | TCP_FLAG_ACK,
        5,
        d.rcv.wnd as u16,
    );
    let _ = tx_segment(&local.addr, &remote.addr, &mut seg);
}

fn tcp_send_ack(s: &mut TcpSock) {
    let (local, remote) = (s.local, s.remote);
    let Some(d) = s.data() else { return };

    let mut seg = Vec::with_capacity(TCP_HLEN);
    build_header(
        &mut seg,
        local.port,
        remote.port,
        d.snd.nxt,
        d.rcv.nxt,
        TCP_FLAG_ACK,
        5,
        d.rcv.wnd as u16,
    );
    let _ = tx_segment(&local.addr, &remote.addr, &mut seg);
}

/// The send engine: emit segments from the circular send buffer while
/// window room remains, bounded by the MSS. With `resend` the walk
/// restarts from SND.UNA instead of SND.NXT.
fn tcp_send_data(s: &mut TcpSock, resend: bool) {
    let (local, remote) = (s.local, s.remote);
    let Some(d) = s.data() else { return };

    let mut wnd = d.snd.wnd as usize;
    let (mut seq, mut unacked, mut head) = if !resend {
        let unacked = d.snd.nxt.wrapping_sub(d.snd.una) as usize;
        wnd = wnd.saturating_sub(unacked);
        (d.snd.nxt, unacked, d.snd_head)
    } else {
        (d.snd.una, 0, d.snd_acked)
    };

    // A zero window still probes with one byte.
    if wnd == 0 {
        wnd = 1;
    }

    let mss_room = (d.snd.mss as usize).saturating_sub(TCP_HLEN).max(1);

    while d.snd_cur > unacked && wnd > 0 {
        let snd = wnd.min(mss_room).min(d.snd_cur - unacked);

        let mut seg = Vec::with_capacity(TCP_HLEN + snd);
        build_header(
            &mut seg,
            local.port,
            remote.port,
            seq,
            d.rcv.nxt,
            TCP_FLAG_ACK,
            5,
            d.rcv.wnd as u16,
        );

        // Copy out of the circular buffer.
        if head + snd <= d.sndbuf.len() {
            seg.extend_from_slice(&d.sndbuf[head..head + snd]);
            head += snd;
            if head == d.sndbuf.len() {
                head = 0;
            }
        } else {
            let first = d.sndbuf.len() - head;
            seg.extend_from_slice(&d.sndbuf[head..]);
            seg.extend_from_slice(&d.sndbuf[..snd - first]);
            head = snd - first;
        }

        let _ = tx_segment(&local.addr, &remote.addr, &mut seg);

        wnd -= snd.min(wnd);
        seq = seq.wrapping_add(snd as u32);
        unacked += snd;
    }

    d.timer = timer::uptime_ms();
    if !resend {
        d.snd_head = head;
        d.snd.nxt = seq;
    }
}

/*****************************************************************************/
/* Inbound processing */

/// SEGMENT ARRIVES for a LISTEN socket (RFC 793 pp. 65-66). Most of the
/// work waits for accept(); here the connection is only queued.
fn listen_pkt(cell: &TcpCell, src: &Ipv6Addr, dst: &Ipv6Addr, hdr: &TcpHdr<'_>) -> i32 {
    let flags = hdr.flags();

    // Incoming RSTs are ignored; incoming ACKs draw a RST.
    if flags & TCP_FLAG_RST != 0 {
        return 0;
    }
    if flags & TCP_FLAG_ACK != 0 {
        return -1;
    }
    if flags & TCP_FLAG_SYN == 0 {
        return 0;
    }

    // Parse options now, for the peer's MSS.
    let mss = match hdr.mss_option() {
        Ok(m) => m.unwrap_or(536).min(TCP_DEFAULT_MSS),
        Err(()) => return -1,
    };

    let mut s = cell.sock.lock();
    let remote = SockAddr::new(*src, hdr.src_port);
    let local = SockAddr::new(*dst, hdr.dst_port);
    let isn = hdr.seq;
    let wnd = hdr.wnd as u32;

    let Some(l) = s.listen_data() else { return -1 };

    // A retransmitted SYN refreshes its queue entry.
    for q in l.queue.iter_mut() {
        if q.remote == remote && q.local.addr == local.addr {
            q.isn = isn;
            q.mss = mss;
            return 0;
        }
    }

    if l.queue.len() >= l.backlog {
        return -1;
    }

    l.queue.push_back(Lsock {
        local,
        remote,
        isn,
        wnd,
        mss,
    });

    drop(s);
    // Wake anyone parked in accept().
    cell.cv_listen.signal();
    0
}

/// SEGMENT ARRIVES in SYN-SENT (RFC 793 pp. 66-68).
fn synsent_pkt(cell: &TcpCell, src: &Ipv6Addr, dst: &Ipv6Addr, hdr: &TcpHdr<'_>, data: &[u8]) -> i32 {
    let flags = hdr.flags();
    let ack = hdr.ack;
    let seq = hdr.seq;
    let sz = data.len() - hdr.offset();

    let mut s = cell.sock.lock();
    let mut gotack = false;

    // First, the ACK bit.
    if flags & TCP_FLAG_ACK != 0 {
        gotack = true;
        let bad = s
            .data()
            .map(|d| seq_le(ack, d.snd.iss) || seq_gt(ack, d.snd.nxt))
            .unwrap_or(true);
        if bad {
            drop(s);
            tcp_bpkt_rst(src, dst, hdr, sz);
            return 0;
        }
    }

    // Next, the RST bit.
    if flags & TCP_FLAG_RST != 0 {
        if gotack {
            s.state = TcpState::Closed;
            s.reset = true;
            drop(s);
            cell.cv_recv.signal();
            cell.cv_send.signal();
        }
        return 0;
    }

    // Finally, the SYN.
    if flags & TCP_FLAG_SYN != 0 {
        let mss = match hdr.mss_option() {
            Ok(m) => m.unwrap_or(536).min(TCP_DEFAULT_MSS),
            Err(()) => return -1,
        };
        let wnd = hdr.wnd;

        {
            let Some(d) = s.data() else { return 0 };
            d.rcv.nxt = seq.wrapping_add(1);
            d.rcv.irs = seq;
            d.snd.mss = mss;
            d.snd.wnd = wnd as u32;
        }

        if gotack {
            let established = {
                let Some(d) = s.data() else { return 0 };
                d.snd.una = ack;
                seq_gt(ack, d.snd.iss)
            };

            if established {
                // The ack covers our ISS: connection up, ack theirs.
                s.state = TcpState::Established;
                tcp_send_ack(&mut s);
                drop(s);
                cell.cv_send.signal();
            }
        } else {
            // Simultaneous open.
            s.state = TcpState::SynReceived;
            let _ = tcp_send_syn(&mut s, true);
            drop(s);
            cell.cv_send.signal();
        }
    }

    0
}

/// SEGMENT ARRIVES in the synchronized states (RFC 793 pp. 69-76).
fn process_pkt(cell: &TcpCell, src: &Ipv6Addr, dst: &Ipv6Addr, hdr: &TcpHdr<'_>, data: &[u8]) -> i32 {
    let flags = hdr.flags();
    let seq = hdr.seq;
    let ack = hdr.ack;
    let payload = &data[hdr.offset()..];
    let mut sz = payload.len();

    let mut s = cell.sock.lock();
    let mut bad_pkt = false;

    // First: is the sequence number inside our receive window? A
    // rejected segment (except a RST) is answered with an ACK carrying
    // our current state.
    {
        let Some(d) = s.data() else { return -1 };
        if d.rcv.wnd == 0 {
            if sz != 0 || seq != d.rcv.nxt {
                bad_pkt = true;
            }
        } else if !(seq_ge(seq, d.rcv.nxt) && seq_lt(seq, d.rcv.nxt.wrapping_add(d.rcv.wnd))) {
            bad_pkt = true;
        }
    }

    if bad_pkt {
        if flags & TCP_FLAG_RST == 0 {
            tcp_send_ack(&mut s);
        }
        return 0;
    }

    // Second: RST processing. Valid in-window RSTs kill the connection
    // and release both directions.
    if flags & TCP_FLAG_RST != 0 {
        s.state = TcpState::Closed;
        s.reset = true;
        drop(s);
        cell.cv_recv.signal();
        cell.cv_send.signal();
        return 0;
    }

    // Third: an in-window SYN means the peer re-opened; reset.
    if flags & TCP_FLAG_SYN != 0 {
        drop(s);
        tcp_bpkt_rst(src, dst, hdr, sz);
        return 0;
    }

    // Fourth: everything from here on needs an ACK.
    if flags & TCP_FLAG_ACK == 0 {
        return 0;
    }

    let mut acksyn = 0u32;

    if s.state == TcpState::SynReceived {
        let ok = {
            let Some(d) = s.data() else { return -1 };
            seq_le(d.snd.una, ack) && seq_le(ack, d.snd.nxt)
        };
        if ok {
            s.state = TcpState::Established;
            acksyn = 1;
        } else {
            drop(s);
            tcp_bpkt_rst(src, dst, hdr, sz);
            return 0;
        }
    }

    // Fifth: advance SND.UNA, reclaim acked bytes from the send buffer,
    // and track the send window per the WL1/WL2 rules.
    let mut wake_sender = false;
    let ack_action = {
        let wnd = hdr.wnd;
        let Some(d) = s.data() else { return -1 };

        if seq_lt(d.snd.una, ack) && seq_le(ack, d.snd.nxt) {
            let newly = ack.wrapping_sub(d.snd.una).wrapping_sub(acksyn) as usize;
            d.snd_acked += newly;
            d.snd_cur -= newly.min(d.snd_cur);
            d.snd.una = ack;
            wake_sender = true;

            if d.snd_acked >= d.sndbuf.len() {
                d.snd_acked -= d.sndbuf.len();
            }

            if seq_lt(d.snd.wl1, seq) || (d.snd.wl1 == seq && seq_le(d.snd.wl2, ack)) {
                d.snd.wnd = wnd as u32;
                d.snd.wl1 = seq;
                d.snd.wl2 = ack;
            }
            0
        } else if seq_gt(ack, d.snd.nxt) {
            // This ACKs something we haven't sent; correct the peer.
            1
        } else {
            0
        }
    };

    if ack_action == 1 {
        tcp_send_ack(&mut s);
        return 0;
    }

    if wake_sender {
        cell.cv_send.signal();
    }

    // State-specific ACK handling.
    let now = timer::uptime_ms();
    match s.state {
        TcpState::FinWait1 => {
            let fin_acked = s.data().map(|d| ack == d.snd.nxt).unwrap_or(false);
            if fin_acked {
                s.state = TcpState::FinWait2;
            }
        }
        TcpState::Closing => {
            let fin_acked = s.data().map(|d| ack == d.snd.nxt).unwrap_or(false);
            if fin_acked {
                s.state = TcpState::TimeWait;
                if let Some(d) = s.data() {
                    d.timer = now;
                }
            } else {
                return 0;
            }
        }
        TcpState::LastAck => {
            let fin_acked = s.data().map(|d| ack == d.snd.nxt).unwrap_or(false);
            if fin_acked {
                s.state = TcpState::Closed;
                return 0;
            }
        }
        TcpState::TimeWait => {
            // ACK the peer's FIN again and restart the 2MSL clock.
            if let Some(d) = s.data() {
                d.timer = now;
            }
            tcp_send_ack(&mut s);
        }
        _ => {}
    }

    // Sixth: URG records the urgent pointer; it is not surfaced.
    if flags & TCP_FLAG_URG != 0
        && matches!(
            s.state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    {
        let up = seq.wrapping_add(hdr.urg as u32);
        if let Some(d) = s.data() {
            if seq_gt(up, d.rcv.up) {
                d.rcv.up = up;
            }
        }
    }

    // Seventh: take the payload into the receive buffer, advance
    // RCV.NXT, shrink the window, and ACK.
    let mut wake_reader = false;
    if matches!(
        s.state,
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
    ) {
        let copied = {
            let Some(d) = s.data() else { return -1 };

            if sz > d.rcv.wnd as usize {
                // Truncate to the window; the FIN (if any) cannot be
                // acked off a clipped segment.
                sz = d.rcv.wnd as usize;
                bad_pkt = true;
            }

            if sz != 0 {
                let mut buf = &payload[..sz];
                d.rcv.nxt = d.rcv.nxt.wrapping_add(sz as u32);
                d.rcv.wnd -= sz as u32;
                d.rcv_cur += sz;

                if d.rcv_tail + sz <= d.rcvbuf.len() {
                    d.rcvbuf[d.rcv_tail..d.rcv_tail + sz].copy_from_slice(buf);
                    d.rcv_tail += sz;
                    if d.rcv_tail == d.rcvbuf.len() {
                        d.rcv_tail = 0;
                    }
                } else {
                    let first = d.rcvbuf.len() - d.rcv_tail;
                    d.rcvbuf[d.rcv_tail..].copy_from_slice(&buf[..first]);
                    buf = &buf[first..];
                    let rest = buf.len();
                    d.rcvbuf[..rest].copy_from_slice(buf);
                    d.rcv_tail = rest;
                }
                true
            } else {
                false
            }
        };

        if copied {
            wake_reader = true;
            tcp_send_ack(&mut s);
        }
    } else if sz != 0 {
        // Segment text in a closing state: the peer is confused.
        bad_pkt = true;
    }

    // Eighth: FIN processing, skipped when the segment was over-long.
    if !bad_pkt && flags & TCP_FLAG_FIN != 0 {
        if let Some(d) = s.data() {
            d.rcv.nxt = d.rcv.nxt.wrapping_add(1);
        }
        tcp_send_ack(&mut s);
        wake_reader = true;

        match s.state {
            TcpState::SynReceived | TcpState::Established => {
                s.state = TcpState::CloseWait;
            }
            TcpState::FinWait1 => {
                let fin_acked = s.data().map(|d| !seq_lt(ack, d.snd.nxt)).unwrap_or(false);
                if fin_acked {
                    s.state = TcpState::TimeWait;
                    if let Some(d) = s.data() {
                        d.timer = timer::uptime_ms();
                    }
                } else {
                    s.state = TcpState::Closing;
                }
            }
            TcpState::FinWait2 => {
                s.state = TcpState::TimeWait;
                if let Some(d) = s.data() {
                    d.timer = timer::uptime_ms();
                }
            }
            TcpState::TimeWait => {
                if let Some(d) = s.data() {
                    d.timer = timer::uptime_ms();
                }
            }
            _ => {}
        }
    }

    drop(s);
    if wake_reader {
        cell.cv_recv.signal();
    }
    0
}

/*****************************************************************************/
/* The periodic tick */

/// Retransmission, deferred FINs, TIME-WAIT expiry, and reaping of
/// descriptorless sockets. Runs every 50ms off the network worker.
fn tcp_tick() {
    let Ok(_rg) = ReadGuard::lock() else { return };

    let cells: Vec<Arc<TcpCell>> = SOCKS.lock().clone();

    for cell in &cells {
        let Ok(_g) = CellGuard::lock(cell) else {
            continue;
        };
        let now = timer::uptime_ms();
        let mut s = cell.sock.lock();

        match s.state {
            TcpState::SynSent => {
                // Our last <SYN> may be lost; try again after the RTO.
                let resend = s
                    .data()
                    .map(|d| d.timer + TCP_DEFAULT_RTTO_MS <= now)
                    .unwrap_or(false);
                if resend {
                    let _ = tcp_send_syn(&mut s, false);
                    if let Some(d) = s.data() {
                        d.timer = now;
                    }
                }
            }

            TcpState::SynReceived => {
                let resend = s
                    .data()
                    .map(|d| d.timer + TCP_DEFAULT_RTTO_MS <= now)
                    .unwrap_or(false);
                if resend {
                    let _ = tcp_send_syn(&mut s, true);
                    if let Some(d) = s.data() {
                        d.timer = now;
                    }
                }
            }

            TcpState::TimeWait => {
                // After 2MSL the connection evaporates; the descriptor
                // was already dealt with by close().
                let expired = s
                    .data()
                    .map(|d| d.timer + 2 * TCP_DEFAULT_MSL_MS <= now)
                    .unwrap_or(true);
                if expired {
                    s.state = TcpState::Closed;
                }
            }

            TcpState::Established | TcpState::CloseWait => {
                let (has_data, stale) = s
                    .data()
                    .map(|d| (d.snd_cur > 0, d.timer + TCP_DEFAULT_RTTO_MS <= now))
                    .unwrap_or((false, false));

                if has_data && stale {
                    tcp_send_data(&mut s, true);
                } else if !has_data && s.intflags.contains(IntFlags::QUEUEDCLOSE) {
                    // The close that was waiting on the data can have
                    // its FIN now.
                    s.state = if s.state == TcpState::Established {
                        TcpState::FinWait1
                    } else {
                        TcpState::Closing
                    };
                    tcp_send_fin_ack(&mut s);
                    if let Some(d) = s.data() {
                        d.snd.nxt = d.snd.nxt.wrapping_add(1);
                    }
                    s.intflags.remove(IntFlags::QUEUEDCLOSE);
                }
            }

            _ => {}
        }
    }

    drop(_rg);

    // Reap sockets whose descriptor is gone and that have fully closed.
    if let Ok(_wg) = WriteGuard::lock() {
        SOCKS.lock().retain(|cell| {
            let s = cell.sock.lock();
            !(s.intflags.contains(IntFlags::CANBEDEL) && s.state == TcpState::Closed)
        });
    }
}

/*****************************************************************************/
/* The protocol vtable */

pub struct TcpProto;

impl TcpProto {
    fn pick_ephemeral(&self, skip: SockId) -> u16 {
        let socks = SOCKS.lock();
        let mut port = 1024u16;
        loop {
            let taken = socks.iter().any(|c| {
                c.id != skip && {
                    let s = c.sock.lock();
                    s.local.port == port
                }
            });
            if !taken {
                return port;
            }
            port += 1;
        }
    }
}

impl SocketProto for TcpProto {
    fn socket(&self, id: SockId, domain: Domain) -> Result<(), Errno> {
        let cell = Arc::new(TcpCell {
            id,
            mutex: Mutex::new(),
            cv_send: Condvar::new(),
            cv_recv: Condvar::new(),
            cv_listen: Condvar::new(),
            sock: SpinMutex::new(TcpSock {
                domain,
                local: SockAddr::ANY,
                remote: SockAddr::ANY,
                flags: SockFlags::empty(),
                intflags: IntFlags::empty(),
                state: TcpState::Closed,
                reset: false,
                kind: Kind::Fresh,
            }),
        });

        let _wg = WriteGuard::lock()?;
        SOCKS.lock().insert(0, cell);
        Ok(())
    }

    fn close(&self, id: SockId) {
        loop {
            let Ok(_wg) = WriteGuard::lock() else { return };
            let Some(cell) = find_cell(id) else { return };
            let Ok(_g) = CellGuard::lock(&cell) else { return };

            let mut s = cell.sock.lock();

            // accept() is mid-construction; come back around.
            if s.state == TcpState::Listen {
                if let Some(l) = s.listen_data() {
                    if l.accepting {
                        drop(s);
                        drop(_g);
                        drop(_wg);
                        if sched::in_irq() {
                            return;
                        }
                        sched::yield_now();
                        continue;
                    }
                }
            }

            let mut remove_now = false;

            match s.state {
                TcpState::Listen => {
                    let local = s.local;
                    if let Some(l) = s.listen_data() {
                        // Reset every queued connection.
                        let queued: Vec<Lsock> = l.queue.drain(..).collect();
                        let accept_wait = l.accept_wait;
                        for q in queued {
                            tcp_rst(
                                &local.addr,
                                &q.remote.addr,
                                q.local.port,
                                q.remote.port,
                                TCP_FLAG_ACK | TCP_FLAG_RST,
                                0,
                                q.isn.wrapping_add(1),
                            );
                        }

                        if accept_wait {
                            // Let the parked accept() tear things down.
                            s.state = TcpState::Closed;
                            drop(s);
                            cell.cv_listen.broadcast();
                            return;
                        }
                    }
                    remove_now = true;
                }

                TcpState::SynSent => {
                    remove_now = true;
                }

                TcpState::Established | TcpState::CloseWait => {
                    let drained = s.data().map(|d| d.snd_cur == 0).unwrap_or(true);
                    if drained {
                        let next = if s.state == TcpState::Established {
                            TcpState::FinWait1
                        } else {
                            TcpState::Closing
                        };
                        tcp_send_fin_ack(&mut s);
                        if let Some(d) = s.data() {
                            d.snd.nxt = d.snd.nxt.wrapping_add(1);
                        }
                        s.state = next;
                    } else {
                        // The tick sends the FIN once the data drains.
                        s.intflags.insert(IntFlags::QUEUEDCLOSE);
                    }
                }

                TcpState::SynReceived => {
                    tcp_send_fin_ack(&mut s);
                    if let Some(d) = s.data() {
                        d.snd.nxt = d.snd.nxt.wrapping_add(1);
                    }
                    s.state = TcpState::FinWait1;
                }

                TcpState::Closed => {
                    // Also covers reset connections: no network action.
                    remove_now = true;
                }

                TcpState::FinWait1 | TcpState::FinWait2 => {}

                TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => {
                    log::debug!("net_tcp: close() on socket in invalid state");
                }
            }

            if remove_now {
                drop(s);
                SOCKS.lock().retain(|c| c.id != id);
            } else {
                s.intflags.insert(IntFlags::CANBEDEL);
            }
            return;
        }
    }

    fn bind(&self, id: SockId, addr: SockAddr) -> Result<(), Errno> {
        // The write lock, even though the list is not modified: a
        // duplicate-port scan under the read lock could deadlock
        // against a concurrent bind on the per-socket mutexes.
        let _wg = WriteGuard::lock()?;
        let cell = find_cell(id).ok_or(Errno::EBADF)?;
        let _g = CellGuard::lock(&cell)?;

        {
            let s = cell.sock.lock();
            match s.state {
                TcpState::Listen => return Err(Errno::EINVAL),
                TcpState::Closed => {}
                _ => return Err(Errno::EISCONN),
            }
            if s.local.port != 0 {
                return Err(Errno::EINVAL);
            }
            if s.domain == Domain::V4
                && !addr.addr.is_unspecified()
                && !super::netif::is_v4_mapped(&addr.addr)
            {
                return Err(Errno::EINVAL);
            }
        }

        let port = if addr.port != 0 {
            // No one else may hold this port.
            let socks = SOCKS.lock();
            for c in socks.iter() {
                if c.id == id {
                    continue;
                }
                if c.sock.lock().local.port == addr.port {
                    return Err(Errno::EADDRINUSE);
                }
            }
            addr.port
        } else {
            self.pick_ephemeral(id)
        };

        let mut s = cell.sock.lock();
        s.local = SockAddr::new(addr.addr, port);
        Ok(())
    }

    fn connect(&self, id: SockId, addr: SockAddr) -> Result<(), Errno> {
        if addr.addr.is_unspecified() || addr.port == 0 {
            return Err(Errno::EADDRNOTAVAIL);
        }

        let cell = {
            let _wg = WriteGuard::lock()?;
            let cell = find_cell(id).ok_or(Errno::EBADF)?;
            let _g = CellGuard::lock(&cell)?;

            {
                let s = cell.sock.lock();
                match s.state {
                    TcpState::Closed => {}
                    TcpState::Listen => return Err(Errno::EOPNOTSUPP),
                    TcpState::SynSent => return Err(Errno::EALREADY),
                    _ => return Err(Errno::EISCONN),
                }
            }

            let port = {
                let s = cell.sock.lock();
                if s.local.port == 0 {
                    Some(self.pick_ephemeral(id))
                } else {
                    None
                }
            };

            let mut s = cell.sock.lock();
            if let Some(p) = port {
                s.local.port = p;
                if s.domain == Domain::V4 {
                    if let Some(dev) = super::default_dev() {
                        let ip = dev.lock().ip_addr;
                        if ip != [0; 4] {
                            s.local.addr = v4_mapped(ip);
                        }
                    }
                }
            }

            s.remote = addr;

            // Build the connection state and fire the <SYN>.
            let mut data = ConnData::new();
            data.snd.iss = (timer::uptime_us() >> 2) as u32;
            data.snd.una = data.snd.iss;
            data.snd.nxt = data.snd.iss.wrapping_add(1);
            data.timer = timer::uptime_ms();
            s.kind = Kind::Data(data);
            s.state = TcpState::SynSent;

            tcp_send_syn(&mut s, false)?;
            drop(s);

            cell.clone()
        };

        // Non-blocking connects report progress and bail.
        {
            let s = cell.sock.lock();
            if s.flags.contains(SockFlags::NONBLOCK) || sched::in_irq() {
                return Err(Errno::EINPROGRESS);
            }
        }

        // Block until the connection resolves, one way or the other.
        let _g = CellGuard::lock(&cell)?;
        let waited = cell.cv_send.wait(&cell.mutex, 2 * TCP_DEFAULT_MSL_MS);

        let mut s = cell.sock.lock();
        if waited == Err(Errno::ETIMEDOUT) {
            s.state = TcpState::Closed;
            return Err(Errno::ETIMEDOUT);
        }
        if s.reset {
            return Err(Errno::ECONNREFUSED);
        }
        Ok(())
    }

    fn listen(&self, id: SockId, backlog: usize) -> Result<(), Errno> {
        let backlog = backlog.clamp(1, SOMAXCONN);

        let _rg = ReadGuard::lock()?;
        let cell = find_cell(id).ok_or(Errno::EBADF)?;
        let _g = CellGuard::lock(&cell)?;

        let mut s = cell.sock.lock();
        if s.state != TcpState::Closed {
            return Err(Errno::EINVAL);
        }
        if s.local.port == 0 {
            return Err(Errno::EADDRNOTAVAIL);
        }

        s.kind = Kind::Listen(ListenData {
            backlog,
            queue: VecDeque::with_capacity(backlog),
            accepting: false,
            accept_wait: false,
        });
        s.state = TcpState::Listen;
        Ok(())
    }

    fn accept(&self, id: SockId) -> Result<(SockId, SockAddr), Errno> {
        let cell = {
            let _rg = ReadGuard::lock()?;
            find_cell(id).ok_or(Errno::EBADF)?
        };

        let guard = CellGuard::lock(&cell)?;

        // Pull a queued connection, blocking if allowed.
        let lsock = loop {
            let mut s = cell.sock.lock();

            if s.state != TcpState::Listen {
                if s.state == TcpState::Closed {
                    // close() won the race while we were waiting; finish
                    // the teardown from this side.
                    drop(s);
                    drop(guard);
                    let _wg = WriteGuard::lock()?;
                    SOCKS.lock().retain(|c| c.id != id);
                    return Err(Errno::EINTR);
                }
                return Err(Errno::EINVAL);
            }

            let nonblock = s.flags.contains(SockFlags::NONBLOCK) || sched::in_irq();
            let l = s.listen_data().ok_or(Errno::EINVAL)?;

            if let Some(ls) = l.queue.pop_front() {
                l.accepting = true;
                break ls;
            }

            if nonblock {
                return Err(Errno::EWOULDBLOCK);
            }

            l.accept_wait = true;
            drop(s);
            cell.cv_listen.wait(&cell.mutex, 0)?;
            let mut s = cell.sock.lock();
            if let Some(l) = s.listen_data() {
                l.accept_wait = false;
            }
        };

        // Build the new connection socket.
        let new_id = socket::next_id();
        let domain = cell.sock.lock().domain;

        let mut data = ConnData::new();
        data.snd.iss = (timer::uptime_us() >> 2) as u32;
        data.snd.nxt = data.snd.iss.wrapping_add(1);
        data.snd.una = data.snd.iss;
        data.snd.wnd = lsock.wnd;
        data.snd.wl1 = data.snd.iss;
        data.snd.mss = lsock.mss;
        data.rcv.nxt = lsock.isn.wrapping_add(1);
        data.rcv.irs = lsock.isn;
        data.rcv.wnd = TCP_DEFAULT_WINDOW;
        data.timer = timer::uptime_ms();

        let peer = lsock.remote;

        let new_cell = Arc::new(TcpCell {
            id: new_id,
            mutex: Mutex::new(),
            cv_send: Condvar::new(),
            cv_recv: Condvar::new(),
            cv_listen: Condvar::new(),
            sock: SpinMutex::new(TcpSock {
                domain,
                local: lsock.local,
                remote: lsock.remote,
                flags: SockFlags::empty(),
                intflags: IntFlags::empty(),
                state: TcpState::SynReceived,
                reset: false,
                kind: Kind::Data(data),
            }),
        });

        // Lock order is list-then-socket, and we hold the socket mutex,
        // so the listener is marked Accepting (refusing further SYNs)
        // while we let go of it to take the write lock. A retransmitted
        // SYN in that window is dropped rather than matched against a
        // half-visible socket.
        drop(guard);

        {
            let _wg = WriteGuard::lock()?;
            let _g = CellGuard::lock(&cell)?;

            {
                let mut ns = new_cell.sock.lock();
                let _ = tcp_send_syn(&mut ns, true);
                if let Some(d) = ns.data() {
                    d.timer = timer::uptime_ms();
                }
            }
            SOCKS.lock().insert(0, new_cell);

            let mut s = cell.sock.lock();
            if let Some(l) = s.listen_data() {
                l.accepting = false;
            }
        }

        Ok((new_id, peer))
    }

    fn recvfrom(&self, id: SockId, buf: &mut [u8], _peek: bool) -> Result<(usize, SockAddr), Errno> {
        let cell = {
            let _rg = ReadGuard::lock()?;
            find_cell(id).ok_or(Errno::EBADF)?
        };

        let _g = CellGuard::lock(&cell)?;

        loop {
            let mut s = cell.sock.lock();

            if s.flags.contains(SockFlags::SHUT_RD) {
                return Ok((0, s.remote));
            }
            if s.reset {
                return Err(Errno::ECONNRESET);
            }

            let nonblock = s.flags.contains(SockFlags::NONBLOCK) || sched::in_irq();
            let state = s.state;
            let peer = s.remote;
            let d = s.data().ok_or(Errno::ENOTCONN)?;

            if d.rcv_cur == 0 {
                // No more data will ever arrive in the closing states.
                if matches!(
                    state,
                    TcpState::Closed
                        | TcpState::CloseWait
                        | TcpState::Closing
                        | TcpState::LastAck
                        | TcpState::TimeWait
                ) {
                    return Ok((0, peer));
                }

                if nonblock {
                    return Err(Errno::EWOULDBLOCK);
                }

                drop(s);
                cell.cv_recv.wait(&cell.mutex, 0)?;
                continue;
            }

            // Copy out of the circular buffer and open the window back up.
            let size = core::cmp::min(buf.len(), d.rcv_cur);
            d.rcv.wnd += size as u32;
            d.rcv_cur -= size;

            if d.rcv_head + size <= d.rcvbuf.len() {
                buf[..size].copy_from_slice(&d.rcvbuf[d.rcv_head..d.rcv_head + size]);
                d.rcv_head += size;
                if d.rcv_head == d.rcvbuf.len() {
                    d.rcv_head = 0;
                }
            } else {
                let first = d.rcvbuf.len() - d.rcv_head;
                buf[..first].copy_from_slice(&d.rcvbuf[d.rcv_head..]);
                buf[first..size].copy_from_slice(&d.rcvbuf[..size - first]);
                d.rcv_head = size - first;
            }

            if d.rcv_cur == 0 {
                d.rcv_head = 0;
                d.rcv_tail = 0;
            }

            return Ok((size, peer));
        }
    }

    fn sendto(&self, id: SockId, buf: &[u8], addr: Option<SockAddr>) -> Result<usize, Errno> {
        // A destination on a stream socket is a caller error.
        if addr.is_some() {
            return Err(Errno::EISCONN);
        }

        let cell = {
            let _rg = ReadGuard::lock()?;
            find_cell(id).ok_or(Errno::EBADF)?
        };

        let _g = CellGuard::lock(&cell)?;

        let mut waited = false;
        loop {
            let mut s = cell.sock.lock();

            if s.flags.contains(SockFlags::SHUT_WR) {
                return Err(Errno::EPIPE);
            }

            match s.state {
                TcpState::Closed if s.reset => return Err(Errno::ECONNRESET),
                TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                    return Err(Errno::ENOTCONN)
                }
                TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait => return Err(Errno::EPIPE),
                _ => {}
            }

            let nonblock = s.flags.contains(SockFlags::NONBLOCK) || sched::in_irq();
            let reset = s.reset;
            let d = s.data().ok_or(Errno::ENOTCONN)?;

            if d.snd_cur == d.sndbuf.len() {
                if nonblock {
                    return Err(Errno::EWOULDBLOCK);
                }
                if waited {
                    // Still no room after a wake: the connection went
                    // away underneath us.
                    return Err(if reset {
                        Errno::ECONNRESET
                    } else {
                        Errno::ENOTCONN
                    });
                }

                drop(s);
                cell.cv_send.wait(&cell.mutex, 0)?;
                waited = true;
                continue;
            }

            // Pointers park at zero whenever the buffer fully drains.
            if d.snd_cur == 0 {
                d.snd_head = 0;
                d.snd_acked = 0;
                d.snd_tail = 0;
            }

            let room = d.sndbuf.len() - d.snd_cur;
            let size = core::cmp::min(buf.len(), room);

            if d.snd_tail + size <= d.sndbuf.len() {
                d.sndbuf[d.snd_tail..d.snd_tail + size].copy_from_slice(&buf[..size]);
                d.snd_tail += size;
                if d.snd_tail == d.sndbuf.len() {
                    d.snd_tail = 0;
                }
            } else {
                let first = d.sndbuf.len() - d.snd_tail;
                d.sndbuf[d.snd_tail..].copy_from_slice(&buf[..first]);
                d.sndbuf[..size - first].copy_from_slice(&buf[first..size]);
                d.snd_tail = size - first;
            }

            d.snd_cur += size;

            // Push it onto the wire.
            tcp_send_data(&mut s, false);
            return Ok(size);
        }
    }

    fn shutdown(&self, id: SockId, how: u32) -> Result<(), Errno> {
        if how & !SHUT_RDWR != 0 || how == 0 {
            return Err(Errno::EINVAL);
        }

        let _rg = ReadGuard::lock()?;
        let cell = find_cell(id).ok_or(Errno::EBADF)?;
        let _g = CellGuard::lock(&cell)?;

        let mut s = cell.sock.lock();
        if how & SHUT_RD != 0 {
            s.flags.insert(SockFlags::SHUT_RD);
        }
        if how & SHUT_WR != 0 {
            s.flags.insert(SockFlags::SHUT_WR);
        }
        Ok(())
    }

    fn set_nonblock(&self, id: SockId, nb: bool) -> Result<(), Errno> {
        let _rg = ReadGuard::lock()?;
        let cell = find_cell(id).ok_or(Errno::EBADF)?;
        let _g = CellGuard::lock(&cell)?;

        cell.sock.lock().flags.set(SockFlags::NONBLOCK, nb);
        Ok(())
    }

    fn getsockopt(&self, id: SockId, level: i32, opt: i32) -> Result<i32, Errno> {
        let cell = find_cell(id).ok_or(Errno::EBADF)?;
        let s = cell.sock.lock();

        match (level, opt) {
            (SOL_SOCKET, SO_TYPE) => Ok(1), // SOCK_STREAM
            (SOL_SOCKET, SO_ACCEPTCONN) => Ok((s.state == TcpState::Listen) as i32),
            (IPPROTO_IPV6, IPV6_V6ONLY) if s.domain == Domain::V6 => {
                Ok(s.flags.contains(SockFlags::V6ONLY) as i32)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn setsockopt(&self, id: SockId, level: i32, opt: i32, value: i32) -> Result<(), Errno> {
        let cell = find_cell(id).ok_or(Errno::EBADF)?;
        let mut s = cell.sock.lock();

        match (level, opt) {
            (IPPROTO_IPV6, IPV6_V6ONLY) if s.domain == Domain::V6 => {
                s.flags.set(SockFlags::V6ONLY, value != 0);
                Ok(())
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn poll(&self, id: SockId, events: PollEvents) -> PollEvents {
        let Some(cell) = find_cell(id) else {
            return PollEvents::ERR;
        };
        let mut s = cell.sock.lock();

        let mut ready = PollEvents::empty();
        if s.reset {
            ready |= PollEvents::ERR;
        }

        match s.state {
            TcpState::Listen => {
                if let Some(l) = s.listen_data() {
                    if !l.queue.is_empty() {
                        ready |= PollEvents::IN;
                    }
                }
            }
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
                if let Some(d) = s.data() {
                    if d.rcv_cur > 0 {
                        ready |= PollEvents::IN;
                    }
                    if d.snd_cur < d.sndbuf.len()
                        && matches!(s.state, TcpState::Established)
                    {
                        ready |= PollEvents::OUT;
                    }
                }
            }
            TcpState::CloseWait | TcpState::Closed => {
                ready |= PollEvents::IN;
            }
            _ => {}
        }

        ready & events
    }

    fn input(&self, _nif: Option<&NetIfRef>, ip: &IpHdrRef<'_>, data: &[u8]) -> InputResult {
        let src = ip.src();
        let dst = ip.dst();

        // The checksum covers the pseudo-header and the whole segment.
        let ps = checksum::pseudo_v6(&src, &dst, data.len() as u32, PROTO_TCP);
        if checksum::checksum(data, ps) != 0 {
            return InputResult::Consumed;
        }

        let Some(hdr) = TcpHdr::parse(data) else {
            return InputResult::Consumed;
        };
        let flags = hdr.flags();

        let rv = {
            let Ok(_rg) = ReadGuard::lock() else {
                return InputResult::Consumed;
            };

            match find_sock(&src, &dst, hdr.src_port, hdr.dst_port, ip.domain()) {
                Some(cell) => {
                    let Ok(_g) = CellGuard::lock(&cell) else {
                        return InputResult::Consumed;
                    };

                    let (state, accepting) = {
                        let mut s = cell.sock.lock();
                        let acc = s.listen_data().map(|l| l.accepting).unwrap_or(false);
                        (s.state, acc)
                    };

                    match state {
                        TcpState::Listen if accepting => 0,
                        TcpState::Listen => listen_pkt(&cell, &src, &dst, &hdr),
                        TcpState::SynSent => synsent_pkt(&cell, &src, &dst, &hdr, data),
                        TcpState::Closed => -1,
                        _ => process_pkt(&cell, &src, &dst, &hdr, data),
                    }
                }
                None => -1,
            }
        };

        // Anything that went wrong answers with a RST (never RST a RST).
        if rv != 0 && flags & TCP_FLAG_RST == 0 {
            tcp_bpkt_rst(&src, &dst, &hdr, data.len() - hdr.offset());
        }

        InputResult::Consumed
    }
}

/// Register the protocol record and the retransmission tick.
pub fn init() -> Result<(), Errno> {
    static REGISTERED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
    if REGISTERED.swap(true, core::sync::atomic::Ordering::AcqRel) {
        return Ok(());
    }

    socket::proto_add(socket::SockType::Stream, PROTO_TCP, Arc::new(TcpProto));
    *CB_ID.lock() = Some(worker::add_callback(tcp_tick, TCP_TICK_MS));
    Ok(())
}

pub fn shutdown() {
    if let Some(id) = CB_ID.lock().take() {
        let _ = worker::del_callback(id);
    }
    SOCKS.lock().clear();
}

/// Observable state of a socket, for diagnostics and tests.
pub fn sock_state(id: SockId) -> Option<TcpState> {
    find_cell(id).map(|c| c.sock.lock().state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::netif::{LoopbackDriver, NetIf, NetIfRef, ETH_HLEN};
    use crate::net::socket as sockapi;
    use crate::net::socket::SockType;
    use crate::net::{arp, ipv4};
    use crate::vfs;

    /// Serialize the TCP tests: they share the socket list, the default
    /// device, and the ARP cache.
    static TCP_TEST_LOCK: SpinMutex<()> = SpinMutex::new(());

    const OUR_IP: [u8; 4] = [10, 0, 0, 1];
    const PEER_IP: [u8; 4] = [10, 0, 0, 2];
    const PEER_MAC: [u8; 6] = [2, 0, 0, 0, 0, 0x22];

    fn setup_dev() -> NetIfRef {
        let drv = LoopbackDriver::new([2, 0, 0, 0, 0, 0x11]);
        let mut nif = NetIf::new("tcp0", Box::new(drv));
        nif.ip_addr = OUR_IP;
        nif.netmask = [255, 255, 255, 0];
        let nif = Arc::new(SpinMutex::new(nif));
        super::super::set_default(Some(nif.clone()));
        // Pre-resolve the peer so replies hit the wire immediately.
        arp::insert(&nif, PEER_MAC, PEER_IP, 0).unwrap();
        nif
    }

    /// Build a client segment addressed at our server.
    fn segment(
        sport: u16,
        dport: u16,
        seq: u32,
        ack: u32,
        flags: u16,
        mss: bool,
        payload: &[u8],
    ) -> (ipv4::Ipv4Hdr, Vec<u8>) {
        let words: u16 = if mss { 6 } else { 5 };
        let mut seg = Vec::new();
        build_header(&mut seg, sport, dport, seq, ack, flags, words, 8192);
        if mss {
            seg.extend_from_slice(&[TCP_OPT_MSS, 4]);
            seg.extend_from_slice(&TCP_DEFAULT_MSS.to_be_bytes());
        }
        seg.extend_from_slice(payload);

        let src = v4_mapped(PEER_IP);
        let dst = v4_mapped(OUR_IP);
        let cs = checksum::checksum(
            &seg,
            checksum::pseudo_v6(&src, &dst, seg.len() as u32, PROTO_TCP),
        );
        seg[16..18].copy_from_slice(&cs.to_be_bytes());

        let mut ip = ipv4::Ipv4Hdr::new(64, PROTO_TCP, PEER_IP, OUR_IP, seg.len() as u16);
        ip.fix_checksum();
        (ip, seg)
    }

    fn inject(nif: &NetIfRef, ip: &ipv4::Ipv4Hdr, seg: &[u8]) {
        let r = sockapi::input_v4(Some(nif), ip, seg);
        assert_eq!(r, InputResult::Consumed);
    }

    /// Pop the next emitted TCP segment off the mock driver.
    fn next_tx(nif: &NetIfRef) -> Option<Vec<u8>> {
        let frame = nif.lock().driver.rx()?;
        // Strip ethernet + IPv4 headers.
        let ip = ipv4::Ipv4Hdr::parse(&frame[ETH_HLEN..])?;
        let off = ETH_HLEN + ip.hdr_len();
        Some(frame[off..off + (ip.length as usize - ip.hdr_len())].to_vec())
    }

    fn flags_of(seg: &[u8]) -> u16 {
        u16::from_be_bytes([seg[12], seg[13]]) & 0x3F
    }

    fn seq_of(seg: &[u8]) -> u32 {
        u32::from_be_bytes([seg[4], seg[5], seg[6], seg[7]])
    }

    fn ack_of(seg: &[u8]) -> u32 {
        u32::from_be_bytes([seg[8], seg[9], seg[10], seg[11]])
    }

    fn set_nonblock(fd: i32) {
        use crate::vfs::{FcntlCmd, OpenMode};
        vfs::fcntl(fd, FcntlCmd::SetFl(OpenMode::NONBLOCK)).unwrap();
    }

    #[test]
    fn passive_handshake_data_and_close() {
        let _l = TCP_TEST_LOCK.lock();
        init().unwrap();
        let nif = setup_dev();

        let srv = sockapi::socket(Domain::V4, SockType::Stream, PROTO_TCP).unwrap();
        sockapi::bind(srv, SockAddr::v4([0, 0, 0, 0], 8080)).unwrap();
        sockapi::listen(srv, 4).unwrap();
        set_nonblock(srv);

        // Client SYN, seq = X.
        let x = 1000u32;
        let (ip, seg) = segment(5555, 8080, x, 0, TCP_FLAG_SYN, true, &[]);
        inject(&nif, &ip, &seg);

        // accept() pops the queued connection and emits <SYN,ACK>.
        let (conn, peer) = sockapi::accept(srv).unwrap();
        assert_eq!(peer.port, 5555);
        set_nonblock(conn);

        let synack = next_tx(&nif).expect("no SYN,ACK emitted");
        assert_eq!(flags_of(&synack), TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert_eq!(ack_of(&synack), x.wrapping_add(1));
        // The MSS option rides along (kind 2, length 4, 1460).
        assert_eq!(&synack[20..24], &[2, 4, 0x05, 0xB4]);
        let y = seq_of(&synack);

        // Client ACK completes the handshake.
        let (ip, seg) = segment(5555, 8080, x + 1, y + 1, TCP_FLAG_ACK, false, &[]);
        inject(&nif, &ip, &seg);

        let cid = {
            let f = vfs::fd::get(conn).unwrap();
            f.as_socket().unwrap().id
        };
        assert_eq!(sock_state(cid), Some(TcpState::Established));

        // 100 bytes of data from the client.
        let payload: Vec<u8> = (0..100u8).collect();
        let (ip, seg) = segment(
            5555,
            8080,
            x + 1,
            y + 1,
            TCP_FLAG_ACK | TCP_FLAG_PSH,
            false,
            &payload,
        );
        inject(&nif, &ip, &seg);

        // The server acks exactly the 100 bytes.
        let data_ack = next_tx(&nif).expect("no data ACK");
        assert_eq!(flags_of(&data_ack), TCP_FLAG_ACK);
        assert_eq!(ack_of(&data_ack), x + 101);

        // recv returns those bytes.
        let mut buf = [0u8; 256];
        let n = sockapi::recv(conn, &mut buf).unwrap();
        assert_eq!(n, 100);
        assert_eq!(&buf[..100], &payload[..]);

        // Server-side close: <FIN,ACK> goes out.
        vfs::close(conn).unwrap();
        let fin = next_tx(&nif).expect("no FIN emitted");
        assert_eq!(flags_of(&fin), TCP_FLAG_FIN | TCP_FLAG_ACK);
        assert_eq!(seq_of(&fin), y + 1);
        assert_eq!(ack_of(&fin), x + 101);
        assert_eq!(sock_state(cid), Some(TcpState::FinWait1));

        // Client acks our FIN.
        let (ip, seg) = segment(5555, 8080, x + 101, y + 2, TCP_FLAG_ACK, false, &[]);
        inject(&nif, &ip, &seg);
        assert_eq!(sock_state(cid), Some(TcpState::FinWait2));

        // Client's own FIN; we ACK and sit in TIME-WAIT.
        let (ip, seg) = segment(
            5555,
            8080,
            x + 101,
            y + 2,
            TCP_FLAG_FIN | TCP_FLAG_ACK,
            false,
            &[],
        );
        inject(&nif, &ip, &seg);

        let last_ack = next_tx(&nif).expect("no final ACK");
        assert_eq!(flags_of(&last_ack), TCP_FLAG_ACK);
        assert_eq!(ack_of(&last_ack), x + 102);
        assert_eq!(sock_state(cid), Some(TcpState::TimeWait));

        // After 2MSL the tick clears the connection out entirely.
        timer::advance_ms(2 * TCP_DEFAULT_MSL_MS + 100);
        tcp_tick();
        assert_eq!(sock_state(cid), None);

        vfs::close(srv).unwrap();
        super::super::set_default(None);
    }

    #[test]
    fn active_open_emits_syn_and_completes() {
        let _l = TCP_TEST_LOCK.lock();
        init().unwrap();
        let nif = setup_dev();

        let fd = sockapi::socket(Domain::V4, SockType::Stream, PROTO_TCP).unwrap();
        set_nonblock(fd);
        sockapi::bind(fd, SockAddr::v4(OUR_IP, 7000)).unwrap();

        // Non-blocking connect: SYN goes out, the call reports progress.
        assert_eq!(
            sockapi::connect(fd, SockAddr::v4(PEER_IP, 80)).unwrap_err(),
            Errno::EINPROGRESS
        );

        let syn = next_tx(&nif).expect("no SYN emitted");
        assert_eq!(flags_of(&syn), TCP_FLAG_SYN);
        let x = seq_of(&syn);

        let cid = {
            let f = vfs::fd::get(fd).unwrap();
            f.as_socket().unwrap().id
        };
        assert_eq!(sock_state(cid), Some(TcpState::SynSent));

        // Peer's <SYN,ACK>.
        let y = 555_000u32;
        let (ip, seg) = segment(80, 7000, y, x.wrapping_add(1), TCP_FLAG_SYN | TCP_FLAG_ACK, true, &[]);
        inject(&nif, &ip, &seg);

        assert_eq!(sock_state(cid), Some(TcpState::Established));
        let ack = next_tx(&nif).expect("no handshake ACK");
        assert_eq!(flags_of(&ack), TCP_FLAG_ACK);
        assert_eq!(ack_of(&ack), y + 1);

        // Send some data; the segment carries it with our ACK state.
        assert_eq!(sockapi::send(fd, b"abcdef").unwrap(), 6);
        let dataseg = next_tx(&nif).expect("no data segment");
        assert_eq!(&dataseg[20..26], b"abcdef");
        assert_eq!(seq_of(&dataseg), x.wrapping_add(1));

        // Peer RST kills the connection; send reports the reset.
        let (ip, seg) = segment(80, 7000, y + 1, x + 7, TCP_FLAG_RST, false, &[]);
        inject(&nif, &ip, &seg);
        assert_eq!(sockapi::send(fd, b"more").unwrap_err(), Errno::ECONNRESET);

        vfs::close(fd).unwrap();
        // The reset socket reaps immediately on close.
        assert_eq!(sock_state(cid), None);
        super::super::set_default(None);
    }

    #[test]
    fn stateless_segments_draw_rst() {
        let _l = TCP_TEST_LOCK.lock();
        init().unwrap();
        let nif = setup_dev();

        // An ACK to a port nobody owns: RST with seq = their ack.
        let (ip, seg) = segment(4242, 9999, 77, 1234, TCP_FLAG_ACK, false, &[]);
        inject(&nif, &ip, &seg);
        let rst = next_tx(&nif).expect("no RST emitted");
        assert_eq!(flags_of(&rst), TCP_FLAG_RST);
        assert_eq!(seq_of(&rst), 1234);

        // A SYN to a dead port: RST,ACK covering the SYN.
        let (ip, seg) = segment(4242, 9998, 500, 0, TCP_FLAG_SYN, false, &[]);
        inject(&nif, &ip, &seg);
        let rst = next_tx(&nif).expect("no RST,ACK emitted");
        assert_eq!(flags_of(&rst), TCP_FLAG_RST | TCP_FLAG_ACK);
        assert_eq!(ack_of(&rst), 501);

        super::super::set_default(None);
    }

    #[test]
    fn corrupt_checksum_is_dropped_silently() {
        let _l = TCP_TEST_LOCK.lock();
        init().unwrap();
        let nif = setup_dev();

        let (ip, mut seg) = segment(4242, 9997, 1, 0, TCP_FLAG_SYN, false, &[]);
        seg[16] ^= 0xFF;
        inject(&nif, &ip, &seg);
        assert!(next_tx(&nif).is_none(), "bad checksum must not draw a reply");

        super::super::set_default(None);
    }
}
