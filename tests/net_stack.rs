/*
 * End-to-end network stack tests over the loopback path: UDP datagram
 * delivery, IPv4 fragmentation and reassembly (including out-of-order
 * arrival and the death timer), and the ping round trip.
 */

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use marlin_kernel::net::socket::{self, Domain, SockAddr, SockType};
use marlin_kernel::net::{checksum, icmp4, ipv4, ipv4_frag, tcp, udp, worker};
use marlin_kernel::utils::timer;
use marlin_kernel::vfs;

/// The loopback paths share global protocol state; run one test at a
/// time.
static NET_LOCK: Mutex<()> = Mutex::new(());

fn setup() {
    let _ = ipv4_frag::init();
    let _ = udp::init();
    let _ = tcp::init();
}

fn loop4(port: u16) -> SockAddr {
    SockAddr::v4([127, 0, 0, 1], port)
}

fn set_nonblock(fd: i32) {
    use marlin_kernel::vfs::{FcntlCmd, OpenMode};
    vfs::fcntl(fd, FcntlCmd::SetFl(OpenMode::NONBLOCK)).unwrap();
}

#[test]
fn udp_loopback_identical_bytes() {
    let _g = NET_LOCK.lock().unwrap();
    setup();

    let rx = socket::socket(Domain::V4, SockType::Dgram, 17).unwrap();
    socket::bind(rx, loop4(19001)).unwrap();

    let tx = socket::socket(Domain::V4, SockType::Dgram, 17).unwrap();
    let payload: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(
        socket::sendto(tx, &payload, Some(loop4(19001))).unwrap(),
        payload.len()
    );

    let mut buf = vec![0u8; 1024];
    let (n, from) = socket::recvfrom(rx, &mut buf, false).unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(&buf[..n], &payload[..]);
    assert!(from.port >= 1024); // the sender auto-picked an ephemeral port

    vfs::close(rx).unwrap();
    vfs::close(tx).unwrap();
}

#[test]
fn udp_loopback_fragmented_datagram() {
    let _g = NET_LOCK.lock().unwrap();
    setup();

    let rx = socket::socket(Domain::V4, SockType::Dgram, 17).unwrap();
    socket::bind(rx, loop4(19002)).unwrap();

    let tx = socket::socket(Domain::V4, SockType::Dgram, 17).unwrap();

    // 3000 bytes is comfortably past the 1500-byte MTU: the datagram
    // travels as three fragments and reassembles on the way in.
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
    assert_eq!(
        socket::sendto(tx, &payload, Some(loop4(19002))).unwrap(),
        payload.len()
    );

    let mut buf = vec![0u8; 4096];
    let (n, _) = socket::recvfrom(rx, &mut buf, false).unwrap();
    assert_eq!(n, payload.len());
    assert_eq!(&buf[..n], &payload[..]);

    vfs::close(rx).unwrap();
    vfs::close(tx).unwrap();
}

/// Build a UDP datagram split by hand into IPv4 fragments on 8-byte
/// boundaries. Returns (fragments, full payload).
fn make_fragments(port: u16, total_data: usize) -> (Vec<(ipv4::Ipv4Hdr, Vec<u8>)>, Vec<u8>) {
    let src = [127, 0, 0, 1];
    let dst = [127, 0, 0, 1];

    let inner: Vec<u8> = (0..total_data as u32).map(|i| (i % 239) as u8).collect();

    // The UDP header + payload as one unit.
    let mut dgram = Vec::with_capacity(8 + inner.len());
    dgram.extend_from_slice(&2048u16.to_be_bytes()); // src port
    dgram.extend_from_slice(&port.to_be_bytes());
    dgram.extend_from_slice(&((8 + inner.len()) as u16).to_be_bytes());
    dgram.extend_from_slice(&[0, 0]);
    dgram.extend_from_slice(&inner);

    let srcm = marlin_kernel::net::netif::v4_mapped(src);
    let dstm = marlin_kernel::net::netif::v4_mapped(dst);
    let cs = checksum::checksum(
        &dgram,
        checksum::pseudo_v6(&srcm, &dstm, dgram.len() as u32, 17),
    );
    dgram[6..8].copy_from_slice(&cs.to_be_bytes());

    // Chop into 1000-byte fragments (125 blocks each).
    let mut frags = Vec::new();
    let mut off = 0usize;
    while off < dgram.len() {
        let chunk = core::cmp::min(1000, dgram.len() - off);
        let last = off + chunk == dgram.len();

        let mut hdr = ipv4::Ipv4Hdr::new(64, 17, src, dst, chunk as u16);
        hdr.packet_id = 0x7A7A;
        hdr.flags_frag_offs = ((off >> 3) as u16) | if last { 0 } else { ipv4::IP_FLAG_MF };
        hdr.fix_checksum();

        let mut pkt = Vec::with_capacity(20 + chunk);
        pkt.extend_from_slice(&hdr.encode());
        pkt.extend_from_slice(&dgram[off..off + chunk]);
        frags.push((hdr, pkt));

        off += chunk;
    }

    (frags, inner)
}

#[test]
fn reassembly_handles_reverse_order_and_expiry() {
    let _g = NET_LOCK.lock().unwrap();
    setup();

    let rx = socket::socket(Domain::V4, SockType::Dgram, 17).unwrap();
    socket::bind(rx, loop4(19003)).unwrap();
    set_nonblock(rx);

    // Reverse-order arrival still reassembles into one delivery.
    let (frags, inner) = make_fragments(19003, 2992);
    assert_eq!(frags.len(), 3);
    for (_, pkt) in frags.iter().rev() {
        ipv4::input(None, pkt);
    }

    let mut buf = vec![0u8; 4096];
    let (n, _) = socket::recvfrom(rx, &mut buf, false).unwrap();
    assert_eq!(n, inner.len());
    assert_eq!(&buf[..n], &inner[..]);

    // A missing middle fragment never delivers, and the death timer
    // (TTL seconds) eventually discards the partial reassembly.
    ipv4::input(None, &frags[0].1);
    ipv4::input(None, &frags[2].1);
    assert!(socket::recvfrom(rx, &mut buf, false).is_err());

    timer::advance_ms(65_000);
    worker::run_due_callbacks();

    // The late middle fragment now has nothing to join: no delivery.
    ipv4::input(None, &frags[1].1);
    assert!(socket::recvfrom(rx, &mut buf, false).is_err());

    // All three together still work afterwards.
    for (_, pkt) in frags.iter() {
        ipv4::input(None, pkt);
    }
    let (n, _) = socket::recvfrom(rx, &mut buf, false).unwrap();
    assert_eq!(n, inner.len());

    vfs::close(rx).unwrap();
}

static PINGS: AtomicU32 = AtomicU32::new(0);

fn on_ping(_src: &[u8; 4], seq: u16, rtt: Option<u64>, _ttl: u8, _data: &[u8]) {
    assert_eq!(seq, 42);
    assert!(rtt.is_some());
    PINGS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn ping_loopback_round_trip() {
    let _g = NET_LOCK.lock().unwrap();
    setup();

    icmp4::set_echo_cb(Some(on_ping));
    let before = PINGS.load(Ordering::SeqCst);
    icmp4::send_echo(None, [127, 0, 0, 1], 7, 42, b"console-ping").unwrap();
    assert_eq!(PINGS.load(Ordering::SeqCst), before + 1);
    icmp4::set_echo_cb(None);
}
