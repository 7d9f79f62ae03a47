/*
 * IPv4 Fragmentation and Reassembly
 *
 * Both directions are direct implementations of the example procedures
 * in RFC 791 (pages 26-29): sends larger than the MTU are chopped on
 * 8-byte boundaries; inbound fragments are collected per
 * (src, dst, protocol, ident) with a bitfield tracking which 8-byte
 * blocks have arrived. Each reassembly carries a death-timer derived
 * from the packet TTL; a janitor callback reaps expired ones every two
 * seconds.
 */

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::errno::Errno;
use crate::utils::timer;

use super::ipv4::{self, Ipv4Hdr, IP_FLAG_DF, IP_FLAG_MF, IP_FRAG_MASK};
use super::netif::NetIfRef;
use super::worker;

/// Janitor period.
const REAP_INTERVAL_MS: u64 = 2000;

/// Bitfield size: one bit per 8-byte block of a max-size datagram.
const BITFIELD_BYTES: usize = 8192;

struct IpFrag {
    src: [u8; 4],
    dst: [u8; 4],
    ident: u16,
    proto: u8,

    hdr: Ipv4Hdr,
    data: Vec<u8>,
    bitfield: Box<[u8; BITFIELD_BYTES]>,
    total_length: usize,
    death_time: u64,
}

static FRAGS: Mutex<Vec<IpFrag>> = Mutex::new(Vec::new());
static CB_ID: Mutex<Option<i32>> = Mutex::new(None);

/// Reap reassemblies whose death-timer has passed. Runs off the network
/// worker thread.
fn reap() {
    let now = timer::uptime_ms();
    FRAGS.lock().retain(|f| f.death_time >= now);
}

/// Set the bits for fragment blocks [start, end).
fn set_bits(bitfield: &mut [u8], start: usize, end: usize) {
    for bit in start..end {
        bitfield[bit >> 3] |= 1 << (bit & 7);
    }
}

/// Check that every block up to `end` is present.
fn all_bits_set(bitfield: &[u8], end: usize) -> bool {
    for i in 0..(end >> 3) {
        if bitfield[i] != 0xFF {
            return false;
        }
    }
    if end & 7 != 0 {
        let want = (1u8 << (end & 7)) - 1;
        if bitfield[end >> 3] & want != want {
            return false;
        }
    }
    true
}

/// Merge one fragment into its reassembly. When the datagram completes
/// it is returned for delivery; delivery happens with the table
/// unlocked, since the upper layers may loop a reply straight back into
/// this stack.
fn import(
    hdr: &Ipv4Hdr,
    data: &[u8],
    flags: u16,
    idx: usize,
    frags: &mut Vec<IpFrag>,
) -> Option<(Ipv4Hdr, Vec<u8>)> {
    let fo = (flags & IP_FRAG_MASK) as usize;
    let ihl = hdr.hdr_len();
    let start = fo << 3;
    let end = start + (hdr.length as usize) - ihl;
    let now = timer::uptime_ms();

    let f = &mut frags[idx];

    if end > f.data.len() {
        f.data.resize(end, 0);
    }
    f.data[start..end].copy_from_slice(&data[..end - start]);
    set_bits(&mut f.bitfield[..], fo, fo + ((hdr.length as usize - ihl) + 7 >> 3));

    // The fragment with More-Fragments clear pins the total length.
    if flags & IP_FLAG_MF == 0 {
        f.total_length = end;
    }

    // The first fragment carries the definitive header.
    if fo == 0 {
        f.hdr = hdr.clone();
    }

    let complete = f.total_length != 0 && all_bits_set(&f.bitfield[..], f.total_length >> 3);

    if complete {
        // Fix the length; the upper layers don't re-verify the header
        // checksum on a reassembled datagram.
        let total = f.total_length;
        let mut whole = f.hdr.clone();
        whole.length = (total + whole.hdr_len()) as u16;
        let data = core::mem::take(&mut f.data);
        frags.remove(idx);
        return Some((whole, data));
    }

    // Refresh the timer, monotone non-decreasing.
    f.death_time = core::cmp::max(f.death_time, now + (hdr.ttl as u64) * 1000);
    None
}

/// Fragment-aware send: under the MTU goes straight out; over it, the
/// datagram is split on 8-byte boundaries unless Don't-Fragment forbids
/// it.
pub fn send(nif: Option<&NetIfRef>, hdr: Ipv4Hdr, data: &[u8]) -> Result<(), Errno> {
    let nif_ref = super::dev_or_default(nif).ok();
    let mtu = nif_ref
        .as_ref()
        .map(|n| n.lock().mtu)
        .unwrap_or(super::netif::ETH_MTU);

    let ihl = hdr.hdr_len();
    let flags = hdr.flags_frag_offs;

    // If the packet doesn't need to be fragmented, send it as is.
    if ihl + data.len() < mtu {
        return ipv4::send_packet(nif, &hdr, data);
    }

    // Oversized with DF set has nowhere to go.
    if flags & IP_FLAG_DF != 0 {
        return Err(Errno::EMSGSIZE);
    }

    // Number of 8-byte fragment blocks per fragment, and the byte count.
    let nfb = (mtu - ihl) >> 3;
    let ds = nfb << 3;

    let mut offset_blocks = (flags & IP_FRAG_MASK) as usize;
    let mut remaining = data;

    while remaining.len() + ihl >= mtu {
        let mut fh = hdr.clone();
        fh.flags_frag_offs = (flags & 0xE000) | IP_FLAG_MF | (offset_blocks as u16 & IP_FRAG_MASK);
        fh.length = (ihl + ds) as u16;
        fh.fix_checksum();
        ipv4::send_packet(nif, &fh, &remaining[..ds])?;

        remaining = &remaining[ds..];
        offset_blocks += nfb;
    }

    // The tail fragment keeps the original MF flag.
    let mut fh = hdr.clone();
    fh.flags_frag_offs = (flags & 0xE000) | (offset_blocks as u16 & IP_FRAG_MASK);
    fh.length = (ihl + remaining.len()) as u16;
    fh.fix_checksum();
    ipv4::send_packet(nif, &fh, remaining)
}

/// Accept one inbound datagram: unfragmented traffic passes straight
/// through, fragments are collected until their datagram completes.
pub fn reassemble(nif: Option<&NetIfRef>, hdr: &Ipv4Hdr, data: &[u8]) -> i32 {
    let flags = hdr.flags_frag_offs;

    // Offset zero and no More-Fragments: the whole packet.
    if flags & IP_FLAG_MF == 0 && flags & IP_FRAG_MASK == 0 {
        return ipv4::input_proto(nif, hdr, data);
    }

    // Reassembly buffers grow on demand; from interrupt context that
    // needs an irq-safe allocator.
    if !crate::sched::alloc_ok() {
        return -1;
    }

    let completed = {
        let mut frags = FRAGS.lock();

        // Find the reassembly this fragment belongs to, creating a new
        // one on first sight.
        let idx = match frags.iter().position(|f| {
            f.src == hdr.src
                && f.dst == hdr.dest
                && f.ident == hdr.packet_id
                && f.proto == hdr.protocol
        }) {
            Some(idx) => idx,
            None => {
                frags.push(IpFrag {
                    src: hdr.src,
                    dst: hdr.dest,
                    ident: hdr.packet_id,
                    proto: hdr.protocol,
                    hdr: hdr.clone(),
                    data: Vec::new(),
                    bitfield: Box::new([0u8; BITFIELD_BYTES]),
                    total_length: 0,
                    death_time: timer::uptime_ms() + (hdr.ttl as u64) * 1000,
                });
                frags.len() - 1
            }
        };

        import(hdr, data, flags, idx, &mut frags)
    };

    match completed {
        Some((whole, data)) => ipv4::input_proto(nif, &whole, &data),
        None => 0,
    }
}

/// Register the janitor.
pub fn init() -> Result<(), Errno> {
    let mut id = CB_ID.lock();
    if id.is_none() {
        *id = Some(worker::add_callback(reap, REAP_INTERVAL_MS));
    }
    Ok(())
}

pub fn shutdown() {
    if let Some(id) = CB_ID.lock().take() {
        let _ = worker::del_callback(id);
    }
    FRAGS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_helpers() {
        let mut bf = [0u8; 16];
        set_bits(&mut bf, 0, 10);
        assert!(all_bits_set(&bf, 10));
        assert!(!all_bits_set(&bf, 11));
        set_bits(&mut bf, 10, 13);
        assert!(all_bits_set(&bf, 13));
    }
}
