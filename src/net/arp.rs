/*
 * ARP Handling System
 *
 * Address Resolution Protocol cache for IPv4: each entry pairs an IPv4
 * address with a MAC, stamped with its last-confirmed time. Entries age
 * out after ten minutes; an entry with no timestamp never expires
 * (static mappings). An unresolved entry may hold one pending IPv4
 * packet that is transmitted as soon as the reply arrives.
 */

use alloc::vec::Vec;
use spin::Mutex;

use crate::errno::Errno;
use crate::utils::timer;

use super::ipv4::{self, Ipv4Hdr};
use super::netif::{NetIfRef, ETH_HLEN, ETH_TYPE_ARP, MAC_BROADCAST};

/// Cache entry lifetime in milliseconds (10 minutes).
const ARP_MAX_AGE_MS: u64 = 600 * 1000;

/// ARP opcode values.
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;

/// Size of an ARP packet for IPv4-over-ethernet.
const ARP_PKT_LEN: usize = 28;

struct ArpEntry {
    mac: [u8; 6],
    ip: [u8; 4],
    /// Last confirmation time; zero means the entry never expires.
    timestamp: u64,
    /// Packet waiting on this resolution, if any.
    pending: Option<(Ipv4Hdr, Vec<u8>)>,
}

static ARP_CACHE: Mutex<Vec<ArpEntry>> = Mutex::new(Vec::new());

/// Result of a cache lookup.
pub enum LookupResult {
    /// Entry found; here's the MAC.
    Found([u8; 6]),
    /// No entry; a query has been sent, and the packet (if any) queued.
    InProgress,
    /// An incomplete entry exists already; resolution still pending.
    Unresolved,
}

/// Garbage collect timed out entries.
pub fn gc() {
    let now = timer::uptime_ms();
    ARP_CACHE
        .lock()
        .retain(|e| e.timestamp == 0 || now < e.timestamp + ARP_MAX_AGE_MS);
}

/// Add (or refresh) a cache entry. A queued packet waiting on this
/// address goes out immediately.
pub fn insert(nif: &NetIfRef, mac: [u8; 6], ip: [u8; 4], timestamp: u64) -> Result<(), Errno> {
    let pending = {
        let mut cache = ARP_CACHE.lock();

        match cache.iter_mut().find(|e| e.ip == ip) {
            Some(e) => {
                e.mac = mac;
                e.timestamp = timestamp;
                e.pending.take()
            }
            None => {
                cache.insert(
                    0,
                    ArpEntry {
                        mac,
                        ip,
                        timestamp,
                        pending: None,
                    },
                );
                None
            }
        }
    };

    // Send our queued packet, if we had one.
    if let Some((hdr, data)) = pending {
        let _ = ipv4::send_packet(Some(nif), &hdr, &data);
    }

    gc();
    Ok(())
}

/// Look up an entry. On a miss an ARP query goes out, the packet (if
/// given) is parked on the new incomplete entry, and the send should
/// report success: the packet leaves when the reply arrives.
pub fn lookup(
    nif: &NetIfRef,
    ip: [u8; 4],
    pending: Option<(&Ipv4Hdr, &[u8])>,
) -> Result<LookupResult, Errno> {
    gc();

    {
        let mut cache = ARP_CACHE.lock();
        if let Some(e) = cache.iter_mut().find(|e| e.ip == ip) {
            if e.mac == [0; 6] {
                return Ok(LookupResult::Unresolved);
            }
            if e.timestamp != 0 {
                e.timestamp = timer::uptime_ms();
            }
            return Ok(LookupResult::Found(e.mac));
        }

        // Not there: park an incomplete entry, copying the caller's
        // packet by value. A newer pending packet would replace it.
        cache.insert(
            0,
            ArpEntry {
                mac: [0; 6],
                ip,
                timestamp: timer::uptime_ms(),
                pending: pending.map(|(h, d)| (h.clone(), d.to_vec())),
            },
        );
    }

    // Generate a who-has query.
    query(nif, ip)?;
    Ok(LookupResult::InProgress)
}

/// Reverse lookup: IP for a MAC.
pub fn revlookup(mac: [u8; 6]) -> Option<[u8; 4]> {
    let mut cache = ARP_CACHE.lock();
    let e = cache.iter_mut().find(|e| e.mac == mac)?;
    if e.timestamp != 0 {
        e.timestamp = timer::uptime_ms();
    }
    Some(e.ip)
}

fn build_arp(nif_mac: [u8; 6], nif_ip: [u8; 4], op: u16, target_mac: [u8; 6], target_ip: [u8; 4]) -> [u8; ARP_PKT_LEN] {
    let mut pkt = [0u8; ARP_PKT_LEN];
    pkt[0..2].copy_from_slice(&1u16.to_be_bytes()); // ethernet
    pkt[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // IPv4
    pkt[4] = 6; // hw size
    pkt[5] = 4; // proto size
    pkt[6..8].copy_from_slice(&op.to_be_bytes());
    pkt[8..14].copy_from_slice(&nif_mac);
    pkt[14..18].copy_from_slice(&nif_ip);
    pkt[18..24].copy_from_slice(&target_mac);
    pkt[24..28].copy_from_slice(&target_ip);
    pkt
}

/// Generate an ARP who-has query for `ip` on the given device.
pub fn query(nif: &NetIfRef, ip: [u8; 4]) -> Result<(), Errno> {
    let mut n = nif.lock();
    let pkt = build_arp(n.mac, n.ip_addr, ARP_OP_REQUEST, MAC_BROADCAST, ip);
    n.tx_frame(&MAC_BROADCAST, ETH_TYPE_ARP, &pkt)
}

/// Send an ARP reply for our own address to the asker.
fn reply(nif: &NetIfRef, asker_mac: [u8; 6], asker_ip: [u8; 4]) -> Result<(), Errno> {
    let mut n = nif.lock();
    let pkt = build_arp(n.mac, n.ip_addr, ARP_OP_REPLY, asker_mac, asker_ip);
    n.tx_frame(&asker_mac, ETH_TYPE_ARP, &pkt)
}

/// Receive an ARP frame (called by the input demux with the whole
/// ethernet frame).
pub fn input(nif: &NetIfRef, frame: &[u8]) -> i32 {
    if frame.len() < ETH_HLEN + ARP_PKT_LEN {
        return -1;
    }

    let pkt = &frame[ETH_HLEN..];
    let op = u16::from_be_bytes([pkt[6], pkt[7]]);
    let sender_mac: [u8; 6] = pkt[8..14].try_into().unwrap();
    let sender_ip: [u8; 4] = pkt[14..18].try_into().unwrap();

    match op {
        ARP_OP_REQUEST => {
            let _ = reply(nif, sender_mac, sender_ip);
            let _ = insert(nif, sender_mac, sender_ip, timer::uptime_ms());
        }
        ARP_OP_REPLY => {
            let _ = insert(nif, sender_mac, sender_ip, timer::uptime_ms());
        }
        other => {
            log::debug!("net_arp: unknown ARP opcode: {}", other);
        }
    }

    0
}

/// Initialize the ARP cache.
pub fn init() {
    ARP_CACHE.lock().clear();
}

/// Drop every entry.
pub fn shutdown() {
    ARP_CACHE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::netif::{LoopbackDriver, NetIf};
    use alloc::sync::Arc;

    /// The cache is a process-wide global; serialize the tests poking it.
    static ARP_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn test_if() -> NetIfRef {
        let drv = LoopbackDriver::new([2, 0, 0, 0, 0, 9]);
        let mut nif = NetIf::new("test0", alloc::boxed::Box::new(drv));
        nif.ip_addr = [10, 0, 0, 1];
        nif.netmask = [255, 255, 255, 0];
        Arc::new(spin::Mutex::new(nif))
    }

    #[test]
    fn miss_sends_query_and_reply_releases_pending() {
        let _g = ARP_TEST_LOCK.lock();
        init();
        let nif = test_if();

        let hdr = Ipv4Hdr::new(64, super::super::ipv4::PROTO_UDP, [10, 0, 0, 1], [10, 0, 0, 2], 8);
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];

        // First lookup: miss, query on the wire, packet parked.
        match lookup(&nif, [10, 0, 0, 2], Some((&hdr, &payload))).unwrap() {
            LookupResult::InProgress => {}
            _ => panic!("expected InProgress"),
        }
        {
            let mut n = nif.lock();
            let frame = n.driver.rx().expect("no ARP query sent");
            assert_eq!(&frame[12..14], &[0x08, 0x06]);
            // Opcode request at ARP offset 6.
            assert_eq!(frame[ETH_HLEN + 7], 1);
        }

        // Second lookup while unresolved.
        match lookup(&nif, [10, 0, 0, 2], None).unwrap() {
            LookupResult::Unresolved => {}
            _ => panic!("expected Unresolved"),
        }

        // The reply arrives: entry fills in and the parked packet flies.
        insert(&nif, [2, 0, 0, 0, 0, 0x22], [10, 0, 0, 2], timer::uptime_ms()).unwrap();
        match lookup(&nif, [10, 0, 0, 2], None).unwrap() {
            LookupResult::Found(mac) => assert_eq!(mac, [2, 0, 0, 0, 0, 0x22]),
            _ => panic!("expected Found"),
        }
        {
            let mut n = nif.lock();
            let frame = n.driver.rx().expect("pending packet not sent");
            assert_eq!(&frame[12..14], &[0x08, 0x00]);
            assert_eq!(&frame[..6], &[2, 0, 0, 0, 0, 0x22]);
        }
    }

    #[test]
    fn entries_age_out() {
        let _g = ARP_TEST_LOCK.lock();
        init();
        let nif = test_if();
        insert(&nif, [2, 0, 0, 0, 0, 1], [10, 9, 9, 9], timer::uptime_ms()).unwrap();
        // A static entry (timestamp 0) survives the same aging.
        insert(&nif, [2, 0, 0, 0, 0, 2], [10, 9, 9, 8], 0).unwrap();

        timer::advance_ms(ARP_MAX_AGE_MS + 1000);
        gc();

        assert!(matches!(
            lookup(&nif, [10, 9, 9, 8], None).unwrap(),
            LookupResult::Found(_)
        ));
        // The aged entry is gone; this lookup re-queries.
        assert!(matches!(
            lookup(&nif, [10, 9, 9, 9], None).unwrap(),
            LookupResult::InProgress
        ));
    }
}
