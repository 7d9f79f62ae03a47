/*
 * Neighbor Discovery Protocol Cache (RFC 4861)
 *
 * The IPv6 analog of the ARP cache, with the RFC's reachability states:
 * Incomplete entries are waiting on a first advertisement, Reachable
 * entries are fresh, Stale entries have aged but remain usable, Delay
 * gives upper-layer confirmation a grace window, and Probe entries are
 * being re-solicited. Unsolicited advertisements carrying a different
 * MAC demote Reachable entries to Stale. An Incomplete entry may hold
 * one pending packet, sent once resolution completes.
 */

use alloc::vec::Vec;
use core::net::Ipv6Addr;
use spin::Mutex;

use crate::errno::Errno;
use crate::utils::timer;

use super::icmp6;
use super::ipv6::Ipv6Hdr;
use super::netif::{solicited_node_group, NetIfRef};

/// An entry that hasn't been confirmed in this long is dead (10 min).
const NDP_MAX_AGE_MS: u64 = 600 * 1000;

/// Incomplete entries get this long for a first answer.
const NDP_INCOMPLETE_AGE_MS: u64 = 2000;

/// How long a Delay entry waits before moving to Probe.
const DELAY_FIRST_PROBE_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdpState {
    Incomplete,
    Reachable,
    Stale,
    Delay,
    Probe,
}

struct NdpEntry {
    ip: Ipv6Addr,
    mac: [u8; 6],
    state: NdpState,
    last_reachable: u64,
    /// When the entry entered Delay, for the Probe transition.
    delay_since: u64,
    pending: Option<(Ipv6Hdr, Vec<u8>)>,
}

static NDP_CACHE: Mutex<Vec<NdpEntry>> = Mutex::new(Vec::new());

pub enum LookupResult {
    Found([u8; 6]),
    InProgress,
    Unresolved,
}

/// Age out dead entries and advance Delay entries to Probe, soliciting
/// again.
pub fn gc(nif: Option<&NetIfRef>) {
    let now = timer::uptime_ms();
    let mut probe: Vec<Ipv6Addr> = Vec::new();

    {
        let mut cache = NDP_CACHE.lock();
        cache.retain(|e| {
            !(e.last_reachable + NDP_MAX_AGE_MS < now
                || (e.state == NdpState::Incomplete
                    && e.last_reachable + NDP_INCOMPLETE_AGE_MS < now))
        });

        for e in cache.iter_mut() {
            if e.state == NdpState::Delay && e.delay_since + DELAY_FIRST_PROBE_MS < now {
                e.state = NdpState::Probe;
                probe.push(e.ip);
            }
        }
    }

    if let Some(nif) = nif {
        for ip in probe {
            send_sol(nif, &ip);
        }
    }
}

/// Add or refresh an entry from a received advertisement. `unsol` marks
/// unsolicited information, which cannot confirm reachability: a MAC
/// change through it only leaves the entry Stale.
pub fn insert(nif: &NetIfRef, mac: [u8; 6], ip: &Ipv6Addr, unsol: bool) -> Result<(), Errno> {
    // Multicast and unspecified addresses have no business in here.
    let first = ip.octets()[0];
    if first == 0xFF || ip.is_unspecified() {
        return Err(Errno::EINVAL);
    }

    let now = timer::uptime_ms();

    let pending = {
        let mut cache = NDP_CACHE.lock();

        match cache.iter_mut().find(|e| e.ip == *ip) {
            Some(e) => {
                if unsol && e.mac != mac {
                    e.state = NdpState::Stale;
                } else {
                    e.state = NdpState::Reachable;
                }
                e.mac = mac;
                e.last_reachable = now;
                e.pending.take()
            }
            None => {
                cache.insert(
                    0,
                    NdpEntry {
                        ip: *ip,
                        mac,
                        state: if unsol {
                            NdpState::Stale
                        } else {
                            NdpState::Reachable
                        },
                        last_reachable: now,
                        delay_since: 0,
                        pending: None,
                    },
                );
                None
            }
        }
    };

    // Send our queued packet, if we have one.
    if let Some((hdr, data)) = pending {
        let _ = super::ipv6::send_packet(Some(nif), &hdr, &data);
    }

    gc(Some(nif));
    Ok(())
}

/// Send a neighbor solicitation to the solicited-node group of `ip`.
fn send_sol(nif: &NetIfRef, ip: &Ipv6Addr) {
    let dst = solicited_node_group(ip);
    let _ = icmp6::send_nsol(Some(nif), &dst, ip, false);
}

/// Resolve `ip` to a MAC. On a miss an incomplete entry is created, a
/// solicitation goes out, and the packet (if given) parks on the entry.
/// A Stale hit starts the Delay clock and still returns the MAC.
pub fn lookup(
    nif: &NetIfRef,
    ip: &Ipv6Addr,
    pending: Option<(&Ipv6Hdr, &[u8])>,
) -> Result<LookupResult, Errno> {
    gc(Some(nif));

    let now = timer::uptime_ms();
    let mut solicit = false;

    let result = {
        let mut cache = NDP_CACHE.lock();

        match cache.iter_mut().find(|e| e.ip == *ip) {
            Some(e) if e.state == NdpState::Incomplete => Some(LookupResult::Unresolved),
            Some(e) => {
                if e.state == NdpState::Stale {
                    e.state = NdpState::Delay;
                    e.delay_since = now;
                    solicit = true;
                }
                Some(LookupResult::Found(e.mac))
            }
            None => {
                cache.insert(
                    0,
                    NdpEntry {
                        ip: *ip,
                        mac: [0; 6],
                        state: NdpState::Incomplete,
                        last_reachable: now,
                        delay_since: 0,
                        pending: pending.map(|(h, d)| (h.clone(), d.to_vec())),
                    },
                );
                None
            }
        }
    };

    if let Some(r) = result {
        if solicit {
            send_sol(nif, ip);
        }
        return Ok(r);
    }

    send_sol(nif, ip);
    Ok(LookupResult::InProgress)
}

/// Current state of an entry, for diagnostics.
pub fn entry_state(ip: &Ipv6Addr) -> Option<NdpState> {
    NDP_CACHE.lock().iter().find(|e| e.ip == *ip).map(|e| e.state)
}

pub fn init() {
    NDP_CACHE.lock().clear();
}

pub fn shutdown() {
    NDP_CACHE.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::netif::{LoopbackDriver, NetIf};
    use alloc::sync::Arc;

    static NDP_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn test_if() -> NetIfRef {
        let drv = LoopbackDriver::new([2, 0, 0, 0, 0, 7]);
        Arc::new(spin::Mutex::new(NetIf::new("test6", alloc::boxed::Box::new(drv))))
    }

    #[test]
    fn rejects_multicast_and_unspecified() {
        let _g = NDP_TEST_LOCK.lock();
        let nif = test_if();
        assert!(insert(&nif, [2, 0, 0, 0, 0, 1], &super::super::ipv6::ALL_NODES, false).is_err());
        assert!(insert(&nif, [2, 0, 0, 0, 0, 1], &Ipv6Addr::UNSPECIFIED, false).is_err());
    }

    #[test]
    fn states_follow_rfc4861() {
        let _g = NDP_TEST_LOCK.lock();
        init();
        let nif = test_if();
        let peer: Ipv6Addr = "fe80::aa".parse().unwrap();

        // A solicited advertisement makes the entry Reachable.
        insert(&nif, [2, 0, 0, 0, 0, 0x11], &peer, false).unwrap();
        assert_eq!(entry_state(&peer), Some(NdpState::Reachable));

        // An unsolicited advertisement with a NEW mac demotes to Stale.
        insert(&nif, [2, 0, 0, 0, 0, 0x22], &peer, true).unwrap();
        assert_eq!(entry_state(&peer), Some(NdpState::Stale));

        // A lookup on a Stale entry returns the MAC but starts Delay.
        match lookup(&nif, &peer, None).unwrap() {
            LookupResult::Found(mac) => assert_eq!(mac[5], 0x22),
            _ => panic!("expected Found"),
        }
        assert_eq!(entry_state(&peer), Some(NdpState::Delay));

        // After the delay window, gc moves it to Probe and re-solicits.
        timer::advance_ms(DELAY_FIRST_PROBE_MS + 100);
        gc(Some(&nif));
        assert_eq!(entry_state(&peer), Some(NdpState::Probe));
    }

    #[test]
    fn miss_parks_and_solicits() {
        let _g = NDP_TEST_LOCK.lock();
        init();
        let nif = test_if();
        let peer: Ipv6Addr = "fe80::bb".parse().unwrap();

        assert!(matches!(
            lookup(&nif, &peer, None).unwrap(),
            LookupResult::InProgress
        ));
        // While incomplete, further lookups report Unresolved.
        assert!(matches!(
            lookup(&nif, &peer, None).unwrap(),
            LookupResult::Unresolved
        ));
        // A solicitation frame went out to the solicited-node group MAC.
        let frame = nif.lock().driver.rx().expect("no solicitation sent");
        assert_eq!(&frame[..2], &[0x33, 0x33]);
    }
}
