/*
 * Main Packet Input System
 *
 * The ethertype demux. Drivers (or their IRQ handlers) call input() for
 * every received frame; an installable hook lets a sniffer or test
 * harness take over the input path.
 */

use spin::Mutex;

use super::netif::{NetIfRef, ETH_HLEN, ETH_TYPE_ARP, ETH_TYPE_IPV4, ETH_TYPE_IPV6, MAC_BROADCAST};
use super::{arp, ipv4, ipv6};

/// Alternate input target.
pub type InputFn = fn(&NetIfRef, &[u8]) -> i32;

static INPUT_TARGET: Mutex<Option<InputFn>> = Mutex::new(None);

fn default_input(nif: &NetIfRef, frame: &[u8]) -> i32 {
    if frame.len() < ETH_HLEN {
        return -1;
    }

    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

    // If this is bound for a multicast address, make sure we actually
    // care about the group it was sent to.
    if frame[0] & 0x01 != 0 && frame[..6] != MAC_BROADCAST {
        let cares = nif.lock().multicast_check(&frame[..6]);
        if !cares {
            return 0;
        }
    }

    match ethertype {
        ETH_TYPE_IPV4 => ipv4::input(Some(nif), &frame[ETH_HLEN..]),
        ETH_TYPE_ARP => arp::input(nif, frame),
        ETH_TYPE_IPV6 => ipv6::input(Some(nif), &frame[ETH_HLEN..], Some(&frame[6..12])),
        _ => 0,
    }
}

/// Process an incoming frame.
pub fn input(nif: &NetIfRef, frame: &[u8]) -> i32 {
    let hook = *INPUT_TARGET.lock();
    match hook {
        Some(f) => f(nif, frame),
        None => default_input(nif, frame),
    }
}

/// Install an alternate input target; returns the old one.
pub fn set_target(target: Option<InputFn>) -> Option<InputFn> {
    core::mem::replace(&mut *INPUT_TARGET.lock(), target)
}
