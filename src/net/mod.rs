/*
 * Network Core
 *
 * This module and the others in this tree handle the
 * architecture-independent part of the networking system:
 *
 * - Network card drivers register their interfaces here
 * - Link-level messages (ARP) are handled near here
 * - The whole networking system is brought up and torn down from here
 *
 * Bring-up order matters and mirrors the dependency chain: the worker
 * thread first, then neighbor caches, fragmentation, IPv6, the socket
 * framework, and the transports on top.
 */

pub mod arp;
pub mod checksum;
pub mod icmp4;
pub mod icmp6;
pub mod input;
pub mod ipv4;
pub mod ipv4_frag;
pub mod ipv6;
pub mod ndp;
pub mod netif;
pub mod socket;
pub mod tcp;
pub mod udp;
pub mod worker;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::errno::Errno;

pub use netif::{NetDriver, NetIf, NetIfRef, NetifFlags};

/// Active network interfaces.
static IF_LIST: Mutex<Vec<NetIfRef>> = Mutex::new(Vec::new());

/// The default device, used whenever a caller passes no interface.
static DEFAULT_DEV: Mutex<Option<NetIfRef>> = Mutex::new(None);

static INITTED: AtomicBool = AtomicBool::new(false);

/// Register a network device. Drivers may do this before net::init();
/// the device is probed and started there.
pub fn reg_device(nif: NetIfRef) -> Result<(), Errno> {
    let mut list = IF_LIST.lock();

    {
        let mut n = nif.lock();
        if n.flags.contains(NetifFlags::REGISTERED) {
            log::warn!("net: '{}' is already registered", n.name);
            return Err(Errno::EEXIST);
        }
        n.flags.insert(NetifFlags::REGISTERED);
    }

    list.push(nif);
    Ok(())
}

/// Unregister a network device.
pub fn unreg_device(nif: &NetIfRef) -> Result<(), Errno> {
    let mut list = IF_LIST.lock();
    let before = list.len();
    list.retain(|n| !Arc::ptr_eq(n, nif));

    if list.len() == before {
        log::warn!("net: device isn't registered");
        return Err(Errno::ENOENT);
    }

    nif.lock().flags.remove(NetifFlags::REGISTERED);
    Ok(())
}

/// Swap the default device; returns the old one.
pub fn set_default(nif: Option<NetIfRef>) -> Option<NetIfRef> {
    core::mem::replace(&mut *DEFAULT_DEV.lock(), nif)
}

/// The default device.
pub fn default_dev() -> Option<NetIfRef> {
    DEFAULT_DEV.lock().clone()
}

/// Resolve an optional interface argument to a concrete one.
pub(crate) fn dev_or_default(nif: Option<&NetIfRef>) -> Result<NetIfRef, Errno> {
    match nif {
        Some(n) => Ok(n.clone()),
        None => default_dev().ok_or(Errno::ENETDOWN),
    }
}

/// Probe, initialize and start every registered device; the first one
/// that comes up becomes the default.
pub fn dev_init() -> Result<(), Errno> {
    let list: Vec<NetIfRef> = IF_LIST.lock().clone();
    let mut detected = 0;

    for nif in list {
        let ok = {
            let mut n = nif.lock();

            if n.driver.detect().is_err() {
                false
            } else if n.driver.init().is_err() {
                false
            } else if n.driver.start().is_err() {
                let _ = n.driver.shutdown();
                false
            } else {
                n.flags.insert(NetifFlags::INITIALIZED | NetifFlags::RUNNING);
                true
            }
        };

        if ok {
            detected += 1;
            let mut def = DEFAULT_DEV.lock();
            if def.is_none() {
                *def = Some(nif.clone());
            }
        }
    }

    log::debug!("net: detected {} usable network device(s)", detected);
    Ok(())
}

/// Bring the whole networking system up.
pub fn init() -> Result<(), Errno> {
    if INITTED.load(Ordering::Acquire) {
        return Ok(());
    }

    // Detect and potentially initialize devices.
    dev_init()?;

    worker::init()?;
    arp::init();
    ndp::init();
    ipv4_frag::init()?;
    ipv6::init()?;
    socket::init();
    udp::init()?;
    tcp::init()?;

    INITTED.store(true, Ordering::Release);
    Ok(())
}

/// Tear the networking system down in reverse order.
pub fn shutdown() {
    if !INITTED.load(Ordering::Acquire) {
        return;
    }

    tcp::shutdown();
    udp::shutdown();
    socket::shutdown_framework();
    ipv6::shutdown();
    ipv4_frag::shutdown();
    ndp::shutdown();
    arp::shutdown();
    worker::shutdown();

    let list: Vec<NetIfRef> = IF_LIST.lock().drain(..).collect();
    for nif in list {
        let mut n = nif.lock();
        if n.flags.contains(NetifFlags::RUNNING) {
            let _ = n.driver.stop();
        }
        if n.flags.contains(NetifFlags::INITIALIZED) {
            let _ = n.driver.shutdown();
        }
        n.flags = NetifFlags::empty();
    }

    *DEFAULT_DEV.lock() = None;
    INITTED.store(false, Ordering::Release);
}
