/*
 * Network Interface Abstraction
 *
 * The NetDriver trait is the narrow contract a hardware driver
 * implements: bring-up, teardown, frame tx/rx and multicast filter
 * programming. NetIf wraps a driver with the addressing state the stack
 * manages: IPv4 address/netmask/gateway/broadcast, the IPv6 link-local
 * and global addresses, MTU and hop limit.
 *
 * Ethernet framing happens here: a frame is dst[6] src[6] ethertype[2]
 * followed by payload.
 */

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::net::Ipv6Addr;

use crate::errno::Errno;

/// Ethernet header length.
pub const ETH_HLEN: usize = 14;

/// Ethertypes the stack speaks.
pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_IPV6: u16 = 0x86DD;

/// Largest ethernet payload we will emit.
pub const ETH_MTU: usize = 1500;

/// The all-ones broadcast MAC.
pub const MAC_BROADCAST: [u8; 6] = [0xFF; 6];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NetifFlags: u32 {
        const REGISTERED  = 1 << 0;
        const INITIALIZED = 1 << 1;
        const RUNNING     = 1 << 2;
    }
}

/// The hardware contract.
pub trait NetDriver: Send + Sync {
    /// Is the hardware present at all?
    fn detect(&mut self) -> Result<(), Errno>;
    fn init(&mut self) -> Result<(), Errno>;
    fn start(&mut self) -> Result<(), Errno>;
    fn stop(&mut self) -> Result<(), Errno>;
    fn shutdown(&mut self) -> Result<(), Errno>;

    /// Transmit one complete ethernet frame.
    fn tx(&mut self, frame: &[u8], blocking: bool) -> Result<(), Errno>;

    /// Pull one received frame, if any is pending.
    fn rx(&mut self) -> Option<Vec<u8>>;

    /// Program the multicast filter with the given MAC list.
    fn set_mc(&mut self, macs: &[[u8; 6]]) -> Result<(), Errno>;

    /// The burned-in hardware address.
    fn mac_addr(&self) -> [u8; 6];
}

/// One network interface: driver plus addressing state.
pub struct NetIf {
    pub name: String,
    pub driver: Box<dyn NetDriver>,
    pub flags: NetifFlags,
    pub mac: [u8; 6],

    /* IPv4 */
    pub ip_addr: [u8; 4],
    pub netmask: [u8; 4],
    pub gateway: [u8; 4],
    pub broadcast: [u8; 4],
    pub mtu: usize,

    /* IPv6 */
    pub ip6_lladdr: Ipv6Addr,
    pub ip6_addrs: Vec<Ipv6Addr>,
    pub ip6_gateway: Ipv6Addr,
    pub hop_limit: u8,
    pub mtu6: u32,

    /// Multicast MACs we are subscribed to.
    pub mc_list: Vec<[u8; 6]>,
}

/// Shared handle to an interface.
pub type NetIfRef = Arc<spin::Mutex<NetIf>>;

impl NetIf {
    pub fn new(name: &str, driver: Box<dyn NetDriver>) -> Self {
        let mac = driver.mac_addr();
        Self {
            name: String::from(name),
            driver,
            flags: NetifFlags::empty(),
            mac,
            ip_addr: [0; 4],
            netmask: [0; 4],
            gateway: [0; 4],
            broadcast: [255; 4],
            mtu: ETH_MTU,
            ip6_lladdr: lladdr_from_mac(&mac),
            ip6_addrs: Vec::new(),
            ip6_gateway: Ipv6Addr::UNSPECIFIED,
            hop_limit: 0,
            mtu6: ETH_MTU as u32,
            mc_list: Vec::new(),
        }
    }

    /// Transmit a payload wrapped in an ethernet header. The frame is
    /// assembled in a bounded buffer; anything past the MTU is the
    /// caller's bug and comes back as EMSGSIZE rather than a panic.
    pub fn tx_frame(&mut self, dst_mac: &[u8; 6], ethertype: u16, payload: &[u8]) -> Result<(), Errno> {
        let mut frame: heapless::Vec<u8, { ETH_HLEN + ETH_MTU }> = heapless::Vec::new();
        frame.extend_from_slice(dst_mac).map_err(|_| Errno::EMSGSIZE)?;
        frame.extend_from_slice(&self.mac).map_err(|_| Errno::EMSGSIZE)?;
        frame
            .extend_from_slice(&ethertype.to_be_bytes())
            .map_err(|_| Errno::EMSGSIZE)?;
        frame.extend_from_slice(payload).map_err(|_| Errno::EMSGSIZE)?;
        self.driver.tx(&frame, true)
    }

    /// Join a multicast MAC group, reprogramming the filter.
    pub fn multicast_add(&mut self, mac: [u8; 6]) -> Result<(), Errno> {
        if !self.mc_list.contains(&mac) {
            self.mc_list.push(mac);
            let list = self.mc_list.clone();
            self.driver.set_mc(&list)?;
        }
        Ok(())
    }

    /// Leave a multicast MAC group.
    pub fn multicast_del(&mut self, mac: [u8; 6]) -> Result<(), Errno> {
        let before = self.mc_list.len();
        self.mc_list.retain(|m| *m != mac);
        if self.mc_list.len() != before {
            let list = self.mc_list.clone();
            self.driver.set_mc(&list)?;
        }
        Ok(())
    }

    /// Whether we care about frames sent to this multicast MAC.
    pub fn multicast_check(&self, mac: &[u8]) -> bool {
        self.mc_list.iter().any(|m| m == mac)
    }
}

/// Derive the EUI-64 link-local address from a MAC.
pub fn lladdr_from_mac(mac: &[u8; 6]) -> Ipv6Addr {
    let mut o = [0u8; 16];
    o[0] = 0xFE;
    o[1] = 0x80;
    o[8] = mac[0] ^ 0x02;
    o[9] = mac[1];
    o[10] = mac[2];
    o[11] = 0xFF;
    o[12] = 0xFE;
    o[13] = mac[3];
    o[14] = mac[4];
    o[15] = mac[5];
    Ipv6Addr::from(o)
}

/// The solicited-node multicast group for a unicast address:
/// ff02::1:ffXX:XXXX over the low 24 bits.
pub fn solicited_node_group(addr: &Ipv6Addr) -> Ipv6Addr {
    let o = addr.octets();
    Ipv6Addr::from([
        0xFF, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xFF, o[13], o[14], o[15],
    ])
}

/// The ethernet MAC an IPv6 multicast group maps to (33:33 + low 32).
pub fn multicast_mac_v6(addr: &Ipv6Addr) -> [u8; 6] {
    let o = addr.octets();
    [0x33, 0x33, o[12], o[13], o[14], o[15]]
}

/// Whether an address is a v4-mapped IPv6 address (::ffff:a.b.c.d).
pub fn is_v4_mapped(addr: &Ipv6Addr) -> bool {
    addr.to_ipv4_mapped().is_some()
}

/// Extract the IPv4 address out of a v4-mapped address.
pub fn v4_of(addr: &Ipv6Addr) -> Option<[u8; 4]> {
    addr.to_ipv4_mapped().map(|v4| v4.octets())
}

/// Wrap an IPv4 address into its v4-mapped IPv6 form.
pub fn v4_mapped(addr: [u8; 4]) -> Ipv6Addr {
    let mut o = [0u8; 16];
    o[10] = 0xFF;
    o[11] = 0xFF;
    o[12..16].copy_from_slice(&addr);
    Ipv6Addr::from(o)
}

/// Whether the address is in fe80::/10.
pub fn is_linklocal(addr: &Ipv6Addr) -> bool {
    let o = addr.octets();
    o[0] == 0xFE && (o[1] & 0xC0) == 0x80
}

/// Whether the address is link-local-scope multicast (ff02::/16).
pub fn is_mc_linklocal(addr: &Ipv6Addr) -> bool {
    let o = addr.octets();
    o[0] == 0xFF && (o[1] & 0x0F) == 0x02
}

/// Loopback driver used for testing and for the loopback interface: tx
/// frames are queued and can be popped as rx frames.
pub struct LoopbackDriver {
    mac: [u8; 6],
    queue: Vec<Vec<u8>>,
}

impl LoopbackDriver {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            mac,
            queue: Vec::new(),
        }
    }

    /// Frames transmitted so far, oldest first.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.queue
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl NetDriver for LoopbackDriver {
    fn detect(&mut self) -> Result<(), Errno> {
        Ok(())
    }
    fn init(&mut self) -> Result<(), Errno> {
        Ok(())
    }
    fn start(&mut self) -> Result<(), Errno> {
        Ok(())
    }
    fn stop(&mut self) -> Result<(), Errno> {
        Ok(())
    }
    fn shutdown(&mut self) -> Result<(), Errno> {
        Ok(())
    }

    fn tx(&mut self, frame: &[u8], _blocking: bool) -> Result<(), Errno> {
        self.queue.push(frame.to_vec());
        Ok(())
    }

    fn rx(&mut self) -> Option<Vec<u8>> {
        if self.queue.is_empty() {
            None
        } else {
            Some(self.queue.remove(0))
        }
    }

    fn set_mc(&mut self, _macs: &[[u8; 6]]) -> Result<(), Errno> {
        Ok(())
    }

    fn mac_addr(&self) -> [u8; 6] {
        self.mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lladdr_flips_the_local_bit() {
        let ll = lladdr_from_mac(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let o = ll.octets();
        assert_eq!(&o[..2], &[0xFE, 0x80]);
        assert_eq!(o[8], 0x02);
        assert_eq!(o[11], 0xFF);
        assert_eq!(o[12], 0xFE);
        assert_eq!(o[15], 0x55);
    }

    #[test]
    fn solicited_node_takes_low_24_bits() {
        let a: Ipv6Addr = "fe80::0211:22ff:fe33:4455".parse().unwrap();
        let g = solicited_node_group(&a);
        let o = g.octets();
        assert_eq!(&o[..2], &[0xFF, 0x02]);
        assert_eq!(o[11], 0x01);
        assert_eq!(o[12], 0xFF);
        assert_eq!(&o[13..], &[0x33, 0x44, 0x55]);
    }

    #[test]
    fn v4_mapping_roundtrip() {
        let m = v4_mapped([192, 168, 1, 2]);
        assert!(is_v4_mapped(&m));
        assert_eq!(v4_of(&m), Some([192, 168, 1, 2]));
        assert!(!is_v4_mapped(&Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn frames_carry_the_ethernet_header() {
        let drv = LoopbackDriver::new([2, 0, 0, 0, 0, 1]);
        let mut nif = NetIf::new("lo0", Box::new(drv));
        nif.tx_frame(&MAC_BROADCAST, ETH_TYPE_ARP, &[1, 2, 3]).unwrap();
        let frame = nif.driver.rx().unwrap();
        assert_eq!(&frame[..6], &MAC_BROADCAST);
        assert_eq!(&frame[6..12], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        assert_eq!(&frame[14..], &[1, 2, 3]);
    }
}
