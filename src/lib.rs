/*
 * Marlin Kernel Runtime Core
 *
 * This crate is the architecture-independent core of the Marlin console OS:
 *
 * 1. THREADING: A pre-emptive priority round-robin scheduler with a
 *    cooperative fallback, joinable/detached threads, timed waits, and
 *    the "genwait" sleep-on-object primitive that every synchronization
 *    object is layered on.
 *
 * 2. NETWORKING: ARP/NDP neighbor resolution, an IPv4/IPv6 layer with
 *    fragmentation and reassembly, ICMPv4/ICMPv6 including neighbor
 *    discovery, UDP/UDP-Lite, and a full TCP implementation.
 *
 * 3. FILESYSTEM: An ext2 driver (block cache, inode cache, indirect block
 *    walks, directory management) behind a POSIX-style VFS.
 *
 * The hardware touches the crate only through narrow seams: the platform
 * layer supplies a context-switch implementation (sched::context), a
 * millisecond clock (utils::timer), block devices (fs::block_dev) and
 * network drivers (net::netif). Everything else lives here.
 */

#![cfg_attr(not(test), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod errno;
pub mod utils;

pub mod sched;
pub mod sync;

pub mod net;

pub mod fs;
pub mod vfs;

pub use errno::Errno;
