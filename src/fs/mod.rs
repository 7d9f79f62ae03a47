/*
 * Filesystem Support
 *
 * The block-device contract the drivers implement, a ram-backed device
 * for tooling and tests, and the ext2 driver.
 */

pub mod block_dev;
pub mod ext2;

pub use block_dev::{BlockDevice, RamDisk};
