/*
 * ext2 Filesystem Core
 *
 * The Ext2Fs handle owns the block device, the parsed superblock, the
 * block group descriptor table and the block cache, and carries the
 * mount flags. Everything the rest of the driver does goes through the
 * accessors here, which keep the fs-block to device-block conversion and
 * the read-only policy in one place.
 */

pub mod block;
pub mod directory;
pub mod inode;
pub mod superblock;
pub mod symlink;
pub mod vfs;

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::errno::Errno;
use crate::fs::block_dev::BlockDevice;

use block::{BlockCache, BlockIo, DEFAULT_CACHE_BLOCKS};
use superblock::{BgDesc, Superblock, BG_DESC_SIZE};

bitflags! {
    /// Mount flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Allow writes; absent means read-only.
        const RW = 0x0001;
    }
}

/// Mount id generator; keys the shared inode cache.
static NEXT_FS_ID: AtomicU64 = AtomicU64::new(1);

/// A mounted ext2 filesystem.
pub struct Ext2Fs {
    pub(crate) id: u64,
    dev: Box<dyn BlockDevice>,
    pub(crate) sb: Superblock,
    pub(crate) bgs: Vec<BgDesc>,
    cache: BlockCache,
    mnt_flags: MountFlags,
    /// Set when free-block/free-inode counters change; cleared on sync.
    pub(crate) sb_dirty: bool,
    /// Device blocks per filesystem block, as a shift.
    dev_shift: u32,
}

/// Adapter giving the block cache device access at fs-block granularity.
pub(crate) struct DevIo<'a> {
    dev: &'a mut dyn BlockDevice,
    shift: u32,
    blocks_count: u32,
}

impl BlockIo for DevIo<'_> {
    fn read(&mut self, block: u32, out: &mut [u8]) -> Result<(), Errno> {
        if block >= self.blocks_count {
            return Err(Errno::EINVAL);
        }
        self.dev
            .read_blocks((block as u64) << self.shift, 1usize << self.shift, out)
            .map_err(|_| Errno::EIO)
    }

    fn write(&mut self, block: u32, data: &[u8]) -> Result<(), Errno> {
        if block >= self.blocks_count {
            return Err(Errno::EINVAL);
        }
        self.dev
            .write_blocks((block as u64) << self.shift, 1usize << self.shift, data)
            .map_err(|_| Errno::EIO)
    }
}

impl Ext2Fs {
    /// Mount a filesystem from a block device.
    pub fn mount(dev: Box<dyn BlockDevice>, flags: MountFlags) -> Result<Self, Errno> {
        Self::mount_with_cache(dev, flags, DEFAULT_CACHE_BLOCKS)
    }

    pub fn mount_with_cache(
        mut dev: Box<dyn BlockDevice>,
        flags: MountFlags,
        cache_size: usize,
    ) -> Result<Self, Errno> {
        if flags.contains(MountFlags::RW) && !dev.can_write() {
            log::warn!("ext2: device does not support writing, cannot mount read-write");
            return Err(Errno::EROFS);
        }

        dev.init()?;

        let sb = superblock::read_superblock(dev.as_mut())?;

        // The ext2 block size must be at least as large as the device's
        // own sector size.
        let fs_log = sb.s_log_block_size + 10;
        let dev_log = dev.log_block_size();
        if fs_log < dev_log {
            dev.shutdown()?;
            return Err(Errno::EINVAL);
        }
        let dev_shift = fs_log - dev_log;

        let block_size = sb.block_size() as usize;

        // Figure out how many block groups we have.
        let bc = sb.s_blocks_count - sb.s_first_data_block;
        let mut bg_count = bc / sb.s_blocks_per_group;
        if bc % sb.s_blocks_per_group != 0 {
            bg_count += 1;
        }

        let mut fs = Self {
            id: NEXT_FS_ID.fetch_add(1, Ordering::Relaxed),
            dev,
            sb,
            bgs: Vec::new(),
            cache: BlockCache::new(cache_size, block_size),
            mnt_flags: flags,
            sb_dirty: false,
            dev_shift,
        };

        fs.read_blockgroups(bg_count)?;

        log::info!(
            "ext2: mounted fs #{} ({} blocks of {} bytes, {} groups, {})",
            fs.id,
            fs.sb.s_blocks_count,
            block_size,
            bg_count,
            if flags.contains(MountFlags::RW) {
                "read-write"
            } else {
                "read-only"
            }
        );

        Ok(fs)
    }

    /// Sync and release everything, shutting the device down.
    pub fn unmount(mut self) -> Result<(), Errno> {
        self.sync()?;
        inode::cache_drop_fs(self.id);
        self.dev.shutdown()
    }

    pub fn is_rw(&self) -> bool {
        self.mnt_flags.contains(MountFlags::RW)
    }

    pub fn block_size(&self) -> u32 {
        self.sb.block_size()
    }

    pub fn log_block_size(&self) -> u32 {
        self.sb.s_log_block_size + 10
    }

    /// i_blocks unit conversion: 512-byte sectors per filesystem block.
    pub fn sectors_per_block(&self) -> u32 {
        2 << self.sb.s_log_block_size
    }

    pub(crate) fn split_io(&mut self) -> (&mut BlockCache, DevIo<'_>) {
        let Self {
            dev,
            cache,
            sb,
            dev_shift,
            ..
        } = self;
        let io = DevIo {
            shift: *dev_shift,
            blocks_count: sb.s_blocks_count,
            dev: dev.as_mut(),
        };
        (cache, io)
    }

    /*************************************************************************/
    /* Block access */

    /// Uncached read of one filesystem block.
    pub fn block_read_nc(&mut self, block: u32, out: &mut [u8]) -> Result<(), Errno> {
        let (_, mut io) = self.split_io();
        io.read(block, out)
    }

    /// Uncached write of one filesystem block.
    pub fn block_write_nc(&mut self, block: u32, data: &[u8]) -> Result<(), Errno> {
        let (_, mut io) = self.split_io();
        io.write(block, data)
    }

    /// Cached read access.
    pub fn with_block<R>(&mut self, block: u32, f: impl FnOnce(&[u8]) -> R) -> Result<R, Errno> {
        let (cache, mut io) = self.split_io();
        cache.with_block(block, &mut io, f)
    }

    /// Cached write access; the block is marked dirty.
    pub fn with_block_mut<R>(
        &mut self,
        block: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, Errno> {
        let (cache, mut io) = self.split_io();
        cache.with_block_mut(block, &mut io, f)
    }

    /// Mark a cached block dirty.
    pub fn block_mark_dirty(&mut self, block: u32) -> Result<(), Errno> {
        self.cache.mark_dirty(block)
    }

    /// Flush the block cache. Read-only mounts are a no-op.
    pub fn block_cache_wb(&mut self) -> Result<(), Errno> {
        if !self.is_rw() {
            return Ok(());
        }
        let (cache, mut io) = self.split_io();
        cache.write_back(&mut io)
    }

    /*************************************************************************/
    /* Allocation */

    /// Try to allocate one block in the given group.
    fn block_alloc_in_group(&mut self, bg: u32) -> Result<Option<u32>, Errno> {
        if self.bgs[bg as usize].bg_free_blocks_count == 0 {
            return Ok(None);
        }

        let bitmap_block = self.bgs[bg as usize].bg_block_bitmap;
        let last = self.sb.s_blocks_per_group - 1;
        let index = self.with_block(bitmap_block, |d| block::bit_find_zero(d, 0, last))?;

        let Some(index) = index else {
            log::warn!(
                "ext2: block group {} indicates that it has free blocks, but doesn't \
                 appear to. Please run fsck on this volume!",
                bg
            );
            return Ok(None);
        };

        self.with_block_mut(bitmap_block, |d| block::bit_set(d, index))?;
        self.bgs[bg as usize].bg_free_blocks_count -= 1;
        self.sb.s_free_blocks_count -= 1;
        self.sb_dirty = true;

        let bn = index + bg * self.sb.s_blocks_per_group + self.sb.s_first_data_block;

        // Hand the block back zero-filled.
        self.with_block_mut(bn, |d| d.fill(0))?;
        Ok(Some(bn))
    }

    /// Allocate and zero one data block, preferring block group `bg`.
    pub fn block_alloc(&mut self, bg: u32) -> Result<u32, Errno> {
        if !self.is_rw() {
            return Err(Errno::EROFS);
        }
        if self.sb.s_free_blocks_count == 0 {
            return Err(Errno::ENOSPC);
        }

        if let Some(bn) = self.block_alloc_in_group(bg)? {
            return Ok(bn);
        }

        for group in 0..self.bgs.len() as u32 {
            if group == bg {
                continue;
            }
            if let Some(bn) = self.block_alloc_in_group(group)? {
                return Ok(bn);
            }
        }

        log::warn!(
            "ext2: filesystem indicates that it has free blocks, but doesn't appear \
             to. Please run fsck on this volume!"
        );
        Err(Errno::ENOSPC)
    }

    /// Return a block to the free pool.
    pub fn block_free(&mut self, blk: u32) -> Result<(), Errno> {
        let bg = (blk - self.sb.s_first_data_block) / self.sb.s_blocks_per_group;
        let index = (blk - self.sb.s_first_data_block) % self.sb.s_blocks_per_group;
        let bitmap_block = self.bgs[bg as usize].bg_block_bitmap;

        self.with_block_mut(bitmap_block, |d| block::bit_clear(d, index))?;
        self.bgs[bg as usize].bg_free_blocks_count += 1;
        self.sb.s_free_blocks_count += 1;
        self.sb_dirty = true;
        Ok(())
    }

    /*************************************************************************/
    /* Superblock / block group persistence */

    fn read_blockgroups(&mut self, bg_count: u32) -> Result<(), Errno> {
        let block_size = self.block_size() as usize;
        let per_block = block_size / BG_DESC_SIZE;
        let mut buf = alloc::vec![0u8; block_size];
        let mut block = self.sb.s_first_data_block + 1;
        let mut remaining = bg_count as usize;

        self.bgs = Vec::with_capacity(bg_count as usize);
        while remaining > 0 {
            self.block_read_nc(block, &mut buf)?;
            let n = core::cmp::min(remaining, per_block);
            for i in 0..n {
                self.bgs.push(BgDesc::parse(&buf[i * BG_DESC_SIZE..]));
            }
            remaining -= n;
            block += 1;
        }
        Ok(())
    }

    fn write_blockgroups(&mut self) -> Result<(), Errno> {
        let block_size = self.block_size() as usize;
        let per_block = block_size / BG_DESC_SIZE;
        let mut buf = alloc::vec![0u8; block_size];
        let mut block = self.sb.s_first_data_block + 1;

        let bgs = self.bgs.clone();
        for chunk in bgs.chunks(per_block) {
            buf.fill(0);
            for (i, bg) in chunk.iter().enumerate() {
                bg.encode(&mut buf[i * BG_DESC_SIZE..]);
            }
            self.block_write_nc(block, &buf)?;
            block += 1;
        }
        Ok(())
    }

    /// Flush everything dirty: inodes, blocks, then superblock and group
    /// descriptors. Read-only mounts are a no-op.
    pub fn sync(&mut self) -> Result<(), Errno> {
        if !self.is_rw() {
            return Ok(());
        }

        inode::cache_write_back(self)?;
        self.block_cache_wb()?;

        if self.sb_dirty {
            superblock::write_superblock(self.dev.as_mut(), &self.sb)?;
            self.write_blockgroups()?;
            self.sb_dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testimg {
    /* Test scaffolding: format a minimal one-group ext2 image on a ram
     * disk. 1024-byte blocks, 128-byte inodes, FILETYPE feature on,
     * revision 1. Layout: boot, superblock, group descriptors, block
     * bitmap, inode bitmap, inode table, root directory, data. */

    use super::inode;
    use crate::fs::block_dev::{BlockDevice, RamDisk};

    const BLOCK: usize = 1024;

    fn wr16(b: &mut [u8], off: usize, v: u16) {
        b[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn wr32(b: &mut [u8], off: usize, v: u32) {
        b[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_block(rd: &mut RamDisk, block: u32, data: &[u8]) {
        rd.write_blocks((block as u64) * 2, 2, data).unwrap();
    }

    /// Format a fresh filesystem of `blocks` 1024-byte blocks (at least
    /// 32) with `inodes` inodes (multiple of 8, at most 512).
    pub fn mkfs(blocks: u32, inodes: u32) -> RamDisk {
        assert!(blocks >= 32 && inodes >= 16 && inodes % 8 == 0);

        let mut rd = RamDisk::new((blocks as usize) * 2);

        let inode_table_blocks = inodes.div_ceil(8); // 128-byte inodes
        let first_data = 5 + inode_table_blocks; // first block past the metadata
        let root_block = first_data;
        // Blocks 1..first_data are metadata; root dir takes one more.
        let used_blocks = first_data; // count of used bits (blocks 1..=first_data)
        let free_blocks = (blocks - 1) - used_blocks;
        let reserved_inodes = 10;
        let free_inodes = inodes - reserved_inodes;

        // Superblock.
        let mut sb = [0u8; 1024];
        wr32(&mut sb, 0, inodes);
        wr32(&mut sb, 4, blocks);
        wr32(&mut sb, 12, free_blocks);
        wr32(&mut sb, 16, free_inodes);
        wr32(&mut sb, 20, 1); // first data block
        wr32(&mut sb, 24, 0); // log block size: 1024
        wr32(&mut sb, 32, 8192); // blocks per group
        wr32(&mut sb, 40, inodes); // inodes per group
        wr16(&mut sb, 52, 1); // mount count
        wr16(&mut sb, 56, super::superblock::EXT2_MAGIC);
        wr16(&mut sb, 58, super::superblock::EXT2_VALID_FS);
        wr32(&mut sb, 76, super::superblock::EXT2_DYNAMIC_REV);
        wr32(&mut sb, 84, 11); // first_ino
        wr16(&mut sb, 88, 128); // inode size
        wr32(&mut sb, 96, super::superblock::EXT2_FEATURE_INCOMPAT_FILETYPE);
        put_block(&mut rd, 1, &sb);

        // Group descriptor.
        let mut bgd = [0u8; 1024];
        wr32(&mut bgd, 0, 3); // block bitmap
        wr32(&mut bgd, 4, 4); // inode bitmap
        wr32(&mut bgd, 8, 5); // inode table
        wr16(&mut bgd, 12, free_blocks as u16);
        wr16(&mut bgd, 14, free_inodes as u16);
        wr16(&mut bgd, 16, 1); // used dirs (root)
        put_block(&mut rd, 2, &bgd);

        // Block bitmap: bit b-1 covers block b. Mark metadata + root
        // block used, and everything past the end of the volume used so
        // the allocator never wanders off the disk.
        let mut bbm = [0u8; 1024];
        for bit in 0..8192u32 {
            let block_num = bit + 1;
            if block_num <= root_block || block_num >= blocks {
                bbm[(bit >> 3) as usize] |= 1 << (bit & 7);
            }
        }
        put_block(&mut rd, 3, &bbm);

        // Inode bitmap: inodes 1..=10 reserved, rest free; padding past
        // the inode count marked used.
        let mut ibm = [0u8; 1024];
        for bit in 0..8192u32 {
            let ino = bit + 1;
            if ino <= reserved_inodes || ino > inodes {
                ibm[(bit >> 3) as usize] |= 1 << (bit & 7);
            }
        }
        put_block(&mut rd, 4, &ibm);

        // Inode table: all zero except the root inode (number 2).
        let mut itable = alloc::vec![0u8; (inode_table_blocks as usize) * BLOCK];
        {
            let root = &mut itable[128..256]; // inode 2, second record
            wr16(root, 0, inode::EXT2_S_IFDIR | 0o755);
            wr32(root, 4, BLOCK as u32); // size
            wr16(root, 26, 2); // links: "." and ".."
            wr32(root, 28, 2); // i_blocks in sectors
            wr32(root, 40, root_block); // i_block[0]
        }
        for (i, chunk) in itable.chunks(BLOCK).enumerate() {
            put_block(&mut rd, 5 + i as u32, chunk);
        }

        // Root directory data: "." then ".." filling the block.
        let mut rootdir = [0u8; 1024];
        wr32(&mut rootdir, 0, 2);
        wr16(&mut rootdir, 4, 12);
        rootdir[6] = 1;
        rootdir[7] = super::directory::EXT2_FT_DIR;
        rootdir[8] = b'.';
        wr32(&mut rootdir, 12, 2);
        wr16(&mut rootdir, 16, (BLOCK - 12) as u16);
        rootdir[18] = 2;
        rootdir[19] = super::directory::EXT2_FT_DIR;
        rootdir[20] = b'.';
        rootdir[21] = b'.';
        put_block(&mut rd, root_block, &rootdir);

        rd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::block_dev::RamDisk;

    fn mount_fresh() -> Ext2Fs {
        let rd = testimg::mkfs(256, 64);
        Ext2Fs::mount(alloc::boxed::Box::new(rd), MountFlags::RW).unwrap()
    }

    #[test]
    fn mounts_and_reads_root() {
        let mut fs = mount_fresh();
        assert_eq!(fs.block_size(), 1024);
        assert_eq!(fs.bgs.len(), 1);

        let root = inode::get(&mut fs, inode::EXT2_ROOT_INO).unwrap();
        let ino = inode::read(&root);
        assert!(ino.is_dir());
        assert_eq!(ino.i_links_count, 2);
        inode::put(&mut fs, root);
    }

    #[test]
    fn block_alloc_updates_counters_and_bitmap() {
        let mut fs = mount_fresh();
        let free_before = fs.sb.s_free_blocks_count;

        let bn = fs.block_alloc(0).unwrap();
        assert!(bn > 0 && bn < fs.sb.s_blocks_count);
        assert_eq!(fs.sb.s_free_blocks_count, free_before - 1);
        assert!(fs.sb_dirty);

        // The bitmap count invariant: set bits + free == total in group.
        let bitmap_block = fs.bgs[0].bg_block_bitmap;
        let in_volume = fs.sb.s_blocks_count - fs.sb.s_first_data_block;
        let used = fs
            .with_block(bitmap_block, |d| block::bit_count(d, in_volume))
            .unwrap();
        assert_eq!(used + fs.sb.s_free_blocks_count, in_volume);

        fs.block_free(bn).unwrap();
        assert_eq!(fs.sb.s_free_blocks_count, free_before);
    }

    #[test]
    fn inode_cache_refcount_lifecycle() {
        let mut fs = mount_fresh();

        let a = inode::get(&mut fs, inode::EXT2_ROOT_INO).unwrap();
        let b = inode::get(&mut fs, inode::EXT2_ROOT_INO).unwrap();
        // Two checkouts of the same inode share a slot.
        inode::put(&mut fs, a);
        // Still referenced: a mutation through b is visible on re-get.
        inode::with_mut(&b, |i| i.i_generation = 7);
        inode::put(&mut fs, b);

        let c = inode::get(&mut fs, inode::EXT2_ROOT_INO).unwrap();
        assert_eq!(inode::read(&c).i_generation, 7);
        inode::put(&mut fs, c);
    }

    #[test]
    fn alloc_block_walks_into_indirection() {
        let mut fs = mount_fresh();
        let root = inode::get(&mut fs, inode::EXT2_ROOT_INO).unwrap();

        // Allocate a file inode and push it past the direct blocks.
        let f = inode::alloc(&mut fs, root.num).unwrap();
        inode::with_mut(&f, |i| {
            i.i_mode = inode::EXT2_S_IFREG;
            i.i_links_count = 1;
        });

        let mut phys = alloc::vec::Vec::new();
        for l in 0..14u32 {
            phys.push(inode::alloc_block(&mut fs, &f, l).unwrap());
        }

        let ino = inode::read(&f);
        assert!(ino.i_block[..12].iter().all(|&b| b != 0));
        assert_ne!(ino.i_block[12], 0, "indirect table expected");
        // 14 data blocks + 1 indirect table, in 512-byte sectors.
        assert_eq!(ino.i_blocks, 15 * fs.sectors_per_block());

        // The read walk maps every logical block back to what alloc gave.
        inode::with_mut(&f, |i| i.set_size64(14 * 1024));
        let ino = inode::read(&f);
        for (l, &p) in phys.iter().enumerate() {
            assert_eq!(inode::read_block(&mut fs, &ino, l as u32).unwrap(), p);
        }

        // Freeing everything restores the free-block count.
        let free_before_file = fs.sb.s_free_blocks_count + 15;
        inode::free_all(&mut fs, &f, false).unwrap();
        assert_eq!(fs.sb.s_free_blocks_count, free_before_file);

        inode::put(&mut fs, f);
        inode::put(&mut fs, root);
    }

    #[test]
    fn directory_add_find_remove_preserves_reclen_invariant() {
        let mut fs = mount_fresh();
        let root = inode::get(&mut fs, inode::EXT2_ROOT_INO).unwrap();
        let rino = inode::read(&root);

        directory::add_entry(&mut fs, &root, "alpha", 11, directory::EXT2_FT_REG_FILE).unwrap();
        directory::add_entry(&mut fs, &root, "beta", 12, directory::EXT2_FT_REG_FILE).unwrap();

        let rino2 = inode::read(&root);
        let found = directory::entry(&mut fs, &rino2, "alpha").unwrap().unwrap();
        assert_eq!(found.inode, 11);

        // rec_len sums to the block size before and after removal.
        let sum_reclen = |fs: &mut Ext2Fs, dir: &inode::DiskInode| -> usize {
            let bn = inode::read_block(fs, dir, 0).unwrap();
            fs.with_block(bn, |d| {
                let mut off = 0;
                while off < 1024 {
                    let rl = u16::from_le_bytes([d[off + 4], d[off + 5]]) as usize;
                    assert!(rl != 0);
                    off += rl;
                }
                off
            })
            .unwrap()
        };
        assert_eq!(sum_reclen(&mut fs, &rino2), 1024);

        let removed = directory::rm_entry(&mut fs, &rino2, "alpha").unwrap();
        assert_eq!(removed, 11);
        assert_eq!(sum_reclen(&mut fs, &rino2), 1024);
        assert!(directory::entry(&mut fs, &rino2, "alpha").unwrap().is_none());
        assert!(directory::entry(&mut fs, &rino2, "beta").unwrap().is_some());

        let _ = rino;
        inode::put(&mut fs, root);
    }

    #[test]
    fn sync_persists_superblock_counters() {
        let mut fs = mount_fresh();
        let bn = fs.block_alloc(0).unwrap();
        let free_after = fs.sb.s_free_blocks_count;
        let _ = bn;

        fs.sync().unwrap();
        assert!(!fs.sb_dirty);

        // Read the superblock straight off the device and compare.
        let mut raw = [0u8; 1024];
        fs.block_read_nc(1, &mut raw).unwrap();
        let sb2 = superblock::Superblock::parse(&raw).unwrap();
        assert_eq!(sb2.s_free_blocks_count, free_after);
    }
}
