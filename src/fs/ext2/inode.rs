/*
 * ext2 Inode Management
 *
 * The on-disk inode image, the shared inode cache, and the block walks.
 *
 * The cache is one global pool shared by every mount: a chained hash
 * table keyed by (filesystem id, inode number) for lookup, plus a tail
 * queue of zero-reference slots for reuse. A slot whose refcount drops
 * to zero STAYS in the hash table while sitting on the free tail, so a
 * later get() can revive it without touching the disk. Slots are only
 * truly recycled when the free tail is popped for a new inode.
 *
 * Callers hold InodeRef handles and must put() them; the handle is a
 * stable index into the pool, which is how a memory-safe rendition of
 * "return a pointer into the cache" comes out.
 */

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use crate::errno::Errno;
use crate::utils::timer;

use super::block;
use super::directory;
use super::symlink;
use super::Ext2Fs;

/// log2 of the inode pool size.
const LOG_MAX_INODES: usize = 8;
const MAX_INODES: usize = 1 << LOG_MAX_INODES;
const HASH_SZ: usize = 1 << LOG_MAX_INODES;

/// Reserved inode numbers.
pub const EXT2_BAD_INO: u32 = 1;
pub const EXT2_ROOT_INO: u32 = 2;

/// i_mode file type values.
pub const EXT2_S_IFSOCK: u16 = 0xC000;
pub const EXT2_S_IFLNK: u16 = 0xA000;
pub const EXT2_S_IFREG: u16 = 0x8000;
pub const EXT2_S_IFBLK: u16 = 0x6000;
pub const EXT2_S_IFDIR: u16 = 0x4000;
pub const EXT2_S_IFCHR: u16 = 0x2000;
pub const EXT2_S_IFIFO: u16 = 0x1000;
pub const EXT2_S_IFMT: u16 = 0xF000;

/// i_mode permission bits (user class).
pub const EXT2_S_IRUSR: u16 = 0x0100;
pub const EXT2_S_IWUSR: u16 = 0x0080;
pub const EXT2_S_IXUSR: u16 = 0x0040;

/// xattr block header magic.
const EXT2_XATTR_MAGIC: u32 = 0xEA02_0000;

/// Maximum symlink indirections in one path walk.
pub const SYMLOOP_MAX: u32 = 16;

/// Longest path we will resolve, matching the 4096-byte symlink cap.
pub const PATH_MAX: usize = 4096;

/// On-disk inode image, host-order fields. 128 bytes on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskInode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_osd1: u32,
    pub i_block: [u32; 15],
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_dir_acl: u32,
    pub i_faddr: u32,
    pub i_osd2: [u8; 12],
}

impl DiskInode {
    pub fn parse(buf: &[u8]) -> Self {
        let rd16 = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);
        let rd32 = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);

        let mut i_block = [0u32; 15];
        for (i, b) in i_block.iter_mut().enumerate() {
            *b = rd32(40 + i * 4);
        }

        let mut i_osd2 = [0u8; 12];
        i_osd2.copy_from_slice(&buf[116..128]);

        Self {
            i_mode: rd16(0),
            i_uid: rd16(2),
            i_size: rd32(4),
            i_atime: rd32(8),
            i_ctime: rd32(12),
            i_mtime: rd32(16),
            i_dtime: rd32(20),
            i_gid: rd16(24),
            i_links_count: rd16(26),
            i_blocks: rd32(28),
            i_flags: rd32(32),
            i_osd1: rd32(36),
            i_block,
            i_generation: rd32(100),
            i_file_acl: rd32(104),
            i_dir_acl: rd32(108),
            i_faddr: rd32(112),
            i_osd2,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        let mut wr16 = |o: usize, v: u16| out[o..o + 2].copy_from_slice(&v.to_le_bytes());
        wr16(0, self.i_mode);
        wr16(2, self.i_uid);
        wr16(24, self.i_gid);
        wr16(26, self.i_links_count);

        let mut wr32 = |o: usize, v: u32| out[o..o + 4].copy_from_slice(&v.to_le_bytes());
        wr32(4, self.i_size);
        wr32(8, self.i_atime);
        wr32(12, self.i_ctime);
        wr32(16, self.i_mtime);
        wr32(20, self.i_dtime);
        wr32(28, self.i_blocks);
        wr32(32, self.i_flags);
        wr32(36, self.i_osd1);
        for (i, b) in self.i_block.iter().enumerate() {
            wr32(40 + i * 4, *b);
        }
        wr32(100, self.i_generation);
        wr32(104, self.i_file_acl);
        wr32(108, self.i_dir_acl);
        wr32(112, self.i_faddr);
        out[116..128].copy_from_slice(&self.i_osd2);
    }

    pub fn ftype(&self) -> u16 {
        self.i_mode & EXT2_S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.ftype() == EXT2_S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.ftype() == EXT2_S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.ftype() == EXT2_S_IFLNK
    }

    /// Size of a regular file as a 64-bit value; the upper half lives in
    /// i_dir_acl when the LARGE_FILE feature is active.
    pub fn size64(&self) -> u64 {
        if self.is_reg() {
            (self.i_size as u64) | ((self.i_dir_acl as u64) << 32)
        } else {
            self.i_size as u64
        }
    }

    pub fn set_size64(&mut self, sz: u64) {
        self.i_size = sz as u32;
        if self.is_reg() {
            self.i_dir_acl = (sz >> 32) as u32;
        }
    }

    /// The raw i_block area as bytes; fast symlinks store their target
    /// here.
    pub fn block_area(&self) -> [u8; 60] {
        let mut out = [0u8; 60];
        for (i, b) in self.i_block.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&b.to_le_bytes());
        }
        out
    }

    pub fn set_block_area(&mut self, data: &[u8]) {
        let mut area = [0u8; 60];
        area[..data.len().min(60)].copy_from_slice(&data[..data.len().min(60)]);
        for (i, b) in self.i_block.iter_mut().enumerate() {
            *b = u32::from_le_bytes([
                area[i * 4],
                area[i * 4 + 1],
                area[i * 4 + 2],
                area[i * 4 + 3],
            ]);
        }
    }
}

/*****************************************************************************/
/* The shared inode cache */

struct Slot {
    inode: DiskInode,
    fs_id: u64,
    num: u32,
    refcnt: u32,
    dirty: bool,
}

struct InodeCache {
    slots: Vec<Slot>,
    /// Hash buckets of slot indices, keyed by inode number.
    hash: Vec<Vec<usize>>,
    /// Tail queue of zero-reference slots; head is the eviction victim.
    free: VecDeque<usize>,
}

impl InodeCache {
    fn new() -> Self {
        let slots = (0..MAX_INODES)
            .map(|_| Slot {
                inode: DiskInode::default(),
                fs_id: 0,
                num: 0,
                refcnt: 0,
                dirty: false,
            })
            .collect();
        Self {
            slots,
            hash: (0..HASH_SZ).map(|_| Vec::new()).collect(),
            free: (0..MAX_INODES).collect(),
        }
    }

    fn bucket(num: u32) -> usize {
        (num as usize) & (HASH_SZ - 1)
    }

    fn find(&self, fs_id: u64, num: u32) -> Option<usize> {
        self.hash[Self::bucket(num)]
            .iter()
            .copied()
            .find(|&i| self.slots[i].fs_id == fs_id && self.slots[i].num == num)
    }

    fn unhash(&mut self, idx: usize) {
        let num = self.slots[idx].num;
        if num != 0 {
            self.hash[Self::bucket(num)].retain(|&i| i != idx);
        }
    }
}

static INODES: Mutex<Option<InodeCache>> = Mutex::new(None);

fn with_cache<R>(f: impl FnOnce(&mut InodeCache) -> R) -> R {
    let mut guard = INODES.lock();
    let cache = guard.get_or_insert_with(InodeCache::new);
    f(cache)
}

/// A checked-out inode. Must be released with put(); not cloneable.
#[derive(Debug)]
pub struct InodeRef {
    pub num: u32,
    slot: usize,
}

/// Copy the inode image out of a handle.
pub fn read(r: &InodeRef) -> DiskInode {
    with_cache(|c| c.slots[r.slot].inode)
}

/// Mutate the cached inode in place and mark it dirty.
pub fn with_mut<R>(r: &InodeRef, f: impl FnOnce(&mut DiskInode) -> R) -> R {
    with_cache(|c| {
        c.slots[r.slot].dirty = true;
        f(&mut c.slots[r.slot].inode)
    })
}

/// Mark the inode dirty without changing it (after external edits).
pub fn mark_dirty(r: &InodeRef) {
    with_cache(|c| c.slots[r.slot].dirty = true);
}

/// Where inode `num` lives on disk: (block group, index within group).
fn locate(fs: &Ext2Fs, num: u32) -> (u32, u32) {
    let bg = (num - 1) / fs.sb.s_inodes_per_group;
    let index = (num - 1) % fs.sb.s_inodes_per_group;
    (bg, index)
}

/// Read an inode image from the filesystem, validating it against the
/// inode bitmap: unallocated inodes are rejected.
fn read_from_disk(fs: &mut Ext2Fs, num: u32) -> Result<DiskInode, Errno> {
    if num == 0 || num > fs.sb.s_inodes_count {
        return Err(Errno::EIO);
    }

    let (bg, index) = locate(fs, num);
    let bitmap = fs.bgs[bg as usize].bg_inode_bitmap;
    let allocated = fs.with_block(bitmap, |d| block::bit_is_set(d, index))?;
    if !allocated {
        return Err(Errno::EIO);
    }

    let isize = fs.sb.inode_size() as u32;
    let per_block = fs.block_size() / isize;
    let iblock = fs.bgs[bg as usize].bg_inode_table + index / per_block;
    let offset = ((index % per_block) * isize) as usize;

    fs.with_block(iblock, |d| DiskInode::parse(&d[offset..offset + 128]))
}

/// Write one cached slot back through the block cache.
fn slot_write_back(fs: &mut Ext2Fs, c: &mut InodeCache, idx: usize) -> Result<(), Errno> {
    if !fs.is_rw() {
        return Ok(());
    }

    let num = c.slots[idx].num;
    if num == 0 || num > fs.sb.s_inodes_count {
        return Err(Errno::EINVAL);
    }

    let (bg, index) = locate(fs, num);
    let isize = fs.sb.inode_size() as u32;
    let per_block = fs.block_size() / isize;
    let iblock = fs.bgs[bg as usize].bg_inode_table + index / per_block;
    let offset = ((index % per_block) * isize) as usize;

    let image = c.slots[idx].inode;
    fs.with_block_mut(iblock, |d| image.encode(&mut d[offset..offset + 128]))?;
    c.slots[idx].dirty = false;
    Ok(())
}

/// Check an inode out of the cache, reading it from disk on a miss.
pub fn get(fs: &mut Ext2Fs, num: u32) -> Result<InodeRef, Errno> {
    let mut guard = INODES.lock();
    let c = guard.get_or_insert_with(InodeCache::new);

    // Already cached?
    if let Some(idx) = c.find(fs.id, num) {
        if c.slots[idx].refcnt == 0 {
            c.free.retain(|&i| i != idx);
        }
        c.slots[idx].refcnt += 1;
        return Ok(InodeRef { num, slot: idx });
    }

    // Pick a reusable slot: the oldest free-tail entry we can actually
    // recycle. A dirty slot belonging to another mount cannot be written
    // back from here, so it is skipped.
    let pos = c
        .free
        .iter()
        .position(|&i| !c.slots[i].dirty || c.slots[i].fs_id == fs.id)
        .ok_or(Errno::EMFILE)?;
    let idx = c.free.remove(pos).ok_or(Errno::EMFILE)?;

    if c.slots[idx].dirty {
        slot_write_back(fs, c, idx)?;
    }
    c.unhash(idx);

    c.slots[idx].refcnt = 1;
    c.slots[idx].num = num;
    c.slots[idx].fs_id = fs.id;
    c.slots[idx].dirty = false;

    match read_from_disk(fs, num) {
        Ok(ino) => {
            c.slots[idx].inode = ino;
            c.hash[InodeCache::bucket(num)].push(idx);
            Ok(InodeRef { num, slot: idx })
        }
        Err(e) => {
            c.slots[idx].refcnt = 0;
            c.slots[idx].num = 0;
            c.slots[idx].fs_id = 0;
            c.free.push_front(idx);
            Err(e)
        }
    }
}

/// Release a handle. At zero references a dirty inode is written back to
/// the block cache and the slot joins the free tail (still hashed, so it
/// can be revived cheaply).
pub fn put(fs: &mut Ext2Fs, r: InodeRef) {
    let mut guard = INODES.lock();
    let Some(c) = guard.as_mut() else { return };

    debug_assert!(c.slots[r.slot].refcnt != 0, "inode put() underflow");
    c.slots[r.slot].refcnt -= 1;

    if c.slots[r.slot].refcnt == 0 {
        if c.slots[r.slot].dirty {
            if let Err(e) = slot_write_back(fs, c, r.slot) {
                log::warn!("ext2: inode {} write-back failed: {}", r.num, e);
            }
        }
        c.free.push_back(r.slot);
    }
}

/// Flush every dirty cached inode belonging to `fs` out to its block
/// cache. Read-only mounts are a no-op.
pub fn cache_write_back(fs: &mut Ext2Fs) -> Result<(), Errno> {
    if !fs.is_rw() {
        return Ok(());
    }

    let mut guard = INODES.lock();
    let Some(c) = guard.as_mut() else {
        return Ok(());
    };

    for idx in 0..MAX_INODES {
        if c.slots[idx].fs_id == fs.id && c.slots[idx].dirty {
            slot_write_back(fs, c, idx)?;
        }
    }
    Ok(())
}

/// Forget every cached inode of an unmounted filesystem.
pub fn cache_drop_fs(fs_id: u64) {
    let mut guard = INODES.lock();
    let Some(c) = guard.as_mut() else { return };

    for idx in 0..MAX_INODES {
        if c.slots[idx].fs_id == fs_id {
            c.unhash(idx);
            c.slots[idx].num = 0;
            c.slots[idx].fs_id = 0;
            c.slots[idx].dirty = false;
            c.slots[idx].refcnt = 0;
        }
    }
}

/*****************************************************************************/
/* Allocation and freeing */

/// Allocate a fresh inode, preferring the parent's block group. The
/// returned inode is zeroed and dirty; the caller fills in the mode and
/// times.
pub fn alloc(fs: &mut Ext2Fs, parent: u32) -> Result<InodeRef, Errno> {
    if !fs.is_rw() {
        return Err(Errno::EROFS);
    }
    if fs.sb.s_free_inodes_count == 0 {
        return Err(Errno::ENOSPC);
    }

    let (parent_bg, _) = locate(fs, parent);
    let groups = fs.bgs.len() as u32;

    let mut chosen: Option<(u32, u32)> = None;
    for attempt in 0..=groups {
        let bg = if attempt == 0 {
            parent_bg
        } else {
            let g = attempt - 1;
            if g == parent_bg {
                continue;
            }
            g
        };

        if fs.bgs[bg as usize].bg_free_inodes_count == 0 {
            continue;
        }

        let bitmap = fs.bgs[bg as usize].bg_inode_bitmap;
        let last = fs.sb.s_inodes_per_group - 1;
        let index = fs.with_block(bitmap, |d| block::bit_find_zero(d, 0, last))?;

        match index {
            Some(index) => {
                fs.with_block_mut(bitmap, |d| block::bit_set(d, index))?;
                fs.bgs[bg as usize].bg_free_inodes_count -= 1;
                fs.sb.s_free_inodes_count -= 1;
                fs.sb_dirty = true;
                chosen = Some((bg, index));
                break;
            }
            None => {
                log::warn!(
                    "ext2: block group {} indicates that it has free inodes, but \
                     doesn't appear to. Please run fsck on this volume!",
                    bg
                );
            }
        }
    }

    let Some((bg, index)) = chosen else {
        log::warn!(
            "ext2: filesystem indicates that it has free inodes, but doesn't appear \
             to. Please run fsck on this volume!"
        );
        return Err(Errno::ENOSPC);
    };

    let num = index + bg * fs.sb.s_inodes_per_group + 1;
    let r = get(fs, num)?;
    with_mut(&r, |ino| *ino = DiskInode::default());
    Ok(r)
}

fn free_ind_block(fs: &mut Ext2Fs, iblk: u32) -> Result<(), Errno> {
    if iblk == 0 {
        log::error!(
            "ext2: inode indicates use of block 0 for an indirect block. Run fsck ASAP!"
        );
        return Err(Errno::EIO);
    }

    let bs = fs.block_size() as usize;
    let mut buf = alloc::vec![0u8; bs];
    fs.block_read_nc(iblk, &mut buf)?;

    for i in 0..bs / 4 {
        let blk = u32::from_le_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]]);
        if blk != 0 {
            fs.block_free(blk)?;
        }
    }

    fs.block_free(iblk)
}

fn free_dind_block(fs: &mut Ext2Fs, iblk: u32, triple: bool) -> Result<(), Errno> {
    if iblk == 0 {
        log::error!(
            "ext2: inode indicates use of block 0 for a doubly-indirect block. Run fsck ASAP!"
        );
        return Err(Errno::EIO);
    }

    let bs = fs.block_size() as usize;
    let mut buf = alloc::vec![0u8; bs];
    fs.block_read_nc(iblk, &mut buf)?;

    for i in 0..bs / 4 {
        let blk = u32::from_le_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]]);
        if blk == 0 {
            continue;
        }
        if triple {
            free_dind_block(fs, blk, false)?;
        } else {
            free_ind_block(fs, blk)?;
        }
    }

    fs.block_free(iblk)
}

/// Release every data block of an inode. With `for_del` the inode itself
/// is freed too: its bitmap bit is cleared, i_dtime is stamped, and any
/// extended-attribute block loses a reference.
pub fn free_all(fs: &mut Ext2Fs, r: &InodeRef, for_del: bool) -> Result<(), Errno> {
    fs.block_cache_wb()?;

    let mut ino = read(r);

    if for_del {
        let (bg, index) = locate(fs, r.num);
        let bitmap = fs.bgs[bg as usize].bg_inode_bitmap;
        fs.with_block_mut(bitmap, |d| block::bit_clear(d, index))?;
        fs.bgs[bg as usize].bg_free_inodes_count += 1;
        fs.sb.s_free_inodes_count += 1;
        fs.sb_dirty = true;

        with_mut(r, |i| i.i_dtime = (timer::uptime_ms() / 1000) as u32);

        // Drop our reference on the xattr block, if any.
        if ino.i_file_acl != 0 {
            let acl = ino.i_file_acl;
            let refs = fs.with_block_mut(acl, |d| {
                let magic = u32::from_le_bytes([d[0], d[1], d[2], d[3]]);
                if magic != EXT2_XATTR_MAGIC {
                    log::warn!("ext2: xattr with bad magic!");
                    return None;
                }
                let refcount = u32::from_le_bytes([d[4], d[5], d[6], d[7]]) - 1;
                d[4..8].copy_from_slice(&refcount.to_le_bytes());
                Some(refcount)
            })?;
            if refs == Some(0) {
                fs.block_free(acl)?;
            }
        }
    }

    // Direct blocks. Fast symlinks have i_blocks == 0, so they need no
    // special handling here.
    for i in 0..12 {
        if ino.i_block[i] != 0 {
            fs.block_free(ino.i_block[i])?;
            ino.i_block[i] = 0;
        }
    }

    if ino.i_block[12] != 0 {
        free_ind_block(fs, ino.i_block[12])?;
        ino.i_block[12] = 0;
    }

    if ino.i_block[13] != 0 {
        free_dind_block(fs, ino.i_block[13], false)?;
        ino.i_block[13] = 0;
    }

    if ino.i_block[14] != 0 {
        free_dind_block(fs, ino.i_block[14], true)?;
        ino.i_block[14] = 0;
    }

    // An xattr block that survives still counts against i_blocks.
    let remaining = if ino.i_file_acl != 0 && !for_del {
        fs.sectors_per_block()
    } else {
        0
    };

    with_mut(r, |i| {
        i.i_block = ino.i_block;
        i.i_blocks = remaining;
    });

    Ok(())
}

/// Drop one link to an inode. Directories are zeroed outright (ext2
/// forbids directory hard links); at zero links the inode and all its
/// blocks are reclaimed.
pub fn deref(fs: &mut Ext2Fs, inode_num: u32, is_dir: bool) -> Result<(), Errno> {
    if !fs.is_rw() {
        return Err(Errno::EROFS);
    }

    let r = get(fs, inode_num)?;

    let links = with_mut(&r, |ino| {
        if is_dir {
            ino.i_links_count = 0;
        } else {
            ino.i_links_count -= 1;
        }
        ino.i_links_count
    });

    if is_dir {
        let (bg, _) = locate(fs, inode_num);
        fs.bgs[bg as usize].bg_used_dirs_count -= 1;
        fs.sb_dirty = true;
    }

    let rv = if links == 0 {
        free_all(fs, &r, true)
    } else {
        Ok(())
    };

    put(fs, r);
    rv
}

/*****************************************************************************/
/* Block walks */

fn ind_entry(fs: &mut Ext2Fs, blk: u32, idx: u32) -> Result<u32, Errno> {
    fs.with_block(blk, |d| {
        let o = (idx * 4) as usize;
        u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
    })
}

fn set_ind_entry(fs: &mut Ext2Fs, blk: u32, idx: u32, val: u32) -> Result<(), Errno> {
    fs.with_block_mut(blk, |d| {
        let o = (idx * 4) as usize;
        d[o..o + 4].copy_from_slice(&val.to_le_bytes());
    })
}

/// Map a logical block of a file to its physical block number, walking
/// the indirect tables as needed. Past-the-end asks are EINVAL.
pub fn read_block(fs: &mut Ext2Fs, ino: &DiskInode, block_num: u32) -> Result<u32, Errno> {
    let lbs = fs.log_block_size();
    let sz = ino.size64();

    if ((block_num as u64) << lbs) >= sz {
        return Err(Errno::EINVAL);
    }

    if block_num < 12 {
        return Ok(ino.i_block[block_num as usize]);
    }

    let per_ind = fs.block_size() / 4;
    let mut bn = block_num - 12;

    if bn < per_ind {
        return ind_entry(fs, ino.i_block[12], bn);
    }

    bn -= per_ind;
    if bn < per_ind * per_ind {
        let l1 = ind_entry(fs, ino.i_block[13], bn / per_ind)?;
        return ind_entry(fs, l1, bn % per_ind);
    }

    bn -= per_ind * per_ind;
    let l1 = ind_entry(fs, ino.i_block[14], bn / (per_ind * per_ind))?;
    bn %= per_ind * per_ind;
    let l2 = ind_entry(fs, l1, bn / per_ind)?;
    ind_entry(fs, l2, bn % per_ind)
}

fn alloc_direct(fs: &mut Ext2Fs, r: &InodeRef, bg: u32) -> Result<u32, Errno> {
    let bn = fs.block_alloc(bg)?;
    let spb = fs.sectors_per_block();
    with_mut(r, |ino| ino.i_blocks += spb);
    Ok(bn)
}

/// Allocate an indirect table plus its first data block; returns
/// (table block, data block).
fn alloc_ind(fs: &mut Ext2Fs, r: &InodeRef, bg: u32) -> Result<(u32, u32), Errno> {
    let table = fs.block_alloc(bg)?;

    let data = match alloc_direct(fs, r, bg) {
        Ok(d) => d,
        Err(e) => {
            fs.block_free(table)?;
            return Err(e);
        }
    };

    set_ind_entry(fs, table, 0, data)?;
    let spb = fs.sectors_per_block();
    with_mut(r, |ino| ino.i_blocks += spb);
    Ok((table, data))
}

fn alloc_dind(fs: &mut Ext2Fs, r: &InodeRef, bg: u32) -> Result<(u32, u32), Errno> {
    let table = fs.block_alloc(bg)?;

    let (l1, data) = match alloc_ind(fs, r, bg) {
        Ok(p) => p,
        Err(e) => {
            fs.block_free(table)?;
            return Err(e);
        }
    };

    set_ind_entry(fs, table, 0, l1)?;
    let spb = fs.sectors_per_block();
    with_mut(r, |ino| ino.i_blocks += spb);
    Ok((table, data))
}

fn alloc_tind(fs: &mut Ext2Fs, r: &InodeRef, bg: u32) -> Result<(u32, u32), Errno> {
    let table = fs.block_alloc(bg)?;

    let (l2, data) = match alloc_dind(fs, r, bg) {
        Ok(p) => p,
        Err(e) => {
            fs.block_free(table)?;
            return Err(e);
        }
    };

    set_ind_entry(fs, table, 0, l2)?;
    let spb = fs.sectors_per_block();
    with_mut(r, |ino| ino.i_blocks += spb);
    Ok((table, data))
}

/// Allocate the data block for logical index `logical`, zero-filled,
/// creating whatever level of indirect table the position calls for.
/// Returns the new physical block. The caller updates i_size and
/// timestamps; i_blocks is maintained here (indirect tables included).
pub fn alloc_block(fs: &mut Ext2Fs, r: &InodeRef, logical: u32) -> Result<u32, Errno> {
    if !fs.is_rw() {
        return Err(Errno::EROFS);
    }

    let ino = read(r);
    let (bg, _) = locate(fs, r.num);
    let per_ind = fs.block_size() / 4;
    let mut blocks = logical;

    if blocks < 12 {
        let bn = alloc_direct(fs, r, bg)?;
        with_mut(r, |i| i.i_block[blocks as usize] = bn);
        return Ok(bn);
    }
    if blocks == 12 {
        let (table, data) = alloc_ind(fs, r, bg)?;
        with_mut(r, |i| i.i_block[12] = table);
        return Ok(data);
    }

    blocks -= 12;

    if blocks < per_ind {
        let bn = alloc_direct(fs, r, bg)?;
        set_ind_entry(fs, ino.i_block[12], blocks, bn)?;
        return Ok(bn);
    }
    if blocks == per_ind {
        let (table, data) = alloc_dind(fs, r, bg)?;
        with_mut(r, |i| i.i_block[13] = table);
        return Ok(data);
    }

    blocks -= per_ind;

    if blocks < per_ind * per_ind {
        let l1_idx = blocks / per_ind;
        let rest = blocks % per_ind;

        if rest != 0 {
            let l1 = ind_entry(fs, ino.i_block[13], l1_idx)?;
            let bn = alloc_direct(fs, r, bg)?;
            set_ind_entry(fs, l1, rest, bn)?;
            return Ok(bn);
        } else {
            let (table, data) = alloc_ind(fs, r, bg)?;
            set_ind_entry(fs, ino.i_block[13], l1_idx, table)?;
            return Ok(data);
        }
    }
    if blocks == per_ind * per_ind {
        let (table, data) = alloc_tind(fs, r, bg)?;
        with_mut(r, |i| i.i_block[14] = table);
        return Ok(data);
    }

    blocks -= per_ind * per_ind;
    let l3_idx = blocks / (per_ind * per_ind);
    let l2_idx = (blocks % (per_ind * per_ind)) / per_ind;
    let l1_idx = blocks % per_ind;

    if l3_idx >= per_ind {
        // The triply-indirect tree is full; the file has hit its limit.
        return Err(Errno::EFBIG);
    }

    if l2_idx == 0 && l1_idx == 0 {
        let (table, data) = alloc_dind(fs, r, bg)?;
        set_ind_entry(fs, ino.i_block[14], l3_idx, table)?;
        Ok(data)
    } else if l1_idx == 0 {
        let l2 = ind_entry(fs, ino.i_block[14], l3_idx)?;
        let (table, data) = alloc_ind(fs, r, bg)?;
        set_ind_entry(fs, l2, l2_idx, table)?;
        Ok(data)
    } else {
        let l2 = ind_entry(fs, ino.i_block[14], l3_idx)?;
        let l1 = ind_entry(fs, l2, l2_idx)?;
        let bn = alloc_direct(fs, r, bg)?;
        set_ind_entry(fs, l1, l1_idx, bn)?;
        Ok(bn)
    }
}

/*****************************************************************************/
/* Path resolution */

/// How to treat symlinks found during a path walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// Follow every symlink, including the final component.
    Follow,
    /// Follow symlinks in intermediate components only.
    FollowExceptLast,
}

/// Walk a slash-separated path from the root directory to an inode.
///
/// Symlinks are followed per `resolve`, restarting the remainder of the
/// walk from the symlink's parent directory; absolute targets are
/// refused (EXDEV) and more than SYMLOOP_MAX indirections is ELOOP.
pub fn by_path(fs: &mut Ext2Fs, path: &str, resolve: Resolve) -> Result<InodeRef, Errno> {
    if path.len() >= PATH_MAX {
        return Err(Errno::ENAMETOOLONG);
    }

    let mut dir = get(fs, EXT2_ROOT_INO)?;
    let mut parts: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    let mut idx = 0;
    let mut links_derefed = 0u32;

    while idx < parts.len() {
        let token = parts[idx].clone();
        if token.len() > 255 {
            put(fs, dir);
            return Err(Errno::ENAMETOOLONG);
        }

        let dino = read(&dir);
        if !dino.is_dir() {
            put(fs, dir);
            return Err(Errno::ENOTDIR);
        }

        let Some(dent) = directory::entry(fs, &dino, &token)? else {
            put(fs, dir);
            // A missing intermediate means the prefix is not a directory
            // path; a missing final component is a plain not-found.
            return if idx + 1 < parts.len() {
                Err(Errno::ENOTDIR)
            } else {
                Err(Errno::ENOENT)
            };
        };

        let next = get(fs, dent.inode)?;
        let nino = read(&next);
        let is_last = idx + 1 == parts.len();

        let follow = match resolve {
            Resolve::Follow => true,
            Resolve::FollowExceptLast => !is_last,
        };

        if nino.is_symlink() && follow {
            links_derefed += 1;
            if links_derefed > SYMLOOP_MAX {
                put(fs, next);
                put(fs, dir);
                return Err(Errno::ELOOP);
            }

            let target = symlink::resolve(fs, &nino)?;
            put(fs, next);

            // Absolute targets would escape this filesystem; refuse.
            if target.starts_with('/') {
                put(fs, dir);
                return Err(Errno::EXDEV);
            }

            // Splice the target in front of the remaining components and
            // restart from the symlink's parent directory.
            let mut spliced: Vec<String> = target
                .split('/')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            spliced.extend(parts.drain(idx + 1..));
            parts = spliced;
            idx = 0;

            if parts.iter().map(|p| p.len() + 1).sum::<usize>() >= PATH_MAX {
                put(fs, dir);
                return Err(Errno::ENAMETOOLONG);
            }
            continue;
        }

        put(fs, dir);
        dir = next;
        idx += 1;
    }

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_inode_roundtrip() {
        let mut ino = DiskInode::default();
        ino.i_mode = EXT2_S_IFREG | EXT2_S_IRUSR | EXT2_S_IWUSR;
        ino.i_size = 12345;
        ino.i_links_count = 2;
        ino.i_blocks = 8;
        ino.i_block[0] = 77;
        ino.i_block[14] = 99;

        let mut buf = [0u8; 128];
        ino.encode(&mut buf);
        let back = DiskInode::parse(&buf);
        assert_eq!(back.i_mode, ino.i_mode);
        assert_eq!(back.i_size, 12345);
        assert_eq!(back.i_block[0], 77);
        assert_eq!(back.i_block[14], 99);
        assert!(back.is_reg());
    }

    #[test]
    fn large_file_size_uses_dir_acl() {
        let mut ino = DiskInode::default();
        ino.i_mode = EXT2_S_IFREG;
        ino.set_size64(0x1_2345_6789);
        assert_eq!(ino.i_size, 0x2345_6789);
        assert_eq!(ino.i_dir_acl, 1);
        assert_eq!(ino.size64(), 0x1_2345_6789);
    }

    #[test]
    fn block_area_holds_symlink_targets() {
        let mut ino = DiskInode::default();
        ino.set_block_area(b"target/path");
        let area = ino.block_area();
        assert_eq!(&area[..11], b"target/path");
        assert_eq!(area[11], 0);
    }
}
