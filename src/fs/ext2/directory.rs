/*
 * ext2 Directory Management
 *
 * Directory data blocks hold packed variable-length records:
 * (inode u32, rec_len u16, name_len u8, file_type u8, name bytes). The
 * last record in a block always stretches its rec_len to the end of the
 * block, so `sum(rec_len) == block_size` for every block. A record with
 * rec_len == 0 means the block is corrupt; every scan stops there
 * rather than looping forever.
 */

use alloc::string::String;

use crate::errno::Errno;

use super::inode::{self, DiskInode, InodeRef};
use super::Ext2Fs;

/// Directory entry file_type values (FILETYPE feature).
pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SOCK: u8 = 6;
pub const EXT2_FT_SYMLINK: u8 = 7;

/// Fixed header size of one record.
const DIRENT_HDR: usize = 8;

/// Space one record with `name_len` name bytes actually needs.
fn rec_size(name_len: usize) -> usize {
    (DIRENT_HDR + name_len + 3) & !3
}

/// A decoded directory entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub inode: u32,
    pub file_type: u8,
    pub name: String,
}

/// Map an inode's mode to the dirent file_type byte.
pub fn file_type_of(ino: &DiskInode) -> u8 {
    match ino.ftype() {
        inode::EXT2_S_IFREG => EXT2_FT_REG_FILE,
        inode::EXT2_S_IFDIR => EXT2_FT_DIR,
        inode::EXT2_S_IFCHR => EXT2_FT_CHRDEV,
        inode::EXT2_S_IFBLK => EXT2_FT_BLKDEV,
        inode::EXT2_S_IFIFO => EXT2_FT_FIFO,
        inode::EXT2_S_IFSOCK => EXT2_FT_SOCK,
        inode::EXT2_S_IFLNK => EXT2_FT_SYMLINK,
        _ => EXT2_FT_UNKNOWN,
    }
}

fn rd_inode(d: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([d[off], d[off + 1], d[off + 2], d[off + 3]])
}

fn rd_reclen(d: &[u8], off: usize) -> usize {
    u16::from_le_bytes([d[off + 4], d[off + 5]]) as usize
}

fn write_record(d: &mut [u8], off: usize, ino: u32, rec_len: u16, name: &[u8], ftype: u8) {
    d[off..off + 4].copy_from_slice(&ino.to_le_bytes());
    d[off + 4..off + 6].copy_from_slice(&rec_len.to_le_bytes());
    d[off + 6] = name.len() as u8;
    d[off + 7] = ftype;
    d[off + 8..off + 8 + name.len()].copy_from_slice(name);
}

/// Number of data blocks a directory spans.
fn dir_blocks(fs: &Ext2Fs, dir: &DiskInode) -> u32 {
    (dir.i_size >> fs.log_block_size()) + u32::from(dir.i_size % fs.block_size() != 0)
}

/// Whether the directory holds nothing beyond "." and "..".
pub fn is_empty(fs: &mut Ext2Fs, dir: &DiskInode) -> Result<bool, Errno> {
    let bs = fs.block_size() as usize;

    for i in 0..dir_blocks(fs, dir) {
        let bn = inode::read_block(fs, dir, i)?;
        let empty = fs.with_block(bn, |d| {
            let mut off = 0;
            while off < bs {
                let rec_len = rd_reclen(d, off);
                if rec_len == 0 {
                    return Err(Errno::EIO);
                }
                if rd_inode(d, off) != 0 {
                    let name_len = d[off + 6] as usize;
                    if name_len > 2 || d[off + 8] != b'.' {
                        return Ok(false);
                    }
                    if name_len == 2 && d[off + 9] != b'.' {
                        return Ok(false);
                    }
                }
                off += rec_len;
            }
            Ok(true)
        })??;

        if !empty {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Look a name up in a directory, scanning every data block.
pub fn entry(fs: &mut Ext2Fs, dir: &DiskInode, fn_: &str) -> Result<Option<DirEntryInfo>, Errno> {
    let bs = fs.block_size() as usize;
    let name = fn_.as_bytes();

    for i in 0..dir_blocks(fs, dir) {
        let bn = inode::read_block(fs, dir, i)?;
        let found = fs.with_block(bn, |d| {
            let mut off = 0;
            while off < bs {
                let rec_len = rd_reclen(d, off);
                if rec_len == 0 {
                    return Err(Errno::EIO);
                }
                let ino = rd_inode(d, off);
                if ino != 0 {
                    let name_len = d[off + 6] as usize;
                    if name_len == name.len() && &d[off + 8..off + 8 + name_len] == name {
                        return Ok(Some(DirEntryInfo {
                            inode: ino,
                            file_type: d[off + 7],
                            name: String::from(fn_),
                        }));
                    }
                }
                off += rec_len;
            }
            Ok(None)
        })??;

        if found.is_some() {
            return Ok(found);
        }
    }

    Ok(None)
}

/// Remove a name from a directory, returning the inode number it held.
///
/// A victim that is not first in its block is absorbed into the previous
/// record's rec_len; the first record is blanked in place instead (its
/// rec_len must keep covering the region).
pub fn rm_entry(fs: &mut Ext2Fs, dir: &DiskInode, fn_: &str) -> Result<u32, Errno> {
    if !fs.is_rw() {
        return Err(Errno::EROFS);
    }

    let bs = fs.block_size() as usize;
    let name = fn_.as_bytes();

    for i in 0..dir_blocks(fs, dir) {
        let bn = inode::read_block(fs, dir, i)?;
        let removed = fs.with_block_mut(bn, |d| {
            let mut off = 0;
            let mut prev: Option<usize> = None;
            while off < bs {
                let rec_len = rd_reclen(d, off);
                if rec_len == 0 {
                    return Err(Errno::EIO);
                }
                let ino = rd_inode(d, off);
                if ino != 0 {
                    let name_len = d[off + 6] as usize;
                    if name_len == name.len() && &d[off + 8..off + 8 + name_len] == name {
                        match prev {
                            Some(p) => {
                                // Extend the previous record over the victim.
                                let merged = (rd_reclen(d, p) + rec_len) as u16;
                                d[p + 4..p + 6].copy_from_slice(&merged.to_le_bytes());
                                d[off..off + rec_len].fill(0);
                            }
                            None => {
                                // First in block: blank it, keep rec_len.
                                d[off..off + 4].fill(0);
                                d[off + 8..off + 8 + name_len].fill(0);
                                d[off + 6] = 0;
                                d[off + 7] = 0;
                            }
                        }
                        return Ok(Some(ino));
                    }
                }
                prev = Some(off);
                off += rec_len;
            }
            Ok(None)
        })??;

        if let Some(ino) = removed {
            return Ok(ino);
        }
    }

    Err(Errno::ENOENT)
}

/// Point an existing name at a different inode (used to rewrite ".."
/// when a directory moves).
pub fn redir_entry(fs: &mut Ext2Fs, dir: &DiskInode, fn_: &str, new_inode: u32) -> Result<(), Errno> {
    if !fs.is_rw() {
        return Err(Errno::EROFS);
    }

    let bs = fs.block_size() as usize;
    let name = fn_.as_bytes();

    for i in 0..dir_blocks(fs, dir) {
        let bn = inode::read_block(fs, dir, i)?;
        let done = fs.with_block_mut(bn, |d| {
            let mut off = 0;
            while off < bs {
                let rec_len = rd_reclen(d, off);
                if rec_len == 0 {
                    return Err(Errno::EIO);
                }
                if rd_inode(d, off) != 0 {
                    let name_len = d[off + 6] as usize;
                    if name_len == name.len() && &d[off + 8..off + 8 + name_len] == name {
                        d[off..off + 4].copy_from_slice(&new_inode.to_le_bytes());
                        return Ok(true);
                    }
                }
                off += rec_len;
            }
            Ok(false)
        })??;

        if done {
            return Ok(());
        }
    }

    Err(Errno::ENOENT)
}

/// Add a (name -> inode) entry, splitting the first record found with
/// enough slack; when every block is packed a fresh one is allocated.
pub fn add_entry(
    fs: &mut Ext2Fs,
    dir: &InodeRef,
    fn_: &str,
    inode_num: u32,
    ftype: u8,
) -> Result<(), Errno> {
    if !fs.is_rw() {
        return Err(Errno::EROFS);
    }

    let name = fn_.as_bytes();
    if name.is_empty() || name.len() > 255 {
        return Err(Errno::ENAMETOOLONG);
    }

    let bs = fs.block_size() as usize;
    let needed = rec_size(name.len());
    let ftype = if fs.sb.has_filetype() {
        ftype
    } else {
        EXT2_FT_UNKNOWN
    };

    let dino = inode::read(dir);

    for i in 0..dir_blocks(fs, &dino) {
        let bn = inode::read_block(fs, &dino, i)?;
        let placed = fs.with_block_mut(bn, |d| {
            let mut off = 0;
            while off < bs {
                let rec_len = rd_reclen(d, off);
                if rec_len == 0 {
                    return Err(Errno::EIO);
                }
                let ino = rd_inode(d, off);

                if ino == 0 && rec_len >= needed {
                    // A blanked record big enough: reuse it in place,
                    // keeping its rec_len coverage.
                    write_record(d, off, inode_num, rec_len as u16, name, ftype);
                    return Ok(true);
                }

                if ino != 0 {
                    let used = rec_size(d[off + 6] as usize);
                    let slack = rec_len - used;
                    if slack >= needed {
                        // Split: shrink this record, put ours in the gap.
                        d[off + 4..off + 6].copy_from_slice(&(used as u16).to_le_bytes());
                        write_record(d, off + used, inode_num, slack as u16, name, ftype);
                        return Ok(true);
                    }
                }

                off += rec_len;
            }
            Ok(false)
        })??;

        if placed {
            return Ok(());
        }
    }

    // No block has room: grow the directory by one block holding just
    // this entry.
    let next_block = dir_blocks(fs, &dino);
    let bn = inode::alloc_block(fs, dir, next_block)?;
    fs.with_block_mut(bn, |d| {
        write_record(d, 0, inode_num, bs as u16, name, ftype);
    })?;
    inode::with_mut(dir, |ino| ino.i_size += bs as u32);
    Ok(())
}

/// Populate a fresh directory with its "." and ".." entries and account
/// for it in the block group.
pub fn create_empty(
    fs: &mut Ext2Fs,
    dir: &InodeRef,
    self_num: u32,
    parent_num: u32,
) -> Result<(), Errno> {
    if !fs.is_rw() {
        return Err(Errno::EROFS);
    }

    let bs = fs.block_size() as usize;
    let bn = inode::alloc_block(fs, dir, 0)?;

    fs.with_block_mut(bn, |d| {
        write_record(d, 0, self_num, 12, b".", EXT2_FT_DIR);
        write_record(d, 12, parent_num, (bs - 12) as u16, b"..", EXT2_FT_DIR);
    })?;

    inode::with_mut(dir, |ino| {
        ino.i_size = bs as u32;
        ino.i_links_count = 2;
    });

    let bg = (self_num - 1) / fs.sb.s_inodes_per_group;
    fs.bgs[bg as usize].bg_used_dirs_count += 1;
    fs.sb_dirty = true;
    Ok(())
}

/// Decode the record at byte offset `pos` of the directory, for readdir.
/// Returns (entry, next position); the entry is None for blanked
/// records, which the caller skips.
pub fn read_at(
    fs: &mut Ext2Fs,
    dir: &DiskInode,
    pos: u64,
) -> Result<(Option<DirEntryInfo>, u64), Errno> {
    let bs = fs.block_size() as usize;
    let lbs = fs.log_block_size();
    let bn = inode::read_block(fs, dir, (pos >> lbs) as u32)?;
    let off = (pos as usize) & (bs - 1);

    fs.with_block(bn, |d| {
        let rec_len = rd_reclen(d, off);
        if rec_len == 0 || off + rec_len > bs {
            return Err(Errno::EIO);
        }
        let ino = rd_inode(d, off);
        let next = pos + rec_len as u64;
        if ino == 0 {
            return Ok((None, next));
        }
        let name_len = d[off + 6] as usize;
        let name = core::str::from_utf8(&d[off + 8..off + 8 + name_len])
            .map_err(|_| Errno::EIO)?;
        Ok((
            Some(DirEntryInfo {
                inode: ino,
                file_type: d[off + 7],
                name: String::from(name),
            }),
            next,
        ))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_round_to_four() {
        assert_eq!(rec_size(1), 12);
        assert_eq!(rec_size(2), 12);
        assert_eq!(rec_size(4), 12);
        assert_eq!(rec_size(5), 16);
        assert_eq!(rec_size(255), 264);
    }

    #[test]
    fn write_and_read_record() {
        let mut d = [0u8; 64];
        write_record(&mut d, 0, 42, 64, b"hello", EXT2_FT_REG_FILE);
        assert_eq!(rd_inode(&d, 0), 42);
        assert_eq!(rd_reclen(&d, 0), 64);
        assert_eq!(d[6], 5);
        assert_eq!(d[7], EXT2_FT_REG_FILE);
        assert_eq!(&d[8..13], b"hello");
    }
}
