/*
 * ext2 Superblock and Block Group Descriptors
 *
 * On-disk structures, little-endian throughout. The superblock lives at
 * byte offset 1024 from the start of the volume regardless of block
 * size; block group descriptors immediately follow it (block 2 on a
 * 1024-byte-block filesystem, block 1 otherwise).
 *
 * Field names follow the classic ext2 documentation so they can be
 * cross-checked against e2fsprogs output directly.
 */

use crate::errno::Errno;
use crate::fs::block_dev::BlockDevice;

/// The one true magic value.
pub const EXT2_MAGIC: u16 = 0xEF53;

/// s_rev_level values.
pub const EXT2_GOOD_OLD_REV: u32 = 0;
pub const EXT2_DYNAMIC_REV: u32 = 1;

/// Inode size on revision-0 filesystems.
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;

/// First non-reserved inode on revision-0 filesystems.
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;

/// s_feature_ro_compat bits we care about.
pub const EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const EXT2_FEATURE_RO_COMPAT_LARGE_FILE: u32 = 0x0002;

/// s_feature_incompat bits we care about.
pub const EXT2_FEATURE_INCOMPAT_FILETYPE: u32 = 0x0002;

/// s_state values.
pub const EXT2_VALID_FS: u16 = 1;
pub const EXT2_ERROR_FS: u16 = 2;

/// Size of the on-disk superblock image.
pub const SUPERBLOCK_SIZE: usize = 1024;

/// Size of one block group descriptor on disk.
pub const BG_DESC_SIZE: usize = 32;

/// The ext2 superblock, parsed. Only the fields this driver consumes are
/// kept; everything else rides along in `raw` so a read-modify-write
/// cycle preserves it bit-exactly.
#[derive(Clone)]
pub struct Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_blocks_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_rev_level: u32,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,

    /// The full 1024-byte on-disk image, updated on encode.
    raw: [u8; SUPERBLOCK_SIZE],
}

fn rd16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn rd32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn wr16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn wr32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

impl Superblock {
    /// Parse a 1024-byte superblock image.
    pub fn parse(buf: &[u8]) -> Result<Self, Errno> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(Errno::EINVAL);
        }

        let mut raw = [0u8; SUPERBLOCK_SIZE];
        raw.copy_from_slice(&buf[..SUPERBLOCK_SIZE]);

        let sb = Self {
            s_inodes_count: rd32(buf, 0),
            s_blocks_count: rd32(buf, 4),
            s_r_blocks_count: rd32(buf, 8),
            s_free_blocks_count: rd32(buf, 12),
            s_free_inodes_count: rd32(buf, 16),
            s_first_data_block: rd32(buf, 20),
            s_log_block_size: rd32(buf, 24),
            s_blocks_per_group: rd32(buf, 32),
            s_inodes_per_group: rd32(buf, 40),
            s_mtime: rd32(buf, 44),
            s_wtime: rd32(buf, 48),
            s_mnt_count: rd16(buf, 52),
            s_magic: rd16(buf, 56),
            s_state: rd16(buf, 58),
            s_rev_level: rd32(buf, 76),
            s_first_ino: rd32(buf, 84),
            s_inode_size: rd16(buf, 88),
            s_feature_compat: rd32(buf, 92),
            s_feature_incompat: rd32(buf, 96),
            s_feature_ro_compat: rd32(buf, 100),
            raw,
        };

        if sb.s_magic != EXT2_MAGIC {
            return Err(Errno::EINVAL);
        }

        Ok(sb)
    }

    /// Serialize back to the 1024-byte on-disk image, preserving every
    /// field this driver does not interpret.
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut out = self.raw;
        wr32(&mut out, 0, self.s_inodes_count);
        wr32(&mut out, 4, self.s_blocks_count);
        wr32(&mut out, 8, self.s_r_blocks_count);
        wr32(&mut out, 12, self.s_free_blocks_count);
        wr32(&mut out, 16, self.s_free_inodes_count);
        wr32(&mut out, 20, self.s_first_data_block);
        wr32(&mut out, 24, self.s_log_block_size);
        wr32(&mut out, 32, self.s_blocks_per_group);
        wr32(&mut out, 40, self.s_inodes_per_group);
        wr32(&mut out, 44, self.s_mtime);
        wr32(&mut out, 48, self.s_wtime);
        wr16(&mut out, 52, self.s_mnt_count);
        wr16(&mut out, 56, self.s_magic);
        wr16(&mut out, 58, self.s_state);
        wr32(&mut out, 76, self.s_rev_level);
        wr32(&mut out, 84, self.s_first_ino);
        wr16(&mut out, 88, self.s_inode_size);
        wr32(&mut out, 92, self.s_feature_compat);
        wr32(&mut out, 96, self.s_feature_incompat);
        wr32(&mut out, 100, self.s_feature_ro_compat);
        out
    }

    /// Filesystem block size in bytes.
    pub fn block_size(&self) -> u32 {
        1024 << self.s_log_block_size
    }

    /// Effective on-disk inode record size.
    pub fn inode_size(&self) -> u16 {
        if self.s_rev_level >= EXT2_DYNAMIC_REV {
            self.s_inode_size
        } else {
            EXT2_GOOD_OLD_INODE_SIZE
        }
    }

    /// First inode available for regular allocation.
    pub fn first_ino(&self) -> u32 {
        if self.s_rev_level >= EXT2_DYNAMIC_REV {
            self.s_first_ino
        } else {
            EXT2_GOOD_OLD_FIRST_INO
        }
    }

    /// Whether directory entries carry the file-type byte.
    pub fn has_filetype(&self) -> bool {
        self.s_feature_incompat & EXT2_FEATURE_INCOMPAT_FILETYPE != 0
    }

    /// Whether regular files may use the upper size bits in i_dir_acl.
    pub fn has_large_file(&self) -> bool {
        self.s_feature_ro_compat & EXT2_FEATURE_RO_COMPAT_LARGE_FILE != 0
    }
}

/// One block group descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct BgDesc {
    pub bg_block_bitmap: u32,
    pub bg_inode_bitmap: u32,
    pub bg_inode_table: u32,
    pub bg_free_blocks_count: u16,
    pub bg_free_inodes_count: u16,
    pub bg_used_dirs_count: u16,
}

impl BgDesc {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            bg_block_bitmap: rd32(buf, 0),
            bg_inode_bitmap: rd32(buf, 4),
            bg_inode_table: rd32(buf, 8),
            bg_free_blocks_count: rd16(buf, 12),
            bg_free_inodes_count: rd16(buf, 14),
            bg_used_dirs_count: rd16(buf, 16),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        out[..BG_DESC_SIZE].fill(0);
        wr32(out, 0, self.bg_block_bitmap);
        wr32(out, 4, self.bg_inode_bitmap);
        wr32(out, 8, self.bg_inode_table);
        wr16(out, 12, self.bg_free_blocks_count);
        wr16(out, 14, self.bg_free_inodes_count);
        wr16(out, 16, self.bg_used_dirs_count);
    }
}

/// Read the superblock off a raw device, whatever its sector size.
pub fn read_superblock(dev: &mut dyn BlockDevice) -> Result<Superblock, Errno> {
    let lbs = dev.log_block_size();

    if lbs > 10 {
        // One device block holds the whole front of the volume.
        let mut buf = alloc::vec![0u8; 1usize << lbs];
        dev.read_blocks(0, 1, &mut buf)?;
        Superblock::parse(&buf[1024..2048])
    } else {
        // The superblock starts at device block 1024 >> lbs and covers
        // 1024 >> lbs blocks.
        let blocks = (1024 >> lbs) as usize;
        let mut buf = alloc::vec![0u8; SUPERBLOCK_SIZE];
        dev.read_blocks(1024 >> lbs, blocks, &mut buf)?;
        Superblock::parse(&buf)
    }
}

/// Write the (main) superblock image back to the device.
pub fn write_superblock(dev: &mut dyn BlockDevice, sb: &Superblock) -> Result<(), Errno> {
    let lbs = dev.log_block_size();
    let image = sb.encode();

    if lbs > 10 {
        // Read-modify-write the device block containing byte 1024.
        let mut buf = alloc::vec![0u8; 1usize << lbs];
        dev.read_blocks(0, 1, &mut buf)?;
        buf[1024..2048].copy_from_slice(&image);
        dev.write_blocks(0, 1, &buf)
    } else {
        let blocks = (1024 >> lbs) as usize;
        dev.write_blocks(1024 >> lbs, blocks, &image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_image() -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = [0u8; SUPERBLOCK_SIZE];
        wr32(&mut buf, 0, 32); // inodes
        wr32(&mut buf, 4, 128); // blocks
        wr32(&mut buf, 20, 1); // first data block
        wr32(&mut buf, 24, 0); // 1024-byte blocks
        wr32(&mut buf, 32, 128);
        wr32(&mut buf, 40, 32);
        wr16(&mut buf, 56, EXT2_MAGIC);
        wr16(&mut buf, 58, EXT2_VALID_FS);
        buf
    }

    #[test]
    fn parse_and_encode_roundtrip() {
        let img = minimal_image();
        let mut sb = Superblock::parse(&img).unwrap();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.inode_size(), 128);
        assert_eq!(sb.first_ino(), EXT2_GOOD_OLD_FIRST_INO);

        sb.s_free_blocks_count = 99;
        let out = sb.encode();
        let again = Superblock::parse(&out).unwrap();
        assert_eq!(again.s_free_blocks_count, 99);
        assert_eq!(again.s_blocks_count, 128);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut img = minimal_image();
        img[56] = 0;
        assert!(Superblock::parse(&img).is_err());
    }

    #[test]
    fn bg_desc_roundtrip() {
        let bg = BgDesc {
            bg_block_bitmap: 3,
            bg_inode_bitmap: 4,
            bg_inode_table: 5,
            bg_free_blocks_count: 100,
            bg_free_inodes_count: 20,
            bg_used_dirs_count: 1,
        };
        let mut buf = [0u8; BG_DESC_SIZE];
        bg.encode(&mut buf);
        let back = BgDesc::parse(&buf);
        assert_eq!(back.bg_inode_table, 5);
        assert_eq!(back.bg_free_blocks_count, 100);
    }
}
