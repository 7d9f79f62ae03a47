/*
 * End-to-end POSIX surface tests for the ext2 driver: a filesystem is
 * formatted onto a ram disk, mounted through the VFS, and driven purely
 * through the public descriptor API.
 */

use marlin_kernel::fs::ext2::{self, MountFlags};
use marlin_kernel::fs::{BlockDevice, RamDisk};
use marlin_kernel::vfs::{self, FileType, OpenMode, Whence};

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

/// Format a minimal one-group ext2 filesystem: 1024-byte blocks,
/// 128-byte inodes, revision 1 with the FILETYPE feature.
fn mkfs(blocks: u32, inodes: u32) -> RamDisk {
    let mut rd = RamDisk::new((blocks as usize) * 2);

    let itb = inodes.div_ceil(8);
    let first_data = 5 + itb;
    let root_block = first_data;
    let free_blocks = (blocks - 1) - first_data;
    let reserved = 10;
    let free_inodes = inodes - reserved;

    let mut sb = [0u8; BLOCK];
    wr32(&mut sb, 0, inodes);
    wr32(&mut sb, 4, blocks);
    wr32(&mut sb, 12, free_blocks);
    wr32(&mut sb, 16, free_inodes);
    wr32(&mut sb, 20, 1);
    wr32(&mut sb, 24, 0);
    wr32(&mut sb, 32, 8192);
    wr32(&mut sb, 40, inodes);
    wr16(&mut sb, 56, 0xEF53);
    wr16(&mut sb, 58, 1);
    wr32(&mut sb, 76, 1); // revision
    wr32(&mut sb, 84, 11); // first inode
    wr16(&mut sb, 88, 128); // inode size
    wr32(&mut sb, 96, 0x0002); // FILETYPE
    put_block(&mut rd, 1, &sb);

    let mut bgd = [0u8; BLOCK];
    wr32(&mut bgd, 0, 3);
    wr32(&mut bgd, 4, 4);
    wr32(&mut bgd, 8, 5);
    wr16(&mut bgd, 12, free_blocks as u16);
    wr16(&mut bgd, 14, free_inodes as u16);
    wr16(&mut bgd, 16, 1);
    put_block(&mut rd, 2, &bgd);

    // Block bitmap: bit b-1 covers block b; everything up to the root
    // directory block is taken, as is everything past the volume end.
    let mut bbm = [0u8; BLOCK];
    for bit in 0..8192u32 {
        let bn = bit + 1;
        if bn <= root_block || bn >= blocks {
            bbm[(bit >> 3) as usize] |= 1 << (bit & 7);
        }
    }
    put_block(&mut rd, 3, &bbm);

    // Inode bitmap: 1..=10 reserved; everything past the count taken.
    let mut ibm = [0u8; BLOCK];
    for bit in 0..8192u32 {
        let ino = bit + 1;
        if ino <= reserved || ino > inodes {
            ibm[(bit >> 3) as usize] |= 1 << (bit & 7);
        }
    }
    put_block(&mut rd, 4, &ibm);

    // Inode table with the root directory (inode 2).
    let mut itable = vec![0u8; (itb as usize) * BLOCK];
    {
        let root = &mut itable[128..256];
        wr16(root, 0, 0x4000 | 0o755);
        wr32(root, 4, BLOCK as u32);
        wr16(root, 26, 2);
        wr32(root, 28, 2);
        wr32(root, 40, root_block);
    }
    for (i, chunk) in itable.chunks(BLOCK).enumerate() {
        put_block(&mut rd, 5 + i as u32, chunk);
    }

    // Root directory data: "." and "..".
    let mut rootdir = [0u8; BLOCK];
    wr32(&mut rootdir, 0, 2);
    wr16(&mut rootdir, 4, 12);
    rootdir[6] = 1;
    rootdir[7] = 2;
    rootdir[8] = b'.';
    wr32(&mut rootdir, 12, 2);
    wr16(&mut rootdir, 16, (BLOCK - 12) as u16);
    rootdir[18] = 2;
    rootdir[19] = 2;
    rootdir[20] = b'.';
    rootdir[21] = b'.';
    put_block(&mut rd, root_block, &rootdir);

    rd
}

#[test]
fn create_write_readback_survives_remount() {
    let rd = mkfs(256, 64);
    ext2::vfs::mount("/it1", Box::new(rd), MountFlags::RW).unwrap();

    let fd = vfs::open("/it1/a", OpenMode::CREAT | OpenMode::WRITE).unwrap();
    assert_eq!(vfs::write(fd, b"hello").unwrap(), 5);
    vfs::close(fd).unwrap();

    let st = vfs::stat("/it1/a").unwrap();
    assert_eq!(st.ftype, FileType::File);
    assert_eq!(st.size, 5);

    // Sync everything and read back through a cold open.
    vfs::sync_all().unwrap();
    let fd = vfs::open("/it1/a", OpenMode::READ).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(vfs::read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    vfs::close(fd).unwrap();

    ext2::vfs::unmount("/it1").unwrap();
}

#[test]
fn rename_across_directories_keeps_link_counts() {
    let rd = mkfs(256, 64);
    ext2::vfs::mount("/it2", Box::new(rd), MountFlags::RW).unwrap();

    vfs::mkdir("/it2/d1").unwrap();
    vfs::mkdir("/it2/d2").unwrap();

    let fd = vfs::open("/it2/d1/f", OpenMode::CREAT | OpenMode::WRITE).unwrap();
    vfs::write(fd, b"move me").unwrap();
    vfs::close(fd).unwrap();

    vfs::rename("/it2/d1/f", "/it2/d2/f").unwrap();

    assert!(vfs::stat("/it2/d1/f").is_err());
    let st = vfs::stat("/it2/d2/f").unwrap();
    assert_eq!(st.ftype, FileType::File);
    assert_eq!(st.size, 7);

    // The moved file still reads back.
    let fd = vfs::open("/it2/d2/f", OpenMode::READ).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(vfs::read(fd, &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"move me");
    vfs::close(fd).unwrap();

    ext2::vfs::unmount("/it2").unwrap();
}

#[test]
fn large_file_spans_indirect_blocks() {
    let rd = mkfs(512, 64);
    ext2::vfs::mount("/it3", Box::new(rd), MountFlags::RW).unwrap();

    // 20KiB crosses from the direct pointers into the indirect table.
    let data: Vec<u8> = (0..20 * 1024u32).map(|i| (i * 7 % 253) as u8).collect();
    let fd = vfs::open("/it3/big", OpenMode::CREAT | OpenMode::WRITE).unwrap();
    assert_eq!(vfs::write(fd, &data).unwrap(), data.len());
    vfs::close(fd).unwrap();

    let fd = vfs::open("/it3/big", OpenMode::READ).unwrap();
    assert_eq!(vfs::total(fd).unwrap(), data.len() as u64);

    // Spot-check a block boundary deep in the indirect range.
    assert_eq!(vfs::seek(fd, 13 * 1024 - 3, Whence::Set).unwrap(), 13 * 1024 - 3);
    let mut buf = [0u8; 6];
    assert_eq!(vfs::read(fd, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..], &data[13 * 1024 - 3..13 * 1024 + 3]);
    vfs::close(fd).unwrap();

    vfs::unlink("/it3/big").unwrap();
    assert!(vfs::stat("/it3/big").is_err());

    ext2::vfs::unmount("/it3").unwrap();
}

#[test]
fn symlink_chain_resolves_through_open() {
    let rd = mkfs(256, 64);
    ext2::vfs::mount("/it4", Box::new(rd), MountFlags::RW).unwrap();

    let fd = vfs::open("/it4/target", OpenMode::CREAT | OpenMode::WRITE).unwrap();
    vfs::write(fd, b"end of chain").unwrap();
    vfs::close(fd).unwrap();

    vfs::symlink("target", "/it4/l1").unwrap();
    vfs::symlink("l1", "/it4/l2").unwrap();
    assert_eq!(vfs::readlink("/it4/l2").unwrap(), "l1");

    let fd = vfs::open("/it4/l2", OpenMode::READ).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(vfs::read(fd, &mut buf).unwrap(), 12);
    assert_eq!(&buf[..12], b"end of chain");
    vfs::close(fd).unwrap();

    ext2::vfs::unmount("/it4").unwrap();
}
