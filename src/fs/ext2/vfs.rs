/*
 * POSIX-style VFS Adaptor for ext2
 *
 * Glues the ext2 core to the kernel VFS: path-level operations (open,
 * stat, rename, link, ...) and per-file handles with read/write/seek/
 * readdir. One sleeping mutex per mount serializes everything, exactly
 * one lock wide: the ext2 core below assumes single-threaded access.
 *
 * Every error path releases the mutex through the guard helper, and
 * every inode checked out of the cache is put back before returning.
 */

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};

use crate::errno::Errno;
use crate::fs::block_dev::BlockDevice;
use crate::sync;
use crate::utils::timer;
use crate::vfs::{
    self, DirEnt, FcntlCmd, FileAttr, FileOps, FileType, OpenMode, PollEvents, Stat, VfsOps,
    Whence,
};

use super::directory;
use super::inode::{self, DiskInode, InodeRef, Resolve, EXT2_S_IFLNK, EXT2_S_IFMT, EXT2_S_IFREG,
                   EXT2_S_IRUSR, EXT2_S_IWUSR};
use super::symlink;
use super::{Ext2Fs, MountFlags};

/// Wall-clock seconds for inode timestamps. The console has no battery
/// clock in this core; uptime is the monotonic stand-in the platform
/// layer may correct at boot.
fn now_secs() -> u32 {
    (timer::uptime_ms() / 1000) as u32
}

struct MountState {
    fs: Ext2Fs,
    /// Inode numbers with live file handles, with counts; rename,
    /// unlink and rmdir refuse to touch them.
    open_inodes: BTreeMap<u32, u32>,
}

/// One mounted ext2 filesystem, VFS-facing.
pub struct Ext2Mount {
    lock: sync::Mutex,
    state: spin::Mutex<MountState>,
    /// Back-reference to our own Arc so open() can hand file handles a
    /// strong hold on the mount.
    self_ref: spin::Once<Weak<Ext2Mount>>,
}

/// Mount an ext2 filesystem and register it at `prefix` in the VFS.
pub fn mount(
    prefix: &str,
    dev: alloc::boxed::Box<dyn BlockDevice>,
    flags: MountFlags,
) -> Result<Arc<Ext2Mount>, Errno> {
    let fs = Ext2Fs::mount(dev, flags)?;
    let mnt = Arc::new(Ext2Mount {
        lock: sync::Mutex::new(),
        state: spin::Mutex::new(MountState {
            fs,
            open_inodes: BTreeMap::new(),
        }),
        self_ref: spin::Once::new(),
    });
    mnt.self_ref.call_once(|| Arc::downgrade(&mnt));
    vfs::mount(prefix, mnt.clone())?;
    Ok(mnt)
}

/// Unregister and shut down the mount at `prefix`.
pub fn unmount(prefix: &str) -> Result<(), Errno> {
    vfs::unmount(prefix)
}

/// Mutex guard: unlocks on drop so no early return can leak the lock.
struct OpGuard<'a> {
    mnt: &'a Ext2Mount,
}

impl<'a> OpGuard<'a> {
    fn take(mnt: &'a Ext2Mount) -> Result<Self, Errno> {
        mnt.lock.lock()?;
        Ok(Self { mnt })
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mnt.lock.unlock();
    }
}

impl Ext2Mount {
    /// Run `f` with the mount serialized and the state borrowed.
    fn with_fs<R>(&self, f: impl FnOnce(&mut MountState) -> Result<R, Errno>) -> Result<R, Errno> {
        let _guard = OpGuard::take(self)?;
        let mut state = self.state.lock();
        f(&mut state)
    }

    /// Flush without going through the VFS layer.
    pub fn sync_now(&self) -> Result<(), Errno> {
        self.with_fs(|st| st.fs.sync())
    }
}

/// Split "/a/b/c" into ("/a/b", "c").
fn split_parent(path: &str) -> Result<(&str, &str), Errno> {
    let idx = path.rfind('/').ok_or(Errno::EINVAL)?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return Err(Errno::EINVAL);
    }
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Ok((parent, name))
}

fn is_root(path: &str) -> bool {
    path.is_empty() || path == "/"
}

/// Create a zero-length regular file, inheriting ownership from the
/// parent directory. Returns the new inode checked out.
fn create_empty_file(st: &mut MountState, path: &str) -> Result<(InodeRef, u32), Errno> {
    if !st.fs.is_rw() {
        return Err(Errno::EROFS);
    }

    let (parent_path, name) = split_parent(path)?;
    let parent = inode::by_path(&mut st.fs, parent_path, Resolve::Follow)?;
    let pino = inode::read(&parent);

    if !pino.is_dir() {
        inode::put(&mut st.fs, parent);
        return Err(Errno::ENOTDIR);
    }

    let nref = match inode::alloc(&mut st.fs, parent.num) {
        Ok(r) => r,
        Err(e) => {
            inode::put(&mut st.fs, parent);
            return Err(e);
        }
    };
    let new_num = nref.num;

    let now = now_secs();
    inode::with_mut(&nref, |ino| {
        // Copy the interesting parts from the parent.
        ino.i_mode = (pino.i_mode & !EXT2_S_IFMT) | EXT2_S_IFREG;
        ino.i_uid = pino.i_uid;
        ino.i_gid = pino.i_gid;
        ino.i_osd2 = pino.i_osd2;
        ino.i_atime = now;
        ino.i_ctime = now;
        ino.i_mtime = now;
        ino.i_links_count = 1;
    });

    if let Err(e) = directory::add_entry(
        &mut st.fs,
        &parent,
        name,
        new_num,
        directory::EXT2_FT_REG_FILE,
    ) {
        inode::put(&mut st.fs, parent);
        inode::put(&mut st.fs, nref);
        let _ = inode::deref(&mut st.fs, new_num, false);
        return Err(e);
    }

    inode::with_mut(&parent, |ino| {
        ino.i_mtime = now;
        ino.i_ctime = now;
    });
    inode::put(&mut st.fs, parent);

    Ok((nref, new_num))
}

/*****************************************************************************/
/* Per-file handles */

struct FileInner {
    pos: u64,
    iref: Option<InodeRef>,
}

/// An open ext2 file or directory.
pub struct Ext2File {
    mnt: Arc<Ext2Mount>,
    inode_num: u32,
    mode: OpenMode,
    inner: spin::Mutex<FileInner>,
}

impl Ext2File {
    fn with_handle<R>(
        &self,
        f: impl FnOnce(&mut MountState, &InodeRef, &mut u64) -> Result<R, Errno>,
    ) -> Result<R, Errno> {
        self.mnt.with_fs(|st| {
            let mut inner = self.inner.lock();
            let FileInner { pos, iref } = &mut *inner;
            let iref = iref.as_ref().ok_or(Errno::EBADF)?;
            f(st, iref, pos)
        })
    }
}

impl FileOps for Ext2File {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if !self.mode.contains(OpenMode::READ) {
            return Err(Errno::EBADF);
        }
        if self.mode.contains(OpenMode::DIR) {
            return Err(Errno::EISDIR);
        }

        self.with_handle(|st, iref, pos| {
            let ino = inode::read(iref);
            let size = ino.size64();

            let mut cnt = buf.len() as u64;
            if *pos + cnt > size {
                cnt = size.saturating_sub(*pos);
            }

            let bs = st.fs.block_size() as u64;
            let lbs = st.fs.log_block_size();
            let total = cnt as usize;
            let mut done = 0usize;

            while done < total {
                let bo = (*pos & (bs - 1)) as usize;
                let chunk = core::cmp::min(total - done, bs as usize - bo);
                let bn = inode::read_block(&mut st.fs, &ino, (*pos >> lbs) as u32)?;
                st.fs.with_block(bn, |d| {
                    buf[done..done + chunk].copy_from_slice(&d[bo..bo + chunk]);
                })?;
                *pos += chunk as u64;
                done += chunk;
            }

            Ok(total)
        })
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        if !self.mode.contains(OpenMode::WRITE) {
            return Err(Errno::EBADF);
        }
        if self.mode.contains(OpenMode::DIR) {
            return Err(Errno::EISDIR);
        }

        self.with_handle(|st, iref, pos| {
            if !st.fs.is_rw() {
                return Err(Errno::EROFS);
            }

            let mut ino = inode::read(iref);
            let mut size = ino.size64();

            if self.mode.contains(OpenMode::APPEND) {
                *pos = size;
            }

            // Fill in any gap a forward seek left behind; alloc_block
            // hands back zeroed blocks.
            if *pos > size {
                let lbs = st.fs.log_block_size();
                let bs64 = st.fs.block_size() as u64;
                let mut next = ((size + bs64 - 1) >> lbs) as u32;
                while ((next as u64) << lbs) < *pos {
                    inode::alloc_block(&mut st.fs, iref, next)?;
                    next += 1;
                }
                size = *pos;
                inode::with_mut(iref, |i| i.set_size64(size));
                ino = inode::read(iref);
            }

            let bs = st.fs.block_size() as u64;
            let lbs = st.fs.log_block_size();
            let total = buf.len();
            let mut done = 0usize;

            while done < total {
                let bo = (*pos & (bs - 1)) as usize;
                let chunk = core::cmp::min(total - done, bs as usize - bo);

                let lblock = (*pos >> lbs) as u32;
                let bn = match inode::read_block(&mut st.fs, &ino, lblock) {
                    Ok(bn) => bn,
                    // Past the last block: grow the file.
                    Err(Errno::EINVAL) => inode::alloc_block(&mut st.fs, iref, lblock)?,
                    Err(e) => return Err(e),
                };

                st.fs.with_block_mut(bn, |d| {
                    d[bo..bo + chunk].copy_from_slice(&buf[done..done + chunk]);
                })?;

                *pos += chunk as u64;
                done += chunk;

                if *pos > ino.size64() {
                    inode::with_mut(iref, |i| i.set_size64(*pos));
                    ino = inode::read(iref);
                }
            }

            inode::with_mut(iref, |i| i.i_mtime = now_secs());
            Ok(total)
        })
    }

    fn seek(&self, offset: i64, whence: Whence) -> Result<i64, Errno> {
        if self.mode.contains(OpenMode::DIR) {
            return Err(Errno::EINVAL);
        }

        self.with_handle(|_st, iref, pos| {
            let size = inode::read(iref).size64() as i64;
            let new = match whence {
                Whence::Set => offset,
                Whence::Cur => *pos as i64 + offset,
                Whence::End => size + offset,
            };

            if new < 0 {
                return Err(Errno::EINVAL);
            }

            *pos = core::cmp::min(new, size) as u64;
            Ok(*pos as i64)
        })
    }

    fn tell(&self) -> Result<i64, Errno> {
        if self.mode.contains(OpenMode::DIR) {
            return Err(Errno::EINVAL);
        }
        Ok(self.inner.lock().pos as i64)
    }

    fn total(&self) -> Result<u64, Errno> {
        if self.mode.contains(OpenMode::DIR) {
            return Err(Errno::EINVAL);
        }
        self.with_handle(|_st, iref, _pos| Ok(inode::read(iref).size64()))
    }

    fn readdir(&self) -> Result<Option<DirEnt>, Errno> {
        if !self.mode.contains(OpenMode::DIR) {
            return Err(Errno::EBADF);
        }

        self.with_handle(|st, iref, pos| {
            let dino = inode::read(iref);

            loop {
                if *pos >= dino.i_size as u64 {
                    return Ok(None);
                }

                let (ent, next) = directory::read_at(&mut st.fs, &dino, *pos)?;
                *pos = next;

                let Some(ent) = ent else { continue };

                // Pull the entry's inode for size and times.
                let eref = inode::get(&mut st.fs, ent.inode)?;
                let eino = inode::read(&eref);
                inode::put(&mut st.fs, eref);

                let is_dir = eino.is_dir();
                return Ok(Some(DirEnt {
                    name: ent.name,
                    size: if is_dir { -1 } else { eino.size64() as i64 },
                    time: eino.i_mtime as u64,
                    ftype: if is_dir { FileType::Dir } else { ftype_of(&eino) },
                }));
            }
        })
    }

    fn fcntl(&self, cmd: FcntlCmd) -> Result<u32, Errno> {
        match cmd {
            FcntlCmd::GetFl => Ok(self.mode.bits()),
            FcntlCmd::SetFl(_) => Ok(0),
        }
    }

    fn poll(&self, events: PollEvents) -> PollEvents {
        // Disk files are always ready.
        events & (PollEvents::IN | PollEvents::OUT)
    }

    fn fstat(&self) -> Result<Stat, Errno> {
        self.with_handle(|_st, iref, _pos| {
            let ino = inode::read(iref);
            Ok(stat_of(self.inode_num, &ino))
        })
    }

    fn on_close(&self) -> Result<(), Errno> {
        self.mnt.with_fs(|st| {
            let mut inner = self.inner.lock();
            if let Some(iref) = inner.iref.take() {
                inode::put(&mut st.fs, iref);
                match st.open_inodes.get_mut(&self.inode_num) {
                    Some(n) if *n > 1 => *n -= 1,
                    _ => {
                        st.open_inodes.remove(&self.inode_num);
                    }
                }
            }
            Ok(())
        })
    }
}

fn ftype_of(ino: &DiskInode) -> FileType {
    match ino.ftype() {
        EXT2_S_IFLNK => FileType::Symlink,
        EXT2_S_IFREG => FileType::File,
        EXT2_S_IFDIR => FileType::Dir,
        inode::EXT2_S_IFSOCK
        | inode::EXT2_S_IFIFO
        | inode::EXT2_S_IFBLK
        | inode::EXT2_S_IFCHR => FileType::Pipe,
        _ => FileType::None,
    }
}

fn stat_of(num: u32, ino: &DiskInode) -> Stat {
    let mut attr = FileAttr::empty();
    if ino.i_mode & EXT2_S_IRUSR != 0 {
        attr |= FileAttr::R;
    }
    if ino.i_mode & EXT2_S_IWUSR != 0 {
        attr |= FileAttr::W;
    }

    Stat {
        unique: num,
        ftype: ftype_of(ino),
        attr,
        size: ino.size64(),
        time: ino.i_mtime as u64,
    }
}

/*****************************************************************************/
/* Path-level operations */

impl VfsOps for Ext2Mount {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Arc<dyn FileOps>, Errno> {
        let _guard = OpGuard::take(self)?;
        let mut state = self.state.lock();
        let st = &mut *state;

        if mode.intersects(OpenMode::WRITE | OpenMode::TRUNC) && !st.fs.is_rw() {
            return Err(Errno::EROFS);
        }

        let iref = match inode::by_path(&mut st.fs, path, Resolve::Follow) {
            Ok(r) => r,
            Err(Errno::ENOENT) if mode.contains(OpenMode::CREAT) => {
                create_empty_file(st, path)?.0
            }
            Err(e) => return Err(e),
        };

        let ino = inode::read(&iref);

        // No writing to directories; no O_DIR on non-directories.
        if ino.is_dir() && (mode.contains(OpenMode::WRITE) || !mode.contains(OpenMode::DIR)) {
            inode::put(&mut st.fs, iref);
            return Err(Errno::EISDIR);
        }
        if mode.contains(OpenMode::DIR) && !ino.is_dir() {
            inode::put(&mut st.fs, iref);
            return Err(Errno::ENOTDIR);
        }

        if mode.contains(OpenMode::WRITE) && mode.contains(OpenMode::TRUNC) {
            if let Err(e) = inode::free_all(&mut st.fs, &iref, false) {
                inode::put(&mut st.fs, iref);
                return Err(e);
            }
            inode::with_mut(&iref, |i| {
                i.set_size64(0);
                i.i_dtime = 0;
                i.i_mtime = now_secs();
            });
        }

        let num = iref.num;
        *st.open_inodes.entry(num).or_insert(0) += 1;

        let mnt = self
            .self_ref
            .get()
            .and_then(|w| w.upgrade())
            .ok_or(Errno::ENODEV)?;

        Ok(Arc::new(Ext2File {
            mnt,
            inode_num: num,
            mode,
            inner: spin::Mutex::new(FileInner {
                pos: 0,
                iref: Some(iref),
            }),
        }))
    }

    fn stat(&self, path: &str) -> Result<Stat, Errno> {
        self.with_fs(|st| {
            let iref = inode::by_path(&mut st.fs, path, Resolve::Follow)?;
            let ino = inode::read(&iref);
            let s = stat_of(iref.num, &ino);
            inode::put(&mut st.fs, iref);
            Ok(s)
        })
    }

    fn unlink(&self, path: &str) -> Result<(), Errno> {
        if is_root(path) {
            return Err(Errno::EPERM);
        }

        self.with_fs(|st| {
            if !st.fs.is_rw() {
                return Err(Errno::EROFS);
            }

            let (parent_path, name) = split_parent(path)?;
            let parent = inode::by_path(&mut st.fs, parent_path, Resolve::Follow)?;
            let pino = inode::read(&parent);

            let finish = |st: &mut MountState, parent: InodeRef| {
                inode::put(&mut st.fs, parent);
            };

            if !pino.is_dir() {
                finish(st, parent);
                return Err(Errno::ENOTDIR);
            }

            let Some(dent) = directory::entry(&mut st.fs, &pino, name)? else {
                finish(st, parent);
                return Err(Errno::ENOENT);
            };

            let target = inode::get(&mut st.fs, dent.inode)?;
            let tino = inode::read(&target);

            // Directories are rmdir's business.
            if tino.is_dir() {
                inode::put(&mut st.fs, target);
                finish(st, parent);
                return Err(Errno::EPERM);
            }

            // Refuse to delete the data behind somebody's open handle.
            if tino.i_links_count == 1 && st.open_inodes.contains_key(&dent.inode) {
                inode::put(&mut st.fs, target);
                finish(st, parent);
                return Err(Errno::EBUSY);
            }

            directory::rm_entry(&mut st.fs, &pino, name)?;
            inode::with_mut(&parent, |i| {
                let now = now_secs();
                i.i_ctime = now;
                i.i_mtime = now;
            });

            inode::put(&mut st.fs, target);
            finish(st, parent);
            inode::deref(&mut st.fs, dent.inode, false)
        })
    }

    fn mkdir(&self, path: &str) -> Result<(), Errno> {
        if is_root(path) {
            return Err(Errno::EEXIST);
        }

        self.with_fs(|st| {
            if !st.fs.is_rw() {
                return Err(Errno::EROFS);
            }

            let (parent_path, name) = split_parent(path)?;
            let parent = inode::by_path(&mut st.fs, parent_path, Resolve::Follow)?;
            let pino = inode::read(&parent);

            if !pino.is_dir() {
                inode::put(&mut st.fs, parent);
                return Err(Errno::ENOTDIR);
            }

            if directory::entry(&mut st.fs, &pino, name)?.is_some() {
                inode::put(&mut st.fs, parent);
                return Err(Errno::EEXIST);
            }

            let nref = match inode::alloc(&mut st.fs, parent.num) {
                Ok(r) => r,
                Err(e) => {
                    inode::put(&mut st.fs, parent);
                    return Err(e);
                }
            };
            let new_num = nref.num;

            let now = now_secs();
            inode::with_mut(&nref, |ino| {
                ino.i_mode = pino.i_mode;
                ino.i_uid = pino.i_uid;
                ino.i_gid = pino.i_gid;
                ino.i_osd2 = pino.i_osd2;
                ino.i_atime = now;
                ino.i_ctime = now;
                ino.i_mtime = now;
            });

            if let Err(e) = directory::create_empty(&mut st.fs, &nref, new_num, parent.num) {
                inode::put(&mut st.fs, parent);
                inode::put(&mut st.fs, nref);
                let _ = inode::deref(&mut st.fs, new_num, true);
                return Err(e);
            }

            if let Err(e) =
                directory::add_entry(&mut st.fs, &parent, name, new_num, directory::EXT2_FT_DIR)
            {
                inode::put(&mut st.fs, parent);
                inode::put(&mut st.fs, nref);
                let _ = inode::deref(&mut st.fs, new_num, true);
                return Err(e);
            }

            // The new child's ".." counts as a link to the parent.
            inode::with_mut(&parent, |i| i.i_links_count += 1);

            inode::put(&mut st.fs, nref);
            inode::put(&mut st.fs, parent);
            Ok(())
        })
    }

    fn rmdir(&self, path: &str) -> Result<(), Errno> {
        if is_root(path) {
            return Err(Errno::EPERM);
        }

        self.with_fs(|st| {
            if !st.fs.is_rw() {
                return Err(Errno::EROFS);
            }

            let (parent_path, name) = split_parent(path)?;
            let parent = inode::by_path(&mut st.fs, parent_path, Resolve::Follow)?;
            let pino = inode::read(&parent);

            if !pino.is_dir() {
                inode::put(&mut st.fs, parent);
                return Err(Errno::ENOTDIR);
            }

            let Some(dent) = directory::entry(&mut st.fs, &pino, name)? else {
                inode::put(&mut st.fs, parent);
                return Err(Errno::ENOENT);
            };

            let target = inode::get(&mut st.fs, dent.inode)?;
            let tino = inode::read(&target);

            if !tino.is_dir() {
                inode::put(&mut st.fs, target);
                inode::put(&mut st.fs, parent);
                return Err(Errno::EPERM);
            }

            if !directory::is_empty(&mut st.fs, &tino)? {
                inode::put(&mut st.fs, target);
                inode::put(&mut st.fs, parent);
                return Err(Errno::ENOTEMPTY);
            }

            if st.open_inodes.contains_key(&dent.inode) {
                inode::put(&mut st.fs, target);
                inode::put(&mut st.fs, parent);
                return Err(Errno::EBUSY);
            }

            directory::rm_entry(&mut st.fs, &pino, name)?;
            inode::put(&mut st.fs, target);
            inode::deref(&mut st.fs, dent.inode, true)?;

            inode::with_mut(&parent, |i| {
                let now = now_secs();
                i.i_ctime = now;
                i.i_mtime = now;
                // The victim's ".." is gone.
                i.i_links_count -= 1;
            });
            inode::put(&mut st.fs, parent);
            Ok(())
        })
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), Errno> {
        if is_root(from) {
            return Err(Errno::EINVAL);
        }

        self.with_fs(|st| {
            if !st.fs.is_rw() {
                return Err(Errno::EROFS);
            }

            let (sparent_path, sname) = split_parent(from)?;
            let (dparent_path, dname) = split_parent(to)?;

            // Source side.
            let sparent = inode::by_path(&mut st.fs, sparent_path, Resolve::Follow)?;
            let spino = inode::read(&sparent);
            if !spino.is_dir() {
                inode::put(&mut st.fs, sparent);
                return Err(Errno::ENOTDIR);
            }

            let Some(sdent) = directory::entry(&mut st.fs, &spino, sname)? else {
                inode::put(&mut st.fs, sparent);
                return Err(Errno::ENOENT);
            };
            let moving = inode::get(&mut st.fs, sdent.inode)?;
            let mino = inode::read(&moving);
            let moving_is_dir = mino.is_dir();

            // Destination side.
            let dparent = match inode::by_path(&mut st.fs, dparent_path, Resolve::Follow) {
                Ok(p) => p,
                Err(e) => {
                    inode::put(&mut st.fs, moving);
                    inode::put(&mut st.fs, sparent);
                    return Err(e);
                }
            };
            let dpino = inode::read(&dparent);

            let bail = |st: &mut MountState,
                        a: InodeRef,
                        b: InodeRef,
                        c: InodeRef,
                        e: Errno| {
                inode::put(&mut st.fs, a);
                inode::put(&mut st.fs, b);
                inode::put(&mut st.fs, c);
                Err(e)
            };

            if !dpino.is_dir() {
                return bail(st, dparent, moving, sparent, Errno::ENOTDIR);
            }

            // If the destination name exists, vet the replacement.
            let existing = directory::entry(&mut st.fs, &dpino, dname)?;
            let mut replaced_dir = false;

            if let Some(ref dent) = existing {
                let dest = inode::get(&mut st.fs, dent.inode)?;
                let dino = inode::read(&dest);

                if dino.is_dir() {
                    replaced_dir = true;
                    if !moving_is_dir {
                        inode::put(&mut st.fs, dest);
                        return bail(st, dparent, moving, sparent, Errno::EISDIR);
                    }
                    if !directory::is_empty(&mut st.fs, &dino)? {
                        inode::put(&mut st.fs, dest);
                        return bail(st, dparent, moving, sparent, Errno::ENOTEMPTY);
                    }
                }

                if st.open_inodes.contains_key(&dent.inode) {
                    inode::put(&mut st.fs, dest);
                    return bail(st, dparent, moving, sparent, Errno::EBUSY);
                }

                // Remove the entry being replaced and drop its inode.
                directory::rm_entry(&mut st.fs, &dpino, dname)?;
                inode::put(&mut st.fs, dest);
                inode::deref(&mut st.fs, dent.inode, replaced_dir)?;

                if replaced_dir {
                    inode::with_mut(&dparent, |i| i.i_links_count -= 1);
                }
            }

            // Install the new entry, then unlink the old one.
            let ft = directory::file_type_of(&mino);
            directory::add_entry(&mut st.fs, &dparent, dname, sdent.inode, ft)?;
            directory::rm_entry(&mut st.fs, &spino, sname)?;

            // A moved directory needs its ".." repointed, and both
            // parents' link counts adjusted.
            if moving_is_dir {
                directory::redir_entry(&mut st.fs, &mino, "..", dparent.num)?;
                inode::with_mut(&sparent, |i| i.i_links_count -= 1);
                inode::with_mut(&dparent, |i| i.i_links_count += 1);
            }

            let now = now_secs();
            inode::with_mut(&sparent, |i| {
                i.i_mtime = now;
                i.i_ctime = now;
            });
            inode::with_mut(&dparent, |i| {
                i.i_mtime = now;
                i.i_ctime = now;
            });

            inode::put(&mut st.fs, dparent);
            inode::put(&mut st.fs, moving);
            inode::put(&mut st.fs, sparent);
            Ok(())
        })
    }

    fn link(&self, target: &str, linkpath: &str) -> Result<(), Errno> {
        if is_root(target) {
            return Err(Errno::EPERM);
        }
        if is_root(linkpath) {
            return Err(Errno::EEXIST);
        }

        self.with_fs(|st| {
            if !st.fs.is_rw() {
                return Err(Errno::EROFS);
            }

            // Do not follow a symlink in the final component: a hard
            // link to a symlink links the symlink itself.
            let tref = inode::by_path(&mut st.fs, target, Resolve::FollowExceptLast)?;
            let tino = inode::read(&tref);

            if tino.is_dir() {
                inode::put(&mut st.fs, tref);
                return Err(Errno::EPERM);
            }

            let (parent_path, name) = split_parent(linkpath)?;
            let parent = match inode::by_path(&mut st.fs, parent_path, Resolve::Follow) {
                Ok(p) => p,
                Err(e) => {
                    inode::put(&mut st.fs, tref);
                    return Err(e);
                }
            };
            let pino = inode::read(&parent);

            if !pino.is_dir() {
                inode::put(&mut st.fs, parent);
                inode::put(&mut st.fs, tref);
                return Err(Errno::ENOTDIR);
            }

            if directory::entry(&mut st.fs, &pino, name)?.is_some() {
                inode::put(&mut st.fs, parent);
                inode::put(&mut st.fs, tref);
                return Err(Errno::EEXIST);
            }

            let ft = directory::file_type_of(&tino);
            if let Err(e) = directory::add_entry(&mut st.fs, &parent, name, tref.num, ft) {
                inode::put(&mut st.fs, parent);
                inode::put(&mut st.fs, tref);
                return Err(e);
            }

            let now = now_secs();
            inode::with_mut(&tref, |i| {
                i.i_links_count += 1;
                i.i_ctime = now;
            });
            inode::with_mut(&parent, |i| {
                i.i_ctime = now;
                i.i_mtime = now;
            });

            inode::put(&mut st.fs, parent);
            inode::put(&mut st.fs, tref);
            Ok(())
        })
    }

    fn symlink(&self, target: &str, linkpath: &str) -> Result<(), Errno> {
        if is_root(linkpath) {
            return Err(Errno::EEXIST);
        }
        if target.len() >= symlink::SYMLINK_MAX {
            return Err(Errno::ENAMETOOLONG);
        }

        self.with_fs(|st| {
            if !st.fs.is_rw() {
                return Err(Errno::EROFS);
            }

            let (parent_path, name) = split_parent(linkpath)?;
            let parent = inode::by_path(&mut st.fs, parent_path, Resolve::Follow)?;
            let pino = inode::read(&parent);

            if !pino.is_dir() {
                inode::put(&mut st.fs, parent);
                return Err(Errno::ENOTDIR);
            }

            if directory::entry(&mut st.fs, &pino, name)?.is_some() {
                inode::put(&mut st.fs, parent);
                return Err(Errno::EEXIST);
            }

            let nref = match inode::alloc(&mut st.fs, parent.num) {
                Ok(r) => r,
                Err(e) => {
                    inode::put(&mut st.fs, parent);
                    return Err(e);
                }
            };
            let new_num = nref.num;

            let now = now_secs();
            inode::with_mut(&nref, |ino| {
                ino.i_mode = (pino.i_mode & !EXT2_S_IFMT) | EXT2_S_IFLNK;
                ino.i_uid = pino.i_uid;
                ino.i_gid = pino.i_gid;
                ino.i_osd2 = pino.i_osd2;
                ino.i_atime = now;
                ino.i_ctime = now;
                ino.i_mtime = now;
                ino.i_links_count = 1;
                ino.i_size = target.len() as u32;
            });

            if target.len() < 60 {
                // Fast symlink: the target fits in the block pointers.
                inode::with_mut(&nref, |ino| ino.set_block_area(target.as_bytes()));
            } else {
                let bs = st.fs.block_size() as usize;
                let mut remaining = target.as_bytes();
                let mut lblock = 0u32;
                while !remaining.is_empty() {
                    let bn = match inode::alloc_block(&mut st.fs, &nref, lblock) {
                        Ok(bn) => bn,
                        Err(e) => {
                            inode::put(&mut st.fs, parent);
                            inode::put(&mut st.fs, nref);
                            let _ = inode::deref(&mut st.fs, new_num, false);
                            return Err(e);
                        }
                    };
                    let take = remaining.len().min(bs);
                    let chunk = &remaining[..take];
                    st.fs.with_block_mut(bn, |d| {
                        d[..take].copy_from_slice(chunk);
                        d[take..].fill(0);
                    })?;
                    remaining = &remaining[take..];
                    lblock += 1;
                }
            }

            if let Err(e) = directory::add_entry(
                &mut st.fs,
                &parent,
                name,
                new_num,
                directory::EXT2_FT_SYMLINK,
            ) {
                inode::put(&mut st.fs, parent);
                inode::put(&mut st.fs, nref);
                let _ = inode::deref(&mut st.fs, new_num, false);
                return Err(e);
            }

            inode::with_mut(&parent, |i| {
                i.i_ctime = now;
                i.i_mtime = now;
            });

            inode::put(&mut st.fs, parent);
            inode::put(&mut st.fs, nref);
            Ok(())
        })
    }

    fn readlink(&self, path: &str) -> Result<String, Errno> {
        self.with_fs(|st| {
            let iref = inode::by_path(&mut st.fs, path, Resolve::FollowExceptLast)?;
            let ino = inode::read(&iref);

            if !ino.is_symlink() {
                inode::put(&mut st.fs, iref);
                return Err(Errno::EINVAL);
            }

            let target = symlink::resolve(&mut st.fs, &ino);
            inode::put(&mut st.fs, iref);
            target
        })
    }

    fn sync(&self) -> Result<(), Errno> {
        self.sync_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ext2::testimg;
    use crate::vfs::{FileType, OpenMode, Whence};

    /// Mount a fresh formatted image at a caller-unique prefix; tests
    /// run concurrently and share the kernel-wide mount table.
    fn mount_at(prefix: &str) -> Arc<Ext2Mount> {
        let rd = testimg::mkfs(256, 64);
        mount(prefix, alloc::boxed::Box::new(rd), MountFlags::RW).unwrap()
    }

    #[test]
    fn create_write_readback_and_stat() {
        let _m = mount_at("/tcw");

        let fd = vfs::open("/tcw/a", OpenMode::CREAT | OpenMode::WRITE).unwrap();
        assert_eq!(vfs::write(fd, b"hello").unwrap(), 5);
        vfs::close(fd).unwrap();

        let fd = vfs::open("/tcw/a", OpenMode::READ).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(vfs::read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // A second read is at EOF.
        assert_eq!(vfs::read(fd, &mut buf).unwrap(), 0);
        vfs::close(fd).unwrap();

        let st = vfs::stat("/tcw/a").unwrap();
        assert_eq!(st.ftype, FileType::File);
        assert_eq!(st.size, 5);
        assert!(st.attr.contains(crate::vfs::FileAttr::R));

        vfs::unmount("/tcw").unwrap();
    }

    #[test]
    fn multi_block_file_roundtrip_with_seek() {
        let _m = mount_at("/tmb");

        // Write 3000 patterned bytes: spans three 1024-byte blocks.
        let data: alloc::vec::Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let fd = vfs::open("/tmb/big", OpenMode::CREAT | OpenMode::WRITE).unwrap();
        assert_eq!(vfs::write(fd, &data).unwrap(), 3000);
        vfs::close(fd).unwrap();

        let fd = vfs::open("/tmb/big", OpenMode::READ).unwrap();
        assert_eq!(vfs::total(fd).unwrap(), 3000);

        // Seek into the middle block and read across the boundary.
        assert_eq!(vfs::seek(fd, 1500, Whence::Set).unwrap(), 1500);
        let mut buf = [0u8; 600];
        assert_eq!(vfs::read(fd, &mut buf).unwrap(), 600);
        assert_eq!(&buf[..], &data[1500..2100]);
        assert_eq!(vfs::tell(fd).unwrap(), 2100);

        // Seek relative to the end.
        assert_eq!(vfs::seek(fd, -100, Whence::End).unwrap(), 2900);
        vfs::close(fd).unwrap();

        vfs::unmount("/tmb").unwrap();
    }

    #[test]
    fn truncate_resets_contents() {
        let _m = mount_at("/ttr");

        let fd = vfs::open("/ttr/f", OpenMode::CREAT | OpenMode::WRITE).unwrap();
        vfs::write(fd, b"0123456789").unwrap();
        vfs::close(fd).unwrap();

        let fd = vfs::open("/ttr/f", OpenMode::WRITE | OpenMode::TRUNC).unwrap();
        vfs::write(fd, b"xy").unwrap();
        vfs::close(fd).unwrap();

        assert_eq!(vfs::stat("/ttr/f").unwrap().size, 2);
        vfs::unmount("/ttr").unwrap();
    }

    #[test]
    fn mkdir_readdir_rmdir() {
        let _m = mount_at("/tdir");

        vfs::mkdir("/tdir/d").unwrap();
        assert_eq!(vfs::mkdir("/tdir/d"), Err(Errno::EEXIST));
        assert_eq!(vfs::stat("/tdir/d").unwrap().ftype, FileType::Dir);

        // Parent gained a link from the child's "..".
        let fd = vfs::open("/tdir/d/f", OpenMode::CREAT | OpenMode::WRITE).unwrap();
        vfs::write(fd, b"z").unwrap();
        vfs::close(fd).unwrap();

        // Read the directory back: ".", "..", "f".
        let fd = vfs::open("/tdir/d", OpenMode::READ | OpenMode::DIR).unwrap();
        let mut names = alloc::vec::Vec::new();
        while let Some(ent) = vfs::readdir(fd).unwrap() {
            names.push(ent.name);
        }
        vfs::close(fd).unwrap();
        assert_eq!(names, [".", "..", "f"]);

        // A populated directory will not go away.
        assert_eq!(vfs::rmdir("/tdir/d"), Err(Errno::ENOTEMPTY));
        vfs::unlink("/tdir/d/f").unwrap();
        vfs::rmdir("/tdir/d").unwrap();
        assert_eq!(vfs::stat("/tdir/d"), Err(Errno::ENOENT));

        vfs::unmount("/tdir").unwrap();
    }

    #[test]
    fn rename_across_directories() {
        let _m = mount_at("/trn");

        vfs::mkdir("/trn/d1").unwrap();
        vfs::mkdir("/trn/d2").unwrap();
        let fd = vfs::open("/trn/d1/f", OpenMode::CREAT | OpenMode::WRITE).unwrap();
        vfs::write(fd, b"payload").unwrap();
        vfs::close(fd).unwrap();

        let d1_links = vfs::stat("/trn/d1").unwrap();
        let d2_links = vfs::stat("/trn/d2").unwrap();
        let _ = (&d1_links, &d2_links);

        vfs::rename("/trn/d1/f", "/trn/d2/f").unwrap();

        assert_eq!(vfs::stat("/trn/d1/f"), Err(Errno::ENOENT));
        let st = vfs::stat("/trn/d2/f").unwrap();
        assert_eq!(st.ftype, FileType::File);
        assert_eq!(st.size, 7);

        // Moving a file doesn't change either directory's link count;
        // verify through the mount's own state.
        let m = &_m;
        m.with_fs(|stt| {
            let d1 = inode::by_path(&mut stt.fs, "/d1", Resolve::Follow)?;
            let d2 = inode::by_path(&mut stt.fs, "/d2", Resolve::Follow)?;
            assert_eq!(inode::read(&d1).i_links_count, 2);
            assert_eq!(inode::read(&d2).i_links_count, 2);
            inode::put(&mut stt.fs, d1);
            inode::put(&mut stt.fs, d2);
            Ok(())
        })
        .unwrap();

        // Moving a directory updates ".." and the parents' link counts.
        vfs::mkdir("/trn/d1/sub").unwrap();
        vfs::rename("/trn/d1/sub", "/trn/d2/sub").unwrap();
        m.with_fs(|stt| {
            let d1 = inode::by_path(&mut stt.fs, "/d1", Resolve::Follow)?;
            let d2 = inode::by_path(&mut stt.fs, "/d2", Resolve::Follow)?;
            assert_eq!(inode::read(&d1).i_links_count, 2);
            assert_eq!(inode::read(&d2).i_links_count, 3);
            inode::put(&mut stt.fs, d1);
            inode::put(&mut stt.fs, d2);
            Ok(())
        })
        .unwrap();
        assert_eq!(vfs::stat("/trn/d2/sub").unwrap().ftype, FileType::Dir);

        vfs::unmount("/trn").unwrap();
    }

    #[test]
    fn hard_links_share_data() {
        let _m = mount_at("/tln");

        let fd = vfs::open("/tln/orig", OpenMode::CREAT | OpenMode::WRITE).unwrap();
        vfs::write(fd, b"shared").unwrap();
        vfs::close(fd).unwrap();

        vfs::link("/tln/orig", "/tln/other").unwrap();

        let a = vfs::stat("/tln/orig").unwrap();
        let b = vfs::stat("/tln/other").unwrap();
        assert_eq!(a.unique, b.unique);

        // Unlinking one name leaves the data reachable by the other.
        vfs::unlink("/tln/orig").unwrap();
        let fd = vfs::open("/tln/other", OpenMode::READ).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(vfs::read(fd, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"shared");
        vfs::close(fd).unwrap();

        vfs::unmount("/tln").unwrap();
    }

    #[test]
    fn symlinks_resolve_and_loop_out() {
        let _m = mount_at("/tsl");

        let fd = vfs::open("/tsl/real", OpenMode::CREAT | OpenMode::WRITE).unwrap();
        vfs::write(fd, b"via-link").unwrap();
        vfs::close(fd).unwrap();

        // Relative target, resolved through the link.
        vfs::symlink("real", "/tsl/ln").unwrap();
        assert_eq!(vfs::readlink("/tsl/ln").unwrap(), "real");

        let fd = vfs::open("/tsl/ln", OpenMode::READ).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(vfs::read(fd, &mut buf).unwrap(), 8);
        assert_eq!(&buf[..8], b"via-link");
        vfs::close(fd).unwrap();

        // Absolute targets are refused at resolution time.
        vfs::symlink("/etc/passwd", "/tsl/abs").unwrap();
        assert_eq!(vfs::stat("/tsl/abs"), Err(Errno::EXDEV));

        // A two-link cycle trips the SYMLOOP limit.
        vfs::symlink("loop2", "/tsl/loop1").unwrap();
        vfs::symlink("loop1", "/tsl/loop2").unwrap();
        assert_eq!(vfs::stat("/tsl/loop1"), Err(Errno::ELOOP));

        vfs::unmount("/tsl").unwrap();
    }

    #[test]
    fn unlink_of_open_file_is_busy() {
        let _m = mount_at("/tbz");

        let fd = vfs::open("/tbz/f", OpenMode::CREAT | OpenMode::WRITE).unwrap();
        vfs::write(fd, b"x").unwrap();
        assert_eq!(vfs::unlink("/tbz/f"), Err(Errno::EBUSY));
        vfs::close(fd).unwrap();
        vfs::unlink("/tbz/f").unwrap();

        vfs::unmount("/tbz").unwrap();
    }

    #[test]
    fn readonly_mount_rejects_writes() {
        let rd = testimg::mkfs(256, 64);
        let _m = mount("/tro", alloc::boxed::Box::new(rd), MountFlags::empty()).unwrap();

        assert_eq!(
            vfs::open("/tro/x", OpenMode::CREAT | OpenMode::WRITE).unwrap_err(),
            Errno::EROFS
        );
        assert_eq!(vfs::mkdir("/tro/d"), Err(Errno::EROFS));
        assert_eq!(vfs::unlink("/tro/x"), Err(Errno::EROFS));

        vfs::unmount("/tro").unwrap();
    }
}
