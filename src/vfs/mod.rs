/*
 * Virtual File System Layer
 *
 * The VFS is the POSIX-ish face of the kernel: small-integer file
 * descriptors over trait objects, a mount table routing path prefixes to
 * filesystem handlers, and the path-level operations (open, stat, rename,
 * link, ...) dispatched to whichever handler owns the path.
 *
 * Two kinds of objects live behind descriptors: ext2 files/directories
 * and sockets. Both implement FileOps; only real filesystems implement
 * the path-level VfsOps.
 */

pub mod fd;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::errno::Errno;
use crate::sched;

/// Longest file name component accepted by the VFS.
pub const MAX_FN_LEN: usize = 255;

bitflags! {
    /// File open modes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const APPEND   = 1 << 2;
        const CREAT    = 1 << 3;
        const TRUNC    = 1 << 4;
        const DIR      = 1 << 5;
        const META     = 1 << 6;
        const NONBLOCK = 1 << 7;
        const ASYNC    = 1 << 8;

        const RDWR = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Seek origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// File type reported by stat().
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    None,
    File,
    Dir,
    Pipe,
    Symlink,
    Meta,
}

bitflags! {
    /// Capability attributes reported by stat().
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttr: u32 {
        const R = 0x01;
        const W = 0x02;
        const RW = 0x03;
    }
}

/// File status information.
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    /// A unique identifier within the owning filesystem (inode number).
    pub unique: u32,
    pub ftype: FileType,
    pub attr: FileAttr,
    pub size: u64,
    /// Last modification time, seconds since the epoch.
    pub time: u64,
}

/// One directory entry from readdir().
#[derive(Debug, Clone)]
pub struct DirEnt {
    pub name: String,
    /// Size in bytes; -1 for directories, matching the classic interface.
    pub size: i64,
    pub time: u64,
    pub ftype: FileType,
}

/// fcntl commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcntlCmd {
    GetFl,
    SetFl(OpenMode),
}

/// Poll readiness bits for select()-style multiplexing.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const IN  = 0x1;
        const OUT = 0x2;
        const ERR = 0x4;
    }
}

/// Per-open-file operations. One implementor per backing object kind
/// (ext2 file handle, socket).
pub trait FileOps: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno>;
    fn write(&self, buf: &[u8]) -> Result<usize, Errno>;

    fn seek(&self, _offset: i64, _whence: Whence) -> Result<i64, Errno> {
        Err(Errno::ESPIPE)
    }

    fn tell(&self) -> Result<i64, Errno> {
        Err(Errno::ESPIPE)
    }

    /// Total size of the underlying object, if meaningful.
    fn total(&self) -> Result<u64, Errno> {
        Err(Errno::ESPIPE)
    }

    /// Next directory entry, or None at the end. Only for O_DIR handles.
    fn readdir(&self) -> Result<Option<DirEnt>, Errno> {
        Err(Errno::ENOTDIR)
    }

    fn ioctl(&self, _cmd: u32, _arg: usize) -> Result<i32, Errno> {
        Err(Errno::EINVAL)
    }

    fn fcntl(&self, _cmd: FcntlCmd) -> Result<u32, Errno> {
        Err(Errno::EINVAL)
    }

    /// Non-blocking readiness check.
    fn poll(&self, _events: PollEvents) -> PollEvents {
        PollEvents::empty()
    }

    /// Status of the open object itself (fstat).
    fn fstat(&self) -> Result<Stat, Errno> {
        Err(Errno::EINVAL)
    }

    /// Downcast hook for the socket layer, which needs its own handle
    /// type back out of the descriptor table.
    fn as_socket(&self) -> Option<&crate::net::socket::SocketFile> {
        None
    }

    /// Called when the last descriptor on this handle is closed.
    fn on_close(&self) -> Result<(), Errno> {
        Ok(())
    }
}

impl core::fmt::Debug for dyn FileOps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("<dyn FileOps>")
    }
}

/// Path-level operations a mounted filesystem provides.
pub trait VfsOps: Send + Sync {
    fn open(&self, path: &str, mode: OpenMode) -> Result<Arc<dyn FileOps>, Errno>;
    fn stat(&self, path: &str) -> Result<Stat, Errno>;
    fn unlink(&self, path: &str) -> Result<(), Errno>;
    fn mkdir(&self, path: &str) -> Result<(), Errno>;
    fn rmdir(&self, path: &str) -> Result<(), Errno>;
    fn rename(&self, from: &str, to: &str) -> Result<(), Errno>;
    fn link(&self, target: &str, linkpath: &str) -> Result<(), Errno>;
    fn symlink(&self, target: &str, linkpath: &str) -> Result<(), Errno>;
    fn readlink(&self, path: &str) -> Result<String, Errno>;
    /// Flush everything dirty to the backing device.
    fn sync(&self) -> Result<(), Errno>;
}

/// One mount table entry.
struct Mount {
    prefix: String,
    handler: Arc<dyn VfsOps>,
}

/// The mount table: longest-prefix routing of absolute paths.
static MOUNTS: Mutex<Vec<Mount>> = Mutex::new(Vec::new());

/// Attach a filesystem at a path prefix ("/" or "/cd", say).
pub fn mount(prefix: &str, handler: Arc<dyn VfsOps>) -> Result<(), Errno> {
    if !prefix.starts_with('/') {
        return Err(Errno::EINVAL);
    }

    let mut mounts = MOUNTS.lock();
    if mounts.iter().any(|m| m.prefix == prefix) {
        return Err(Errno::EEXIST);
    }
    mounts.push(Mount {
        prefix: String::from(prefix),
        handler,
    });
    log::info!("vfs: mounted handler at {}", prefix);
    Ok(())
}

/// Detach the filesystem mounted at `prefix`. The handler is synced
/// before removal.
pub fn unmount(prefix: &str) -> Result<(), Errno> {
    let handler = {
        let mut mounts = MOUNTS.lock();
        let idx = mounts
            .iter()
            .position(|m| m.prefix == prefix)
            .ok_or(Errno::ENOENT)?;
        mounts.remove(idx).handler
    };
    handler.sync()?;
    log::info!("vfs: unmounted {}", prefix);
    Ok(())
}

/// Make `path` absolute against the current thread's working directory
/// and normalize away "." and ".." components.
fn absolutize(path: &str) -> String {
    let joined = if path.starts_with('/') {
        String::from(path)
    } else {
        let mut s = sched::getcwd();
        if !s.ends_with('/') {
            s.push('/');
        }
        s.push_str(path);
        s
    };

    let mut parts: Vec<&str> = Vec::new();
    for comp in joined.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }

    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Route an absolute path to (handler, path-within-handler).
fn route(path: &str) -> Result<(Arc<dyn VfsOps>, String), Errno> {
    let abs = absolutize(path);
    let mounts = MOUNTS.lock();

    let mut best: Option<&Mount> = None;
    for m in mounts.iter() {
        let matches = if m.prefix == "/" {
            true
        } else {
            abs == m.prefix || abs.starts_with(&alloc::format!("{}/", m.prefix))
        };
        if matches && best.map(|b| b.prefix.len() < m.prefix.len()).unwrap_or(true) {
            best = Some(m);
        }
    }

    let m = best.ok_or(Errno::ENODEV)?;
    let rest = if m.prefix == "/" {
        abs
    } else {
        let r = &abs[m.prefix.len()..];
        if r.is_empty() {
            String::from("/")
        } else {
            String::from(r)
        }
    };
    Ok((m.handler.clone(), rest))
}

/*****************************************************************************/
/* Descriptor-level API */

/// Open a file, returning a new descriptor.
pub fn open(path: &str, mode: OpenMode) -> Result<i32, Errno> {
    let (handler, rest) = route(path)?;
    let file = handler.open(&rest, mode)?;
    fd::alloc_fd(file)
}

/// Close a descriptor.
pub fn close(fdnum: i32) -> Result<(), Errno> {
    fd::close_fd(fdnum)
}

pub fn read(fdnum: i32, buf: &mut [u8]) -> Result<usize, Errno> {
    fd::get(fdnum)?.read(buf)
}

pub fn write(fdnum: i32, buf: &[u8]) -> Result<usize, Errno> {
    fd::get(fdnum)?.write(buf)
}

pub fn seek(fdnum: i32, offset: i64, whence: Whence) -> Result<i64, Errno> {
    fd::get(fdnum)?.seek(offset, whence)
}

pub fn tell(fdnum: i32) -> Result<i64, Errno> {
    fd::get(fdnum)?.tell()
}

pub fn total(fdnum: i32) -> Result<u64, Errno> {
    fd::get(fdnum)?.total()
}

pub fn readdir(fdnum: i32) -> Result<Option<DirEnt>, Errno> {
    fd::get(fdnum)?.readdir()
}

pub fn ioctl(fdnum: i32, cmd: u32, arg: usize) -> Result<i32, Errno> {
    fd::get(fdnum)?.ioctl(cmd, arg)
}

pub fn fcntl(fdnum: i32, cmd: FcntlCmd) -> Result<u32, Errno> {
    fd::get(fdnum)?.fcntl(cmd)
}

pub fn fstat(fdnum: i32) -> Result<Stat, Errno> {
    fd::get(fdnum)?.fstat()
}

/// Duplicate a descriptor; both refer to the same open file.
pub fn dup(fdnum: i32) -> Result<i32, Errno> {
    let file = fd::get(fdnum)?;
    fd::alloc_fd(file)
}

/*****************************************************************************/
/* Path-level API */

pub fn stat(path: &str) -> Result<Stat, Errno> {
    let (handler, rest) = route(path)?;
    handler.stat(&rest)
}

pub fn unlink(path: &str) -> Result<(), Errno> {
    let (handler, rest) = route(path)?;
    handler.unlink(&rest)
}

pub fn mkdir(path: &str) -> Result<(), Errno> {
    let (handler, rest) = route(path)?;
    handler.mkdir(&rest)
}

pub fn rmdir(path: &str) -> Result<(), Errno> {
    let (handler, rest) = route(path)?;
    handler.rmdir(&rest)
}

/// Rename/move within one filesystem. Crossing mounts is EXDEV.
pub fn rename(from: &str, to: &str) -> Result<(), Errno> {
    let (h1, r1) = route(from)?;
    let (h2, r2) = route(to)?;
    if !Arc::ptr_eq(&h1, &h2) {
        return Err(Errno::EXDEV);
    }
    h1.rename(&r1, &r2)
}

/// Hard link within one filesystem.
pub fn link(target: &str, linkpath: &str) -> Result<(), Errno> {
    let (h1, r1) = route(target)?;
    let (h2, r2) = route(linkpath)?;
    if !Arc::ptr_eq(&h1, &h2) {
        return Err(Errno::EXDEV);
    }
    h1.link(&r1, &r2)
}

pub fn symlink(target: &str, linkpath: &str) -> Result<(), Errno> {
    let (handler, rest) = route(linkpath)?;
    handler.symlink(target, &rest)
}

pub fn readlink(path: &str) -> Result<String, Errno> {
    let (handler, rest) = route(path)?;
    handler.readlink(&rest)
}

/// Flush every mounted filesystem.
pub fn sync_all() -> Result<(), Errno> {
    let handlers: Vec<Arc<dyn VfsOps>> =
        MOUNTS.lock().iter().map(|m| m.handler.clone()).collect();
    for h in handlers {
        h.sync()?;
    }
    Ok(())
}

/// Drop every mount without syncing. Test harness / panic path only.
pub fn clear_mounts() {
    MOUNTS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolutize_collapses_dots() {
        assert_eq!(absolutize("/a/b/../c/./d"), "/a/c/d");
        assert_eq!(absolutize("/.."), "/");
        assert_eq!(absolutize("/a//b"), "/a/b");
    }

    #[test]
    fn open_mode_composition() {
        let m = OpenMode::RDWR | OpenMode::CREAT;
        assert!(m.contains(OpenMode::READ));
        assert!(m.contains(OpenMode::WRITE));
        assert!(m.contains(OpenMode::CREAT));
        assert!(!m.contains(OpenMode::TRUNC));
    }
}
