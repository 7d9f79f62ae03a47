/*
 * File Descriptor Table
 *
 * The kernel-wide table mapping small integer descriptors to open file
 * handles. Multiple descriptors may share one handle (dup); the handle's
 * on_close hook runs when the last descriptor drops.
 */

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::errno::Errno;

use super::FileOps;

/// The number of distinct file descriptors that can be in use at a time.
pub const FD_SETSIZE: i32 = 1024;

static FD_TABLE: Mutex<Option<BTreeMap<i32, Arc<dyn FileOps>>>> = Mutex::new(None);

fn with_table<R>(f: impl FnOnce(&mut BTreeMap<i32, Arc<dyn FileOps>>) -> R) -> R {
    let mut guard = FD_TABLE.lock();
    let table = guard.get_or_insert_with(BTreeMap::new);
    f(table)
}

/// Install a handle at the lowest free descriptor.
pub fn alloc_fd(file: Arc<dyn FileOps>) -> Result<i32, Errno> {
    with_table(|t| {
        // Lowest free slot, POSIX-style.
        let mut fd = 0;
        while t.contains_key(&fd) {
            fd += 1;
            if fd >= FD_SETSIZE {
                return Err(Errno::EMFILE);
            }
        }
        t.insert(fd, file);
        Ok(fd)
    })
}

/// Look a descriptor up, cloning the handle.
pub fn get(fd: i32) -> Result<Arc<dyn FileOps>, Errno> {
    with_table(|t| t.get(&fd).cloned().ok_or(Errno::EBADF))
}

/// Close a descriptor; runs the handle's on_close when this was the last
/// reference from the table.
pub fn close_fd(fd: i32) -> Result<(), Errno> {
    let file = with_table(|t| t.remove(&fd).ok_or(Errno::EBADF))?;

    let last = with_table(|t| !t.values().any(|v| Arc::ptr_eq(v, &file)));
    if last {
        file.on_close()?;
    }
    Ok(())
}

/// Number of descriptors currently open.
pub fn open_count() -> usize {
    with_table(|t| t.len())
}

/// Drop every descriptor without running close hooks. Test harness only.
pub fn clear() {
    with_table(|t| t.clear());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::{FileOps, Whence};
    use core::sync::atomic::{AtomicU32, Ordering};

    struct NullFile {
        closed: AtomicU32,
    }

    impl FileOps for NullFile {
        fn read(&self, _buf: &mut [u8]) -> Result<usize, Errno> {
            Ok(0)
        }
        fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
            Ok(buf.len())
        }
        fn seek(&self, _o: i64, _w: Whence) -> Result<i64, Errno> {
            Ok(0)
        }
        fn on_close(&self) -> Result<(), Errno> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn alloc_get_close() {
        clear();
        let f = Arc::new(NullFile {
            closed: AtomicU32::new(0),
        });
        let fd = alloc_fd(f.clone()).unwrap();
        assert!(get(fd).is_ok());
        close_fd(fd).unwrap();
        assert_eq!(get(fd).unwrap_err(), Errno::EBADF);
        assert_eq!(f.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dup_defers_close_hook() {
        clear();
        let f = Arc::new(NullFile {
            closed: AtomicU32::new(0),
        });
        let fd1 = alloc_fd(f.clone()).unwrap();
        let fd2 = alloc_fd(f.clone()).unwrap();
        close_fd(fd1).unwrap();
        assert_eq!(f.closed.load(Ordering::SeqCst), 0);
        close_fd(fd2).unwrap();
        assert_eq!(f.closed.load(Ordering::SeqCst), 1);
    }
}
