/*
 * Reader/Writer Semaphore
 *
 * Multi-reader, single-writer lock with writer preference: once a writer
 * is parked, new readers queue behind it. Readers and writers park on
 * separate genwait channels carved out of the same allocation.
 */

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::errno::Errno;
use crate::sched::genwait;

use super::mutex::Mutex;

/// Writer value meaning "nobody" (see sync::mutex).
const FREE: u32 = u32::MAX;

struct RwInner {
    /// Number of active readers.
    readers: AtomicI32,
    /// Owning writer's thread id, FREE when none.
    writer: AtomicU32,
    /// Writers parked or about to park; readers defer to them.
    write_waiters: AtomicU32,
}

/// Reader/writer semaphore handle.
#[derive(Clone)]
pub struct RwSem {
    inner: Arc<RwInner>,
}

impl RwSem {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwInner {
                readers: AtomicI32::new(0),
                writer: AtomicU32::new(FREE),
                write_waiters: AtomicU32::new(0),
            }),
        }
    }

    fn read_token(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn write_token(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize + 1
    }

    fn try_read(&self) -> bool {
        if self.inner.writer.load(Ordering::Acquire) != FREE
            || self.inner.write_waiters.load(Ordering::Acquire) != 0
        {
            return false;
        }
        self.inner.readers.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn try_write(&self, me: u32) -> bool {
        if self.inner.readers.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.inner
            .writer
            .compare_exchange(FREE, me, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquire shared. Blocks while a writer holds or waits.
    pub fn read_lock(&self) -> Result<(), Errno> {
        self.read_lock_timed(0)
    }

    pub fn read_lock_timed(&self, timeout_ms: u64) -> Result<(), Errno> {
        loop {
            let parked = genwait::wait_prepare(self.read_token(), "rwsem_read", timeout_ms, |_| {
                !self.try_read()
            })?;
            if !parked {
                return Ok(());
            }
        }
    }

    /// Interrupt-safe shared acquire.
    pub fn try_read_lock(&self) -> Result<(), Errno> {
        if self.try_read() {
            Ok(())
        } else {
            Err(Errno::EWOULDBLOCK)
        }
    }

    /// Acquire exclusive. Blocks while readers or another writer hold.
    pub fn write_lock(&self) -> Result<(), Errno> {
        self.write_lock_timed(0)
    }

    pub fn write_lock_timed(&self, timeout_ms: u64) -> Result<(), Errno> {
        let me = Mutex::me_tid();
        self.inner.write_waiters.fetch_add(1, Ordering::AcqRel);

        let result = loop {
            let parked =
                match genwait::wait_prepare(self.write_token(), "rwsem_write", timeout_ms, |_| {
                    !self.try_write(me)
                }) {
                    Ok(p) => p,
                    Err(e) => break Err(e),
                };
            if !parked {
                break Ok(());
            }
        };

        self.inner.write_waiters.fetch_sub(1, Ordering::AcqRel);

        // A timed-out writer may have been the only thing holding readers
        // back; let them through.
        if result.is_err() && self.inner.write_waiters.load(Ordering::Acquire) == 0 {
            genwait::wake_all(self.read_token());
        }

        result
    }

    /// Interrupt-safe exclusive acquire.
    pub fn try_write_lock(&self) -> Result<(), Errno> {
        if self.try_write(Mutex::me_tid()) {
            Ok(())
        } else {
            Err(Errno::EWOULDBLOCK)
        }
    }

    /// Release a shared hold.
    pub fn read_unlock(&self) -> Result<(), Errno> {
        let prev = self.inner.readers.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            self.inner.readers.fetch_add(1, Ordering::AcqRel);
            return Err(Errno::EPERM);
        }
        if prev == 1 {
            self.wake_next();
        }
        Ok(())
    }

    /// Release the exclusive hold.
    pub fn write_unlock(&self) -> Result<(), Errno> {
        let me = Mutex::me_tid();
        if self.inner.writer.load(Ordering::Acquire) != me {
            return Err(Errno::EPERM);
        }
        self.inner.writer.store(FREE, Ordering::Release);
        self.wake_next();
        Ok(())
    }

    /// Writers first; a whole batch of readers otherwise.
    fn wake_next(&self) {
        if genwait::wake_one(self.write_token()) == 0 {
            genwait::wake_all(self.read_token());
        }
    }

    pub fn reader_count(&self) -> i32 {
        self.inner.readers.load(Ordering::Acquire)
    }

    pub fn is_write_locked(&self) -> bool {
        self.inner.writer.load(Ordering::Acquire) != FREE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let _g = crate::sched::tests::fresh(crate::sched::SchedMode::Cooperative);
        let rw = RwSem::new();
        rw.read_lock().unwrap();
        rw.read_lock().unwrap();
        assert_eq!(rw.reader_count(), 2);
        // A writer cannot get in past readers.
        assert_eq!(rw.try_write_lock(), Err(Errno::EWOULDBLOCK));
        rw.read_unlock().unwrap();
        rw.read_unlock().unwrap();
        rw.write_lock().unwrap();
        assert!(rw.is_write_locked());
        // Readers cannot get in past a writer.
        assert_eq!(rw.try_read_lock(), Err(Errno::EWOULDBLOCK));
        rw.write_unlock().unwrap();
        crate::sched::shutdown();
    }

    #[test]
    fn unbalanced_unlocks_are_errors() {
        let _g = crate::sched::tests::fresh(crate::sched::SchedMode::Cooperative);
        let rw = RwSem::new();
        assert_eq!(rw.read_unlock(), Err(Errno::EPERM));
        assert_eq!(rw.write_unlock(), Err(Errno::EPERM));
        crate::sched::shutdown();
    }
}
