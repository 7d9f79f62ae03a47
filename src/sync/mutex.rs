/*
 * Sleeping Mutexes
 *
 * Mutex is the plain single-owner lock; RecursiveMutex allows the owner
 * to re-acquire, tracking a depth. Contended lockers park on the mutex's
 * genwait channel; unlock releases the highest-priority waiter.
 *
 * Ownership is tracked by thread id, which makes unlock-by-non-owner and
 * relock-by-owner detectable errors rather than silent deadlocks.
 */

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::errno::Errno;
use crate::sched::{self, genwait, ThreadId};

/// Owner value meaning "nobody": real thread ids are small, and the
/// pre-scheduler boot context uses id 0, so the sentinel sits at the top.
const FREE: u32 = u32::MAX;

struct MutexInner {
    /// Owning thread id, FREE when unheld.
    owner: AtomicU32,
}

/// Single-owner sleeping mutex.
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<MutexInner>,
}

impl Mutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MutexInner {
                owner: AtomicU32::new(FREE),
            }),
        }
    }

    fn token(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Calling thread's raw id; 0 before the scheduler runs.
    pub(crate) fn me_tid() -> u32 {
        sched::current_id().map(|t| t.0).unwrap_or(0)
    }

    fn try_take(&self, me: u32) -> bool {
        self.inner
            .owner
            .compare_exchange(FREE, me, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquire, blocking on contention.
    pub fn lock(&self) -> Result<(), Errno> {
        self.lock_timed(0)
    }

    /// Acquire with a timeout; `timeout_ms == 0` waits forever.
    pub fn lock_timed(&self, timeout_ms: u64) -> Result<(), Errno> {
        let me = Self::me_tid();
        if self.inner.owner.load(Ordering::Acquire) == me {
            // Relocking a non-recursive mutex would deadlock forever.
            return Err(Errno::EINVAL);
        }

        loop {
            let parked = genwait::wait_prepare(self.token(), "mutex_lock", timeout_ms, |_| {
                !self.try_take(me)
            })?;
            if !parked {
                return Ok(());
            }
        }
    }

    /// Acquire without blocking. Interrupt-safe.
    pub fn try_lock(&self) -> Result<(), Errno> {
        if self.try_take(Self::me_tid()) {
            Ok(())
        } else {
            Err(Errno::EWOULDBLOCK)
        }
    }

    /// Release; fails when the caller is not the owner.
    pub fn unlock(&self) -> Result<(), Errno> {
        let me = Self::me_tid();
        if self.inner.owner.load(Ordering::Acquire) != me {
            return Err(Errno::EPERM);
        }
        self.inner.owner.store(FREE, Ordering::Release);
        genwait::wake_one(self.token());
        Ok(())
    }

    /// Whether the mutex is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.inner.owner.load(Ordering::Acquire) != FREE
    }

    /// Whether the calling thread holds the mutex.
    pub fn held_by_me(&self) -> bool {
        self.inner.owner.load(Ordering::Acquire) == Self::me_tid()
    }

    /// Owning thread, if any. Diagnostics.
    pub fn owner_tid(&self) -> Option<ThreadId> {
        match self.inner.owner.load(Ordering::Acquire) {
            FREE => None,
            n => Some(ThreadId(n)),
        }
    }

    pub(crate) fn wait_token(&self) -> usize {
        self.token()
    }

    /// Force-release from condvar internals: hand the lock back to the
    /// free state and release one contender. Caller must own the mutex.
    pub(crate) fn release_raw(&self) {
        self.inner.owner.store(FREE, Ordering::Release);
    }
}

struct RecursiveInner {
    owner: AtomicU32,
    depth: AtomicU32,
}

/// Re-entrant sleeping mutex: the owner may lock again, and must unlock
/// as many times as it locked.
#[derive(Clone)]
pub struct RecursiveMutex {
    inner: Arc<RecursiveInner>,
}

impl RecursiveMutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RecursiveInner {
                owner: AtomicU32::new(FREE),
                depth: AtomicU32::new(0),
            }),
        }
    }

    fn token(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn try_take(&self, me: u32) -> bool {
        if self.inner.owner.load(Ordering::Acquire) == me {
            self.inner.depth.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        if self
            .inner
            .owner
            .compare_exchange(FREE, me, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.depth.store(1, Ordering::Release);
            return true;
        }
        false
    }

    pub fn lock(&self) -> Result<(), Errno> {
        self.lock_timed(0)
    }

    pub fn lock_timed(&self, timeout_ms: u64) -> Result<(), Errno> {
        let me = Mutex::me_tid();
        loop {
            let parked = genwait::wait_prepare(self.token(), "rlock_lock", timeout_ms, |_| {
                !self.try_take(me)
            })?;
            if !parked {
                return Ok(());
            }
        }
    }

    /// Interrupt-safe non-blocking acquire.
    pub fn try_lock(&self) -> Result<(), Errno> {
        if self.try_take(Mutex::me_tid()) {
            Ok(())
        } else {
            Err(Errno::EWOULDBLOCK)
        }
    }

    pub fn unlock(&self) -> Result<(), Errno> {
        let me = Mutex::me_tid();
        if self.inner.owner.load(Ordering::Acquire) != me {
            return Err(Errno::EPERM);
        }
        if self.inner.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.owner.store(FREE, Ordering::Release);
            genwait::wake_one(self.token());
        }
        Ok(())
    }

    pub fn depth(&self) -> u32 {
        self.inner.depth.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_cycle() {
        let _g = crate::sched::tests::fresh(crate::sched::SchedMode::Cooperative);
        let m = Mutex::new();
        assert!(!m.is_locked());
        m.lock().unwrap();
        assert!(m.is_locked());
        assert!(m.held_by_me());
        // Relocking a plain mutex is refused, not deadlocked.
        assert_eq!(m.lock(), Err(Errno::EINVAL));
        m.unlock().unwrap();
        assert!(!m.is_locked());
        // Unlocking again is a caller error.
        assert_eq!(m.unlock(), Err(Errno::EPERM));
        crate::sched::shutdown();
    }

    #[test]
    fn try_lock_reports_contention() {
        let _g = crate::sched::tests::fresh(crate::sched::SchedMode::Cooperative);
        let m = Mutex::new();
        m.lock().unwrap();
        let m2 = m.clone();
        // Same thread, so try_lock sees it held.
        assert_eq!(m2.try_lock(), Err(Errno::EWOULDBLOCK));
        m.unlock().unwrap();
        crate::sched::shutdown();
    }

    #[test]
    fn recursive_depth_counts() {
        let _g = crate::sched::tests::fresh(crate::sched::SchedMode::Cooperative);
        let m = RecursiveMutex::new();
        m.lock().unwrap();
        m.lock().unwrap();
        assert_eq!(m.depth(), 2);
        m.unlock().unwrap();
        assert_eq!(m.depth(), 1);
        m.unlock().unwrap();
        assert_eq!(m.depth(), 0);
        assert_eq!(m.unlock(), Err(Errno::EPERM));
        crate::sched::shutdown();
    }
}
