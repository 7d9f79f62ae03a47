/*
 * Counting Semaphore
 *
 * Classic counted semaphore layered on genwait. wait() takes a count or
 * parks; signal() returns a count and releases the highest-priority
 * waiter, who retries the take. The count is never negative.
 */

use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::errno::Errno;
use crate::sched::genwait;

struct SemInner {
    count: AtomicI32,
}

/// Counting semaphore handle.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemInner>,
}

impl Semaphore {
    /// Create a semaphore with an initial count.
    pub fn new(initial: i32) -> Self {
        Self {
            inner: Arc::new(SemInner {
                count: AtomicI32::new(initial),
            }),
        }
    }

    /// The wait channel: the address of the shared allocation, stable for
    /// the object's whole lifetime.
    fn token(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn try_take(&self) -> bool {
        let mut cur = self.inner.count.load(Ordering::Acquire);
        while cur > 0 {
            match self.inner.count.compare_exchange(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
        false
    }

    /// Take a count, blocking until one is available.
    pub fn wait(&self) -> Result<(), Errno> {
        self.wait_timed(0)
    }

    /// Take a count with a timeout; `timeout_ms == 0` waits forever.
    pub fn wait_timed(&self, timeout_ms: u64) -> Result<(), Errno> {
        loop {
            let parked = genwait::wait_prepare(self.token(), "sem_wait", timeout_ms, |_| {
                !self.try_take()
            })?;
            if !parked {
                return Ok(());
            }
            // Woken by a signal; retry the take.
        }
    }

    /// Take a count without blocking. Interrupt-safe.
    pub fn try_wait(&self) -> Result<(), Errno> {
        if self.try_take() {
            Ok(())
        } else {
            Err(Errno::EWOULDBLOCK)
        }
    }

    /// Return a count and release one waiter.
    pub fn signal(&self) {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        genwait::wake_one(self.token());
    }

    /// The current count.
    pub fn count(&self) -> i32 {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Tear the semaphore down: every parked waiter is released with an
    /// error. The handle stays usable but should be dropped.
    pub fn destroy(&self) {
        genwait::wake_all_err(self.token(), Errno::EINVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_and_blocks_at_zero() {
        let _g = crate::sched::tests::fresh(crate::sched::SchedMode::Cooperative);
        let sem = Semaphore::new(2);
        assert!(sem.try_wait().is_ok());
        assert!(sem.try_wait().is_ok());
        assert_eq!(sem.try_wait(), Err(Errno::EWOULDBLOCK));
        sem.signal();
        assert_eq!(sem.count(), 1);
        assert!(sem.try_wait().is_ok());
        crate::sched::shutdown();
    }

    #[test]
    fn clones_share_the_count() {
        let sem = Semaphore::new(1);
        let other = sem.clone();
        assert!(other.try_wait().is_ok());
        assert_eq!(sem.try_wait(), Err(Errno::EWOULDBLOCK));
    }
}
