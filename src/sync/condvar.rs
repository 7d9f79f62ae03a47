/*
 * Condition Variable
 *
 * wait() atomically releases the associated mutex and parks on the
 * condvar's channel; the mutex is reacquired before returning, whatever
 * the wake reason was. The release and the park happen in one step under
 * the scheduler lock, so a signal between "unlock" and "sleep" cannot be
 * lost.
 */

use alloc::sync::Arc;

use crate::errno::Errno;
use crate::sched::genwait;
use crate::sched::WaitStatus;

use super::mutex::Mutex;

struct CondInner {
    _anchor: u8,
}

/// Condition variable handle.
#[derive(Clone)]
pub struct Condvar {
    inner: Arc<CondInner>,
}

impl Condvar {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CondInner { _anchor: 0 }),
        }
    }

    fn token(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Release `mutex`, park until signaled, reacquire `mutex`.
    ///
    /// The caller must hold `mutex`. `timeout_ms == 0` waits forever; on
    /// timeout the mutex is still reacquired before ETIMEDOUT comes back.
    pub fn wait(&self, mutex: &Mutex, timeout_ms: u64) -> Result<(), Errno> {
        if !mutex.held_by_me() {
            return Err(Errno::EPERM);
        }

        let mutex_token = mutex.wait_token();
        let wait_result = genwait::wait_prepare(self.token(), "cond_wait", timeout_ms, |state| {
            // Hand the mutex over while the scheduler lock pins the world:
            // free it and release its best parked contender.
            mutex.release_raw();
            state.genwait_wake(mutex_token, 1, WaitStatus::Signaled);
            true
        });

        // Whatever happened on the channel, the caller gets the mutex back.
        let relock = mutex.lock();

        match wait_result {
            Ok(_) => relock,
            Err(e) => {
                relock?;
                Err(e)
            }
        }
    }

    /// Wake the highest-priority waiter. The caller should hold the
    /// associated mutex for predictable wake ordering.
    pub fn signal(&self) {
        genwait::wake_one(self.token());
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        genwait::wake_all(self.token());
    }

    /// Tear the condvar down, releasing every waiter with an error.
    pub fn destroy(&self) {
        genwait::wake_all_err(self.token(), Errno::EINVAL);
    }

    /// How many threads are parked on this condvar.
    pub fn waiter_count(&self) -> usize {
        genwait::waiter_count(self.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_requires_the_mutex() {
        let _g = crate::sched::tests::fresh(crate::sched::SchedMode::Cooperative);
        let cv = Condvar::new();
        let m = Mutex::new();
        assert_eq!(cv.wait(&m, 10), Err(Errno::EPERM));
        crate::sched::shutdown();
    }

    #[test]
    fn signal_with_no_waiters_is_a_noop() {
        let _g = crate::sched::tests::fresh(crate::sched::SchedMode::Cooperative);
        let cv = Condvar::new();
        cv.signal();
        cv.broadcast();
        assert_eq!(cv.waiter_count(), 0);
        crate::sched::shutdown();
    }
}
