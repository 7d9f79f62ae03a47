/*
 * Generalized Wait System ("genwait")
 *
 * Any usize token can serve as a wait channel: a heap address, a thread
 * join token, or the distinguished sleep sentinel. A thread blocks on a
 * token with an optional timeout; wakers release one or all waiters on
 * a token, optionally carrying an error. All synchronization primitives
 * (semaphore, mutex, rwsem, condvar) and every blocking socket or
 * filesystem path are layered on this.
 *
 * Waiter order on a channel is highest-priority-first with FIFO ties,
 * maintained by sorted insertion. Timeouts are examined on every
 * scheduler pass.
 *
 * The waiter table lives inside the scheduler state and shares its lock;
 * the single-spinlock protection here is the portable equivalent of the
 * global interrupt-disable the hardware build uses.
 */

use crate::errno::Errno;

use super::thread::{Prio, ThreadId, ThreadState, WaitStatus};
use super::{with_state, SchedState};

/// Wait token used for pure timed sleeps. Cannot collide with a real
/// object address.
pub const SLEEP_OBJECT: usize = usize::MAX;

/// One parked thread on a wait channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    pub tid: ThreadId,
    pub prio: Prio,
}

impl SchedState {
    /// Park `tid` on `obj`. Caller has already set the thread's wait
    /// bookkeeping and state.
    pub(crate) fn genwait_insert(&mut self, obj: usize, tid: ThreadId, prio: Prio) {
        let list = self.waiters.entry(obj).or_default();
        // After every waiter of same-or-higher priority: FIFO inside a band.
        let pos = list.iter().position(|w| w.prio > prio);
        let w = Waiter { tid, prio };
        match pos {
            Some(i) => list.insert(i, w),
            None => list.push(w),
        }
    }

    /// Remove one specific waiter from `obj`'s channel, if parked there.
    pub(crate) fn genwait_remove(&mut self, obj: usize, tid: ThreadId) -> bool {
        let Some(list) = self.waiters.get_mut(&obj) else {
            return false;
        };
        let before = list.len();
        list.retain(|w| w.tid != tid);
        let removed = list.len() != before;
        if list.is_empty() {
            self.waiters.remove(&obj);
        }
        removed
    }

    /// Release a parked thread: record why, make it Ready, enqueue it.
    pub(crate) fn genwait_release(&mut self, tid: ThreadId, status: WaitStatus) {
        if let Some(t) = self.threads.get_mut(&tid) {
            t.wait_obj = None;
            t.wait_deadline = None;
            t.wait_status = status;
            if t.state == ThreadState::Wait {
                t.state = ThreadState::Ready;
                self.add_to_runnable(tid, false);
            }
        }
    }

    /// Wake up to `max` waiters on `obj` with `status`; usize::MAX for all.
    pub(crate) fn genwait_wake(&mut self, obj: usize, max: usize, status: WaitStatus) -> usize {
        let Some(mut list) = self.waiters.remove(&obj) else {
            return 0;
        };

        let n = core::cmp::min(max, list.len());
        let woken: alloc::vec::Vec<Waiter> = list.drain(..n).collect();

        if !list.is_empty() {
            self.waiters.insert(obj, list);
        }

        for w in &woken {
            self.genwait_release(w.tid, status);
        }
        woken.len()
    }

    /// Release every waiter whose deadline has passed with TimedOut.
    pub(crate) fn genwait_check_timeouts(&mut self, now: u64) {
        let mut expired: alloc::vec::Vec<(usize, ThreadId)> = alloc::vec::Vec::new();

        for (obj, list) in self.waiters.iter() {
            for w in list.iter() {
                let deadline = self.threads.get(&w.tid).and_then(|t| t.wait_deadline);
                if let Some(d) = deadline {
                    if d <= now {
                        expired.push((*obj, w.tid));
                    }
                }
            }
        }

        for (obj, tid) in expired {
            self.genwait_remove(obj, tid);
            self.genwait_release(tid, WaitStatus::TimedOut);
        }
    }
}

/// Block the current thread on `obj`.
///
/// `timeout_ms == 0` waits forever. Returns Ok(()) when signaled,
/// Err(ETIMEDOUT) when the deadline passed, or the error a waker
/// attached. Must not be called from interrupt context.
pub fn wait(obj: usize, label: &'static str, timeout_ms: u64) -> Result<(), Errno> {
    wait_prepare(obj, label, timeout_ms, |_| true).map(|_| ())
}

/// Decide-then-park under the scheduler lock.
///
/// `setup` runs with the scheduler state locked; returning false skips
/// the park entirely (Ok(false)), returning true parks the caller on
/// `obj` (Ok(true) once woken). The synchronization primitives use this
/// so "check the counter and go to sleep" is one atomic step - the
/// portable equivalent of the interrupt-disable window in the hardware
/// build - which is what rules out lost wakeups.
pub(crate) fn wait_prepare(
    obj: usize,
    label: &'static str,
    timeout_ms: u64,
    setup: impl FnOnce(&mut SchedState) -> bool,
) -> Result<bool, Errno> {
    if super::in_irq() {
        log::warn!("genwait::wait({:#x}) called inside an interrupt", obj);
        return Err(Errno::EPERM);
    }

    let now = crate::utils::timer::uptime_ms();

    let parked = {
        let mut guard = super::SCHED.lock();
        let state = guard.as_mut().ok_or(Errno::EPERM)?;
        let tid = state.current.ok_or(Errno::EPERM)?;

        if !setup(state) {
            None
        } else {
            {
                let t = state.threads.get_mut(&tid).ok_or(Errno::EPERM)?;
                t.state = ThreadState::Wait;
                t.wait_obj = Some(obj);
                t.wait_label = label;
                t.wait_deadline = (timeout_ms != 0).then(|| now + timeout_ms);
                t.wait_status = WaitStatus::Signaled;
                let prio = t.prio;
                state.genwait_insert(obj, tid, prio);
            }
            Some((tid, state.reschedule_locked(false, now)))
        }
    };

    let Some((tid, switch)) = parked else {
        return Ok(false);
    };

    super::do_switch(switch);

    // Back on this thread's context: report why we were released.
    let status = with_state(|s| s.threads.get(&tid).map(|t| t.wait_status))
        .flatten()
        .unwrap_or(WaitStatus::Signaled);

    match status {
        WaitStatus::Signaled => Ok(true),
        WaitStatus::TimedOut => Err(Errno::ETIMEDOUT),
        WaitStatus::Error(e) => Err(e),
    }
}

/// Wake the highest-priority waiter on `obj`. No-op without waiters.
/// Returns the number of threads woken (0 or 1).
pub fn wake_one(obj: usize) -> usize {
    super::with_state_mut(|s| s.genwait_wake(obj, 1, WaitStatus::Signaled)).unwrap_or(0)
}

/// Wake every waiter on `obj`.
pub fn wake_all(obj: usize) -> usize {
    super::with_state_mut(|s| s.genwait_wake(obj, usize::MAX, WaitStatus::Signaled)).unwrap_or(0)
}

/// Wake the highest-priority waiter on `obj` with an error result.
pub fn wake_one_err(obj: usize, err: Errno) -> usize {
    super::with_state_mut(|s| s.genwait_wake(obj, 1, WaitStatus::Error(err))).unwrap_or(0)
}

/// Wake every waiter on `obj` with an error result (object destroyed,
/// connection reset, and the like).
pub fn wake_all_err(obj: usize, err: Errno) -> usize {
    super::with_state_mut(|s| s.genwait_wake(obj, usize::MAX, WaitStatus::Error(err))).unwrap_or(0)
}

/// Release timed-out waiters. Runs on every scheduler pass; exposed so
/// cooperative builds and tests can drive it directly.
pub fn check_timeouts(now: u64) {
    let _ = super::with_state_mut(|s| s.genwait_check_timeouts(now));
}

/// How many threads are parked on `obj`.
pub fn waiter_count(obj: usize) -> usize {
    with_state(|s| s.waiters.get(&obj).map(|l| l.len()).unwrap_or(0)).unwrap_or(0)
}
