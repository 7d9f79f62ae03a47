/*
 * Thread Structure and Attributes
 *
 * Each thread owns its stack, its saved CPU context, a priority, a state,
 * and the POSIX-adjacent per-thread bits: errno, working directory, and
 * thread-local storage. Threads are identified by a monotonically
 * increasing 32-bit id that is never recycled.
 */

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

use super::context::CpuContext;

/// Thread identifier. Monotonic, starts at 1, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread priority. Lower value means higher priority.
pub type Prio = u32;

/// Default priority for new threads.
pub const PRIO_DEFAULT: Prio = 10;

/// Priority of the idle thread; nothing may be lower-priority than this.
pub const PRIO_MAX: Prio = 4096;

/// Default stack size for new threads (32 KiB).
pub const THREAD_STACK_SIZE: usize = 32 * 1024;

/// Thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Detached thread that has exited; waiting for the reaper.
    Zombie,
    /// Currently executing. A Running thread is on no queue.
    Running,
    /// Runnable; on the run queue (and only there).
    Ready,
    /// Blocked in genwait; off the run queue, wait_obj is set.
    Wait,
    /// Joinable thread that has exited; destroyed by its joiner.
    Finished,
}

bitflags! {
    /// Per-thread flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// On the run queue right now.
        const QUEUED = 1 << 0;
        /// Exits straight to Zombie; cannot be joined.
        const DETACHED = 1 << 1;
        /// Owns a userspace libc reentrancy block.
        const OWNS_REENT = 1 << 2;
    }
}

/// Why a blocked thread was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Explicitly woken by wake_one/wake_all.
    Signaled,
    /// The wait deadline passed.
    TimedOut,
    /// Woken with an error (object destroyed, connection reset, ...).
    Error(crate::Errno),
}

/// One thread-local-storage slot: key, value, optional destructor run
/// when the thread is destroyed.
pub struct TlsSlot {
    pub key: u32,
    pub value: usize,
    pub destructor: Option<fn(usize)>,
}

/// Libc reentrancy block. The libc shim stores its per-thread state here
/// (strtok pointers, rand state, the works); the kernel only swaps the
/// active block on context switch.
pub struct ReentBlock {
    pub raw: [u8; 64],
}

impl Default for ReentBlock {
    fn default() -> Self {
        Self { raw: [0; 64] }
    }
}

/// A kernel thread.
pub struct Thread {
    pub id: ThreadId,
    pub prio: Prio,
    pub state: ThreadState,
    pub flags: ThreadFlags,

    /// Stack buffer, owned by the scheduler.
    pub stack: Box<[u8]>,

    /// Saved CPU context. Boxed so the address stays stable for the
    /// platform layer while the thread table reallocates.
    pub context: Box<CpuContext>,

    /// Entry function and argument; consumed by the birth trampoline.
    pub entry: Option<fn(usize) -> usize>,
    pub entry_arg: usize,

    /// Return value slot, filled by exit(), read by join().
    pub return_value: usize,

    /// Diagnostic label.
    pub label: String,

    /// Current working directory, used by the VFS for relative paths.
    pub pwd: String,

    /// Per-thread errno for the POSIX-adjacent calls.
    pub errno: i32,

    /// Libc reentrancy block.
    pub reent: ReentBlock,

    /// Wait bookkeeping, valid while state == Wait.
    pub wait_obj: Option<usize>,
    pub wait_label: &'static str,
    pub wait_deadline: Option<u64>,
    pub wait_status: WaitStatus,

    /// Thread-local storage slots.
    pub tls: Vec<TlsSlot>,
}

impl Thread {
    pub fn new(id: ThreadId, stack_size: usize, pwd: String) -> Self {
        Self {
            id,
            prio: PRIO_DEFAULT,
            state: ThreadState::Ready,
            flags: ThreadFlags::empty(),
            stack: alloc::vec![0u8; stack_size].into_boxed_slice(),
            context: Box::new(CpuContext::default()),
            entry: None,
            entry_arg: 0,
            return_value: 0,
            label: String::from("[un-named kernel thread]"),
            pwd,
            errno: 0,
            reent: ReentBlock::default(),
            wait_obj: None,
            wait_label: "",
            wait_deadline: None,
            wait_status: WaitStatus::Signaled,
            tls: Vec::new(),
        }
    }

    /// Base address of the stack buffer; the saved stack pointer must
    /// never fall below this.
    pub fn stack_base(&self) -> usize {
        self.stack.as_ptr() as usize
    }

    /// One past the highest usable stack address.
    pub fn stack_top(&self) -> usize {
        self.stack_base() + self.stack.len()
    }

    /// The genwait token joiners sleep on. High region of the address
    /// space, clear of both heap addresses and the sleep sentinel.
    pub fn join_token(id: ThreadId) -> usize {
        (usize::MAX - 0x1000_0000) + id.0 as usize
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("prio", &self.prio)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("label", &self.label)
            .finish()
    }
}

/// Snapshot of one thread for diagnostics (`ps`-style listings).
#[derive(Debug, Clone)]
pub struct ThreadStat {
    pub id: ThreadId,
    pub prio: Prio,
    pub state: ThreadState,
    pub flags: ThreadFlags,
    pub label: String,
    pub wait_label: &'static str,
    pub wait_deadline: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_tokens_do_not_collide_with_sleep_sentinel() {
        assert_ne!(Thread::join_token(ThreadId(1)), usize::MAX);
        assert_ne!(Thread::join_token(ThreadId(1)), Thread::join_token(ThreadId(2)));
    }

    #[test]
    fn new_thread_defaults() {
        let t = Thread::new(ThreadId(7), THREAD_STACK_SIZE, String::from("/"));
        assert_eq!(t.state, ThreadState::Ready);
        assert_eq!(t.prio, PRIO_DEFAULT);
        assert!(t.stack_top() - t.stack_base() == THREAD_STACK_SIZE);
        assert!(!t.flags.contains(ThreadFlags::DETACHED));
    }
}
