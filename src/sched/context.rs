/*
 * Saved CPU Context and the Architecture Seam
 *
 * The scheduler is architecture-independent; everything that actually
 * touches registers lives behind the ContextOps trait, supplied by the
 * platform layer at boot. The CpuContext struct is the scheduler-owned
 * storage the platform fills and restores.
 *
 * The layout deliberately carries only what a context switch needs:
 * program counter, stack pointer, the callee-saved register block, and
 * the floating-point state. Caller-saved registers are dead across the
 * switch points (every switch happens at a call boundary or a full
 * interrupt frame the platform manages itself).
 */

/// Number of callee-saved general-purpose registers preserved per thread.
pub const CALLEE_SAVED_REGS: usize = 8;

/// Number of floating-point registers preserved per thread.
pub const FPU_REGS: usize = 16;

/// Saved CPU context for one thread.
///
/// The scheduler owns one of these per thread (boxed, so the address is
/// stable for the lifetime of the thread regardless of how the thread
/// table reallocates).
#[derive(Debug, Clone)]
pub struct CpuContext {
    /// Program counter at the point of suspension.
    pub pc: usize,
    /// Stack pointer at the point of suspension.
    pub sp: usize,
    /// Callee-saved general purpose registers.
    pub regs: [usize; CALLEE_SAVED_REGS],
    /// Floating point register file, valid when `fpu_used` is set.
    pub fpu: [u64; FPU_REGS],
    /// Whether this thread has touched the FPU since creation.
    pub fpu_used: bool,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self {
            pc: 0,
            sp: 0,
            regs: [0; CALLEE_SAVED_REGS],
            fpu: [0; FPU_REGS],
            fpu_used: false,
        }
    }
}

/// Entry trampoline signature handed to ContextOps::init.
///
/// The scheduler passes its own trampoline here; the trampoline looks up
/// the thread's entry function, runs it, and exits the thread with the
/// return value. It never returns to the platform layer.
pub type EntryTrampoline = fn(arg: usize) -> !;

/// The platform-layer contract for context manipulation.
///
/// Registered once at boot via sched::set_context_ops(). In a hosted test
/// build nothing is registered and the scheduler only exercises its
/// bookkeeping (queue movement, state transitions); no stacks are
/// actually switched.
pub trait ContextOps: Send + Sync {
    /// Prepare a fresh context so that resuming it enters `trampoline`
    /// with `arg` on the given stack.
    fn init(&self, ctx: &mut CpuContext, stack_top: usize, trampoline: EntryTrampoline, arg: usize);

    /// Suspend into `old` and resume `new`.
    ///
    /// # Safety
    /// Both pointers must reference live, scheduler-owned CpuContext
    /// storage; `new` must have been initialized by `init` or a prior
    /// `switch`.
    unsafe fn switch(&self, old: *mut CpuContext, new: *const CpuContext);

    /// Enter the CPU's low-power wait until the next interrupt. Used by
    /// the idle thread.
    fn idle_sleep(&self);

    /// Terminate the whole system. Called when only the idle and reaper
    /// threads remain (all user work is done).
    fn system_exit(&self) -> !;
}
