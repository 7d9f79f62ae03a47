/*
 * Thread Synchronization Primitives
 *
 * Every primitive here is a transparent composition over the scheduler's
 * genwait facility: the primitive's own heap allocation is the wait
 * channel, acquisition state lives in atomics, and the check-and-park
 * step runs under the scheduler lock so wakeups cannot be lost.
 *
 * All primitives are cheap cloneable handles (Arc inside); clones refer
 * to the same underlying object. The try_ variants never block and are
 * safe to call from interrupt context.
 */

pub mod condvar;
pub mod mutex;
pub mod rwsem;
pub mod semaphore;

pub use condvar::Condvar;
pub use mutex::{Mutex, RecursiveMutex};
pub use rwsem::RwSem;
pub use semaphore::Semaphore;
