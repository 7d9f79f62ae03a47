/*
 * Public-surface tests for the scheduler and the synchronization
 * primitives. Without a platform context-switch backend registered the
 * scheduler runs in bookkeeping form: threads are created, queued and
 * tracked, but no stacks are switched, so everything here drives the
 * API from the single host thread.
 */

use std::sync::Mutex as HostMutex;

use marlin_kernel::sched::{self, SchedMode, ThreadState};
use marlin_kernel::sync::{Condvar, Mutex, RecursiveMutex, RwSem, Semaphore};
use marlin_kernel::Errno;

/// The scheduler is one global; run these serially.
static SCHED_LOCK: HostMutex<()> = HostMutex::new(());

fn noop(_: usize) -> usize {
    0
}

#[test]
fn service_threads_exist_after_init() {
    let _g = SCHED_LOCK.lock().unwrap();
    sched::shutdown();
    sched::init(SchedMode::Cooperative).unwrap();

    let stats = sched::thread_stats();
    let labels: Vec<&str> = stats.iter().map(|t| t.label.as_str()).collect();
    assert!(labels.contains(&"[kernel]"));
    assert!(labels.contains(&"[idle]"));
    assert!(labels.contains(&"[reaper]"));

    // The calling context became the running kernel thread.
    let me = sched::current_id().unwrap();
    let kern = stats.iter().find(|t| t.id == me).unwrap();
    assert_eq!(kern.state, ThreadState::Running);

    sched::shutdown();
}

#[test]
fn spawn_detach_join_rules() {
    let _g = SCHED_LOCK.lock().unwrap();
    sched::shutdown();
    sched::init(SchedMode::Cooperative).unwrap();

    let t = sched::spawn(false, noop, 0).unwrap();
    sched::set_label(t, "worker-a");
    assert!(sched::thread_stats().iter().any(|s| s.label == "worker-a"));

    // Detaching twice is refused; joining a detached thread too.
    sched::detach(t).unwrap();
    assert_eq!(sched::detach(t), Err(Errno::EINVAL));
    assert_eq!(sched::join(t), Err(Errno::EINVAL));

    // Unknown threads are reported as such.
    assert_eq!(sched::join(sched::ThreadId(9999)), Err(Errno::ENOENT));

    sched::shutdown();
}

#[test]
fn errno_and_cwd_are_per_thread_state() {
    let _g = SCHED_LOCK.lock().unwrap();
    sched::shutdown();
    sched::init(SchedMode::Cooperative).unwrap();

    sched::set_errno(Errno::ENOENT);
    assert_eq!(sched::errno(), 2);

    sched::setcwd("/tmp");
    assert_eq!(sched::getcwd(), "/tmp");
    sched::setcwd("/");

    sched::shutdown();
}

#[test]
fn tls_keys_are_fresh_and_deletable() {
    let _g = SCHED_LOCK.lock().unwrap();
    sched::shutdown();
    sched::init(SchedMode::Cooperative).unwrap();

    let k1 = sched::tls_key_create(None);
    let k2 = sched::tls_key_create(None);
    assert_ne!(k1, k2);

    sched::tls_set(k1, 111, None).unwrap();
    sched::tls_set(k2, 222, None).unwrap();
    assert_eq!(sched::tls_get(k1), Some(111));
    assert_eq!(sched::tls_get(k2), Some(222));

    sched::tls_key_delete(k1).unwrap();
    assert_eq!(sched::tls_get(k1), None);
    assert_eq!(sched::tls_get(k2), Some(222));

    sched::shutdown();
}

#[test]
fn sync_primitives_uncontended_paths() {
    let _g = SCHED_LOCK.lock().unwrap();
    sched::shutdown();
    sched::init(SchedMode::Cooperative).unwrap();

    // Semaphore counts down and trips at zero.
    let sem = Semaphore::new(1);
    sem.wait().unwrap();
    assert_eq!(sem.try_wait(), Err(Errno::EWOULDBLOCK));
    sem.signal();
    assert_eq!(sem.count(), 1);

    // Mutex: relock refused, foreign unlock refused.
    let m = Mutex::new();
    m.lock().unwrap();
    assert_eq!(m.lock(), Err(Errno::EINVAL));
    m.unlock().unwrap();
    assert_eq!(m.unlock(), Err(Errno::EPERM));

    // Recursive mutex nests.
    let r = RecursiveMutex::new();
    r.lock().unwrap();
    r.lock().unwrap();
    r.unlock().unwrap();
    r.unlock().unwrap();

    // Rwsem: readers share, writers exclude.
    let rw = RwSem::new();
    rw.read_lock().unwrap();
    assert_eq!(rw.try_write_lock(), Err(Errno::EWOULDBLOCK));
    rw.read_unlock().unwrap();
    rw.write_lock().unwrap();
    assert_eq!(rw.try_read_lock(), Err(Errno::EWOULDBLOCK));
    rw.write_unlock().unwrap();

    // Condvar insists on the mutex being held.
    let cv = Condvar::new();
    let m2 = Mutex::new();
    assert_eq!(cv.wait(&m2, 5), Err(Errno::EPERM));
    cv.signal();
    cv.broadcast();

    sched::shutdown();
}
