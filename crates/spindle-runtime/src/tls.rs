//! Thread-local fiber registers
//!
//! Every OS thread that touches the runtime carries three registers:
//!
//! - *current*: the fiber presently executing on this thread
//! - *thread-root*: the fiber representing the thread's original stack,
//!   created lazily on first access
//! - *scheduler-parent*: the fiber scheduled fibers yield back to; defaults
//!   to the thread-root and is overridden by the caller-dispatch fiber
//!
//! The trampoline reaches the enclosing fiber through *current* rather than
//! a back-pointer stored in the context.

use crate::fiber::Fiber;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

thread_local! {
    /// Fiber presently executing on this thread
    static CURRENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber representing this thread's original stack
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Fiber that scheduled fibers yield back to
    static SCHED_PARENT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Cached kernel thread id (0 = not yet fetched)
    static THREAD_ID: Cell<libc::pid_t> = const { Cell::new(0) };
}

/// Kernel thread id of the calling thread, fetched once per thread
#[inline]
pub fn thread_id() -> libc::pid_t {
    THREAD_ID.with(|cell| {
        let mut id = cell.get();
        if id == 0 {
            id = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            cell.set(id);
        }
        id
    })
}

/// Install the currently executing fiber
#[inline]
pub(crate) fn set_current(f: Arc<Fiber>) {
    CURRENT.with(|cell| *cell.borrow_mut() = Some(f));
}

/// Currently executing fiber, if this thread has been initialized
#[inline]
pub(crate) fn current_opt() -> Option<Arc<Fiber>> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Raw pointer to the currently executing fiber
///
/// Used by the terminal yield, which must not hold a handle of its own:
/// the TLS slot keeps the fiber alive until the parent context resumes and
/// replaces it.
#[inline]
pub(crate) fn current_raw() -> *const Fiber {
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(Arc::as_ptr)
            .unwrap_or(std::ptr::null())
    })
}

/// Install this thread's root fiber
#[inline]
pub(crate) fn set_thread_root(f: Arc<Fiber>) {
    THREAD_ROOT.with(|cell| *cell.borrow_mut() = Some(f));
}

/// This thread's root fiber, if created
#[inline]
pub(crate) fn thread_root() -> Option<Arc<Fiber>> {
    THREAD_ROOT.with(|cell| cell.borrow().clone())
}

/// Override the scheduler-parent register (caller-dispatch fiber)
#[inline]
pub(crate) fn set_sched_parent(f: Arc<Fiber>) {
    SCHED_PARENT.with(|cell| *cell.borrow_mut() = Some(f));
}

/// The fiber scheduled fibers on this thread yield back to
#[inline]
pub(crate) fn sched_parent() -> Option<Arc<Fiber>> {
    SCHED_PARENT.with(|cell| cell.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_is_cached_and_nonzero() {
        let a = thread_id();
        let b = thread_id();
        assert!(a > 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_thread_id_differs_across_threads() {
        let main_id = thread_id();
        let other = std::thread::spawn(thread_id).join().unwrap();
        assert_ne!(main_id, other);
    }
}
