//! Stackful coroutine primitive
//!
//! A `Fiber` owns its stack and saved machine context and is driven by an
//! explicit `resume`/`yield_now` pair. Switching is asymmetric: `resume`
//! saves the caller's execution into the fiber's *parent* context and jumps
//! into the fiber; `yield_now` does the reverse.
//!
//! The parent is selected per fiber: fibers created with
//! `runs_under_scheduler` yield to the thread's *scheduler-parent* register,
//! everything else yields to the *thread-root* fiber (see `tls`).

use crate::arch::{self, SavedRegs};
use crate::stack::FiberStack;
use crate::tls;
use spindle_core::constants::DEFAULT_STACK_SIZE;
use spindle_core::rt_error;
use spindle_core::{FiberId, FiberState, SchedResult};
use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Boxed entry closure, consumed on first resume
pub type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// Monotonic id source
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
/// Live fiber count
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// A stackful coroutine
///
/// Handles are `Arc<Fiber>`; the scheduler, the reactor's event table and
/// the caller may all hold one concurrently.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Owned stack; `None` for thread-root fibers, which borrow the
    /// thread's original stack
    stack: Option<FiberStack>,
    ctx: UnsafeCell<SavedRegs>,
    entry: Mutex<Option<EntryFn>>,
    runs_under_scheduler: bool,
    /// Held by the dispatcher across `resume`, serializing external
    /// reset/cancel against a running fiber. Code running inside the fiber
    /// must never take its own dispatch lock, and no dispatch lock may be
    /// held across a yield.
    dispatch_lock: Mutex<()>,
    self_ref: Weak<Fiber>,
}

// `state` and `entry` are synchronized. `ctx` is written only inside
// `resume`/`switch_out`, which the dispatch discipline serializes: a fiber
// context is switched into by at most one thread at a time.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with an entry closure
    ///
    /// `stack_size` of 0 selects the default (128 000 bytes). The fiber
    /// starts READY; nothing runs until the first `resume`.
    pub fn new<F>(entry: F, stack_size: usize, runs_under_scheduler: bool) -> SchedResult<Arc<Self>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_boxed(Box::new(entry), stack_size, runs_under_scheduler)
    }

    /// Create a fiber from an already-boxed entry closure
    pub fn from_boxed(
        entry: EntryFn,
        stack_size: usize,
        runs_under_scheduler: bool,
    ) -> SchedResult<Arc<Self>> {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let stack = FiberStack::alloc(size)?;
        let stack_top = stack.top();

        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: FiberId::new(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(FiberState::Ready.as_u8()),
            stack: Some(stack),
            ctx: UnsafeCell::new(SavedRegs::zeroed()),
            entry: Mutex::new(Some(entry)),
            runs_under_scheduler,
            dispatch_lock: Mutex::new(()),
            self_ref: weak.clone(),
        });
        unsafe {
            arch::init_context(fiber.ctx.get(), stack_top, fiber_main as usize);
        }
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Ok(fiber)
    }

    /// The fiber representing a thread's original stack
    fn new_root() -> Arc<Self> {
        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: FiberId::new(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(FiberState::Running.as_u8()),
            stack: None,
            ctx: UnsafeCell::new(SavedRegs::zeroed()),
            entry: Mutex::new(None),
            runs_under_scheduler: false,
            dispatch_lock: Mutex::new(()),
            self_ref: weak.clone(),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        fiber
    }

    /// The fiber currently executing on this thread
    ///
    /// Lazily creates the thread-root fiber on first call per thread; after
    /// return the thread-local *current* register is always populated. The
    /// fresh root starts RUNNING and doubles as the scheduler-parent until
    /// a dispatch fiber overrides it.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_opt() {
            return f;
        }
        let root = Self::new_root();
        tls::set_current(root.clone());
        tls::set_thread_root(root.clone());
        tls::set_sched_parent(root.clone());
        root
    }

    /// Id of the fiber currently executing on this thread
    ///
    /// Returns `FiberId::NONE` if the thread has not touched the runtime.
    pub fn current_id() -> FiberId {
        tls::current_opt().map(|f| f.id).unwrap_or(FiberId::NONE)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether this fiber represents a thread's original stack
    ///
    /// Thread-root fibers own no stack and must never be parked in the
    /// scheduler; suspension helpers fall back to blocking behavior when
    /// the caller turns out to be one.
    #[inline]
    pub fn is_thread_root(&self) -> bool {
        self.stack.is_none()
    }

    #[inline]
    fn set_state(&self, st: FiberState) {
        self.state.store(st.as_u8(), Ordering::Release);
    }

    /// Switch execution from this fiber's parent into this fiber
    ///
    /// Returns when the fiber yields or terminates. Resuming a fiber that
    /// is not READY is an invariant violation and aborts loudly.
    pub fn resume(&self) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume() on fiber {} in state {}",
            self.id,
            self.state()
        );
        // The save side of the switch writes into this thread's registers;
        // make sure they exist.
        Fiber::current();

        self.set_state(FiberState::Running);
        let parent = self.parent();
        let me = self.self_ref.upgrade().expect("fiber resumed during teardown");
        tls::set_current(me);
        unsafe {
            arch::context_switch(parent.ctx.get(), self.ctx.get());
        }
        // Back on the parent: the fiber yielded or terminated.
    }

    /// Yield the fiber currently executing on this thread back to its parent
    ///
    /// Execution continues at the instruction after the `resume` that last
    /// entered the fiber. The fiber goes back to READY (unless it already
    /// terminated); re-queueing it is the caller's business.
    pub fn yield_now() {
        let curr = tls::current_opt().expect("yield_now() outside fiber context");
        curr.switch_out();
    }

    /// Rewind a terminated fiber to run a new entry closure
    ///
    /// Reuses the existing stack; observably equivalent to constructing a
    /// fresh fiber with `entry`, minus the allocation.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert_eq!(
            self.state(),
            FiberState::Term,
            "reset() on fiber {} in state {}",
            self.id,
            self.state()
        );
        let stack = self
            .stack
            .as_ref()
            .expect("reset() on a stackless thread-root fiber");
        *self.entry.lock().unwrap() = Some(Box::new(entry));
        unsafe {
            arch::init_context(self.ctx.get(), stack.top(), fiber_main as usize);
        }
        self.set_state(FiberState::Ready);
    }

    /// Lock held by the dispatcher across `resume`
    pub(crate) fn lock_dispatch(&self) -> MutexGuard<'_, ()> {
        self.dispatch_lock.lock().unwrap()
    }

    /// The context this fiber switches back to on yield
    fn parent(&self) -> Arc<Fiber> {
        if self.runs_under_scheduler {
            tls::sched_parent().expect("scheduler-parent register not initialized")
        } else {
            tls::thread_root().expect("thread-root register not initialized")
        }
    }

    /// Save this fiber's execution and restore the parent's
    fn switch_out(&self) {
        let st = self.state();
        assert!(
            st == FiberState::Running || st == FiberState::Term,
            "yield from fiber {} in state {}",
            self.id,
            st
        );
        if st != FiberState::Term {
            self.set_state(FiberState::Ready);
        }
        let parent = self.parent();
        tls::set_current(parent.clone());
        unsafe {
            arch::context_switch(self.ctx.get(), parent.ctx.get());
        }
        // Back here on a later resume.
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Number of live fibers in the process
pub fn live_fiber_count() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Entry point every fiber starts in, reached via the arch trampoline
///
/// Runs the entry closure to completion, clears it, marks the fiber TERM
/// and performs the final switch back to the parent. Never returns.
extern "C" fn fiber_main() -> ! {
    {
        let curr = Fiber::current();
        let entry = curr.entry.lock().unwrap().take();
        if let Some(entry) = entry {
            // The unwind must not cross the naked trampoline frame below us
            if catch_unwind(AssertUnwindSafe(entry)).is_err() {
                rt_error!("fiber {} panicked in its entry closure", curr.id());
            }
        }
        curr.set_state(FiberState::Term);
    }
    // All local handles are dropped; the resume() caller and the TLS
    // *current* slot keep the fiber alive until the parent is restored.
    let raw = tls::current_raw();
    debug_assert!(!raw.is_null());
    unsafe { (*raw).switch_out() };
    unreachable!("terminated fiber was resumed");
}
