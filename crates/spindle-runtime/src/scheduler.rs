//! Task scheduler
//!
//! A fixed pool of worker threads draining one shared FIFO queue. Each
//! worker runs the dispatch loop: pop the first task it may execute,
//! resume it (wrapping plain callables in fresh fibers), and fall back to
//! its idle fiber when the queue has nothing for it.
//!
//! The base scheduler's idle fiber just sleeps and yields; `IoManager`
//! overrides it with the reactor loop. Producers call `tickle` on the
//! empty -> non-empty queue edge so a sleeping reactor wakes immediately;
//! spurious tickles are harmless by design.
//!
//! With `use_caller` the constructing thread is enrolled as a worker: a
//! dedicated dispatch fiber becomes that thread's scheduler-parent, and
//! `stop()` resumes it to drain the queue before joining the pool.

use crate::config::RuntimeConfig;
use crate::fiber::{EntryFn, Fiber};
use crate::tls;
use spindle_core::{rt_debug, rt_error};
use spindle_core::{FiberState, SchedResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// What a task runs: an existing fiber, or a callable to wrap in one
enum Payload {
    Fiber(Arc<Fiber>),
    Call(EntryFn),
}

/// One entry in the shared task queue
pub struct ScheduleTask {
    payload: Payload,
    /// Kernel thread id this task is pinned to; `None` = any worker
    target: Option<libc::pid_t>,
}

impl ScheduleTask {
    /// Task resuming an existing fiber. Takes the handle by value; clone
    /// first if the caller wants to keep one.
    pub fn fiber(f: Arc<Fiber>) -> Self {
        Self {
            payload: Payload::Fiber(f),
            target: None,
        }
    }

    /// Task running a plain callable (wrapped in a fresh fiber at dispatch)
    pub fn callback<F>(cb: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_boxed(Box::new(cb))
    }

    /// Task from an already-boxed callable
    pub fn from_boxed(cb: EntryFn) -> Self {
        Self {
            payload: Payload::Call(cb),
            target: None,
        }
    }

    /// Pin the task to one worker's kernel thread id
    pub fn to_thread(mut self, tid: libc::pid_t) -> Self {
        self.target = Some(tid);
        self
    }
}

/// State shared by every scheduler flavor
pub struct SchedulerCore {
    name: String,
    stack_size: usize,
    tasks: Mutex<VecDeque<ScheduleTask>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// OS threads to spawn (excludes the enrolled caller)
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// Set once by `stop()` before the final tickles
    stopping: AtomicBool,
    started: AtomicBool,
    use_caller: bool,
    /// Kernel thread id of the constructing thread in use_caller mode
    root_thread: libc::pid_t,
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl SchedulerCore {
    pub fn new(cfg: &RuntimeConfig) -> Self {
        let thread_count = if cfg.use_caller {
            cfg.worker_threads - 1
        } else {
            cfg.worker_threads
        };
        let root_thread = if cfg.use_caller { tls::thread_id() } else { -1 };
        Self {
            name: cfg.name.clone(),
            stack_size: cfg.stack_size,
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            use_caller: cfg.use_caller,
            root_thread,
            caller_fiber: Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shutdown requested, queue drained, nobody mid-task
    pub fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.tasks.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Whether `stop()` has been requested (the queue may still hold work)
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// An idle worker is one parked inside its idle fiber
    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }
}

/// Scheduler behavior, with the overridable points the reactor hooks into
pub trait Schedule: Send + Sync + 'static {
    /// Shared scheduler state
    fn core(&self) -> &SchedulerCore;

    /// Wake an idle worker. The base scheduler's workers wake on their own.
    fn tickle(&self) {}

    /// Body of each worker's idle fiber
    fn idle(&self) {
        while !self.stopping() {
            thread::sleep(Duration::from_secs(1));
            Fiber::yield_now();
        }
    }

    /// Whether workers may exit their dispatch loop
    fn stopping(&self) -> bool {
        self.core().base_stopping()
    }

    /// Install thread-local handles on a worker thread
    fn install_current(_this: &Arc<Self>)
    where
        Self: Sized,
    {
    }

    /// Append a task, tickling on the empty -> non-empty edge
    ///
    /// Concurrent producers may both observe the empty queue and both
    /// tickle; tickles are idempotent.
    fn schedule(&self, task: ScheduleTask)
    where
        Self: Sized,
    {
        let need_tickle = {
            let mut q = self.core().tasks.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Schedule an existing fiber
    fn schedule_fiber(&self, f: Arc<Fiber>)
    where
        Self: Sized,
    {
        self.schedule(ScheduleTask::fiber(f));
    }

    /// Schedule a plain callable
    fn schedule_callback<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.schedule(ScheduleTask::callback(cb));
    }

    /// Bulk enqueue with a single tickle
    fn schedule_all<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = ScheduleTask>,
        Self: Sized,
    {
        let need_tickle = {
            let mut q = self.core().tasks.lock().unwrap();
            let was_empty = q.is_empty();
            q.extend(tasks);
            was_empty && !q.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Request shutdown and wait for the pool to drain
    ///
    /// Sets the stopping flag, tickles once per worker (plus once for the
    /// caller-dispatch fiber), drives the dispatch fiber to completion on
    /// the constructing thread, then joins the pool. Returns after every
    /// queued task has run.
    fn stop(&self)
    where
        Self: Sized,
    {
        if self.stopping() {
            return;
        }
        let core = self.core();
        core.stopping.store(true, Ordering::Release);

        for _ in 0..core.thread_count {
            self.tickle();
        }

        let caller = core.caller_fiber.lock().unwrap().take();
        if caller.is_some() {
            self.tickle();
        }
        if let Some(dispatch) = caller {
            debug_assert_eq!(
                tls::thread_id(),
                core.root_thread,
                "stop() must run on the constructing thread in use_caller mode"
            );
            dispatch.resume();
            rt_debug!("{}: dispatch fiber finished", core.name);
        }

        let handles: Vec<_> = core.threads.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }
}

/// Spawn the worker pool
///
/// Idempotent; does nothing after `stop()`.
pub fn start<S: Schedule>(this: &Arc<S>) {
    let core = this.core();
    if core.stopping.load(Ordering::Acquire) {
        rt_error!("{}: start() called after stop()", core.name);
        return;
    }
    if core.started.swap(true, Ordering::SeqCst) {
        return;
    }

    let mut threads = core.threads.lock().unwrap();
    debug_assert!(threads.is_empty());
    for i in 0..core.thread_count {
        let driver = this.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{}", core.name, i))
            .spawn(move || run(driver))
            .expect("failed to spawn worker thread");
        threads.push(handle);
    }
}

/// Enroll the constructing thread as a worker
///
/// Creates the dispatch fiber and makes it the scheduler-parent, so
/// fibers resumed here yield back into the dispatch loop instead of the
/// thread root. No-op unless `use_caller`.
pub fn bind_caller<S: Schedule>(this: &Arc<S>) -> SchedResult<()> {
    let core = this.core();
    if !core.use_caller {
        return Ok(());
    }
    Fiber::current(); // thread-root for the constructing thread

    let driver = this.clone();
    let dispatch = Fiber::new(move || run(driver), core.stack_size, false)?;
    tls::set_sched_parent(dispatch.clone());
    *core.caller_fiber.lock().unwrap() = Some(dispatch);
    S::install_current(this);
    Ok(())
}

/// The worker dispatch loop
fn run<S: Schedule>(this: Arc<S>) {
    S::install_current(&this);
    let tid = tls::thread_id();
    rt_debug!("{}: worker loop starting on thread {}", this.core().name, tid);

    if tid != this.core().root_thread {
        Fiber::current(); // thread-root doubles as scheduler-parent here
    }

    let driver = this.clone();
    let idle_fiber = match Fiber::new(move || driver.idle(), this.core().stack_size, true) {
        Ok(f) => f,
        Err(e) => {
            rt_error!(
                "{}: failed to allocate idle fiber on thread {}: {}",
                this.core().name,
                tid,
                e
            );
            return;
        }
    };

    loop {
        let core = this.core();
        let mut task: Option<ScheduleTask> = None;
        let mut tickle_me = false;
        {
            let mut q = core.tasks.lock().unwrap();
            let mut found = None;
            for (i, t) in q.iter().enumerate() {
                // A task pinned to some other worker: leave it, summon a peer
                if let Some(want) = t.target {
                    if want != tid {
                        tickle_me = true;
                        continue;
                    }
                }
                found = Some(i);
                break;
            }
            if let Some(i) = found {
                task = q.remove(i);
                core.active_threads.fetch_add(1, Ordering::SeqCst);
                // Unexamined tail remains after the extraction point
                tickle_me = tickle_me || i < q.len();
            }
        }

        if tickle_me {
            this.tickle();
        }

        match task {
            Some(t) => {
                match t.payload {
                    Payload::Fiber(f) => {
                        // The dispatch lock serializes concurrent external
                        // reset/cancel against this resume
                        let _guard = f.lock_dispatch();
                        if f.state() != FiberState::Term {
                            f.resume();
                        }
                    }
                    Payload::Call(cb) => match Fiber::from_boxed(cb, core.stack_size, true) {
                        Ok(f) => {
                            let _guard = f.lock_dispatch();
                            f.resume();
                        }
                        Err(e) => {
                            rt_error!("{}: failed to allocate task fiber: {}", core.name, e)
                        }
                    },
                }
                core.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    rt_debug!("{}: worker loop ending on thread {}", core.name, tid);
                    break;
                }
                core.idle_threads.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                core.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// The base scheduler: thread pool + queue with the default idle behavior
pub struct Scheduler {
    core: SchedulerCore,
}

impl Schedule for Scheduler {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }
}

impl Scheduler {
    /// Create a scheduler; call `scheduler::start` to spawn the pool
    pub fn new(cfg: RuntimeConfig) -> SchedResult<Arc<Self>> {
        cfg.validate()?;
        let this = Arc::new(Self {
            core: SchedulerCore::new(&cfg),
        });
        bind_caller(&this)?;
        Ok(this)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_caller_mode_runs_tasks_in_stop() {
        let sched = Scheduler::new(RuntimeConfig {
            worker_threads: 1,
            use_caller: true,
            name: "caller-test".into(),
            ..RuntimeConfig::default()
        })
        .unwrap();
        start(&sched);

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            sched.schedule_callback(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_pool_runs_tasks_queued_before_and_after_start() {
        let sched = Scheduler::new(RuntimeConfig::with_threads(2).named("pool-test")).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        sched.schedule_callback(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        start(&sched);

        for _ in 0..4 {
            let h = hits.clone();
            sched.schedule_callback(move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(wait_for(3000, || hits.load(Ordering::SeqCst) == 5));
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_scheduled_fiber_resumes_after_yield() {
        let sched = Scheduler::new(RuntimeConfig::with_threads(1).named("yield-test")).unwrap();
        start(&sched);

        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        )
        .unwrap();

        sched.schedule_fiber(fiber.clone());
        assert!(wait_for(3000, || steps.load(Ordering::SeqCst) == 1));

        // The fiber parked itself without requeueing; push it again
        sched.schedule_fiber(fiber.clone());
        assert!(wait_for(3000, || steps.load(Ordering::SeqCst) == 2));
        assert!(wait_for(3000, || fiber.state() == FiberState::Term));

        sched.stop();
    }

    #[test]
    fn test_target_thread_dispatch() {
        let sched = Scheduler::new(RuntimeConfig::with_threads(2).named("target-test")).unwrap();
        start(&sched);

        // Learn one worker's kernel thread id
        let seen = Arc::new(Mutex::new(None::<libc::pid_t>));
        let s = seen.clone();
        sched.schedule_callback(move || {
            *s.lock().unwrap() = Some(tls::thread_id());
        });
        assert!(wait_for(3000, || seen.lock().unwrap().is_some()));
        let worker_tid = seen.lock().unwrap().unwrap();

        // A task pinned to that worker must run there
        let ran_on = Arc::new(Mutex::new(None::<libc::pid_t>));
        let r = ran_on.clone();
        sched.schedule(
            ScheduleTask::callback(move || {
                *r.lock().unwrap() = Some(tls::thread_id());
            })
            .to_thread(worker_tid),
        );
        assert!(wait_for(3000, || ran_on.lock().unwrap().is_some()));
        assert_eq!(*ran_on.lock().unwrap(), Some(worker_tid));

        sched.stop();
    }

    #[test]
    fn test_bulk_enqueue() {
        let sched = Scheduler::new(RuntimeConfig::with_threads(2).named("bulk-test")).unwrap();
        start(&sched);

        let hits = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<ScheduleTask> = (0..10)
            .map(|_| {
                let h = hits.clone();
                ScheduleTask::callback(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        sched.schedule_all(tasks);

        assert!(wait_for(3000, || hits.load(Ordering::SeqCst) == 10));
        sched.stop();
    }
}
