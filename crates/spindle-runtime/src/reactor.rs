//! I/O manager: the epoll reactor composed over the scheduler
//!
//! `IoManager` owns an epoll instance, a self-pipe, a per-fd event table
//! and the timer manager, and overrides the scheduler's idle fiber with the
//! reactor loop: block in `epoll_wait` bounded by the next timer deadline,
//! push the fiber registered for each ready (fd, event) pair back onto the
//! task queue, harvest ripe timer callbacks, then yield so the dispatch
//! loop drains the queue.
//!
//! Registrations are one-shot and edge-triggered: each fire clears the
//! event bit and submits the waiter exactly once; re-registration after
//! EAGAIN is the caller's retry loop (see `spindle-hook`).

use crate::config::RuntimeConfig;
use crate::fiber::{EntryFn, Fiber};
use crate::scheduler::{self, Schedule, ScheduleTask, SchedulerCore};
use crate::timer::{self, TimerCallback, TimerHandle, TimerManager};
use spindle_core::{rt_debug, rt_error};
use spindle_core::{FiberState, SchedError, SchedResult};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Readiness events a waiter can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    /// The epoll interest bit this event corresponds to
    #[inline]
    fn bit(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
        }
    }
}

const ET: u32 = libc::EPOLLET as u32;
const MAX_EVENTS: usize = 256;
/// Hard cap on one reactor sleep, timers or not
const MAX_TIMEOUT_MS: u64 = 5000;
const INITIAL_FD_SLOTS: usize = 32;

/// What gets submitted to the scheduler when an event fires
enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(EntryFn),
}

/// The (scheduler, waiter) pair registered for one event on one fd
struct EventContext {
    scheduler: Weak<IoManager>,
    waiter: Option<Waiter>,
}

impl EventContext {
    fn new() -> Self {
        Self {
            scheduler: Weak::new(),
            waiter: None,
        }
    }

    fn reset(&mut self) {
        self.scheduler = Weak::new();
        self.waiter = None;
    }
}

/// Mutable per-fd state, guarded by the per-fd mutex
struct FdInner {
    /// Union of event bits currently registered in epoll for this fd
    events: u32,
    read: EventContext,
    write: EventContext,
}

impl FdInner {
    fn ctx_mut(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// One-shot fire: clear the bit and submit the waiter to the scheduler
    /// it registered with. Runs under the per-fd mutex, so a concurrent
    /// cancel and a readiness report cannot both claim the waiter.
    fn trigger(&mut self, event: Event) {
        assert!(
            self.events & event.bit() != 0,
            "trigger of unregistered {:?}",
            event
        );
        self.events &= !event.bit();

        let ctx = self.ctx_mut(event);
        let sched = ctx.scheduler.upgrade();
        let waiter = ctx.waiter.take();
        ctx.reset();

        if let (Some(sched), Some(waiter)) = (sched, waiter) {
            match waiter {
                Waiter::Fiber(f) => sched.schedule(ScheduleTask::fiber(f)),
                Waiter::Callback(cb) => sched.schedule(ScheduleTask::from_boxed(cb)),
            }
        }
    }
}

/// Per-fd record; the slot persists for the life of the manager
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdInner {
                events: 0,
                read: EventContext::new(),
                write: EventContext::new(),
            }),
        }
    }
}

thread_local! {
    /// IoManager driving the current worker thread
    static CURRENT_IO: RefCell<Weak<IoManager>> = const { RefCell::new(Weak::new()) };
}

/// The reactor
pub struct IoManager {
    core: SchedulerCore,
    timers: TimerManager,
    epfd: RawFd,
    /// Self-pipe: [read end (registered edge-triggered), write end]
    tickle_fds: [RawFd; 2],
    /// (fd, event) pairs registered but not yet fired or cancelled
    pending_events: AtomicUsize,
    /// Slot table indexed by fd number; shared lock for lookup, exclusive
    /// for growth. Never shrinks.
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    self_ref: Weak<IoManager>,
}

impl IoManager {
    /// Build the reactor and start its worker pool
    ///
    /// Construction order: epoll instance, self-pipe (read end
    /// non-blocking, registered edge-triggered), fd table pre-size, caller
    /// enrollment, worker start. Syscall failures roll back what was
    /// created and propagate.
    pub fn new(cfg: RuntimeConfig) -> SchedResult<Arc<Self>> {
        cfg.validate()?;

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(SchedError::Platform(errno()));
        }

        let mut pipe_fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let err = errno();
            unsafe { libc::close(epfd) };
            return Err(SchedError::Platform(err));
        }

        let cleanup = |err: i32| {
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            SchedError::Platform(err)
        };

        // Edge-triggered read end must be drained to EAGAIN, so it has to
        // be non-blocking
        let flags = unsafe { libc::fcntl(pipe_fds[0], libc::F_GETFL, 0) };
        if flags < 0 || unsafe { libc::fcntl(pipe_fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) } != 0
        {
            return Err(cleanup(errno()));
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32 | ET,
            u64: pipe_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) } != 0 {
            return Err(cleanup(errno()));
        }

        let this = Arc::new_cyclic(|weak| IoManager {
            core: SchedulerCore::new(&cfg),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
            self_ref: weak.clone(),
        });
        this.resize_fd_table(INITIAL_FD_SLOTS);

        scheduler::bind_caller(&this)?;
        scheduler::start(&this);
        Ok(this)
    }

    /// IoManager driving the calling thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IO.with(|cell| cell.borrow().upgrade())
    }

    /// Register interest in `event` on `fd`, waking the calling fiber
    ///
    /// The registration is one-shot: on readiness (or `cancel_event`) the
    /// fiber is submitted to the scheduler exactly once and the interest
    /// is dropped. The caller must `yield_now` after this returns. Must be
    /// called from inside a RUNNING fiber.
    pub fn add_event(&self, fd: RawFd, event: Event) -> SchedResult<()> {
        self.add_event_inner(fd, event, None)
    }

    /// Register interest in `event` on `fd`, running `cb` on readiness
    pub fn add_event_callback<F>(&self, fd: RawFd, event: Event, cb: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, event, Some(Box::new(cb)))
    }

    fn add_event_inner(&self, fd: RawFd, event: Event, cb: Option<EntryFn>) -> SchedResult<()> {
        let ctx = self.fd_context(fd)?;
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events & event.bit() != 0 {
            rt_error!(
                "{}: add_event: {:?} already registered on fd {}",
                self.core.name(),
                event,
                fd
            );
            return Err(SchedError::EventExists);
        }

        let op = if inner.events == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep = libc::epoll_event {
            events: ET | inner.events | event.bit(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            let err = errno();
            rt_error!(
                "{}: add_event: epoll_ctl(fd {}) failed: os error {}",
                self.core.name(),
                fd,
                err
            );
            return Err(SchedError::Platform(err));
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.events |= event.bit();

        let ectx = inner.ctx_mut(event);
        debug_assert!(ectx.waiter.is_none(), "stale event context on fd");
        ectx.scheduler = self.self_ref.clone();
        ectx.waiter = Some(match cb {
            Some(cb) => Waiter::Callback(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    FiberState::Running,
                    "add_event without callback must run inside the waiting fiber"
                );
                Waiter::Fiber(fiber)
            }
        });
        Ok(())
    }

    /// Drop a registration without firing its waiter
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = {
            let table = self.fd_contexts.read().unwrap();
            match table.get(fd as usize) {
                Some(c) => c.clone(),
                None => return false,
            }
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.bit() == 0 {
            return false;
        }

        let new_events = inner.events & !event.bit();
        if !self.reregister(fd, new_events) {
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        inner.events = new_events;
        inner.ctx_mut(event).reset();
        true
    }

    /// Drop a registration and fire its waiter synthetically
    ///
    /// This is the timeout/abort path: the waiter runs exactly once, here,
    /// and any in-flight readiness for the pair is masked off because the
    /// per-fd mutex is held across the epoll mutation.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = {
            let table = self.fd_contexts.read().unwrap();
            match table.get(fd as usize) {
                Some(c) => c.clone(),
                None => return false,
            }
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.bit() == 0 {
            return false;
        }

        let new_events = inner.events & !event.bit();
        if !self.reregister(fd, new_events) {
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        inner.trigger(event);
        true
    }

    /// Remove the fd from epoll entirely and fire any registered waiters
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = {
            let table = self.fd_contexts.read().unwrap();
            match table.get(fd as usize) {
                Some(c) => c.clone(),
                None => return false,
            }
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events == 0 {
            return false;
        }

        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) } != 0
        {
            rt_error!(
                "{}: cancel_all: epoll_ctl(fd {}) failed: os error {}",
                self.core.name(),
                fd,
                errno()
            );
            return false;
        }

        if inner.events & Event::Read.bit() != 0 {
            inner.trigger(Event::Read);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events & Event::Write.bit() != 0 {
            inner.trigger(Event::Write);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert_eq!(inner.events, 0);
        true
    }

    /// Add a timer firing `period_ms` from now; a new earliest deadline
    /// preempts an in-flight `epoll_wait`
    pub fn add_timer<F>(&self, period_ms: u64, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (handle, at_front) = self.timers.insert(period_ms, Arc::new(cb), recurring);
        if at_front {
            self.on_front_inserted();
        }
        handle
    }

    /// Timer gated by a weak witness; see `TimerManager::add_condition_timer`
    pub fn add_condition_timer<T, F>(
        &self,
        period_ms: u64,
        cb: F,
        cond: &Arc<T>,
        recurring: bool,
    ) -> TimerHandle
    where
        T: Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        let (handle, at_front) = self
            .timers
            .insert(period_ms, timer::guarded(cond, cb), recurring);
        if at_front {
            self.on_front_inserted();
        }
        handle
    }

    pub fn cancel_timer(&self, handle: &TimerHandle) -> bool {
        self.timers.cancel(handle)
    }

    pub fn refresh_timer(&self, handle: &TimerHandle) -> bool {
        self.timers.refresh(handle)
    }

    pub fn reset_timer(&self, handle: &TimerHandle, period_ms: u64, from_now: bool) -> bool {
        let (ok, at_front) = self.timers.reset_inner(handle, period_ms, from_now);
        if at_front {
            self.on_front_inserted();
        }
        ok
    }

    /// (fd, event) pairs registered but not yet fired or cancelled
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// The embedded timer manager
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// A new front timer bounds the reactor's sleep; wake it
    fn on_front_inserted(&self) {
        self.tickle();
    }

    /// MOD the remaining interest or DEL the fd when none remains
    ///
    /// Caller holds the per-fd mutex.
    fn reregister(&self, fd: RawFd, remaining: u32) -> bool {
        let op = if remaining != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ep = libc::epoll_event {
            events: ET | remaining,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) } != 0 {
            rt_error!(
                "{}: epoll_ctl(fd {}) failed: os error {}",
                self.core.name(),
                fd,
                errno()
            );
            return false;
        }
        true
    }

    /// Slot lookup, growing the table when fd is beyond it
    fn fd_context(&self, fd: RawFd) -> SchedResult<Arc<FdContext>> {
        if fd < 0 {
            return Err(SchedError::Platform(libc::EBADF));
        }
        {
            let table = self.fd_contexts.read().unwrap();
            if let Some(ctx) = table.get(fd as usize) {
                return Ok(ctx.clone());
            }
        }
        // Exclusive lock for growth; must land strictly beyond fd, doubling
        // to amortize
        let new_len = (fd as usize + 1).max(INITIAL_FD_SLOTS);
        {
            let mut table = self.fd_contexts.write().unwrap();
            let target = new_len.max(table.len() * 2);
            while table.len() < target {
                let slot_fd = table.len() as RawFd;
                table.push(Arc::new(FdContext::new(slot_fd)));
            }
            Ok(table[fd as usize].clone())
        }
    }

    fn resize_fd_table(&self, len: usize) {
        let mut table = self.fd_contexts.write().unwrap();
        while table.len() < len {
            let slot_fd = table.len() as RawFd;
            table.push(Arc::new(FdContext::new(slot_fd)));
        }
    }

    /// The reactor loop: body of every worker's idle fiber
    fn reactor_loop(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.stopping() {
                rt_debug!(
                    "{}: reactor exiting on thread {}",
                    self.core.name(),
                    crate::tls::thread_id()
                );
                break;
            }

            let rc = loop {
                let timeout = self.timers.next_timeout_ms().min(MAX_TIMEOUT_MS);
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout as i32,
                    )
                };
                if rc < 0 && errno() == libc::EINTR {
                    continue;
                }
                break rc;
            };
            if rc < 0 {
                rt_error!("{}: epoll_wait failed: os error {}", self.core.name(), errno());
            }

            // Ripe timers first: their callbacks join the task queue ahead
            // of this pass's readiness waiters
            let mut cbs: Vec<TimerCallback> = Vec::new();
            self.timers.drain_expired(&mut cbs);
            for cb in cbs {
                self.schedule(ScheduleTask::callback(move || cb()));
            }

            let count = if rc > 0 { rc as usize } else { 0 };
            for i in 0..count {
                let ep_bits = events[i].events;
                let fd = events[i].u64 as RawFd;

                if fd == self.tickle_fds[0] {
                    // Edge-triggered self-pipe: drain every queued byte
                    let mut buf = [0u8; 256];
                    loop {
                        let n = unsafe {
                            libc::read(
                                self.tickle_fds[0],
                                buf.as_mut_ptr() as *mut libc::c_void,
                                buf.len(),
                            )
                        };
                        if n <= 0 {
                            break;
                        }
                    }
                    continue;
                }

                let ctx = {
                    let table = self.fd_contexts.read().unwrap();
                    match table.get(fd as usize) {
                        Some(c) => c.clone(),
                        None => continue,
                    }
                };
                let mut inner = ctx.inner.lock().unwrap();

                // Errors and hangups wake whatever is registered
                let mut ep_bits = ep_bits;
                if ep_bits & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    ep_bits |= (libc::EPOLLIN as u32 | libc::EPOLLOUT as u32) & inner.events;
                }

                let mut real = 0u32;
                if ep_bits & libc::EPOLLIN as u32 != 0 {
                    real |= Event::Read.bit();
                }
                if ep_bits & libc::EPOLLOUT as u32 != 0 {
                    real |= Event::Write.bit();
                }
                real &= inner.events;
                if real == 0 {
                    // A cancel got here first; nothing left to fire
                    continue;
                }

                let remaining = inner.events & !real;
                if !self.reregister(ctx.fd, remaining) {
                    continue;
                }

                if real & Event::Read.bit() != 0 {
                    inner.trigger(Event::Read);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if real & Event::Write.bit() != 0 {
                    inner.trigger(Event::Write);
                    self.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Hand the harvested tasks to the dispatch loop
            Fiber::yield_now();
        }
    }
}

impl Schedule for IoManager {
    fn core(&self) -> &SchedulerCore {
        &self.core
    }

    /// Wake a reactor sleeping in `epoll_wait`. A worker that is not idle
    /// is scanning the queue anyway, so the byte is only spent when
    /// someone is actually blocked.
    fn tickle(&self) {
        if !self.core.has_idle_threads() {
            return;
        }
        let n = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
        debug_assert_eq!(n, 1, "tickle write failed");
    }

    fn idle(&self) {
        self.reactor_loop();
    }

    /// The reactor may stop only when nothing can ever wake again: no
    /// timers, no registered events, and the base queue is drained
    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.core.base_stopping()
    }

    fn install_current(this: &Arc<Self>) {
        CURRENT_IO.with(|cell| *cell.borrow_mut() = Arc::downgrade(this));
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Workers hold strong handles, so by the time this runs the pool
        // has exited (or was never the caller's to run); stop() is then a
        // cheap no-op safeguard
        self.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

#[inline]
fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
