//! End-to-end scenarios exercising the reactor, scheduler, timers and the
//! hook layer together.

use spindle::{hook, Event, Fiber, IoManager, RuntimeConfig, Schedule};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn nonblocking_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    for fd in fds {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_eq!(
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) },
            0
        );
    }
    (fds[0], fds[1])
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    (fds[0], fds[1])
}

fn close_fds(fds: &[RawFd]) {
    for &fd in fds {
        unsafe {
            libc::close(fd);
        }
    }
}

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

/// A parked reader is woken by a write from another fiber and reads
/// exactly what was sent.
#[test]
fn echo_over_pipe() {
    let iom = IoManager::new(RuntimeConfig::with_threads(2).named("echo")).unwrap();
    let (r, w) = nonblocking_pipe();

    let got = Arc::new(Mutex::new(None::<Vec<u8>>));
    let g = got.clone();
    iom.schedule_callback(move || {
        let iom = IoManager::current().unwrap();
        iom.add_event(r, Event::Read).unwrap();
        Fiber::yield_now();
        // Readiness reported: five bytes must be there
        let mut buf = [0u8; 5];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        assert_eq!(n, 5);
        *g.lock().unwrap() = Some(buf.to_vec());
    });

    // Let the reader park before the writer runs
    thread::sleep(Duration::from_millis(100));

    let wrote = Arc::new(AtomicBool::new(false));
    let wr = wrote.clone();
    iom.schedule_callback(move || {
        let n = unsafe { libc::write(w, b"hello".as_ptr() as *const libc::c_void, 5) };
        assert_eq!(n, 5);
        wr.store(true, Ordering::SeqCst);
    });

    assert!(wait_for(5000, || got.lock().unwrap().is_some()));
    assert_eq!(got.lock().unwrap().as_deref(), Some(b"hello".as_slice()));
    assert!(wrote.load(Ordering::SeqCst));
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    close_fds(&[r, w]);
}

/// A condition timer cancels a read wait that never becomes ready; the
/// parked fiber observes ETIMEDOUT at roughly the deadline.
#[test]
fn timeout_wins_over_silent_fd() {
    let iom = IoManager::new(RuntimeConfig::with_threads(1).named("timeout")).unwrap();
    let (r, w) = nonblocking_pipe();

    let outcome = Arc::new(Mutex::new(None::<(i32, Duration)>));
    let out = outcome.clone();
    iom.schedule_callback(move || {
        let iom = IoManager::current().unwrap();
        let witness = Arc::new(hook::IoWitness {
            cancelled: AtomicI32::new(0),
        });

        let weak_witness = Arc::downgrade(&witness);
        let weak_iom = Arc::downgrade(&iom);
        iom.add_condition_timer(
            50,
            move || {
                let Some(w) = weak_witness.upgrade() else { return };
                if w.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                w.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                if let Some(iom) = weak_iom.upgrade() {
                    iom.cancel_event(r, Event::Read);
                }
            },
            &witness,
            false,
        );

        iom.add_event(r, Event::Read).unwrap();
        let t0 = Instant::now();
        Fiber::yield_now();
        *out.lock().unwrap() = Some((witness.cancelled.load(Ordering::SeqCst), t0.elapsed()));
    });

    assert!(wait_for(5000, || outcome.lock().unwrap().is_some()));
    let (cancelled, waited) = outcome.lock().unwrap().unwrap();
    assert_eq!(cancelled, libc::ETIMEDOUT);
    assert!(waited >= Duration::from_millis(40), "woke after {:?}", waited);
    assert!(waited < Duration::from_secs(3), "woke after {:?}", waited);
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    close_fds(&[r, w]);
}

/// Hooked sleep parks the fiber on a timer alone: no epoll interest is
/// registered, and the fiber resumes after the full duration.
#[test]
fn hooked_sleep_is_timer_only() {
    let iom = IoManager::new(RuntimeConfig::with_threads(1).named("sleep")).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    iom.schedule_callback(move || {
        let t0 = Instant::now();
        hook::sleep_ms(300);
        assert!(t0.elapsed() >= Duration::from_millis(300));
        d.store(true, Ordering::SeqCst);
    });

    // Mid-sleep: one pending timer, zero epoll registrations
    thread::sleep(Duration::from_millis(100));
    assert_eq!(iom.pending_event_count(), 0);
    assert!(iom.timers().has_timer());
    assert!(!done.load(Ordering::SeqCst));

    assert!(wait_for(5000, || done.load(Ordering::SeqCst)));
    iom.stop();
}

/// 100 unpinned tasks across 4 workers: each runs exactly once.
#[test]
fn shared_queue_runs_every_task_once() {
    let iom = IoManager::new(RuntimeConfig::with_threads(4).named("fairness")).unwrap();

    let counts: Arc<Vec<AtomicUsize>> =
        Arc::new((0..100).map(|_| AtomicUsize::new(0)).collect());
    for i in 0..100 {
        let counts = counts.clone();
        iom.schedule_callback(move || {
            counts[i].fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(wait_for(5000, || {
        counts.iter().map(|c| c.load(Ordering::SeqCst)).sum::<usize>() == 100
    }));
    for (i, c) in counts.iter().enumerate() {
        assert_eq!(c.load(Ordering::SeqCst), 1, "task {} ran a wrong number of times", i);
    }

    iom.stop();
}

/// A new earliest timer preempts a reactor already parked in epoll_wait
/// with the 5000 ms cap.
#[test]
fn front_timer_preempts_epoll_wait() {
    let iom = IoManager::new(RuntimeConfig::with_threads(1).named("preempt")).unwrap();

    // Let the reactor settle into its capped wait with nothing pending
    thread::sleep(Duration::from_millis(200));

    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    let t0 = Instant::now();
    iom.add_timer(
        10,
        move || {
            f.store(true, Ordering::SeqCst);
        },
        false,
    );

    assert!(wait_for(2000, || fired.load(Ordering::SeqCst)));
    assert!(
        t0.elapsed() < Duration::from_millis(1500),
        "timer fired only after {:?}; the sleeping reactor was not preempted",
        t0.elapsed()
    );

    iom.stop();
}

/// stop() lets an in-flight sleep finish: the timer fires, the fiber runs
/// to completion, and only then do the workers exit.
#[test]
fn graceful_stop_waits_for_sleeping_fiber() {
    let iom = IoManager::new(RuntimeConfig::with_threads(2).named("graceful")).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    iom.schedule_callback(move || {
        hook::sleep_ms(200);
        d.store(true, Ordering::SeqCst);
    });

    // Let the fiber park on its timer first
    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst));

    let t0 = Instant::now();
    iom.stop();
    assert!(done.load(Ordering::SeqCst), "stop() returned before the sleeper finished");
    assert!(t0.elapsed() >= Duration::from_millis(100));
}

/// Hooked read parks until a peer writes; the wrappers behave like
/// blocking calls from inside the fiber.
#[test]
fn hooked_read_write_over_socketpair() {
    let iom = IoManager::new(RuntimeConfig::with_threads(2).named("hooked-echo")).unwrap();
    let (a, b) = socketpair();
    hook::registry().get(a, true).unwrap();
    hook::registry().get(b, true).unwrap();

    let got = Arc::new(AtomicBool::new(false));
    let g = got.clone();
    iom.schedule_callback(move || {
        let mut buf = [0u8; 5];
        let n = hook::read(a, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"tick!");
        g.store(true, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(100));

    iom.schedule_callback(move || {
        let n = hook::write(b, b"tick!").unwrap();
        assert_eq!(n, 5);
    });

    assert!(wait_for(5000, || got.load(Ordering::SeqCst)));
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    hook::registry().remove(a);
    hook::registry().remove(b);
    close_fds(&[a, b]);
}

/// A per-fd receive timeout turns a hooked recv on a silent socket into
/// ETIMEDOUT.
#[test]
fn hooked_recv_times_out() {
    let iom = IoManager::new(RuntimeConfig::with_threads(1).named("hooked-timeout")).unwrap();
    let (a, b) = socketpair();
    hook::registry().get(a, true).unwrap();
    hook::set_recv_timeout(a, 50);

    let outcome = Arc::new(Mutex::new(None::<(i32, Duration)>));
    let out = outcome.clone();
    iom.schedule_callback(move || {
        let mut buf = [0u8; 4];
        let t0 = Instant::now();
        let err = hook::recv(a, &mut buf, 0).unwrap_err();
        *out.lock().unwrap() = Some((err.raw_os_error().unwrap_or(0), t0.elapsed()));
    });

    assert!(wait_for(5000, || outcome.lock().unwrap().is_some()));
    let (errno, waited) = outcome.lock().unwrap().unwrap();
    assert_eq!(errno, libc::ETIMEDOUT);
    assert!(waited >= Duration::from_millis(40), "gave up after {:?}", waited);

    iom.stop();
    hook::registry().remove(a);
    hook::registry().remove(b);
    close_fds(&[a, b]);
}
