//! Cooperative syscall wrappers
//!
//! All wrappers funnel through `do_io`: raw call, EINTR retry, and on
//! EAGAIN a one-shot readiness registration plus an optional condition
//! timer that cancels the wait and marks the shared witness with
//! ETIMEDOUT. The calling fiber yields its worker while parked.

use crate::fd::{registry, TimeoutKind};
use crate::hook_enabled;
use spindle_core::constants::NO_TIMEOUT;
use spindle_core::rt_error;
use spindle_runtime::{Event, Fiber, IoManager};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Timeout witness shared weakly with the condition timer
///
/// `cancelled` holds 0 while the operation is live and ETIMEDOUT once the
/// timer gave up on it.
pub struct IoWitness {
    pub cancelled: AtomicI32,
}

#[inline]
fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[inline]
fn cvt(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Whether the caller can actually be parked
#[inline]
fn in_task_fiber() -> bool {
    !Fiber::current().is_thread_root()
}

/// The suspend/retry loop every data-path wrapper shares
fn do_io<F>(
    fd: RawFd,
    name: &str,
    event: Event,
    timeout_kind: TimeoutKind,
    mut op: F,
) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    if !hook_enabled() {
        return cvt(op());
    }
    let Some(ctx) = registry().get(fd, false) else {
        // Unknown fd: nothing forced it non-blocking, raw call is safe
        return cvt(op());
    };
    if ctx.closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return cvt(op());
    }

    let timeout = ctx.timeout(timeout_kind);
    let witness = Arc::new(IoWitness {
        cancelled: AtomicI32::new(0),
    });

    loop {
        let mut n = op();
        while n < 0 && last_errno() == libc::EINTR {
            n = op();
        }
        if n >= 0 {
            return Ok(n as usize);
        }
        if last_errno() != libc::EAGAIN {
            return Err(io::Error::last_os_error());
        }

        // Would block: park the fiber until readiness or timeout
        let Some(iom) = IoManager::current() else {
            return Err(io::Error::last_os_error());
        };
        if !in_task_fiber() {
            // A thread root cannot be parked in the scheduler
            return Err(io::Error::last_os_error());
        }

        let timer = if timeout != NO_TIMEOUT {
            let weak_witness = Arc::downgrade(&witness);
            let weak_iom = Arc::downgrade(&iom);
            Some(iom.add_condition_timer(
                timeout,
                move || {
                    let Some(w) = weak_witness.upgrade() else { return };
                    if w.cancelled.load(Ordering::SeqCst) != 0 {
                        return;
                    }
                    w.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    if let Some(iom) = weak_iom.upgrade() {
                        iom.cancel_event(fd, event);
                    }
                },
                &witness,
                false,
            ))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, event) {
            rt_error!("{}: add_event(fd {}, {:?}) failed: {}", name, fd, event, e);
            if let Some(t) = &timer {
                iom.cancel_timer(t);
            }
            return Err(e.into());
        }

        Fiber::yield_now();

        // Woken by readiness or by the cancel path
        if let Some(t) = &timer {
            iom.cancel_timer(t);
        }
        if witness.cancelled.load(Ordering::SeqCst) == libc::ETIMEDOUT {
            return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
        }
        // Readiness: retry the syscall
    }
}

/// Cooperative `read`
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::read(fd, ptr as *mut libc::c_void, len)
    })
}

/// Cooperative `write`
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, "write", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::write(fd, ptr as *const libc::c_void, len)
    })
}

/// Cooperative `recv`
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, "recv", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::recv(fd, ptr as *mut libc::c_void, len, flags)
    })
}

/// Cooperative `send`
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, "send", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::send(fd, ptr as *const libc::c_void, len, flags)
    })
}

/// Cooperative `accept`; the accepted fd is registered with the hook layer
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let n = do_io(fd, "accept", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as libc::ssize_t
    })?;
    let new_fd = n as RawFd;
    registry().get(new_fd, true);
    Ok(new_fd)
}

/// Create a socket registered with the hook layer
pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    registry().get(fd, true);
    Ok(fd)
}

/// Cooperative `connect` without a deadline
pub fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> io::Result<()> {
    connect_with_timeout(fd, addr, addrlen, NO_TIMEOUT)
}

/// Cooperative `connect` bounded by `timeout_ms`
///
/// Non-blocking connect returns EINPROGRESS; the fiber parks on WRITE
/// readiness, then the result is read back through SO_ERROR.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> io::Result<()> {
    let raw = || {
        let n = unsafe { libc::connect(fd, addr, addrlen) };
        if n != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    };

    if !hook_enabled() {
        return raw();
    }
    let Some(ctx) = registry().get(fd, false) else {
        return raw();
    };
    if ctx.closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw();
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return Ok(());
    }
    if last_errno() != libc::EINPROGRESS {
        return Err(io::Error::last_os_error());
    }

    let Some(iom) = IoManager::current() else {
        return Err(io::Error::last_os_error());
    };
    if !in_task_fiber() {
        return Err(io::Error::last_os_error());
    }

    let witness = Arc::new(IoWitness {
        cancelled: AtomicI32::new(0),
    });
    let timer = if timeout_ms != NO_TIMEOUT {
        let weak_witness = Arc::downgrade(&witness);
        let weak_iom = Arc::downgrade(&iom);
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(w) = weak_witness.upgrade() else { return };
                if w.cancelled.load(Ordering::SeqCst) != 0 {
                    return;
                }
                w.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                if let Some(iom) = weak_iom.upgrade() {
                    iom.cancel_event(fd, Event::Write);
                }
            },
            &witness,
            false,
        ))
    } else {
        None
    };

    if let Err(e) = iom.add_event(fd, Event::Write) {
        rt_error!("connect: add_event(fd {}) failed: {}", fd, e);
        if let Some(t) = &timer {
            iom.cancel_timer(t);
        }
        return Err(e.into());
    }

    Fiber::yield_now();

    if let Some(t) = &timer {
        iom.cancel_timer(t);
    }
    if witness.cancelled.load(Ordering::SeqCst) == libc::ETIMEDOUT {
        return Err(io::Error::from_raw_os_error(libc::ETIMEDOUT));
    }

    // Writability only means the handshake settled; fetch the verdict
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// Close an fd, firing any parked waiters and dropping its registry entry
pub fn close(fd: RawFd) -> io::Result<()> {
    if hook_enabled() && registry().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        registry().remove(fd);
    }
    if unsafe { libc::close(fd) } != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Bound read-side waits on `fd` to `ms` milliseconds
pub fn set_recv_timeout(fd: RawFd, ms: u64) {
    if let Some(ctx) = registry().get(fd, true) {
        ctx.set_timeout(TimeoutKind::Recv, ms);
    }
}

/// Bound write-side waits on `fd` to `ms` milliseconds
pub fn set_send_timeout(fd: RawFd, ms: u64) {
    if let Some(ctx) = registry().get(fd, true) {
        ctx.set_timeout(TimeoutKind::Send, ms);
    }
}

/// Let the user own non-blocking behavior for `fd`; wrappers stop parking
pub fn set_user_nonblock(fd: RawFd, on: bool) {
    if let Some(ctx) = registry().get(fd, true) {
        ctx.set_user_nonblock(on);
    }
}
