//! Per-fd bookkeeping for the hook layer
//!
//! A process-wide registry tracking, per file descriptor: whether it is a
//! socket, whether it has been closed, the system- vs user-requested
//! non-blocking flags, and read/write timeouts in milliseconds.
//!
//! Sockets are switched to `O_NONBLOCK` at registration (the *system*
//! flag) so the wrappers always get EAGAIN instead of blocking the worker.
//! If the *user* asked for non-blocking themselves, the wrappers stay out
//! of the way entirely.

use spindle_core::constants::NO_TIMEOUT;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Which direction a timeout bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Read-side operations (read/recv/accept)
    Recv,
    /// Write-side operations (write/send/connect)
    Send,
}

/// Hook-layer state for one file descriptor
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    closed: AtomicBool,
    /// Non-blocking forced by the hook layer at registration
    sys_nonblock: AtomicBool,
    /// Non-blocking requested by the user; disables the suspend path
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    /// Probe the fd and, for sockets, force O_NONBLOCK
    fn probe(fd: RawFd) -> Self {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        Self {
            fd,
            is_socket,
            closed: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Relaxed);
    }

    /// Timeout in milliseconds for one direction; ALL_ONES means none
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

/// Process-wide fd table; slots are created lazily
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdRegistry {
    fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Look up an fd's context, creating it when `auto_create`
    ///
    /// Returns `None` for negative fds and for fds the registry has never
    /// seen when `auto_create` is off.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(fd as usize) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }

        let mut slots = self.slots.write().unwrap();
        if (fd as usize) >= slots.len() {
            let target = (fd as usize + 1).max(slots.len() * 2).max(64);
            slots.resize(target, None);
        }
        let slot = &mut slots[fd as usize];
        match slot {
            Some(ctx) => Some(ctx.clone()),
            None => {
                let ctx = Arc::new(FdCtx::probe(fd));
                *slot = Some(ctx.clone());
                Some(ctx)
            }
        }
    }

    /// Drop an fd's context (close path)
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.set_closed();
            }
        }
    }
}

/// The process-wide registry
pub fn registry() -> &'static FdRegistry {
    static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();
    REGISTRY.get_or_init(FdRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        (fds[0], fds[1])
    }

    #[test]
    fn test_socket_probe_sets_nonblock() {
        let (a, b) = socketpair();
        let ctx = registry().get(a, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = unsafe { libc::fcntl(a, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0, "registration forces O_NONBLOCK");

        registry().remove(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_pipe_is_not_a_socket() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = registry().get(fds[0], true).unwrap();
        assert!(!ctx.is_socket());

        registry().remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_lookup_without_create() {
        assert!(registry().get(1_000_000, false).is_none());
        assert!(registry().get(-1, false).is_none());
        assert!(registry().get(-1, true).is_none());
    }

    #[test]
    fn test_timeouts_default_and_roundtrip() {
        let (a, b) = socketpair();
        let ctx = registry().get(a, true).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        ctx.set_timeout(TimeoutKind::Recv, 50);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 50);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        registry().remove(a);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_remove_marks_closed() {
        let (a, b) = socketpair();
        let ctx = registry().get(a, true).unwrap();
        assert!(!ctx.closed());
        registry().remove(a);
        assert!(ctx.closed(), "held handles observe the close");
        assert!(registry().get(a, false).is_none());
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
