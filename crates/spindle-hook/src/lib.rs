//! # spindle-hook
//!
//! Blocking POSIX I/O, rewritten as cooperative suspend/resume over the
//! spindle reactor.
//!
//! Each wrapper performs the raw syscall; on EAGAIN it registers the
//! calling fiber for readiness (plus an optional timeout timer), yields
//! the worker to other fibers, and retries once woken. From the fiber's
//! perspective these look like ordinary blocking calls.
//!
//! ```ignore
//! // Inside a fiber: looks blocking, suspends cooperatively
//! let n = spindle_hook::read(fd, &mut buf)?;
//! spindle_hook::sleep_ms(250);
//! ```
//!
//! Only sockets take the suspend path; regular files and fds the registry
//! has never seen fall through to the raw syscall, as does any thread with
//! hooking disabled.

#![allow(dead_code)]

pub mod fd;
pub mod ops;
pub mod sleep;

pub use fd::{registry, FdCtx, FdRegistry, TimeoutKind};
pub use ops::{
    accept, close, connect, connect_with_timeout, read, recv, send, set_recv_timeout,
    set_send_timeout, set_user_nonblock, socket, write, IoWitness,
};
pub use sleep::{sleep_ms, sleep_secs, sleep_us};

use std::cell::Cell;

thread_local! {
    /// Per-thread hook switch; off means every wrapper is a raw syscall
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether the calling thread routes wrappers through the reactor
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Toggle hooking for the calling thread
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}
