//! # spindle
//!
//! An M:N stackful-coroutine runtime for Linux: fibers with explicit
//! resume/yield, a fixed thread-pool scheduler, a deadline-ordered timer
//! manager, an epoll reactor waking the fiber registered for each
//! (fd, event) pair, and blocking-style I/O wrappers that suspend
//! cooperatively instead of blocking the worker.
//!
//! ```no_run
//! use spindle::{IoManager, RuntimeConfig, Schedule};
//!
//! let iom = IoManager::new(RuntimeConfig::with_threads(2)).unwrap();
//! iom.schedule_callback(|| {
//!     spindle::hook::sleep_ms(100);
//!     println!("ran on a worker fiber");
//! });
//! iom.stop();
//! ```

pub use spindle_core::{
    constants, rlog, FiberId, FiberState, SchedError, SchedResult,
};
pub use spindle_runtime::scheduler::{self, ScheduleTask};
pub use spindle_runtime::timer::{TimerCallback, TimerHandle, TimerManager};
pub use spindle_runtime::{
    Event, Fiber, IoManager, RuntimeConfig, Schedule, Scheduler,
};

/// Cooperative blocking-I/O wrappers
pub mod hook {
    pub use spindle_hook::*;
}
