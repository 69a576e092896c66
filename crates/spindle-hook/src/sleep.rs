//! Cooperative sleep
//!
//! One timer that reschedules the calling fiber, then a yield. The worker
//! thread keeps running other fibers for the duration; no epoll interest
//! is registered. Off-worker callers get the plain blocking sleep.

use spindle_runtime::{Fiber, IoManager, Schedule};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Park the calling fiber for `ms` milliseconds
pub fn sleep_ms(ms: u64) {
    let Some(iom) = IoManager::current() else {
        thread::sleep(Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    if fiber.is_thread_root() {
        // A thread root cannot be parked in the scheduler
        thread::sleep(Duration::from_millis(ms));
        return;
    }

    let weak_iom = Arc::downgrade(&iom);
    iom.add_timer(
        ms,
        move || {
            if let Some(iom) = weak_iom.upgrade() {
                iom.schedule_fiber(fiber.clone());
            }
        },
        false,
    );
    Fiber::yield_now();
}

/// Park the calling fiber for `secs` seconds
pub fn sleep_secs(secs: u64) {
    sleep_ms(secs * 1000);
}

/// Park the calling fiber for `us` microseconds (millisecond granularity)
pub fn sleep_us(us: u64) {
    sleep_ms(us / 1000);
}
