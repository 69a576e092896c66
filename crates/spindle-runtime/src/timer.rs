//! Deadline-ordered timer manager
//!
//! Timers live in an ordered set keyed by absolute system-clock deadline
//! (ties broken by creation sequence, so two timers with identical
//! deadlines coexist). The reactor bounds its `epoll_wait` by
//! `next_timeout_ms` and harvests ripe callbacks with `drain_expired`.
//!
//! The system clock can be yanked backwards; a jump of more than an hour
//! between probes is treated as rollover and fires every pending timer
//! once. Over-firing beats a silent stall.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

/// Shared timer callback; recurring timers invoke it repeatedly
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Backward clock jump treated as rollover
const ROLLOVER_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Ordering key: absolute deadline, ties broken by creation sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    deadline: SystemTime,
    seq: u64,
}

struct TimerState {
    deadline: SystemTime,
    period_ms: u64,
    recurring: bool,
    /// Cleared on cancellation and on one-shot expiry
    cb: Option<TimerCallback>,
}

struct TimerNode {
    seq: u64,
    state: Mutex<TimerState>,
}

/// Reference-counted handle to a timer
///
/// Mutation goes through the owning manager, which locates the timer by
/// identity under its lock; the handle carries no back-pointer that could
/// dangle.
#[derive(Clone)]
pub struct TimerHandle {
    node: Arc<TimerNode>,
}

/// Ordered multiset of timers
pub struct TimerManager {
    timers: RwLock<BTreeMap<TimerKey, Arc<TimerNode>>>,
    /// One-shot front-dirty flag: set when a new earliest timer has been
    /// reported, cleared by `next_timeout_ms`
    tickled: AtomicBool,
    /// Previous clock probe for rollover detection
    previous_probe: Mutex<SystemTime>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            timers: RwLock::new(BTreeMap::new()),
            tickled: AtomicBool::new(false),
            previous_probe: Mutex::new(SystemTime::now()),
        }
    }

    /// Add a timer firing `period_ms` from now
    pub fn add_timer<F>(&self, period_ms: u64, cb: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(period_ms, Arc::new(cb), recurring).0
    }

    /// Add a timer whose callback only fires while `cond` is still alive
    ///
    /// The callback is gated behind a weak reference; once the witness is
    /// dropped the timer degrades to a no-op. Used for per-I/O timeouts.
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
        self.insert(period_ms, guarded(cond, cb), recurring).0
    }

    /// Insert a callback timer; the second return says whether it became
    /// the new front while the front-dirty flag was clear (the caller owes
    /// a wakeup)
    pub(crate) fn insert(
        &self,
        period_ms: u64,
        cb: TimerCallback,
        recurring: bool,
    ) -> (TimerHandle, bool) {
        let deadline = SystemTime::now() + Duration::from_millis(period_ms);
        let node = Arc::new(TimerNode {
            seq: NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TimerState {
                deadline,
                period_ms,
                recurring,
                cb: Some(cb),
            }),
        });
        let key = TimerKey {
            deadline,
            seq: node.seq,
        };

        let mut map = self.timers.write().unwrap();
        map.insert(key, node.clone());
        let is_front = map.keys().next() == Some(&key);
        let at_front = is_front && !self.tickled.load(Ordering::Acquire);
        if at_front {
            self.tickled.store(true, Ordering::Release);
        }
        drop(map);

        (TimerHandle { node }, at_front)
    }

    /// Milliseconds until the earliest deadline
    ///
    /// ALL_ONES if no timers are pending, 0 if the front is already ripe.
    /// Clears the front-dirty flag so the next earlier insertion notifies
    /// again.
    pub fn next_timeout_ms(&self) -> u64 {
        let map = self.timers.read().unwrap();
        self.tickled.store(false, Ordering::Release);

        let Some(key) = map.keys().next() else {
            return u64::MAX;
        };
        let now = SystemTime::now();
        match key.deadline.duration_since(now) {
            Ok(delta) => delta.as_millis() as u64,
            Err(_) => 0, // front deadline already passed
        }
    }

    /// Pop every ripe timer, appending its callback to `out`
    ///
    /// Recurring timers re-arm at now + period; one-shot callbacks are
    /// cleared. On clock rollover all pending timers count as ripe.
    pub fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = SystemTime::now();
        let mut map = self.timers.write().unwrap();
        let rollover = self.detect_clock_rollover(now);

        // Pop first, re-arm after: a rollover drain must not revisit the
        // recurring timers it just reinserted
        let mut ripe: Vec<Arc<TimerNode>> = Vec::new();
        loop {
            let key = match map.keys().next() {
                Some(k) => *k,
                None => break,
            };
            if !rollover && key.deadline > now {
                break;
            }
            ripe.push(map.remove(&key).unwrap());
        }

        for node in ripe {
            let mut st = node.state.lock().unwrap();
            if let Some(cb) = st.cb.clone() {
                out.push(cb);
            }
            if st.recurring {
                st.deadline = now + Duration::from_millis(st.period_ms);
                let key = TimerKey {
                    deadline: st.deadline,
                    seq: node.seq,
                };
                drop(st);
                map.insert(key, node);
            } else {
                st.cb = None;
            }
        }
    }

    /// Cancel a timer; returns false if it already fired or was cancelled
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let mut map = self.timers.write().unwrap();
        let mut st = handle.node.state.lock().unwrap();
        if st.cb.is_none() {
            return false;
        }
        st.cb = None;
        let key = TimerKey {
            deadline: st.deadline,
            seq: handle.node.seq,
        };
        drop(st);
        map.remove(&key);
        true
    }

    /// Push a timer's deadline out to now + period
    pub fn refresh(&self, handle: &TimerHandle) -> bool {
        let mut map = self.timers.write().unwrap();
        let mut st = handle.node.state.lock().unwrap();
        if st.cb.is_none() {
            return false;
        }
        let old_key = TimerKey {
            deadline: st.deadline,
            seq: handle.node.seq,
        };
        if map.remove(&old_key).is_none() {
            return false;
        }
        st.deadline = SystemTime::now() + Duration::from_millis(st.period_ms);
        let key = TimerKey {
            deadline: st.deadline,
            seq: handle.node.seq,
        };
        drop(st);
        map.insert(key, handle.node.clone());
        true
    }

    /// Change a timer's period
    ///
    /// With `from_now` the new deadline counts from the current instant;
    /// otherwise it shifts relative to the timer's original start point
    /// (old deadline minus old period).
    pub fn reset(&self, handle: &TimerHandle, period_ms: u64, from_now: bool) -> bool {
        self.reset_inner(handle, period_ms, from_now).0
    }

    /// `reset` plus the front-insertion flag for the reactor wrapper
    pub(crate) fn reset_inner(
        &self,
        handle: &TimerHandle,
        period_ms: u64,
        from_now: bool,
    ) -> (bool, bool) {
        let mut map = self.timers.write().unwrap();
        let mut st = handle.node.state.lock().unwrap();
        if period_ms == st.period_ms && !from_now {
            return (true, false); // nothing would change
        }
        if st.cb.is_none() {
            return (false, false);
        }
        let old_key = TimerKey {
            deadline: st.deadline,
            seq: handle.node.seq,
        };
        if map.remove(&old_key).is_none() {
            return (false, false);
        }

        let start = if from_now {
            SystemTime::now()
        } else {
            st.deadline
                .checked_sub(Duration::from_millis(st.period_ms))
                .unwrap_or(st.deadline)
        };
        st.period_ms = period_ms;
        st.deadline = start + Duration::from_millis(period_ms);
        let key = TimerKey {
            deadline: st.deadline,
            seq: handle.node.seq,
        };
        drop(st);
        map.insert(key, handle.node.clone());

        let is_front = map.keys().next() == Some(&key);
        let at_front = is_front && !self.tickled.load(Ordering::Acquire);
        if at_front {
            self.tickled.store(true, Ordering::Release);
        }
        (true, at_front)
    }

    /// Whether any timer is pending
    pub fn has_timer(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Caller holds the write lock. Compares the current probe against the
    /// previous one minus an hour; a bigger backward jump means the wall
    /// clock rolled over.
    fn detect_clock_rollover(&self, now: SystemTime) -> bool {
        let mut prev = self.previous_probe.lock().unwrap();
        let rolled = prev
            .checked_sub(ROLLOVER_WINDOW)
            .map(|threshold| now < threshold)
            .unwrap_or(false);
        *prev = now;
        rolled
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Gate a callback behind the liveness of a weak witness
pub(crate) fn guarded<T, F>(cond: &Arc<T>, cb: F) -> TimerCallback
where
    T: Send + Sync + 'static,
    F: Fn() + Send + Sync + 'static,
{
    let weak = Arc::downgrade(cond);
    Arc::new(move || {
        if weak.upgrade().is_some() {
            cb();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn drain_now(mgr: &TimerManager) -> Vec<TimerCallback> {
        let mut out = Vec::new();
        mgr.drain_expired(&mut out);
        out
    }

    #[test]
    fn test_next_timeout_empty() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout_ms(), u64::MAX);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_next_timeout_tracks_front() {
        let mgr = TimerManager::new();
        mgr.add_timer(5000, || {}, false);
        mgr.next_timeout_ms(); // re-arm the front notification

        let (_, front) = mgr.insert(50, Arc::new(|| {}), false);
        assert!(front, "earlier timer should report at-front");

        let ms = mgr.next_timeout_ms();
        assert!(ms <= 50, "next timeout {} should be bounded by 50", ms);
    }

    #[test]
    fn test_overdue_timer_reports_zero() {
        let mgr = TimerManager::new();
        mgr.add_timer(0, || {}, false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.next_timeout_ms(), 0);
    }

    #[test]
    fn test_front_flag_is_one_shot() {
        let mgr = TimerManager::new();
        let (_, first) = mgr.insert(1000, Arc::new(|| {}), false);
        assert!(first);
        // Earlier, but the flag is still set: no second notification
        let (_, second) = mgr.insert(500, Arc::new(|| {}), false);
        assert!(!second);
        // Probing the timeout re-arms the notification
        mgr.next_timeout_ms();
        let (_, third) = mgr.insert(100, Arc::new(|| {}), false);
        assert!(third);
    }

    #[test]
    fn test_drain_fires_ripe_only() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        mgr.add_timer(0, move || { h.fetch_add(1, Ordering::SeqCst); }, false);
        let h = hits.clone();
        mgr.add_timer(60_000, move || { h.fetch_add(100, Ordering::SeqCst); }, false);

        std::thread::sleep(Duration::from_millis(5));
        for cb in drain_now(&mgr) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(mgr.has_timer(), "far timer must survive the drain");
    }

    #[test]
    fn test_identical_deadlines_coexist() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            mgr.add_timer(0, move || { h.fetch_add(1, Ordering::SeqCst); }, false);
        }
        std::thread::sleep(Duration::from_millis(5));
        for cb in drain_now(&mgr) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_recurring_rearms() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        mgr.add_timer(0, move || { h.fetch_add(1, Ordering::SeqCst); }, true);

        std::thread::sleep(Duration::from_millis(5));
        for cb in drain_now(&mgr) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(mgr.has_timer(), "recurring timer must re-arm");

        std::thread::sleep(Duration::from_millis(5));
        for cb in drain_now(&mgr) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let handle = mgr.add_timer(0, move || { h.fetch_add(1, Ordering::SeqCst); }, false);

        assert!(mgr.cancel(&handle));
        assert!(!mgr.cancel(&handle), "second cancel reports nothing to do");
        assert!(!mgr.has_timer());

        std::thread::sleep(Duration::from_millis(5));
        assert!(drain_now(&mgr).is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let mgr = TimerManager::new();
        let handle = mgr.add_timer(40, || {}, false);
        std::thread::sleep(Duration::from_millis(30));

        assert!(mgr.refresh(&handle));
        let ms = mgr.next_timeout_ms();
        assert!(ms > 20, "refreshed deadline should be ~40ms out, got {}", ms);
    }

    #[test]
    fn test_reset_from_now_and_from_origin() {
        let mgr = TimerManager::new();
        let handle = mgr.add_timer(100, || {}, false);

        // Same period, not from_now: nothing to do
        assert!(mgr.reset(&handle, 100, false));

        // Longer period measured from the original start point
        assert!(mgr.reset(&handle, 200, false));
        let ms = mgr.next_timeout_ms();
        assert!(ms > 100 && ms <= 200, "expected (100, 200], got {}", ms);

        // From now: full period again
        assert!(mgr.reset(&handle, 300, true));
        let ms = mgr.next_timeout_ms();
        assert!(ms > 200 && ms <= 300, "expected (200, 300], got {}", ms);
    }

    #[test]
    fn test_cancelled_timer_rejects_reset_and_refresh() {
        let mgr = TimerManager::new();
        let handle = mgr.add_timer(50, || {}, false);
        assert!(mgr.cancel(&handle));
        assert!(!mgr.refresh(&handle));
        assert!(!mgr.reset(&handle, 10, true));
    }

    #[test]
    fn test_condition_timer_gated_by_witness() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        // Live witness: fires
        let witness = Arc::new(());
        let h = hits.clone();
        mgr.add_condition_timer(0, move || { h.fetch_add(1, Ordering::SeqCst); }, &witness, false);

        // Dropped witness: no-op
        let dropped = Arc::new(());
        let h = hits.clone();
        mgr.add_condition_timer(0, move || { h.fetch_add(100, Ordering::SeqCst); }, &dropped, false);
        drop(dropped);

        std::thread::sleep(Duration::from_millis(5));
        for cb in drain_now(&mgr) {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
