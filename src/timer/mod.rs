//! Deadline-ordered timers.
//!
//! Timers live in a set strictly ordered by `(deadline, sequence)`, so two
//! timers with the same deadline keep distinct, stable positions and removal
//! by value is never ambiguous. Deadlines are monotonic-clock milliseconds.

use crate::utils::current_ms;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};


/// Shared timer callback; recurring timers invoke it every period.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Rollbacks larger than this are treated as a clock adjustment.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(1);

type TimerKey = (u64, u64);

struct TimerInner {
    period_ms: u64,
    deadline_ms: u64,
    recurring: bool,
    /// Cleared on cancellation and after a one-shot fires, breaking any
    /// reference cycle through user-captured state.
    cb: Option<TimerCallback>,
}

/// Handle to a scheduled timer.
pub struct Timer {
    seq: u64,
    manager: Weak<TimerManager>,
    inner: Mutex<TimerInner>,
}

impl Timer {
    fn key(inner: &TimerInner, seq: u64) -> TimerKey {
        (inner.deadline_ms, seq)
    }

    /// Removes the timer and clears its callback. Returns false if it
    /// already fired or was already cancelled.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };

        // Lock order: manager set, then timer.
        let mut timers = manager.timers.write();
        let mut inner = self.inner.lock();
        if inner.cb.is_none() {
            return false;
        }
        inner.cb = None;
        timers.remove(&Self::key(&inner, self.seq));
        true
    }

    /// Re-seats the timer one full period from now.
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };

        let mut timers = manager.timers.write();
        let mut inner = self.inner.lock();
        if inner.cb.is_none() {
            return false;
        }
        let Some(timer) = timers.remove(&Self::key(&inner, self.seq)) else {
            return false;
        };
        inner.deadline_ms = current_ms() + inner.period_ms;
        timers.insert(Self::key(&inner, self.seq), timer);
        true
    }

    /// Rebinds the period. With `from_now` the deadline restarts from the
    /// present; otherwise it stays anchored to the timer's original start
    /// (`old_deadline - old_period + ms`).
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };

        let at_front = {
            let mut timers = manager.timers.write();
            let mut inner = self.inner.lock();
            if ms == inner.period_ms && !from_now {
                return true;
            }
            if inner.cb.is_none() {
                return false;
            }
            let Some(timer) = timers.remove(&Self::key(&inner, self.seq)) else {
                return false;
            };

            let start = if from_now {
                current_ms()
            } else {
                inner.deadline_ms - inner.period_ms
            };
            inner.period_ms = ms;
            inner.deadline_ms = start + ms;

            let key = Self::key(&inner, self.seq);
            timers.insert(key, timer);
            timers.keys().next() == Some(&key)
        };

        if at_front {
            manager.notify_front();
        }
        true
    }

    /// Flips the recurring flag; a recurring timer downgraded mid-flight
    /// fires once more and is then retired.
    pub fn set_recurring(&self, recurring: bool) {
        self.inner.lock().recurring = recurring;
    }
}

/// Time-ordered set of timers with earliest-first extraction.
pub struct TimerManager {
    timers: RwLock<BTreeMap<TimerKey, Arc<Timer>>>,
    previous_ms: AtomicU64,
    /// Invoked whenever an insertion becomes the new minimum; the IO manager
    /// uses it to shorten a parked `epoll_wait`.
    front_notify: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            timers: RwLock::new(BTreeMap::new()),
            previous_ms: AtomicU64::new(current_ms()),
            front_notify: OnceLock::new(),
        })
    }

    pub(crate) fn set_front_notify(&self, f: impl Fn() + Send + Sync + 'static) {
        let _ = self.front_notify.set(Box::new(f));
    }

    fn notify_front(&self) {
        if let Some(f) = self.front_notify.get() {
            f();
        }
    }

    /// Schedules `cb` to run `ms` from now, repeating with period `ms` when
    /// `recurring`.
    pub fn add_timer<F>(self: &Arc<Self>, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(ms, Arc::new(cb), recurring)
    }

    pub(crate) fn add_timer_cb(
        self: &Arc<Self>,
        ms: u64,
        cb: TimerCallback,
        recurring: bool,
    ) -> Arc<Timer> {
        let seq = NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed);
        let timer = Arc::new(Timer {
            seq,
            manager: Arc::downgrade(self),
            inner: Mutex::new(TimerInner {
                period_ms: ms,
                deadline_ms: current_ms() + ms,
                recurring,
                cb: Some(cb),
            }),
        });

        let at_front = {
            let mut timers = self.timers.write();
            let key = Timer::key(&timer.inner.lock(), seq);
            timers.insert(key, timer.clone());
            timers.keys().next() == Some(&key)
        };
        if at_front {
            self.notify_front();
        }

        timer
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only fires while
    /// `cond` still upgrades; a dead witness turns the firing into a no-op.
    pub fn add_conditional_timer<T, F>(
        self: &Arc<Self>,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: 0 when already expired,
    /// `u64::MAX` when the set is empty.
    pub fn next_timeout(&self) -> u64 {
        let timers = self.timers.read();
        match timers.keys().next() {
            None => u64::MAX,
            Some(&(deadline, _)) => {
                let now = current_ms();
                if now >= deadline {
                    0
                } else {
                    deadline - now
                }
            }
        }
    }

    pub fn has_timer(&self) -> bool {
        !self.timers.read().is_empty()
    }

    /// Extracts every callback whose deadline has passed, earliest first.
    /// Recurring timers are re-seated at `now + period`; one-shots have their
    /// callback cleared.
    pub fn collect_expired(&self, cbs: &mut Vec<TimerCallback>) {
        let now = current_ms();
        {
            let timers = self.timers.read();
            if timers.is_empty() {
                return;
            }
        }

        let mut timers = self.timers.write();
        if timers.is_empty() {
            return;
        }

        let rollover = self.detect_clock_rollover(now);
        if !rollover {
            match timers.keys().next() {
                Some(&(deadline, _)) if deadline <= now => {}
                _ => return,
            }
        }

        // When the clock rolled back, every timer is considered expired this
        // tick rather than silently drifting by the adjustment.
        let expired: Vec<Arc<Timer>> = if rollover {
            std::mem::take(&mut *timers).into_values().collect()
        } else {
            let tail = timers.split_off(&(now + 1, 0));
            std::mem::replace(&mut *timers, tail).into_values().collect()
        };

        cbs.reserve(expired.len());
        for timer in expired {
            let mut inner = timer.inner.lock();
            let Some(cb) = inner.cb.clone() else {
                continue;
            };
            cbs.push(cb);

            if inner.recurring {
                inner.deadline_ms = now + inner.period_ms;
                let key = Timer::key(&inner, timer.seq);
                drop(inner);
                timers.insert(key, timer);
            } else {
                inner.cb = None;
            }
        }
    }

    fn detect_clock_rollover(&self, now: u64) -> bool {
        let prev = self.previous_ms.swap(now, Ordering::AcqRel);
        now < prev && now < prev.saturating_sub(ROLLOVER_WINDOW_MS)
    }
}
