// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ordered timer collection.
//!
//! All mutation is serialized by one `RwLock`; the wake hook always runs
//! after the lock is released, so a hook that calls back into the
//! manager cannot deadlock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use crate::clock::{self, ClockFn};
use crate::timer::Timer;

/// Deferred work registered with a [`TimerManager`]. Cloned out on
/// expiry, retained for recurring timers.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Hook invoked, outside the lock, when an insert becomes the earliest
/// deadline. An external wait loop uses it to interrupt its sleep.
pub type WakeHook = Box<dyn Fn() + Send + Sync>;

/// Backward clock jumps beyond this are treated as a rollback.
const CLOCK_ROLLBACK_THRESHOLD_MS: u64 = 60 * 60 * 1000;

pub(crate) struct TimerEntry {
    pub(crate) seq: u64,
    pub(crate) due_ms: u64,
    pub(crate) period_ms: u64,
    pub(crate) recurring: bool,
    pub(crate) cb: TimerCallback,
}

/// The ordered set plus its bookkeeping, all guarded by the one lock.
pub(crate) struct TimerQueue {
    /// Key = (absolute due time, insertion sequence): no two distinct
    /// timers ever compare equal, and equal deadlines keep insertion
    /// order.
    by_due: BTreeMap<(u64, u64), TimerEntry>,
    /// seq -> current due time, so handles can address their entry.
    index: HashMap<u64, u64>,
    last_observed_ms: u64,
}

impl TimerQueue {
    pub(crate) fn entry_of(&self, seq: u64) -> Option<&TimerEntry> {
        let due = *self.index.get(&seq)?;
        self.by_due.get(&(due, seq))
    }

    pub(crate) fn remove_entry(&mut self, seq: u64) -> Option<TimerEntry> {
        let due = self.index.remove(&seq)?;
        self.by_due.remove(&(due, seq))
    }

    pub(crate) fn insert_entry(&mut self, entry: TimerEntry) -> (u64, u64) {
        let key = (entry.due_ms, entry.seq);
        self.index.insert(entry.seq, entry.due_ms);
        self.by_due.insert(key, entry);
        key
    }

    /// True when `now` jumped backwards past the threshold. Records
    /// `now` as the latest observation either way.
    fn detect_rollback(&mut self, now_ms: u64) -> bool {
        let rolled = now_ms < self.last_observed_ms.saturating_sub(CLOCK_ROLLBACK_THRESHOLD_MS);
        self.last_observed_ms = now_ms;
        rolled
    }
}

/// State shared by the manager and every outstanding [`Timer`] handle.
pub(crate) struct Shared {
    pub(crate) queue: RwLock<TimerQueue>,
    /// Suppresses redundant wake signals between polls.
    tickled: AtomicBool,
    next_seq: AtomicU64,
    clock: ClockFn,
    wake: Option<WakeHook>,
}

impl Shared {
    pub(crate) fn now(&self) -> u64 {
        (self.clock)()
    }

    /// Insert under the write lock; reports whether the entry landed at
    /// the front with no wake already pending.
    pub(crate) fn insert_locked(&self, queue: &mut TimerQueue, entry: TimerEntry) -> bool {
        let key = queue.insert_entry(entry);
        *queue.by_due.keys().next().expect("queue cannot be empty") == key
            && !self.tickled.swap(true, Ordering::AcqRel)
    }

    /// Deliver the front-changed notification. Must be called with the
    /// lock released.
    pub(crate) fn wake_if(&self, at_front: bool) {
        if at_front {
            if let Some(wake) = &self.wake {
                wake();
            }
        }
    }
}

/// Concurrently shared collection of deferred callbacks ordered by due
/// time.
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::build(None, Box::new(clock::now_ms))
    }

    /// Manager whose front-changed notifications invoke `hook`.
    pub fn with_wake_hook(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self::build(Some(Box::new(hook)), Box::new(clock::now_ms))
    }

    pub(crate) fn build(wake: Option<WakeHook>, clock: ClockFn) -> Self {
        let last_observed_ms = clock();
        TimerManager {
            shared: Arc::new(Shared {
                queue: RwLock::new(TimerQueue {
                    by_due: BTreeMap::new(),
                    index: HashMap::new(),
                    last_observed_ms,
                }),
                tickled: AtomicBool::new(false),
                next_seq: AtomicU64::new(1),
                clock,
                wake,
            }),
        }
    }

    /// Schedule `cb` to fire `period` from now, and every `period` after
    /// that if `recurring`.
    pub fn add_timer(&self, period: Duration, cb: TimerCallback, recurring: bool) -> Timer {
        let period_ms = period.as_millis() as u64;
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let due_ms = self.shared.now() + period_ms;
        let entry = TimerEntry {
            seq,
            due_ms,
            period_ms,
            recurring,
            cb,
        };
        let at_front;
        {
            let mut queue = self.shared.queue.write().unwrap();
            at_front = self.shared.insert_locked(&mut queue, entry);
        }
        self.shared.wake_if(at_front);
        Timer::new(seq, self.shared.clone())
    }

    /// Timer that fires only while `guard` still resolves to a live
    /// object; once the guarded object is gone the callback is skipped
    /// silently. Tracks a lifetime without extending it.
    pub fn add_conditional_timer<T>(
        &self,
        period: Duration,
        cb: TimerCallback,
        guard: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let wrapped: TimerCallback = Arc::new(move || {
            if guard.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(period, wrapped, recurring)
    }

    /// Time until the earliest deadline: zero when already due, `None`
    /// when no timers exist. Clears the pending-wake flag, re-arming the
    /// front-changed hook for the caller's next sleep.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.shared.tickled.store(false, Ordering::Release);
        let queue = self.shared.queue.read().unwrap();
        let (&(due_ms, _), _) = queue.by_due.iter().next()?;
        let now = self.shared.now();
        Some(Duration::from_millis(due_ms.saturating_sub(now)))
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.shared.queue.read().unwrap().by_due.is_empty()
    }

    /// Pop every due callback into `out`, earliest first. Recurring
    /// timers are re-stamped `now + period` and reinserted; one-shot
    /// timers become inert, so a racing `cancel`/`refresh` observes
    /// "already fired". A backward clock jump beyond one hour expires
    /// everything pending.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = self.shared.now();
        let mut queue = self.shared.queue.write().unwrap();
        if queue.by_due.is_empty() {
            return;
        }
        let rollback = queue.detect_rollback(now);
        if rollback {
            log::warn!(
                "clock rollback detected, expiring {} pending timers",
                queue.by_due.len()
            );
        } else if queue
            .by_due
            .keys()
            .next()
            .map_or(true, |&(due, _)| due > now)
        {
            return;
        }

        let expired: Vec<TimerEntry> = if rollback {
            std::mem::take(&mut queue.by_due).into_values().collect()
        } else {
            // Everything strictly below (now + 1, 0) is due at or before
            // `now`.
            let pending = queue.by_due.split_off(&(now + 1, 0));
            std::mem::replace(&mut queue.by_due, pending)
                .into_values()
                .collect()
        };

        out.reserve(expired.len());
        for mut entry in expired {
            queue.index.remove(&entry.seq);
            out.push(entry.cb.clone());
            if entry.recurring {
                entry.due_ms = now + entry.period_ms;
                queue.insert_entry(entry);
            }
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerManager {
    /// Outstanding handles stay valid (they share the store), but every
    /// pending callback is released with the manager; late `cancel` and
    /// `refresh` calls observe "already cancelled".
    fn drop(&mut self) {
        let mut queue = self.shared.queue.write().unwrap();
        queue.by_due.clear();
        queue.index.clear();
    }
}
