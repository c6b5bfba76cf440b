// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Handle to one scheduled timer.

use std::sync::Arc;
use std::time::Duration;

use crate::manager::Shared;

/// Handle to one scheduled callback.
///
/// Addressed into the manager's store by sequence number; the handle
/// shares ownership of the store, so it can never dangle — operations on
/// a timer that already fired or was cancelled just lose the race and
/// report `false`.
pub struct Timer {
    seq: u64,
    shared: Arc<Shared>,
}

impl Timer {
    pub(crate) fn new(seq: u64, shared: Arc<Shared>) -> Self {
        Timer { seq, shared }
    }

    /// Remove the timer. `false` when it already fired or was already
    /// cancelled — a lost race, not an error.
    pub fn cancel(&self) -> bool {
        let mut queue = self.shared.queue.write().unwrap();
        queue.remove_entry(self.seq).is_some()
    }

    /// Push the due time out to now + period. `false` when the timer is
    /// no longer active.
    pub fn refresh(&self) -> bool {
        let now = self.shared.now();
        let mut queue = self.shared.queue.write().unwrap();
        let Some(mut entry) = queue.remove_entry(self.seq) else {
            return false;
        };
        entry.due_ms = now + entry.period_ms;
        // A refresh only moves the due time later; the front never moves
        // earlier, so no wake bookkeeping applies.
        queue.insert_entry(entry);
        true
    }

    /// Change the period. With `from_now` the timer is rebased from the
    /// current instant; otherwise its original start instant is kept, so
    /// the phase is preserved. An unchanged period without `from_now` is
    /// a no-op success.
    pub fn reset(&self, period: Duration, from_now: bool) -> bool {
        let period_ms = period.as_millis() as u64;
        let now = self.shared.now();
        let at_front;
        {
            let mut queue = self.shared.queue.write().unwrap();
            let Some(entry) = queue.entry_of(self.seq) else {
                return false;
            };
            if entry.period_ms == period_ms && !from_now {
                return true;
            }
            let mut entry = queue
                .remove_entry(self.seq)
                .expect("entry_of and remove_entry agree under the lock");
            let start = if from_now {
                now
            } else {
                entry.due_ms - entry.period_ms
            };
            entry.period_ms = period_ms;
            entry.due_ms = start + period_ms;
            at_front = self.shared.insert_locked(&mut queue, entry);
        }
        self.shared.wake_if(at_front);
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::manager::tests::manual_manager;
    use crate::manager::TimerCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn noop() -> TimerCallback {
        Arc::new(|| {})
    }

    #[test]
    fn cancel_twice_reports_the_lost_race() {
        let (manager, _time) = manual_manager();
        let timer = manager.add_timer(Duration::from_millis(100), noop(), false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!manager.has_timer());
    }

    #[test]
    fn cancel_after_firing_is_false() {
        let (manager, time) = manual_manager();
        let timer = manager.add_timer(Duration::from_millis(10), noop(), false);
        time.fetch_add(10, Ordering::SeqCst);
        let mut due = Vec::new();
        manager.list_expired(&mut due);
        assert_eq!(due.len(), 1);
        assert!(!timer.cancel());
        assert!(!timer.refresh());
    }

    #[test]
    fn refresh_restarts_the_period() {
        let (manager, time) = manual_manager();
        let timer = manager.add_timer(Duration::from_millis(100), noop(), false);

        time.fetch_add(60, Ordering::SeqCst);
        assert_eq!(manager.next_deadline(), Some(Duration::from_millis(40)));

        assert!(timer.refresh());
        assert_eq!(manager.next_deadline(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn reset_from_now_rebases() {
        let (manager, time) = manual_manager();
        let timer = manager.add_timer(Duration::from_millis(100), noop(), false);

        time.fetch_add(50, Ordering::SeqCst);
        assert!(timer.reset(Duration::from_millis(200), true));
        assert_eq!(manager.next_deadline(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn reset_preserving_phase_keeps_the_start_instant() {
        let (manager, time) = manual_manager();
        let timer = manager.add_timer(Duration::from_millis(100), noop(), false);

        time.fetch_add(50, Ordering::SeqCst);
        // Rebased from the original start: due = start + 200, i.e. 150ms
        // from the current instant.
        assert!(timer.reset(Duration::from_millis(200), false));
        assert_eq!(manager.next_deadline(), Some(Duration::from_millis(150)));
    }

    #[test]
    fn reset_with_unchanged_period_is_a_quiet_success() {
        let (manager, time) = manual_manager();
        let timer = manager.add_timer(Duration::from_millis(100), noop(), false);

        time.fetch_add(30, Ordering::SeqCst);
        assert!(timer.reset(Duration::from_millis(100), false));
        // No mutation: the deadline did not move.
        assert_eq!(manager.next_deadline(), Some(Duration::from_millis(70)));
    }

    #[test]
    fn operations_on_a_cancelled_timer_all_lose() {
        let (manager, _time) = manual_manager();
        let timer = manager.add_timer(Duration::from_millis(100), noop(), false);
        assert!(timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(Duration::from_millis(50), true));
    }

    #[test]
    fn concurrent_cancel_only_one_wins() {
        let (manager, _time) = manual_manager();
        let timer = Arc::new(manager.add_timer(Duration::from_secs(10), noop(), false));
        let wins = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let timer = timer.clone();
            let wins = wins.clone();
            handles.push(std::thread::spawn(move || {
                if timer.cancel() {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
