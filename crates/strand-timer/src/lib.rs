// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ordered deferred callbacks, shared across threads.
//!
//! A [`TimerManager`] holds one-shot and recurring timers ordered by
//! absolute due time, behind a single reader/writer lock. It performs no
//! waiting of its own: an external loop polls
//! [`next_deadline`](TimerManager::next_deadline) to size its sleep and
//! [`list_expired`](TimerManager::list_expired) to collect due work, and
//! wires the wake hook to cut that sleep short when an insert moves the
//! earliest deadline.
//!
//! Components:
//! - `clock`   — wall-clock milliseconds, injectable for tests
//! - `manager` — ordered set, expiry, clock-rollback defense, wake hook
//! - `timer`   — per-timer handle: cancel / refresh / reset

pub mod clock;
pub mod manager;
pub mod timer;

pub use manager::{TimerCallback, TimerManager, WakeHook};
pub use timer::Timer;
