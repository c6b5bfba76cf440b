// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Time source for due-time arithmetic.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Deliberately the wall clock, not a monotonic source: due times are
/// absolute instants, and the manager defends against the clock being
/// set backwards rather than pretending it cannot happen.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Injectable clock, so tests can move time by hand.
pub(crate) type ClockFn = Box<dyn Fn() -> u64 + Send + Sync>;
