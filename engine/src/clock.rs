//! Monotonic enqueue clock.
//!
//! Queue ordering breaks priority ties by `enqueuedAt`, so two operations
//! enqueued within the same wall-clock millisecond must still receive distinct,
//! increasing stamps. The engine does no IO: callers feed in wall-clock readings
//! and the clock guarantees the stamps it hands out never repeat or go backwards.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// A clock that turns wall-clock readings into strictly increasing stamps.
///
/// Ordering rules:
/// 1. If the wall clock moved forward, its reading is used as-is
/// 2. Otherwise (same millisecond, or the wall clock stepped back) the previous
///    stamp plus one is used
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonotonicClock {
    /// Last stamp handed out
    pub last: Timestamp,
}

impl MonotonicClock {
    /// Create a clock that has not handed out any stamp yet.
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Resume a clock from a previously issued stamp (e.g. the newest
    /// `enqueuedAt` found in a persisted queue).
    pub fn resume_from(last: Timestamp) -> Self {
        Self { last }
    }

    /// Produce the next stamp for the given wall-clock reading.
    pub fn stamp(&mut self, wall: Timestamp) -> Timestamp {
        let next = if wall > self.last {
            wall
        } else {
            self.last.saturating_add(1)
        };
        self.last = next;
        next
    }

    /// Make sure future stamps are later than an externally observed one.
    pub fn observe(&mut self, seen: Timestamp) {
        self.last = self.last.max(seen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_starts_at_zero() {
        let clock = MonotonicClock::new();
        assert_eq!(clock.last, 0);
    }

    #[test]
    fn forward_wall_clock_is_used() {
        let mut clock = MonotonicClock::new();
        assert_eq!(clock.stamp(1000), 1000);
        assert_eq!(clock.stamp(2500), 2500);
    }

    #[test]
    fn same_millisecond_is_disambiguated() {
        let mut clock = MonotonicClock::new();
        assert_eq!(clock.stamp(1000), 1000);
        assert_eq!(clock.stamp(1000), 1001);
        assert_eq!(clock.stamp(1000), 1002);
    }

    #[test]
    fn wall_clock_step_back_never_decreases() {
        let mut clock = MonotonicClock::resume_from(5000);
        assert_eq!(clock.stamp(100), 5001);
        assert_eq!(clock.stamp(6000), 6000);
    }

    #[test]
    fn observe_moves_forward_only() {
        let mut clock = MonotonicClock::resume_from(10);
        clock.observe(5);
        assert_eq!(clock.last, 10);
        clock.observe(50);
        assert_eq!(clock.stamp(20), 51);
    }
}
