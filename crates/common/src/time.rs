//! Time utilities for vela.
//!
//! The main export is [`YieldTimer`], a cooperative scheduling aid. Hot loops
//! that process work already sitting in memory (for example, draining several
//! framed messages out of one large socket read) use it to decide when to
//! hand the scheduler back to other tasks instead of running until the
//! buffer is dry.
//!
//! # Example
//!
//! ```rust
//! use vela_common::YieldTimer;
//! use std::time::Duration;
//!
//! let yt = YieldTimer::start(Duration::from_millis(2));
//! while yt.should_keep_going() {
//!     // process one unit of buffered work, then re-check
//!     # break;
//! }
//! ```

use std::time::{Duration, Instant};

/// Default budget for one uninterrupted pass over buffered work.
///
/// Two milliseconds is long enough to drain a burst of small frames in one
/// go and short enough that a single connection cannot monopolize a worker.
pub const DEFAULT_YIELD_BUDGET: Duration = Duration::from_millis(2);

/// Caps how long one pass of synchronous work may run before yielding.
///
/// A `YieldTimer` is cheap to construct and carries no scheduling machinery
/// of its own; the caller is expected to yield (or return to the reactor)
/// once [`should_keep_going`](YieldTimer::should_keep_going) turns false.
#[derive(Debug, Clone, Copy)]
pub struct YieldTimer {
    started: Instant,
    budget: Duration,
}

impl YieldTimer {
    /// Starts a timer with the given budget.
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// Starts a timer with [`DEFAULT_YIELD_BUDGET`].
    pub fn start_default() -> Self {
        Self::start(DEFAULT_YIELD_BUDGET)
    }

    /// Returns true while the budget has not been exhausted.
    pub fn should_keep_going(&self) -> bool {
        self.started.elapsed() < self.budget
    }

    /// Time spent since the timer was started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generous_budget_keeps_going() {
        let yt = YieldTimer::start(Duration::from_secs(60));
        assert!(yt.should_keep_going());
    }

    #[test]
    fn zero_budget_expires_immediately() {
        let yt = YieldTimer::start(Duration::ZERO);
        assert!(!yt.should_keep_going());
    }

    #[test]
    fn budget_expires_after_elapsed() {
        let yt = YieldTimer::start(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(10));
        assert!(!yt.should_keep_going());
        assert!(yt.elapsed() >= Duration::from_millis(10));
    }
}
