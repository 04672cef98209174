//! Shared utilities for the vela crates.
//!
//! This crate holds the small pieces that more than one vela crate needs:
//! time helpers and the cooperative [`YieldTimer`] used to bound how long a
//! task may occupy the scheduler in one pass.

pub mod time;

pub use time::{YieldTimer, DEFAULT_YIELD_BUDGET};
