//! Utility functions and helpers

pub mod time;

pub use time::{capture_time_now, monotonic_nanos};
