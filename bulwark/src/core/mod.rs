//! Core components of the bulwark overload protection library
//!
//! This module contains the fundamental building blocks:
//! - [`backpressure`]: process-local concurrency gate
//! - [`window`]: sliding-window admission arithmetic
//! - [`keys`]: tracking-key derivation for rate limiting

pub mod backpressure;
pub mod keys;
pub mod window;

pub use backpressure::{
    BackpressureController, BackpressureControllerBuilder, BackpressureStats, LoadState, Permit,
};
pub use keys::KeyDeriver;
pub use window::{RatePolicy, WindowOutcome};

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Rejection returned by [`BackpressureController::admit`] when every slot is taken
///
/// Carries a fixed retry hint so callers can back off predictably.
///
/// # Example
///
/// ```
/// use bulwark::BackpressureController;
///
/// let controller = BackpressureController::new(1);
/// let _held = controller.admit().unwrap();
///
/// match controller.admit() {
///     Err(e) => println!("busy, retry in {}s ({})", e.retry_after.as_secs(), e),
///     Ok(_) => unreachable!(),
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityExceeded {
    /// Requests in flight when the rejection happened
    pub active: usize,
    /// Configured ceiling
    pub max: usize,
    /// How long the caller should wait before retrying
    pub retry_after: Duration,
}

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "capacity exceeded: {}/{} requests in flight, retry after {}s",
            self.active,
            self.max,
            self.retry_after.as_secs()
        )
    }
}

impl Error for CapacityExceeded {}
