//! # Bulwark
//!
//! Overload protection primitives shared by every instance of a request-serving
//! system. This crate has no network code: it holds the pieces that are pure
//! computation or process-local state.
//!
//! ## Overview
//!
//! - [`BackpressureController`]: bounds the number of requests one process
//!   handles at once. Admission yields a [`Permit`] that releases its slot on
//!   drop, so completion, error and cancellation all give the slot back.
//! - [`RatePolicy`]: sliding-window arithmetic used by the distributed rate
//!   limiter in `bulwark-server`. The store does the counting, this type turns
//!   counts and timestamps into a [`WindowOutcome`].
//! - [`KeyDeriver`]: turns an identity or an origin address into a tracking
//!   key. Anonymous origins are hashed so raw addresses never reach the store.
//!
//! ## Quick Start
//!
//! ```
//! use bulwark::BackpressureController;
//!
//! let controller = BackpressureController::new(2);
//!
//! let first = controller.admit().unwrap();
//! let _second = controller.admit().unwrap();
//!
//! // Third request is over capacity
//! let rejected = controller.admit().unwrap_err();
//! assert_eq!(rejected.retry_after.as_secs(), 5);
//!
//! // Releasing a slot makes room again
//! first.release();
//! assert!(controller.admit().is_ok());
//! ```
//!
//! ## Sliding Window
//!
//! ```
//! use bulwark::RatePolicy;
//! use std::time::Duration;
//!
//! let policy = RatePolicy::new(5, Duration::from_secs(60));
//! let now_ms = 1_700_000_000_000;
//!
//! // Four requests already in the window: the fifth is admitted
//! let outcome = policy.consume(4, Some(now_ms - 1_000), now_ms);
//! assert!(outcome.allowed);
//! assert_eq!(outcome.remaining, 0);
//!
//! // Five in the window: the sixth is rejected until the oldest one ages out
//! let outcome = policy.consume(5, Some(now_ms - 1_000), now_ms);
//! assert!(!outcome.allowed);
//! assert_eq!(outcome.retry_after_secs, Some(59));
//! ```
//!
//! ## Thread Safety
//!
//! [`BackpressureController`] is cheap to clone and all clones share one
//! counter; it is safe to call from any number of threads. [`RatePolicy`] and
//! [`KeyDeriver`] are immutable values.

pub mod core;

pub use core::{
    BackpressureController, BackpressureControllerBuilder, BackpressureStats, CapacityExceeded,
    KeyDeriver, LoadState, Permit, RatePolicy, WindowOutcome,
};
