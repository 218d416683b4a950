//! Process-local concurrency gate
//!
//! [`BackpressureController`] is the last line of defense against resource
//! exhaustion in one process. It does not consult any shared state, so it
//! keeps working when the coordination store is down.
//!
//! # States
//!
//! ```text
//! Idle (0) <-> Normal (< 80%) <-> HighLoad (>= 80%) <-> Saturated (= max)
//! ```
//!
//! Only `Saturated` rejects. Transitions are driven by [`BackpressureController::admit`]
//! and by dropping (or releasing) the returned [`Permit`].
//!
//! # Logging
//!
//! - A warning when occupancy is at or above 80%, at most once per interval
//!   (60 seconds by default)
//! - A warning on every rejection
//! - One info line when occupancy falls below 50% after the controller was
//!   saturated; the flag is sticky so this fires once per episode

use super::CapacityExceeded;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Ceiling used when none (or an invalid one) is configured
pub const DEFAULT_MAX_CONCURRENT: usize = 1000;

/// Retry hint attached to every rejection
pub const RETRY_AFTER: Duration = Duration::from_secs(5);

const HIGH_LOAD_PERCENT: usize = 80;
const RECOVERY_PERCENT: usize = 50;
const DEFAULT_HIGH_LOAD_LOG_INTERVAL: Duration = Duration::from_secs(60);
const NEVER: u64 = u64::MAX;

/// Occupancy band of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    /// Nothing in flight
    Idle,
    /// Below 80% of capacity
    Normal,
    /// At or above 80% of capacity, still admitting
    HighLoad,
    /// Every slot taken, rejecting
    Saturated,
}

impl LoadState {
    /// Classify an occupancy level against a ceiling
    pub fn classify(active: usize, max: usize) -> Self {
        if active == 0 {
            LoadState::Idle
        } else if active >= max {
            LoadState::Saturated
        } else if percent_of(active, max) >= HIGH_LOAD_PERCENT {
            LoadState::HighLoad
        } else {
            LoadState::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadState::Idle => "idle",
            LoadState::Normal => "normal",
            LoadState::HighLoad => "high_load",
            LoadState::Saturated => "saturated",
        }
    }
}

/// Occupancy as a whole percentage, rounded down
///
/// Widened so very large ceilings cannot overflow.
fn percent_of(active: usize, max: usize) -> usize {
    if max == 0 {
        return 100;
    }
    (active as u128 * 100 / max as u128) as usize
}

/// Point-in-time view of a controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackpressureStats {
    pub active: usize,
    pub max: usize,
    pub state: LoadState,
    /// Rejections since start
    pub rejected: u64,
    /// High-load warnings actually emitted (after throttling)
    pub high_load_warnings: u64,
    /// Recovery log lines emitted
    pub recoveries: u64,
}

struct Inner {
    max: usize,
    active: AtomicUsize,
    // Set when occupancy hits max, cleared by the recovery log
    reached_capacity: AtomicBool,
    epoch: Instant,
    last_high_load_log_ms: AtomicU64,
    high_load_log_interval: Duration,
    rejected: AtomicU64,
    high_load_warnings: AtomicU64,
    recoveries: AtomicU64,
}

impl Inner {
    fn on_admitted(&self, active: usize) {
        if active >= self.max {
            self.reached_capacity.store(true, Ordering::Release);
        }

        if percent_of(active, self.max) >= HIGH_LOAD_PERCENT {
            self.maybe_warn_high_load(active);
        }
    }

    fn on_released(&self, active: usize) {
        if percent_of(active, self.max) < RECOVERY_PERCENT
            && self.reached_capacity.swap(false, Ordering::AcqRel)
        {
            self.recoveries.fetch_add(1, Ordering::Relaxed);
            info!(
                active = active,
                max = self.max,
                "Concurrency recovered below {}% after saturation",
                RECOVERY_PERCENT
            );
        }
    }

    fn maybe_warn_high_load(&self, active: usize) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let interval_ms = self.high_load_log_interval.as_millis() as u64;
        let last = self.last_high_load_log_ms.load(Ordering::Acquire);

        if last != NEVER && now_ms.saturating_sub(last) < interval_ms {
            return;
        }

        // Only one thread wins the slot for this interval
        if self
            .last_high_load_log_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.high_load_warnings.fetch_add(1, Ordering::Relaxed);
            warn!(
                active = active,
                max = self.max,
                utilization_percent = percent_of(active, self.max),
                "High concurrency load"
            );
        }
    }
}

/// Bounds simultaneously in-flight requests for one process
///
/// Cloning is cheap and every clone shares the same counter.
///
/// # Example
///
/// ```
/// use bulwark::{BackpressureController, LoadState};
///
/// let controller = BackpressureController::new(10);
/// {
///     let _permit = controller.admit().expect("capacity available");
///     assert_eq!(controller.active(), 1);
/// }
/// // Dropping the permit released the slot
/// assert_eq!(controller.state(), LoadState::Idle);
/// ```
#[derive(Clone)]
pub struct BackpressureController {
    inner: Arc<Inner>,
}

/// Builder for configuring a BackpressureController
///
/// # Example
///
/// ```
/// use bulwark::BackpressureController;
/// use std::time::Duration;
///
/// let controller = BackpressureController::builder()
///     .max_concurrent(500)
///     .high_load_log_interval(Duration::from_secs(30))
///     .build();
/// assert_eq!(controller.max(), 500);
/// ```
pub struct BackpressureControllerBuilder {
    max_concurrent: i64,
    high_load_log_interval: Duration,
}

impl BackpressureControllerBuilder {
    /// Set the concurrency ceiling
    ///
    /// Zero or negative values are invalid and fall back to 1000.
    pub fn max_concurrent(mut self, max: i64) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the minimum gap between two high-load warnings
    pub fn high_load_log_interval(mut self, interval: Duration) -> Self {
        self.high_load_log_interval = interval;
        self
    }

    pub fn build(self) -> BackpressureController {
        let max = sanitize_max(self.max_concurrent);
        BackpressureController {
            inner: Arc::new(Inner {
                max,
                active: AtomicUsize::new(0),
                reached_capacity: AtomicBool::new(false),
                epoch: Instant::now(),
                last_high_load_log_ms: AtomicU64::new(NEVER),
                high_load_log_interval: self.high_load_log_interval,
                rejected: AtomicU64::new(0),
                high_load_warnings: AtomicU64::new(0),
                recoveries: AtomicU64::new(0),
            }),
        }
    }
}

fn sanitize_max(configured: i64) -> usize {
    match usize::try_from(configured) {
        Ok(max) if max > 0 => max,
        _ => {
            warn!(
                configured = configured,
                fallback = DEFAULT_MAX_CONCURRENT,
                "Invalid max concurrency, using default"
            );
            DEFAULT_MAX_CONCURRENT
        }
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BackpressureController {
    /// Create a controller with the given ceiling
    ///
    /// Zero or negative values fall back to 1000 rather than rejecting (or
    /// admitting) all traffic forever.
    pub fn new(max_concurrent: i64) -> Self {
        Self::builder().max_concurrent(max_concurrent).build()
    }

    pub fn builder() -> BackpressureControllerBuilder {
        BackpressureControllerBuilder {
            max_concurrent: DEFAULT_MAX_CONCURRENT as i64,
            high_load_log_interval: DEFAULT_HIGH_LOAD_LOG_INTERVAL,
        }
    }

    /// Try to take a slot
    ///
    /// # Errors
    ///
    /// Returns [`CapacityExceeded`] with a 5 second retry hint when every slot
    /// is in use.
    pub fn admit(&self) -> Result<Permit, CapacityExceeded> {
        let inner = &self.inner;
        let mut current = inner.active.load(Ordering::Acquire);

        loop {
            if current >= inner.max {
                inner.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    active = current,
                    max = inner.max,
                    retry_after_secs = RETRY_AFTER.as_secs(),
                    "Request rejected: concurrency limit reached"
                );
                return Err(CapacityExceeded {
                    active: current,
                    max: inner.max,
                    retry_after: RETRY_AFTER,
                });
            }

            match inner.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        inner.on_admitted(current + 1);

        Ok(Permit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Run `work` while holding a slot
    ///
    /// The slot is returned when `work` finishes or when the returned future is
    /// dropped before completion (timeout, client disconnect).
    pub async fn run<F, T>(&self, work: F) -> Result<T, CapacityExceeded>
    where
        F: Future<Output = T>,
    {
        let _permit = self.admit()?;
        Ok(work.await)
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.inner.max
    }

    pub fn state(&self) -> LoadState {
        LoadState::classify(self.active(), self.inner.max)
    }

    pub fn stats(&self) -> BackpressureStats {
        let active = self.active();
        BackpressureStats {
            active,
            max: self.inner.max,
            state: LoadState::classify(active, self.inner.max),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            high_load_warnings: self.inner.high_load_warnings.load(Ordering::Relaxed),
            recoveries: self.inner.recoveries.load(Ordering::Relaxed),
        }
    }
}

/// A held concurrency slot
///
/// The slot is released exactly once: either through [`Permit::release`] or
/// when the permit is dropped.
#[must_use = "dropping the permit releases the slot immediately"]
pub struct Permit {
    inner: Arc<Inner>,
}

impl Permit {
    /// Give the slot back
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let previous = self.inner.active.fetch_sub(1, Ordering::AcqRel);
        self.inner.on_released(previous - 1);
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("active", &self.inner.active.load(Ordering::Relaxed))
            .field("max", &self.inner.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_until_saturated() {
        let controller = BackpressureController::new(3);
        let permits: Vec<_> = (0..3).map(|_| controller.admit().unwrap()).collect();

        assert_eq!(controller.state(), LoadState::Saturated);
        let err = controller.admit().unwrap_err();
        assert_eq!(err.active, 3);
        assert_eq!(err.max, 3);
        assert_eq!(err.retry_after, Duration::from_secs(5));

        drop(permits);
        assert_eq!(controller.active(), 0);
    }

    #[test]
    fn test_release_makes_room() {
        let controller = BackpressureController::new(2);
        let first = controller.admit().unwrap();
        let _second = controller.admit().unwrap();
        assert!(controller.admit().is_err());

        first.release();
        assert_eq!(controller.active(), 1);
        assert!(controller.admit().is_ok());
    }

    #[test]
    fn test_non_positive_max_falls_back_to_default() {
        assert_eq!(BackpressureController::new(0).max(), DEFAULT_MAX_CONCURRENT);
        assert_eq!(BackpressureController::new(-5).max(), DEFAULT_MAX_CONCURRENT);
        assert_eq!(BackpressureController::new(7).max(), 7);
    }

    #[test]
    fn test_load_state_classification() {
        assert_eq!(LoadState::classify(0, 10), LoadState::Idle);
        assert_eq!(LoadState::classify(1, 10), LoadState::Normal);
        assert_eq!(LoadState::classify(7, 10), LoadState::Normal);
        assert_eq!(LoadState::classify(8, 10), LoadState::HighLoad);
        assert_eq!(LoadState::classify(9, 10), LoadState::HighLoad);
        assert_eq!(LoadState::classify(10, 10), LoadState::Saturated);
        assert_eq!(LoadState::classify(1, 1), LoadState::Saturated);
    }

    #[test]
    fn test_huge_ceiling_admits_without_overflow() {
        let controller = BackpressureController::new(i64::MAX);
        assert_eq!(controller.max(), i64::MAX as usize);

        let permit = controller.admit().unwrap();
        assert_eq!(controller.state(), LoadState::Normal);
        assert_eq!(controller.stats().high_load_warnings, 0);
        permit.release();
        assert_eq!(controller.active(), 0);

        let max = usize::MAX;
        assert_eq!(LoadState::classify(max / 10 * 9, max), LoadState::HighLoad);
        assert_eq!(LoadState::classify(max / 2, max), LoadState::Normal);
        assert_eq!(LoadState::classify(max, max), LoadState::Saturated);
    }

    #[test]
    fn test_rejections_are_counted() {
        let controller = BackpressureController::new(1);
        let _held = controller.admit().unwrap();
        for _ in 0..4 {
            assert!(controller.admit().is_err());
        }
        assert_eq!(controller.stats().rejected, 4);
    }

    #[test]
    fn test_high_load_warning_is_throttled() {
        let controller = BackpressureController::builder()
            .max_concurrent(10)
            .high_load_log_interval(Duration::from_secs(3600))
            .build();

        let mut held = Vec::new();
        for _ in 0..9 {
            held.push(controller.admit().unwrap());
        }
        // 8th and 9th admissions are both >= 80%, only one warning fires
        assert_eq!(controller.stats().high_load_warnings, 1);

        held.pop();
        held.push(controller.admit().unwrap());
        assert_eq!(controller.stats().high_load_warnings, 1);
    }

    #[test]
    fn test_high_load_warning_repeats_after_interval() {
        let controller = BackpressureController::builder()
            .max_concurrent(10)
            .high_load_log_interval(Duration::ZERO)
            .build();

        let mut held = Vec::new();
        for _ in 0..9 {
            held.push(controller.admit().unwrap());
        }
        assert_eq!(controller.stats().high_load_warnings, 2);
    }

    #[test]
    fn test_recovery_fires_once_per_episode() {
        let controller = BackpressureController::new(4);
        let mut held: Vec<_> = (0..4).map(|_| controller.admit().unwrap()).collect();

        // 3/4 and 2/4 are not below 50%
        held.pop();
        held.pop();
        assert_eq!(controller.stats().recoveries, 0);

        // 1/4 is below 50%
        held.pop();
        assert_eq!(controller.stats().recoveries, 1);

        // Further drops and admissions below the threshold stay quiet
        held.pop();
        let again = controller.admit().unwrap();
        drop(again);
        assert_eq!(controller.stats().recoveries, 1);
    }

    #[test]
    fn test_recovery_requires_saturation() {
        let controller = BackpressureController::new(4);
        let held: Vec<_> = (0..3).map(|_| controller.admit().unwrap()).collect();
        drop(held);
        assert_eq!(controller.stats().recoveries, 0);
    }

    #[test]
    fn test_clones_share_counter() {
        let controller = BackpressureController::new(2);
        let clone = controller.clone();
        let _a = controller.admit().unwrap();
        let _b = clone.admit().unwrap();
        assert!(controller.admit().is_err());
        assert_eq!(clone.active(), 2);
    }
}
