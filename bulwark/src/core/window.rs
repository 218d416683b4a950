//! Sliding-window admission arithmetic
//!
//! The distributed rate limiter keeps one sorted set per tracking key in the
//! coordination store. The store prunes and counts; this module decides.
//!
//! A sliding window looks back exactly `window` from `now` on every request,
//! so there is no boundary at which a client can spend two budgets back to
//! back (the weakness of fixed buckets).

use std::time::Duration;

/// Budget of `limit` requests per sliding `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub limit: u32,
    pub window: Duration,
}

/// Result of evaluating a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Budget for the window
    pub limit: u32,
    /// Requests still available in the window after this one
    pub remaining: u32,
    /// Unix seconds when the oldest counted request leaves the window
    pub reset_at_secs: u64,
    /// Seconds to wait before retrying (only set when rejected)
    ///
    /// A lower bound: it covers the oldest counted request only. Rejected
    /// requests are counted too, so a caller that keeps retrying can still be
    /// over budget once this much time has passed.
    pub retry_after_secs: Option<u64>,
}

impl RatePolicy {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// TTL to attach to the window key; never zero so the key is not deleted
    /// outright by the store
    pub fn ttl_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }

    /// Lowest score still inside the window at `now_ms`
    pub fn window_start_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.window_ms())
    }

    /// Decide a request that is being recorded
    ///
    /// # Parameters
    ///
    /// - `count_before`: members in the window before this request was added
    /// - `oldest_ms`: score of the oldest member still in the window
    /// - `now_ms`: current time in Unix milliseconds
    pub fn consume(&self, count_before: u64, oldest_ms: Option<i64>, now_ms: i64) -> WindowOutcome {
        let limit = u64::from(self.limit);
        let allowed = count_before < limit;
        let remaining = limit.saturating_sub(count_before.saturating_add(1));

        self.outcome(allowed, remaining, oldest_ms, now_ms)
    }

    /// Decide without recording (status queries)
    pub fn observe(&self, count: u64, oldest_ms: Option<i64>, now_ms: i64) -> WindowOutcome {
        let limit = u64::from(self.limit);
        let allowed = count < limit;
        let remaining = limit.saturating_sub(count);

        self.outcome(allowed, remaining, oldest_ms, now_ms)
    }

    /// Outcome reported when the store could not be consulted
    ///
    /// The request is admitted with the full budget reported as remaining.
    pub fn fail_open(&self, now_ms: i64) -> WindowOutcome {
        WindowOutcome {
            allowed: true,
            limit: self.limit,
            remaining: self.limit,
            reset_at_secs: ceil_secs(now_ms.saturating_add(self.window_ms())),
            retry_after_secs: None,
        }
    }

    fn outcome(&self, allowed: bool, remaining: u64, oldest_ms: Option<i64>, now_ms: i64) -> WindowOutcome {
        let expires_ms = oldest_ms
            .unwrap_or(now_ms)
            .saturating_add(self.window_ms());

        let retry_after_secs = if allowed {
            None
        } else {
            let wait_ms = expires_ms.saturating_sub(now_ms).max(0);
            let max_wait = self.window.as_secs().max(1);
            Some(ceil_secs(wait_ms).clamp(1, max_wait))
        };

        WindowOutcome {
            allowed,
            limit: self.limit,
            remaining: remaining.min(u64::from(self.limit)) as u32,
            reset_at_secs: ceil_secs(expires_ms),
            retry_after_secs,
        }
    }
}

fn ceil_secs(ms: i64) -> u64 {
    let ms = ms.max(0) as u64;
    ms.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn per_minute(limit: u32) -> RatePolicy {
        RatePolicy::new(limit, Duration::from_secs(60))
    }

    #[test]
    fn test_huge_window_saturates() {
        let policy = RatePolicy::new(1, Duration::MAX);
        assert_eq!(policy.window_ms(), i64::MAX);
        assert_eq!(policy.window_start_ms(NOW), NOW - i64::MAX);

        let outcome = policy.consume(1, Some(NOW), NOW);
        assert!(!outcome.allowed);
        assert!(outcome.retry_after_secs.unwrap() >= 1);
    }

    #[test]
    fn test_first_request_in_empty_window() {
        let outcome = per_minute(5).consume(0, Some(NOW), NOW);
        assert!(outcome.allowed);
        assert_eq!(outcome.limit, 5);
        assert_eq!(outcome.remaining, 4);
        assert_eq!(outcome.retry_after_secs, None);
        assert_eq!(outcome.reset_at_secs, (NOW as u64 + 60_000) / 1000);
    }

    #[test]
    fn test_last_slot_then_rejection() {
        let policy = per_minute(5);

        let last = policy.consume(4, Some(NOW - 10_000), NOW);
        assert!(last.allowed);
        assert_eq!(last.remaining, 0);

        let over = policy.consume(5, Some(NOW - 10_000), NOW);
        assert!(!over.allowed);
        assert_eq!(over.remaining, 0);
        assert_eq!(over.retry_after_secs, Some(50));
    }

    #[test]
    fn test_retry_after_rounds_up_and_is_at_least_one() {
        let policy = per_minute(1);

        let outcome = policy.consume(1, Some(NOW - 59_999), NOW);
        assert_eq!(outcome.retry_after_secs, Some(1));

        let outcome = policy.consume(1, Some(NOW - 58_500), NOW);
        assert_eq!(outcome.retry_after_secs, Some(2));

        // Oldest member already on the edge
        let outcome = policy.consume(1, Some(NOW - 60_000), NOW);
        assert_eq!(outcome.retry_after_secs, Some(1));
    }

    #[test]
    fn test_retry_after_never_exceeds_window() {
        let policy = per_minute(1);
        let outcome = policy.consume(3, Some(NOW + 5_000), NOW);
        assert_eq!(outcome.retry_after_secs, Some(60));
    }

    #[test]
    fn test_observe_does_not_count_current_request() {
        let policy = per_minute(5);

        let outcome = policy.observe(0, None, NOW);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 5);

        let outcome = policy.observe(3, Some(NOW - 1_000), NOW);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 2);

        let outcome = policy.observe(5, Some(NOW - 1_000), NOW);
        assert!(!outcome.allowed);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(outcome.retry_after_secs, Some(59));
    }

    #[test]
    fn test_fail_open_reports_full_budget() {
        let outcome = per_minute(10).fail_open(NOW);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 10);
        assert_eq!(outcome.retry_after_secs, None);
    }

    #[test]
    fn test_zero_limit_rejects_everything() {
        let outcome = per_minute(0).consume(0, None, NOW);
        assert!(!outcome.allowed);
        assert_eq!(outcome.remaining, 0);
    }

    #[test]
    fn test_window_start_and_ttl() {
        let policy = RatePolicy::new(5, Duration::from_secs(60));
        assert_eq!(policy.window_start_ms(NOW), NOW - 60_000);
        assert_eq!(policy.ttl_secs(), 60);

        let sub_second = RatePolicy::new(5, Duration::from_millis(500));
        assert_eq!(sub_second.ttl_secs(), 1);
    }
}
