//! Distributed sliding-window rate limiter
//!
//! Each tracking key owns one sorted set in the coordination store, scored by
//! request time in milliseconds. A check prunes, counts, records and refreshes
//! the TTL in one atomic batch, so concurrent instances observe a consistent,
//! non-decreasing count per key.
//!
//! The limiter fails open: when the store is unhealthy or a batch fails, the
//! request is admitted with the full budget and the failure is logged.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bulwark::{RatePolicy, WindowOutcome};
use bulwark_client::{Op, Reply, SharedStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics::Metrics;

pub const KEY_PREFIX: &str = "ratelimit:";

/// Decision returned for every check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix seconds at which the oldest counted request leaves the window
    pub reset_at: u64,
    /// Seconds to wait before retrying; only set when denied. A lower bound,
    /// since denied requests stay in the window too.
    pub retry_after: Option<u64>,
    /// The store could not be consulted and the request was let through
    #[serde(default)]
    pub fail_open: bool,
}

impl RateDecision {
    fn from_outcome(outcome: WindowOutcome, fail_open: bool) -> Self {
        Self {
            allowed: outcome.allowed,
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_at: outcome.reset_at_secs,
            retry_after: outcome.retry_after_secs,
            fail_open,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: SharedStore,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(store: SharedStore, metrics: Arc<Metrics>) -> Self {
        Self { store, metrics }
    }

    /// Record a request against `key` and decide whether it is admitted
    pub async fn check_and_consume(&self, key: &str, policy: RatePolicy) -> RateDecision {
        self.check_and_consume_at(key, policy, SystemTime::now())
            .await
    }

    pub async fn check_and_consume_at(
        &self,
        key: &str,
        policy: RatePolicy,
        now: SystemTime,
    ) -> RateDecision {
        let now_ms = unix_ms(now);
        if !self.store.is_healthy() {
            return self.fail_open(key, policy, now_ms, &StoreError::Unavailable);
        }

        let store_key = store_key(key);
        let ops = [
            Op::ZRemRangeByScore {
                key: store_key.clone(),
                below: policy.window_start_ms(now_ms),
            },
            Op::ZCard {
                key: store_key.clone(),
            },
            Op::ZAdd {
                key: store_key.clone(),
                score: now_ms,
                member: format!("{now_ms}-{:016x}", rand::random::<u64>()),
            },
            Op::Expire {
                key: store_key.clone(),
                ttl_secs: policy.ttl_secs(),
            },
            Op::ZOldest { key: store_key },
        ];

        let window = match self.store.execute(&ops).await {
            Ok(replies) => read_window(replies, 1, 4),
            Err(e) => Err(e),
        };

        match window {
            Ok((count, oldest)) => {
                let decision = RateDecision::from_outcome(policy.consume(count, oldest, now_ms), false);
                self.metrics.record_rate_decision(decision.allowed, false);
                if !decision.allowed {
                    debug!(
                        key = %key,
                        limit = decision.limit,
                        retry_after = decision.retry_after,
                        "Rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => self.fail_open(key, policy, now_ms, &e),
        }
    }

    /// Evaluate `key` without recording a request
    pub async fn peek(&self, key: &str, policy: RatePolicy) -> RateDecision {
        self.peek_at(key, policy, SystemTime::now()).await
    }

    pub async fn peek_at(&self, key: &str, policy: RatePolicy, now: SystemTime) -> RateDecision {
        let now_ms = unix_ms(now);
        if !self.store.is_healthy() {
            return RateDecision::from_outcome(policy.fail_open(now_ms), true);
        }

        let store_key = store_key(key);
        let ops = [
            Op::ZRemRangeByScore {
                key: store_key.clone(),
                below: policy.window_start_ms(now_ms),
            },
            Op::ZCard {
                key: store_key.clone(),
            },
            Op::ZOldest { key: store_key },
        ];

        let window = match self.store.execute(&ops).await {
            Ok(replies) => read_window(replies, 1, 2),
            Err(e) => Err(e),
        };

        match window {
            Ok((count, oldest)) => {
                RateDecision::from_outcome(policy.observe(count, oldest, now_ms), false)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit peek failed");
                RateDecision::from_outcome(policy.fail_open(now_ms), true)
            }
        }
    }

    /// Forget every request recorded for `key`
    ///
    /// Returns whether a window existed. Store failures are logged and
    /// reported as `false`.
    pub async fn reset(&self, key: &str) -> bool {
        match self.store.execute(&[Op::del(vec![store_key(key)])]).await {
            Ok(replies) => matches!(replies.first(), Some(Reply::Int(n)) if *n > 0),
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit reset failed");
                false
            }
        }
    }

    fn fail_open(&self, key: &str, policy: RatePolicy, now_ms: i64, cause: &StoreError) -> RateDecision {
        warn!(key = %key, error = %cause, "Rate limiter failing open");
        self.metrics.record_rate_decision(true, true);
        RateDecision::from_outcome(policy.fail_open(now_ms), true)
    }
}

pub fn store_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

/// Pull the member count and oldest score out of a window batch
fn read_window(
    replies: Vec<Reply>,
    count_at: usize,
    oldest_at: usize,
) -> Result<(u64, Option<i64>), StoreError> {
    let mut replies = replies.into_iter();
    let count = replies
        .nth(count_at)
        .ok_or_else(|| StoreError::Protocol("missing ZCARD reply".to_string()))?
        .int()?;
    let oldest = replies
        .nth(oldest_at - count_at - 1)
        .ok_or_else(|| StoreError::Protocol("missing ZRANGE reply".to_string()))?
        .into_scored()?;

    Ok((count.max(0) as u64, oldest.map(|(_, score)| score)))
}

fn unix_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
