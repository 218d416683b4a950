//! Cache-aside layer over the coordination store
//!
//! The cache is never authoritative, so nothing here returns an error to the
//! caller: reads degrade to misses and writes to no-ops whenever the store is
//! unreachable. A connectivity failure also opens a cooldown window during
//! which the layer reports itself unhealthy and skips the store entirely,
//! even if the connection recovers sooner. Once the window has passed, health
//! follows the connection state again.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bulwark_client::{Op, Reply, SharedStore, StoreError};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Disabled caches behave as permanently unhealthy
    pub enabled: bool,
    pub default_ttl: Duration,
    pub codec: Codec,
    pub cooldown: Duration,
    pub slow_write_threshold: Duration,
    /// Keys per SCAN page and per DEL round trip
    pub batch_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(300),
            codec: Codec::Json,
            cooldown: Duration::from_secs(30),
            slow_write_threshold: Duration::from_millis(100),
            batch_size: 1000,
        }
    }
}

pub struct CacheLayer {
    store: SharedStore,
    settings: CacheSettings,
    degraded_until: Mutex<Option<Instant>>,
    metrics: Arc<Metrics>,
}

impl CacheLayer {
    pub fn new(store: SharedStore, settings: CacheSettings) -> Self {
        Self {
            store,
            settings,
            degraded_until: Mutex::new(None),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Whether the layer will currently talk to the store
    pub fn health_status(&self) -> bool {
        if !self.settings.enabled {
            return false;
        }

        {
            let mut degraded = self.degraded_until.lock();
            if let Some(until) = *degraded {
                if Instant::now() < until {
                    return false;
                }
                *degraded = None;
                info!("Cache degradation window ended");
            }
        }

        self.store.is_healthy()
    }

    /// Read a value; `None` on miss, on an undecodable entry, or when degraded
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.health_status() {
            self.metrics.record_cache_lookup(false);
            return None;
        }

        let bytes = match self
            .single(Op::get(key))
            .await
            .and_then(Reply::into_bytes)
        {
            Ok(bytes) => bytes,
            Err(e) => {
                self.on_store_error("get", key, &e);
                self.metrics.record_cache_lookup(false);
                return None;
            }
        };

        let Some(bytes) = bytes else {
            self.metrics.record_cache_lookup(false);
            return None;
        };

        match self.settings.codec.decode(&bytes) {
            Ok(value) => {
                self.metrics.record_cache_lookup(true);
                Some(value)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value failed to deserialize");
                self.metrics.record_cache_error();
                self.metrics.record_cache_lookup(false);
                None
            }
        }
    }

    /// Write a value with an explicit TTL; a no-op when degraded
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if !self.health_status() {
            return;
        }

        let bytes = match self.settings.codec.encode(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Value failed to serialize for cache");
                self.metrics.record_cache_error();
                return;
            }
        };

        let ttl_secs = ttl.as_secs().max(1);
        let started = Instant::now();
        let result = self.single(Op::set(key, bytes, ttl_secs)).await;
        let elapsed = started.elapsed();

        if let Err(e) = result {
            self.on_store_error("set", key, &e);
            return;
        }

        if elapsed > self.settings.slow_write_threshold {
            warn!(
                key = %key,
                duration_ms = elapsed.as_millis() as u64,
                "Slow cache write"
            );
            self.metrics.record_slow_write();
        }
    }

    /// Write a value with the configured default TTL
    pub async fn set_default<T: Serialize>(&self, key: &str, value: &T) {
        self.set(key, value, self.settings.default_ttl).await;
    }

    /// Remove one key; `false` when nothing was removed or the layer is degraded
    pub async fn delete(&self, key: &str) -> bool {
        if !self.health_status() {
            return false;
        }

        match self
            .single(Op::del(vec![key.to_string()]))
            .await
            .and_then(|reply| reply.int())
        {
            Ok(removed) => removed > 0,
            Err(e) => {
                self.on_store_error("delete", key, &e);
                false
            }
        }
    }

    /// Remove every key matching a glob pattern, returning how many went
    ///
    /// Keys are gathered with a full SCAN first and then deleted in batches,
    /// one round trip per batch. A failure part-way returns the count removed
    /// so far.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        if !self.health_status() {
            return 0;
        }

        let batch_size = self.settings.batch_size.max(1);
        let mut keys = BTreeSet::new();
        let mut cursor = 0;
        loop {
            let page = self
                .single(Op::scan(cursor, pattern, batch_size))
                .await
                .and_then(Reply::into_scan);
            match page {
                Ok((next, found)) => {
                    keys.extend(found);
                    if next == 0 {
                        break;
                    }
                    cursor = next;
                }
                Err(e) => {
                    self.on_store_error("scan", pattern, &e);
                    return 0;
                }
            }
        }

        let keys: Vec<String> = keys.into_iter().collect();
        let mut removed = 0u64;
        for batch in keys.chunks(batch_size) {
            match self
                .single(Op::del(batch.to_vec()))
                .await
                .and_then(|reply| reply.int())
            {
                Ok(n) => removed += n.max(0) as u64,
                Err(e) => {
                    self.on_store_error("invalidate", pattern, &e);
                    break;
                }
            }
        }

        self.metrics.record_invalidated(removed);
        info!(pattern = %pattern, matched = keys.len(), removed, "Cache invalidated");
        removed
    }

    /// Read through the cache, falling back to `loader` on a miss
    ///
    /// The loaded value is written back with `ttl`. Loader errors are
    /// returned as-is; cache failures only ever cost a reload.
    pub async fn get_or_load<T, E, F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let value = loader().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    async fn single(&self, op: Op) -> Result<Reply, StoreError> {
        self.store
            .execute(std::slice::from_ref(&op))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Protocol(format!("no reply to {}", op.name())))
    }

    fn on_store_error(&self, operation: &'static str, key: &str, error: &StoreError) {
        self.metrics.record_cache_error();

        if !error.is_connectivity() {
            warn!(operation, key = %key, error = %error, "Cache operation failed");
            return;
        }

        let mut degraded = self.degraded_until.lock();
        if degraded.is_none() {
            *degraded = Some(Instant::now() + self.settings.cooldown);
            warn!(
                operation,
                key = %key,
                error = %error,
                cooldown_secs = self.settings.cooldown.as_secs(),
                "Cache degraded, bypassing store"
            );
        } else {
            debug!(operation, key = %key, error = %error, "Cache operation failed while degraded");
        }
    }
}
