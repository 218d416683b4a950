use bulwark::{BackpressureController, RatePolicy};
use bulwark_client::{CoordinationStore, MemoryStore};
use bulwark_server::{CacheLayer, CacheSettings, Metrics, RateLimiter};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn limiter_over(store: Arc<MemoryStore>) -> RateLimiter {
    RateLimiter::new(store, Arc::new(Metrics::new()))
}

#[tokio::test]
async fn test_six_calls_against_limit_of_five() {
    let limiter = limiter_over(Arc::new(MemoryStore::new()));
    let policy = RatePolicy::new(5, Duration::from_secs(60));

    let mut allowed = Vec::new();
    let mut last = None;
    for _ in 0..6 {
        let decision = limiter.check_and_consume("user:42", policy).await;
        allowed.push(decision.allowed);
        last = Some(decision);
    }

    assert_eq!(allowed, vec![true, true, true, true, true, false]);
    let retry = last.unwrap().retry_after.unwrap();
    assert!((1..=60).contains(&retry), "retry after {retry}");
}

#[tokio::test]
async fn test_new_call_admitted_after_window() {
    let limiter = limiter_over(Arc::new(MemoryStore::new()));
    let policy = RatePolicy::new(3, Duration::from_secs(60));
    let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

    for i in 0..3 {
        let at = start + Duration::from_secs(i);
        assert!(limiter.check_and_consume_at("user:1", policy, at).await.allowed);
    }
    assert!(
        !limiter
            .check_and_consume_at("user:1", policy, start + Duration::from_secs(5))
            .await
            .allowed
    );

    let later = start + Duration::from_secs(66);
    let decision = limiter.check_and_consume_at("user:1", policy, later).await;
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 2);
}

#[tokio::test]
async fn test_concurrent_checks_never_over_admit() {
    let limiter = limiter_over(Arc::new(MemoryStore::new()));
    let policy = RatePolicy::new(10, Duration::from_secs(60));
    let now = SystemTime::now();

    let decisions = join_all((0..50).map(|_| {
        let limiter = limiter.clone();
        async move { limiter.check_and_consume_at("shared", policy, now).await }
    }))
    .await;

    let admitted = decisions.iter().filter(|d| d.allowed).count();
    assert_eq!(admitted, 10);
}

#[tokio::test]
async fn test_concurrent_checks_across_tasks() {
    let store = Arc::new(MemoryStore::new());
    let limiter = limiter_over(store);
    let policy = RatePolicy::new(25, Duration::from_secs(60));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check_and_consume("spawned", policy).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 25);
}

#[tokio::test]
async fn test_forced_disconnect_both_sides() {
    let store = Arc::new(MemoryStore::new());
    let limiter = limiter_over(store.clone());
    let cache = CacheLayer::new(store.clone(), CacheSettings::default());
    let policy = RatePolicy::new(1, Duration::from_secs(60));

    cache.set("k", &"v", Duration::from_secs(60)).await;
    store.set_available(false);

    // Fail open on the limiter
    for _ in 0..5 {
        let decision = limiter.check_and_consume("user:1", policy).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, policy.limit);
    }
    // Always miss on the cache
    assert_eq!(cache.get::<String>("k").await, None);

    // Nothing was recorded while disconnected
    store.set_available(true);
    assert!(limiter.check_and_consume("user:1", policy).await.allowed);
    assert!(!limiter.check_and_consume("user:1", policy).await.allowed);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Variant {
    flag: bool,
    labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CachedEntity {
    id: u64,
    title: String,
    variant: Variant,
    parent: Option<Box<CachedEntity>>,
}

#[tokio::test]
async fn test_entity_round_trip_and_invalidation() {
    let store = Arc::new(MemoryStore::new());
    let cache = CacheLayer::new(store.clone(), CacheSettings::default());

    let entity = CachedEntity {
        id: 7,
        title: "seven".to_string(),
        variant: Variant {
            flag: false,
            labels: vec!["x".to_string(), "y".to_string()],
        },
        parent: Some(Box::new(CachedEntity {
            id: 1,
            title: "root".to_string(),
            variant: Variant {
                flag: true,
                labels: Vec::new(),
            },
            parent: None,
        })),
    };

    cache
        .set("entity:7:variant:false", &entity, Duration::from_secs(300))
        .await;
    cache
        .set("entity:7:variant:true", &entity, Duration::from_secs(300))
        .await;
    cache
        .set("entity:70:variant:false", &entity, Duration::from_secs(300))
        .await;

    assert_eq!(
        cache.get::<CachedEntity>("entity:7:variant:false").await,
        Some(entity.clone())
    );

    // Entity 7 changed: drop every variant, leave entity 70 alone
    assert_eq!(cache.invalidate_pattern("entity:7:*").await, 2);
    assert_eq!(cache.get::<CachedEntity>("entity:7:variant:false").await, None);
    assert_eq!(
        cache.get::<CachedEntity>("entity:70:variant:false").await,
        Some(entity)
    );
}

#[tokio::test]
async fn test_store_close_is_observable() {
    let store = Arc::new(MemoryStore::new());
    let cache = CacheLayer::new(store.clone(), CacheSettings::default());

    store.close().await;
    assert!(!store.is_healthy());
    assert!(!cache.health_status());
    assert_eq!(cache.invalidate_pattern("*").await, 0);
}

#[tokio::test]
async fn test_backpressure_around_async_work() {
    let controller = BackpressureController::new(2);

    let first = controller.admit().unwrap();
    let second = controller.admit().unwrap();
    let rejected = controller.admit().unwrap_err();
    assert_eq!(rejected.retry_after, Duration::from_secs(5));

    drop(first);
    let result = controller.run(async { 40 + 2 }).await.unwrap();
    assert_eq!(result, 42);

    second.release();
    assert_eq!(controller.active(), 0);
}
