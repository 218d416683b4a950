use bulwark_client::{
    ConnectionStatus, CoordinationStore, MemoryStore, Op, Reply, StoreError,
};
use std::time::Duration;

#[tokio::test]
async fn test_set_get_del() {
    let store = MemoryStore::new();

    let replies = store
        .execute(&[
            Op::set("greeting", b"hello".to_vec(), 60),
            Op::get("greeting"),
            Op::get("missing"),
        ])
        .await
        .unwrap();
    assert_eq!(replies[0], Reply::Ok);
    assert_eq!(replies[1], Reply::Bytes(b"hello".to_vec()));
    assert_eq!(replies[2], Reply::Nil);

    let replies = store
        .execute(&[Op::del(vec!["greeting".into(), "missing".into()])])
        .await
        .unwrap();
    assert_eq!(replies[0], Reply::Int(1));
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_values_expire() {
    let store = MemoryStore::new();
    store
        .execute(&[Op::set("short", b"1".to_vec(), 2)])
        .await
        .unwrap();

    tokio::time::advance(Duration::from_millis(1900)).await;
    assert!(store.contains_key("short"));

    tokio::time::advance(Duration::from_millis(200)).await;
    assert!(!store.contains_key("short"));
    let replies = store.execute(&[Op::get("short")]).await.unwrap();
    assert_eq!(replies[0], Reply::Nil);
}

#[tokio::test]
async fn test_huge_ttls_do_not_overflow() {
    let store = MemoryStore::new();

    let replies = store
        .execute(&[
            Op::set("forever", b"1".to_vec(), u64::MAX),
            Op::ZAdd {
                key: "window".into(),
                score: 1,
                member: "m".into(),
            },
            Op::Expire {
                key: "window".into(),
                ttl_secs: u64::MAX,
            },
        ])
        .await
        .unwrap();
    assert_eq!(replies[0], Reply::Ok);
    assert_eq!(replies[2], Reply::Int(1));
    assert!(store.contains_key("forever"));
    assert!(store.contains_key("window"));
}

#[tokio::test]
async fn test_sorted_set_window_ops() {
    let store = MemoryStore::new();
    let key = "ratelimit:user:1".to_string();

    for (score, member) in [(1000, "a"), (2000, "b"), (3000, "c")] {
        store
            .execute(&[Op::ZAdd {
                key: key.clone(),
                score,
                member: member.to_string(),
            }])
            .await
            .unwrap();
    }

    let replies = store
        .execute(&[
            Op::ZRemRangeByScore {
                key: key.clone(),
                below: 2000,
            },
            Op::ZCard { key: key.clone() },
            Op::ZOldest { key: key.clone() },
            Op::Expire {
                key: key.clone(),
                ttl_secs: 60,
            },
        ])
        .await
        .unwrap();

    assert_eq!(replies[0], Reply::Int(1));
    assert_eq!(replies[1], Reply::Int(2));
    assert_eq!(replies[2], Reply::Scored(Some(("b".to_string(), 2000))));
    assert_eq!(replies[3], Reply::Int(1));
}

#[tokio::test]
async fn test_wrong_type_is_a_command_error() {
    let store = MemoryStore::new();
    store
        .execute(&[Op::set("plain", b"v".to_vec(), 60)])
        .await
        .unwrap();

    let err = store
        .execute(&[Op::ZCard {
            key: "plain".to_string(),
        }])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Command(_)));
    assert!(!err.is_connectivity());
}

#[tokio::test]
async fn test_scan_visits_every_matching_key() {
    let store = MemoryStore::new();
    let mut ops = Vec::new();
    for i in 0..250 {
        ops.push(Op::set(format!("cache:item:{i}"), b"x".to_vec(), 60));
    }
    ops.push(Op::set("other:1", b"x".to_vec(), 60));
    store.execute(&ops).await.unwrap();

    let mut cursor = 0;
    let mut found = Vec::new();
    loop {
        let reply = store
            .execute(&[Op::scan(cursor, "cache:item:*", 100)])
            .await
            .unwrap()
            .remove(0);
        let (next, keys) = reply.into_scan().unwrap();
        found.extend(keys);
        if next == 0 {
            break;
        }
        cursor = next;
    }

    found.sort();
    found.dedup();
    assert_eq!(found.len(), 250);
    assert!(found.iter().all(|k| k.starts_with("cache:item:")));
}

#[tokio::test]
async fn test_unavailable_fails_fast_and_recovers() {
    let store = MemoryStore::new();
    assert!(store.is_healthy());

    store.set_available(false);
    assert!(!store.is_healthy());
    let state = store.state();
    assert_eq!(state.status, ConnectionStatus::Reconnecting);
    assert_eq!(state.reconnect_attempts, 1);
    assert_eq!(
        store.execute(&[Op::Ping]).await.unwrap_err(),
        StoreError::Unavailable
    );

    store.set_available(false);
    assert_eq!(store.state().reconnect_attempts, 2);

    store.set_available(true);
    let state = store.state();
    assert!(state.healthy);
    assert_eq!(state.status, ConnectionStatus::Ready);
    assert_eq!(state.reconnect_attempts, 0);
    assert_eq!(store.execute(&[Op::Ping]).await.unwrap(), vec![Reply::Pong]);
}

#[tokio::test]
async fn test_close_is_terminal() {
    let store = MemoryStore::new();
    store.close().await;

    assert_eq!(store.state().status, ConnectionStatus::Closed);
    store.set_available(true);
    assert!(!store.is_healthy());
    assert_eq!(
        store.execute(&[Op::Ping]).await.unwrap_err(),
        StoreError::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_latency_is_applied() {
    let store = MemoryStore::new();
    store.set_latency(Duration::from_millis(150));

    let started = tokio::time::Instant::now();
    store.execute(&[Op::Ping]).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
}
