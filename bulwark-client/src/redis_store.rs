//! Self-healing Redis client
//!
//! A supervisor task owns the connection lifecycle. It connects in the
//! background, and whenever a command or heartbeat reports a connectivity
//! failure it drops the connection and reconnects with a linear backoff
//! (`min(attempt * 50ms, 2s)` by default), forever, until the client is
//! closed. Commands never wait for a connection: while none is available they
//! fail immediately with [`StoreError::Unavailable`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use redis::Value;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::protocol::{Op, Reply, clamp_ttl};
use crate::state::{ConnectionEvent, ConnectionState, Transition};
use crate::store::CoordinationStore;

pub struct RedisStore {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    config: StoreConfig,
    state: Mutex<ConnectionState>,
    /// Live connection tagged with the generation it was opened in
    conn: RwLock<Option<(u64, MultiplexedConnection)>>,
    generation: AtomicU64,
    lost: Notify,
    shutdown: watch::Sender<bool>,
}

impl RedisStore {
    /// Create the client and start connecting in the background
    ///
    /// Returns as soon as the configuration is validated; the first
    /// connection attempt runs on a spawned task. Must be called from within
    /// a Tokio runtime.
    pub fn connect(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let client = redis::Client::open(config.url())
            .map_err(|e| StoreError::Config(e.to_string()))?;

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(ConnectionState::new()),
            conn: RwLock::new(None),
            generation: AtomicU64::new(0),
            lost: Notify::new(),
            shutdown,
        });

        let mut tasks = vec![tokio::spawn(supervise(
            Arc::clone(&shared),
            client,
            shared.shutdown.subscribe(),
        ))];

        if let Some(interval) = shared.config.heartbeat {
            tasks.push(tokio::spawn(heartbeat(
                Arc::clone(&shared),
                interval,
                shared.shutdown.subscribe(),
            )));
        }

        info!(
            url = %shared.config.redacted_url(),
            "Coordination store client started"
        );

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn execute(&self, ops: &[Op]) -> Result<Vec<Reply>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        for op in ops {
            op.validate()?;
        }
        if self.shared.is_closed() {
            return Err(StoreError::Closed);
        }

        let (generation, mut conn) = self.shared.current().ok_or(StoreError::Unavailable)?;

        let result = match timeout(
            self.shared.config.command_timeout,
            run_pipeline(&mut conn, ops),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        if let Err(e) = &result {
            if e.is_connectivity() {
                self.shared.connection_lost(generation, e);
            } else {
                debug!(error = %e, ops = ops.len(), "Store command failed");
            }
        }

        result
    }

    fn is_healthy(&self) -> bool {
        self.shared.state.lock().healthy
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.lock().clone()
    }

    async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        self.shared.conn.write().take();
        self.shared.record(ConnectionEvent::Close);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Store background task ended abnormally");
            }
        }

        info!("Coordination store client closed");
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn current(&self) -> Option<(u64, MultiplexedConnection)> {
        self.conn.read().clone()
    }

    fn record(&self, event: ConnectionEvent) {
        let transition = self.state.lock().apply(&event);
        if let Transition::Applied { from, to } = transition {
            if from != to {
                debug!(
                    from = from.as_str(),
                    to = to.as_str(),
                    "Store connection state changed"
                );
            }
        }
    }

    /// Drop the connection of `generation` and wake the supervisor
    ///
    /// Failures reported against an older connection are ignored, so a burst
    /// of failing in-flight commands triggers a single reconnect.
    fn connection_lost(&self, generation: u64, cause: &StoreError) {
        {
            let mut conn = self.conn.write();
            match conn.as_ref() {
                Some((current, _)) if *current == generation => *conn = None,
                _ => return,
            }
        }

        error!(error = %cause, "Lost connection to coordination store");
        self.record(ConnectionEvent::Error(cause.to_string()));
        self.lost.notify_one();
    }
}

async fn supervise(
    shared: Arc<Shared>,
    client: redis::Client,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        info!(
            attempt = attempt + 1,
            url = %shared.config.redacted_url(),
            "Connecting to coordination store"
        );
        shared.record(ConnectionEvent::Connect);
        let connecting = timeout(
            shared.config.connect_timeout,
            client.get_multiplexed_async_connection(),
        );

        let outcome = tokio::select! {
            _ = shutdown.changed() => break,
            outcome = connecting => outcome,
        };

        match outcome {
            Ok(Ok(conn)) => {
                let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
                *shared.conn.write() = Some((generation, conn));
                shared.record(ConnectionEvent::Ready);

                if attempt == 0 {
                    info!("Connected to coordination store");
                } else {
                    info!(attempts = attempt, "Reconnected to coordination store");
                }
                attempt = 0;

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = shared.lost.notified() => {}
                }
            }
            Ok(Err(e)) => {
                let e = StoreError::from(e);
                error!(error = %e, "Coordination store connection failed");
                shared.record(ConnectionEvent::Error(e.to_string()));
            }
            Err(_) => {
                error!(
                    timeout_ms = shared.config.connect_timeout.as_millis() as u64,
                    "Coordination store connection timed out"
                );
                shared.record(ConnectionEvent::Error("connect timed out".to_string()));
            }
        }

        attempt = attempt.saturating_add(1);
        let delay = shared.config.reconnect.delay(attempt);
        shared.record(ConnectionEvent::Reconnecting { attempt, delay });
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to coordination store"
        );

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.conn.write().take();
    debug!("Store supervisor stopped");
}

async fn heartbeat(shared: Arc<Shared>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let Some((generation, mut conn)) = shared.current() else {
            continue;
        };

        let result = match timeout(
            shared.config.command_timeout,
            run_pipeline(&mut conn, &[Op::Ping]),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        };

        if let Err(e) = result {
            warn!(error = %e, "Store heartbeat failed");
            if e.is_connectivity() {
                shared.connection_lost(generation, &e);
            }
        }
    }
}

async fn run_pipeline(conn: &mut MultiplexedConnection, ops: &[Op]) -> Result<Vec<Reply>> {
    let pipe = build_pipeline(ops);
    let values: Vec<Value> = pipe.query_async(conn).await?;
    parse_replies(ops, values)
}

fn build_pipeline(ops: &[Op]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    if ops.len() > 1 {
        pipe.atomic();
    }

    for op in ops {
        match op {
            Op::Get { key } => {
                pipe.cmd("GET").arg(key);
            }
            Op::Set {
                key,
                value,
                ttl_secs,
            } => {
                pipe.cmd("SET")
                    .arg(key)
                    .arg(value.as_slice())
                    .arg("EX")
                    .arg(clamp_ttl(*ttl_secs));
            }
            Op::Del { keys } => {
                pipe.cmd("DEL").arg(keys.as_slice());
            }
            Op::Scan {
                cursor,
                pattern,
                count,
            } => {
                pipe.cmd("SCAN")
                    .arg(*cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(*count);
            }
            Op::ZRemRangeByScore { key, below } => {
                pipe.cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg("-inf")
                    .arg(format!("({below}"));
            }
            Op::ZCard { key } => {
                pipe.cmd("ZCARD").arg(key);
            }
            Op::ZAdd { key, score, member } => {
                pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
            }
            Op::ZOldest { key } => {
                pipe.cmd("ZRANGE").arg(key).arg(0).arg(0).arg("WITHSCORES");
            }
            Op::Expire { key, ttl_secs } => {
                pipe.cmd("EXPIRE").arg(key).arg(clamp_ttl(*ttl_secs));
            }
            Op::Ping => {
                pipe.cmd("PING");
            }
        }
    }

    pipe
}

fn parse_replies(ops: &[Op], values: Vec<Value>) -> Result<Vec<Reply>> {
    if values.len() != ops.len() {
        return Err(StoreError::Protocol(format!(
            "expected {} replies, got {}",
            ops.len(),
            values.len()
        )));
    }

    ops.iter()
        .zip(values)
        .map(|(op, value)| parse_reply(op, &value))
        .collect()
}

fn parse_reply(op: &Op, value: &Value) -> Result<Reply> {
    let reply = match op {
        Op::Get { .. } => match redis::from_redis_value::<Option<Vec<u8>>>(value)? {
            Some(bytes) => Reply::Bytes(bytes),
            None => Reply::Nil,
        },
        Op::Set { .. } => Reply::Ok,
        Op::Del { .. }
        | Op::ZRemRangeByScore { .. }
        | Op::ZCard { .. }
        | Op::ZAdd { .. }
        | Op::Expire { .. } => Reply::Int(redis::from_redis_value(value)?),
        Op::Scan { .. } => {
            let (cursor, keys): (u64, Vec<String>) = redis::from_redis_value(value)?;
            Reply::Scan { cursor, keys }
        }
        Op::ZOldest { .. } => {
            let flat: Vec<String> = redis::from_redis_value(value)?;
            Reply::Scored(parse_scored(&flat)?)
        }
        Op::Ping => Reply::Pong,
    };
    Ok(reply)
}

/// `ZRANGE .. WITHSCORES` answers `[member, score]`, scores as decimal text
fn parse_scored(flat: &[String]) -> Result<Option<(String, i64)>> {
    match flat {
        [] => Ok(None),
        [member, score, ..] => {
            let score: f64 = score
                .parse()
                .map_err(|_| StoreError::Protocol(format!("invalid score: {score}")))?;
            Ok(Some((member.clone(), score as i64)))
        }
        [_] => Err(StoreError::Protocol(
            "scored reply is missing its score".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConnectionStatus;

    fn unreachable_config() -> StoreConfig {
        StoreConfig {
            // Nothing listens on port 1
            port: 1,
            heartbeat: None,
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_replies_per_op() {
        let ops = vec![
            Op::get("a"),
            Op::get("b"),
            Op::ZCard { key: "z".into() },
            Op::Scan {
                cursor: 0,
                pattern: "*".into(),
                count: 10,
            },
            Op::ZOldest { key: "z".into() },
            Op::Ping,
        ];
        let values = vec![
            Value::BulkString(b"hello".to_vec()),
            Value::Nil,
            Value::Int(4),
            Value::Array(vec![
                Value::BulkString(b"17".to_vec()),
                Value::Array(vec![Value::BulkString(b"k1".to_vec())]),
            ]),
            Value::Array(vec![
                Value::BulkString(b"1700000000000-ab".to_vec()),
                Value::BulkString(b"1700000000000".to_vec()),
            ]),
            Value::SimpleString("PONG".to_string()),
        ];

        let replies = parse_replies(&ops, values).unwrap();
        assert_eq!(replies[0], Reply::Bytes(b"hello".to_vec()));
        assert_eq!(replies[1], Reply::Nil);
        assert_eq!(replies[2], Reply::Int(4));
        assert_eq!(
            replies[3],
            Reply::Scan {
                cursor: 17,
                keys: vec!["k1".to_string()]
            }
        );
        assert_eq!(
            replies[4],
            Reply::Scored(Some(("1700000000000-ab".to_string(), 1_700_000_000_000)))
        );
        assert_eq!(replies[5], Reply::Pong);
    }

    #[test]
    fn test_parse_replies_length_mismatch() {
        let err = parse_replies(&[Op::Ping, Op::Ping], vec![Value::Okay]).unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
    }

    #[test]
    fn test_parse_scored_empty_set() {
        assert_eq!(parse_scored(&[]).unwrap(), None);
        assert!(parse_scored(&["m".to_string()]).is_err());
        assert!(parse_scored(&["m".to_string(), "nan?".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_commands_fail_fast_while_disconnected() {
        let store = RedisStore::connect(unreachable_config()).unwrap();

        let started = tokio::time::Instant::now();
        let err = store.execute(&[Op::Ping]).await.unwrap_err();
        assert_eq!(err, StoreError::Unavailable);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!store.is_healthy());

        store.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_attempts_accumulate() {
        let store = RedisStore::connect(unreachable_config()).unwrap();

        let mut attempts = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            attempts = store.state().reconnect_attempts;
            if attempts >= 2 {
                break;
            }
        }
        assert!(attempts >= 2, "expected retries, saw {attempts}");
        assert!(store.state().last_error.is_some());

        store.close().await;
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let store = RedisStore::connect(unreachable_config()).unwrap();
        store.close().await;

        let state = store.state();
        assert_eq!(state.status, ConnectionStatus::Closed);
        assert!(!state.healthy);
        assert_eq!(
            store.execute(&[Op::Ping]).await.unwrap_err(),
            StoreError::Closed
        );
    }

    #[tokio::test]
    async fn test_invalid_ops_rejected_before_sending() {
        let store = RedisStore::connect(unreachable_config()).unwrap();
        let err = store.execute(&[Op::del(Vec::new())]).await.unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
        store.close().await;
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_every_connect_attempt_is_logged() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = RedisStore::connect(unreachable_config()).unwrap();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.state().reconnect_attempts >= 1
                && logs.contents().contains("attempt=2")
            {
                break;
            }
        }
        store.close().await;

        let output = logs.contents();
        assert!(output.contains("Connecting to coordination store"), "{output}");
        assert!(output.contains("attempt=1"), "{output}");
        assert!(output.contains("attempt=2"), "{output}");
        assert!(output.contains("redis://127.0.0.1:1/0"), "{output}");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StoreConfig {
            host: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            RedisStore::connect(config),
            Err(StoreError::Config(_))
        ));
    }
}
