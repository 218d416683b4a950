//! In-process coordination store
//!
//! Implements the same op set as the Redis client against a local map, for
//! single-instance deployments and tests. Availability can be toggled at
//! runtime to exercise degradation paths without a real server.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::protocol::{Op, Reply, clamp_ttl};
use crate::state::{ConnectionEvent, ConnectionState, ReconnectPolicy};
use crate::store::CoordinationStore;

enum Value {
    Bytes(Vec<u8>),
    Sorted(SortedSet),
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) -> bool {
        match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.ordered.remove(&(previous, member.to_string()));
                self.ordered.insert((score, member.to_string()));
                false
            }
            None => {
                self.ordered.insert((score, member.to_string()));
                true
            }
        }
    }

    fn remove_below(&mut self, below: i64) -> usize {
        let keep = self.ordered.split_off(&(below, String::new()));
        let removed = std::mem::replace(&mut self.ordered, keep);
        for (_, member) in &removed {
            self.scores.remove(member);
        }
        removed.len()
    }

    fn first(&self) -> Option<(String, i64)> {
        self.ordered
            .first()
            .map(|(score, member)| (member.clone(), *score))
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    latency: Mutex<Duration>,
    reconnect: ReconnectPolicy,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store that is immediately connected
    pub fn new() -> Self {
        let mut state = ConnectionState::new();
        state.apply(&ConnectionEvent::Connect);
        state.apply(&ConnectionEvent::Ready);

        Self {
            entries: Mutex::new(HashMap::new()),
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Simulate losing or regaining the connection
    ///
    /// Data is kept while unavailable, as a real server would keep it.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        if available {
            state.apply(&ConnectionEvent::Connect);
            state.apply(&ConnectionEvent::Ready);
        } else {
            state.apply(&ConnectionEvent::Error(
                "store marked unavailable".to_string(),
            ));
            let attempt = state.reconnect_attempts.saturating_add(1);
            state.apply(&ConnectionEvent::Reconnecting {
                attempt,
                delay: self.reconnect.delay(attempt),
            });
        }
        debug!(available, "Memory store availability changed");
    }

    /// Delay every batch by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .is_some_and(|e| e.is_live(now))
    }

    fn apply(entries: &mut HashMap<String, Entry>, op: &Op, now: Instant) -> Result<Reply> {
        let reply = match op {
            Op::Get { key } => match live(entries, key, now) {
                Some(Entry {
                    value: Value::Bytes(bytes),
                    ..
                }) => Reply::Bytes(bytes.clone()),
                Some(_) => return Err(wrong_type()),
                None => Reply::Nil,
            },
            Op::Set {
                key,
                value,
                ttl_secs,
            } => {
                entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Bytes(value.clone()),
                        expires_at: deadline(now, *ttl_secs),
                    },
                );
                Reply::Ok
            }
            Op::Del { keys } => {
                let mut removed = 0;
                for key in keys {
                    if live(entries, key, now).is_some() {
                        entries.remove(key);
                        removed += 1;
                    }
                }
                Reply::Int(removed)
            }
            Op::Scan {
                cursor,
                pattern,
                count,
            } => {
                let mut keys: Vec<&String> = entries
                    .iter()
                    .filter(|(_, e)| e.is_live(now))
                    .map(|(k, _)| k)
                    .collect();
                keys.sort();

                let start = (*cursor as usize).min(keys.len());
                let end = start.saturating_add(*count).min(keys.len());
                let page = keys[start..end]
                    .iter()
                    .filter(|k| glob_match(pattern, k))
                    .map(|k| (*k).clone())
                    .collect();
                let next = if end >= keys.len() { 0 } else { end as u64 };

                Reply::Scan {
                    cursor: next,
                    keys: page,
                }
            }
            Op::ZRemRangeByScore { key, below } => {
                let (removed, emptied) = match live(entries, key, now) {
                    Some(Entry {
                        value: Value::Sorted(set),
                        ..
                    }) => {
                        let removed = set.remove_below(*below);
                        (removed, set.len() == 0)
                    }
                    Some(_) => return Err(wrong_type()),
                    None => (0, false),
                };
                // Redis drops sorted sets once they are empty
                if emptied {
                    entries.remove(key);
                }
                Reply::Int(removed as i64)
            }
            Op::ZCard { key } => match live(entries, key, now) {
                Some(Entry {
                    value: Value::Sorted(set),
                    ..
                }) => Reply::Int(set.len() as i64),
                Some(_) => return Err(wrong_type()),
                None => Reply::Int(0),
            },
            Op::ZAdd { key, score, member } => {
                if live(entries, key, now).is_none() {
                    entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::Sorted(SortedSet::default()),
                            expires_at: None,
                        },
                    );
                }
                match entries.get_mut(key) {
                    Some(Entry {
                        value: Value::Sorted(set),
                        ..
                    }) => Reply::Int(i64::from(set.insert(member, *score))),
                    _ => return Err(wrong_type()),
                }
            }
            Op::ZOldest { key } => match live(entries, key, now) {
                Some(Entry {
                    value: Value::Sorted(set),
                    ..
                }) => Reply::Scored(set.first()),
                Some(_) => return Err(wrong_type()),
                None => Reply::Scored(None),
            },
            Op::Expire { key, ttl_secs } => match live(entries, key, now) {
                Some(entry) => {
                    entry.expires_at = deadline(now, *ttl_secs);
                    Reply::Int(1)
                }
                None => Reply::Int(0),
            },
            Op::Ping => Reply::Pong,
        };
        Ok(reply)
    }
}

/// Look up a key, evicting it first if it has expired
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

/// Expiry instant for a TTL; past the clock's range the key never expires
fn deadline(now: Instant, ttl_secs: u64) -> Option<Instant> {
    now.checked_add(Duration::from_secs(clamp_ttl(ttl_secs)))
}

fn wrong_type() -> StoreError {
    StoreError::Command(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn execute(&self, ops: &[Op]) -> Result<Vec<Reply>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if !self.is_healthy() {
            return Err(StoreError::Unavailable);
        }
        for op in ops {
            op.validate()?;
        }

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        ops.iter()
            .map(|op| Self::apply(&mut entries, op, now))
            .collect()
    }

    fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.state.lock().apply(&ConnectionEvent::Close);
        debug!("Memory store closed");
    }
}

/// Redis-style glob matching: `*`, `?`, `[abc]`, `[^a-z]` and `\` escapes
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
            continue;
        }
        if pi < p.len() {
            if let Some(next) = match_one(&p, pi, t[ti]) {
                pi = next;
                ti += 1;
                continue;
            }
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match the token at `pi` against `c`, returning the index past the token
fn match_one(p: &[char], pi: usize, c: char) -> Option<usize> {
    match p[pi] {
        '?' => Some(pi + 1),
        '\\' if pi + 1 < p.len() => (p[pi + 1] == c).then_some(pi + 2),
        '[' => {
            let mut i = pi + 1;
            let negate = i < p.len() && p[i] == '^';
            if negate {
                i += 1;
            }

            let mut matched = false;
            while i < p.len() && p[i] != ']' {
                if p[i] == '\\' && i + 1 < p.len() {
                    matched |= p[i + 1] == c;
                    i += 2;
                } else if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
                    let (lo, hi) = if p[i] <= p[i + 2] {
                        (p[i], p[i + 2])
                    } else {
                        (p[i + 2], p[i])
                    };
                    matched |= lo <= c && c <= hi;
                    i += 3;
                } else {
                    matched |= p[i] == c;
                    i += 1;
                }
            }

            // An unterminated class runs to the end of the pattern
            let next = if i < p.len() { i + 1 } else { i };
            (matched != negate).then_some(next)
        }
        literal => (literal == c).then_some(pi + 1),
    }
}
