//! Primitive operations understood by every coordination store
//!
//! A batch of [`Op`]s is submitted to [`CoordinationStore::execute`] and runs
//! as one atomic round trip. The store answers with one [`Reply`] per op, in
//! order.
//!
//! [`CoordinationStore::execute`]: crate::CoordinationStore::execute

use crate::error::{Result, StoreError};

/// Longest expiry a store will apply (about 68 years)
///
/// Redis rejects `EX`/`EXPIRE` values whose deadline overflows its clock, so
/// longer TTLs are clamped here rather than failing the command.
pub const MAX_TTL_SECS: u64 = i32::MAX as u64;

/// Clamp a TTL into the range every store accepts
pub fn clamp_ttl(ttl_secs: u64) -> u64 {
    ttl_secs.min(MAX_TTL_SECS)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Read a value
    Get { key: String },
    /// Write a value with an expiry
    Set {
        key: String,
        value: Vec<u8>,
        ttl_secs: u64,
    },
    /// Delete keys, replying with the number removed
    Del { keys: Vec<String> },
    /// One step of a cursor-based key scan
    Scan {
        cursor: u64,
        pattern: String,
        count: usize,
    },
    /// Drop sorted-set members scored strictly below `below`
    ZRemRangeByScore { key: String, below: i64 },
    /// Number of sorted-set members
    ZCard { key: String },
    /// Insert a sorted-set member
    ZAdd {
        key: String,
        score: i64,
        member: String,
    },
    /// Lowest-scored member and its score
    ZOldest { key: String },
    /// Refresh the expiry of a key
    Expire { key: String, ttl_secs: u64 },
    Ping,
}

impl Op {
    pub fn get(key: impl Into<String>) -> Self {
        Op::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: Vec<u8>, ttl_secs: u64) -> Self {
        Op::Set {
            key: key.into(),
            value,
            ttl_secs,
        }
    }

    pub fn del(keys: Vec<String>) -> Self {
        Op::Del { keys }
    }

    pub fn scan(cursor: u64, pattern: impl Into<String>, count: usize) -> Self {
        Op::Scan {
            cursor,
            pattern: pattern.into(),
            count,
        }
    }

    /// Check the op can be sent at all
    pub fn validate(&self) -> Result<()> {
        match self {
            Op::Del { keys } if keys.is_empty() => {
                Err(StoreError::Protocol("DEL needs at least one key".to_string()))
            }
            Op::Set { ttl_secs: 0, .. } => {
                Err(StoreError::Protocol("SET needs a positive TTL".to_string()))
            }
            Op::Scan { count: 0, .. } => {
                Err(StoreError::Protocol("SCAN needs a positive COUNT".to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Get { .. } => "GET",
            Op::Set { .. } => "SET",
            Op::Del { .. } => "DEL",
            Op::Scan { .. } => "SCAN",
            Op::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Op::ZCard { .. } => "ZCARD",
            Op::ZAdd { .. } => "ZADD",
            Op::ZOldest { .. } => "ZRANGE",
            Op::Expire { .. } => "EXPIRE",
            Op::Ping => "PING",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Pong,
    Int(i64),
    Bytes(Vec<u8>),
    Scan { cursor: u64, keys: Vec<String> },
    Scored(Option<(String, i64)>),
}

impl Reply {
    pub fn int(&self) -> Result<i64> {
        match self {
            Reply::Int(n) => Ok(*n),
            other => Err(unexpected("integer", other)),
        }
    }

    pub fn into_bytes(self) -> Result<Option<Vec<u8>>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Bytes(bytes) => Ok(Some(bytes)),
            other => Err(unexpected("bytes", &other)),
        }
    }

    pub fn into_scan(self) -> Result<(u64, Vec<String>)> {
        match self {
            Reply::Scan { cursor, keys } => Ok((cursor, keys)),
            other => Err(unexpected("scan page", &other)),
        }
    }

    pub fn into_scored(self) -> Result<Option<(String, i64)>> {
        match self {
            Reply::Scored(entry) => Ok(entry),
            other => Err(unexpected("scored member", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &Reply) -> StoreError {
    StoreError::Protocol(format!("expected {wanted} reply, got {got:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_unsendable_ops() {
        assert!(Op::del(Vec::new()).validate().is_err());
        assert!(Op::set("k", b"v".to_vec(), 0).validate().is_err());
        assert!(Op::scan(0, "*", 0).validate().is_err());

        assert!(Op::del(vec!["k".to_string()]).validate().is_ok());
        assert!(Op::set("k", b"v".to_vec(), 10).validate().is_ok());
        assert!(Op::Ping.validate().is_ok());
    }

    #[test]
    fn test_clamp_ttl() {
        assert_eq!(clamp_ttl(60), 60);
        assert_eq!(clamp_ttl(MAX_TTL_SECS), MAX_TTL_SECS);
        assert_eq!(clamp_ttl(u64::MAX), MAX_TTL_SECS);
    }

    #[test]
    fn test_reply_accessors() {
        assert_eq!(Reply::Int(3).int().unwrap(), 3);
        assert!(Reply::Nil.int().is_err());

        assert_eq!(Reply::Nil.into_bytes().unwrap(), None);
        assert_eq!(
            Reply::Bytes(b"x".to_vec()).into_bytes().unwrap(),
            Some(b"x".to_vec())
        );
        assert!(Reply::Int(1).into_bytes().is_err());

        let (cursor, keys) = Reply::Scan {
            cursor: 7,
            keys: vec!["a".into()],
        }
        .into_scan()
        .unwrap();
        assert_eq!(cursor, 7);
        assert_eq!(keys, vec!["a".to_string()]);

        assert_eq!(Reply::Scored(None).into_scored().unwrap(), None);
    }
}
