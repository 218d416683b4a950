//! Coordination store client for bulwark
//!
//! This crate provides the shared store the rate limiter and cache layer run
//! against: a self-healing Redis client that reconnects on its own and
//! reports its health without blocking callers, plus an in-memory store
//! with the same interface for single-node use and tests.

pub mod config;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod redis_store;
pub mod state;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use protocol::{Op, Reply};
pub use redis_store::RedisStore;
pub use state::{ConnectionEvent, ConnectionState, ConnectionStatus, LastError, ReconnectPolicy};
pub use store::{CoordinationStore, SharedStore};
