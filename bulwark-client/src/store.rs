use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{Op, Reply};
use crate::state::ConnectionState;

/// A shared key-value and sorted-set store used to coordinate instances
///
/// Implementations must run each batch passed to [`execute`](Self::execute)
/// atomically and must never block the caller waiting for connectivity:
/// when the store cannot be reached the call fails fast with a connectivity
/// error (see [`StoreError::is_connectivity`](crate::StoreError::is_connectivity)).
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Run a batch of ops as one atomic unit, returning one reply per op
    async fn execute(&self, ops: &[Op]) -> Result<Vec<Reply>>;

    /// Whether the last connectivity event was a successful connect
    fn is_healthy(&self) -> bool;

    /// Snapshot of the connection state
    fn state(&self) -> ConnectionState;

    /// Shut the client down; later calls fail with `StoreError::Closed`
    async fn close(&self);
}

pub type SharedStore = Arc<dyn CoordinationStore>;
