use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Coordination store unavailable")]
    Unavailable,

    #[error("Store client closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Timeout")]
    Timeout,

    #[error("Command error: {0}")]
    Command(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the failure means the store could not be reached
    ///
    /// Connectivity failures trigger reconnection in the client and
    /// degradation in the layers built on top of it.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable | StoreError::Closed | StoreError::Io(_) | StoreError::Timeout
        )
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            StoreError::Timeout
        } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            StoreError::Io(e.to_string())
        } else if e.kind() == redis::ErrorKind::TypeError {
            StoreError::Protocol(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
