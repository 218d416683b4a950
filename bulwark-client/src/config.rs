use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::state::ReconnectPolicy;

/// Connection settings for the coordination store
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: i64,
    pub tls: bool,
    /// Interval between liveness pings; `None` disables the heartbeat
    pub heartbeat: Option<Duration>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            tls: false,
            heartbeat: Some(Duration::from_secs(5)),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(StoreError::Config("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(StoreError::Config("port must be non-zero".to_string()));
        }
        if self.database < 0 {
            return Err(StoreError::Config(format!(
                "database index must not be negative, got {}",
                self.database
            )));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(StoreError::Config(
                "username requires a password".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection URL, credentials included
    pub fn url(&self) -> String {
        self.build_url(false)
    }

    /// Connection URL safe to log
    pub fn redacted_url(&self) -> String {
        self.build_url(true)
    }

    fn build_url(&self, redact: bool) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };

        let auth = match (&self.username, &self.password) {
            (_, Some(_)) if redact => "***@".to_string(),
            (Some(user), Some(pass)) => format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(pass)
            ),
            (None, Some(pass)) => format!(":{}@", urlencoding::encode(pass)),
            _ => String::new(),
        };

        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        format!("{scheme}://{auth}{host}:{}/{}", self.port, self.database)
    }
}
