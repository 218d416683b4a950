//! Tracking-key derivation
//!
//! Authenticated callers are tracked by their stable identity. Anonymous
//! callers are tracked by a salted SHA-256 of their origin address, so the
//! coordination store never holds raw addresses while a single source still
//! cannot exceed its budget.

use sha2::{Digest, Sha256};
use std::net::IpAddr;

const UNKNOWN_ORIGIN: &str = "unknown";
// 16 bytes of digest keeps keys short and collisions negligible
const DIGEST_BYTES: usize = 16;

/// Derives rate-limit tracking keys
///
/// # Example
///
/// ```
/// use bulwark::KeyDeriver;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let deriver = KeyDeriver::new("pepper").trust_forwarded(true);
///
/// assert_eq!(deriver.derive(Some("42"), None, None), "user:42");
///
/// let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
/// let key = deriver.derive(None, Some(" 203.0.113.9 , 10.0.0.1"), Some(peer));
/// assert!(key.starts_with("anon:"));
/// assert!(!key.contains("203.0.113.9"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct KeyDeriver {
    salt: String,
    trust_forwarded: bool,
}

impl KeyDeriver {
    pub fn new(salt: impl Into<String>) -> Self {
        Self {
            salt: salt.into(),
            trust_forwarded: false,
        }
    }

    /// Honor the forwarded-address header (deployments behind a reverse proxy)
    pub fn trust_forwarded(mut self, trust: bool) -> Self {
        self.trust_forwarded = trust;
        self
    }

    /// Build the tracking key for a request
    ///
    /// # Parameters
    ///
    /// - `identity`: authenticated identity, if any
    /// - `forwarded_for`: raw value of the forwarded-address header
    /// - `peer`: transport-layer address
    pub fn derive(
        &self,
        identity: Option<&str>,
        forwarded_for: Option<&str>,
        peer: Option<IpAddr>,
    ) -> String {
        if let Some(id) = identity.map(str::trim).filter(|id| !id.is_empty()) {
            return format!("user:{id}");
        }

        let forwarded = if self.trust_forwarded {
            forwarded_for.and_then(first_forwarded)
        } else {
            None
        };

        match (forwarded, peer) {
            (Some(origin), _) => format!("anon:{}", self.digest(origin)),
            (None, Some(addr)) => format!("anon:{}", self.digest(&addr.to_string())),
            (None, None) => format!("anon:{UNKNOWN_ORIGIN}"),
        }
    }

    fn digest(&self, origin: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b":");
        hasher.update(origin.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..DIGEST_BYTES])
    }
}

/// First entry of a forwarded-address chain, trimmed
pub fn first_forwarded(header: &str) -> Option<&str> {
    header
        .split(',')
        .next()
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
}
