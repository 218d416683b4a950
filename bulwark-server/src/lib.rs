//! # Bulwark Server
//!
//! Overload protection for a fleet of HTTP instances sharing one Redis.
//!
//! ## Purpose
//!
//! Every inbound request passes three layers before business logic runs:
//!
//! - **Backpressure**: an in-process cap on concurrent requests, answering
//!   `503` with `Retry-After: 5` when saturated
//! - **Rate limiting**: a sliding window per caller, coordinated through
//!   Redis so all instances share one budget, answering `429`
//! - **Caching**: a cache-aside layer business code reads through, which
//!   degrades to pass-through when Redis is unreachable
//!
//! Redis is never authoritative. When it is down the rate limiter admits
//! everything (fail open), the cache misses on every read, and the service
//! keeps serving while the client reconnects in the background.
//!
//! ## Quick Start
//!
//! ```bash
//! # Show all available options
//! bulwark --help
//!
//! # Against a local Redis, 100 requests per minute per caller
//! bulwark --http-port 8080 --rate-limit 100 --rate-window 60
//!
//! # Without Redis
//! bulwark --store memory
//!
//! # List all available environment variables
//! bulwark --list-env-vars
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  request ──▶ guard ──▶ BackpressureController ──▶ RateLimiter ──▶ handler
//!                                                       │              │
//!                                                       ▼              ▼
//!                                                CoordinationStore ◀── CacheLayer
//!                                                (Redis | memory)
//! ```
//!
//! ## Embedding
//!
//! Applications mount their own routes behind the guard:
//!
//! ```ignore
//! use bulwark_server::transport::{AppState, protect};
//!
//! let state = Arc::new(AppState::from_config(&config, store));
//! let app = protect(Router::new().route("/orders", get(list_orders)), state.clone())
//!     .with_state(state);
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod transport;


pub use cache::{CacheLayer, CacheSettings};
pub use codec::Codec;
pub use limiter::{RateDecision, RateLimiter};
pub use metrics::Metrics;
pub use policy::{RouteOverride, RoutePolicies};
