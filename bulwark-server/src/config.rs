//! Server configuration and CLI argument parsing
//!
//! Every option can be given on the command line or through a `BULWARK_`
//! environment variable. Configuration is read once at startup.
//!
//! # Configuration Priority
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables
//! 3. Default values (lowest priority)
//!
//! # Example Usage
//!
//! ```bash
//! # Redis-backed, 50 requests per 30 seconds, stricter login route
//! bulwark --rate-limit 50 --rate-window 30 --route-limit /api/login=5/60
//!
//! # Using environment variables
//! export BULWARK_STORE_HOST=redis.internal
//! export BULWARK_ROUTE_LIMITS=/api/login=5/60,/api/search=20/10
//! bulwark
//!
//! # Single instance without Redis
//! bulwark --store memory
//! ```

use std::time::Duration;

use anyhow::{Result, anyhow};
use bulwark::RatePolicy;
use bulwark_client::StoreConfig;
use clap::Parser;

use crate::cache::CacheSettings;
use crate::codec::Codec;
use crate::policy::{RouteOverride, RoutePolicies, parse_route_override};

#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub rate: RateConfig,
    pub keys: KeyConfig,
    /// Maximum in-flight requests; non-positive values fall back to the default
    pub max_concurrent: i64,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub kind: StoreKind,
    pub client: StoreConfig,
}

#[derive(Debug, Clone)]
pub struct RateConfig {
    pub default: RatePolicy,
    pub routes: Vec<RouteOverride>,
}

impl RateConfig {
    pub fn policies(&self) -> RoutePolicies {
        RoutePolicies::new(self.default, self.routes.clone())
    }
}

#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub salt: String,
    pub trust_forwarded: bool,
}

/// Backing coordination store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Shared Redis server, for multi-instance deployments
    Redis,
    /// Process-local store, for a single instance or development
    Memory,
}

impl std::str::FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(StoreKind::Redis),
            "memory" => Ok(StoreKind::Memory),
            _ => Err(anyhow!(
                "Invalid store type: {}. Valid options are: redis, memory",
                s
            )),
        }
    }
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(
    name = "bulwark",
    about = "Overload protection service",
    long_about = "Distributed rate limiting, a degradable cache layer and concurrency backpressure in front of an HTTP service.\n\nEnvironment variables with BULWARK_ prefix are supported. CLI arguments take precedence over environment variables."
)]
pub struct Args {
    // HTTP
    #[arg(
        long,
        value_name = "HOST",
        help = "HTTP host",
        default_value = "127.0.0.1",
        env = "BULWARK_HTTP_HOST"
    )]
    pub http_host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "HTTP port",
        default_value_t = 8080,
        env = "BULWARK_HTTP_PORT"
    )]
    pub http_port: u16,

    // Coordination store
    #[arg(
        long,
        value_name = "TYPE",
        help = "Store type: redis, memory",
        default_value = "redis",
        env = "BULWARK_STORE"
    )]
    pub store: StoreKind,
    #[arg(
        long,
        value_name = "HOST",
        help = "Redis host",
        default_value = "127.0.0.1",
        env = "BULWARK_STORE_HOST"
    )]
    pub store_host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "Redis port",
        default_value_t = 6379,
        env = "BULWARK_STORE_PORT"
    )]
    pub store_port: u16,
    #[arg(long, value_name = "USER", help = "Redis username", env = "BULWARK_STORE_USERNAME")]
    pub store_username: Option<String>,
    #[arg(
        long,
        value_name = "PASSWORD",
        help = "Redis password",
        env = "BULWARK_STORE_PASSWORD",
        hide_env_values = true
    )]
    pub store_password: Option<String>,
    #[arg(
        long,
        value_name = "INDEX",
        help = "Redis database index",
        default_value_t = 0,
        env = "BULWARK_STORE_DB"
    )]
    pub store_db: i64,
    #[arg(long, help = "Connect to Redis over TLS", env = "BULWARK_STORE_TLS")]
    pub store_tls: bool,
    #[arg(
        long,
        value_name = "SECS",
        help = "Heartbeat interval in seconds (0 disables)",
        default_value_t = 5,
        env = "BULWARK_STORE_HEARTBEAT"
    )]
    pub store_heartbeat: u64,

    // Cache
    #[arg(
        long,
        value_name = "BOOL",
        help = "Enable the cache layer",
        default_value_t = true,
        action = clap::ArgAction::Set,
        env = "BULWARK_CACHE_ENABLED"
    )]
    pub cache_enabled: bool,
    #[arg(
        long,
        value_name = "SECS",
        help = "Default cache TTL in seconds",
        default_value_t = 300,
        env = "BULWARK_CACHE_TTL"
    )]
    pub cache_ttl: u64,
    #[arg(
        long,
        value_name = "CODEC",
        help = "Cache value encoding: json, msgpack",
        default_value = "json",
        env = "BULWARK_CACHE_CODEC"
    )]
    pub cache_codec: Codec,
    #[arg(
        long,
        value_name = "SECS",
        help = "Seconds the cache stays bypassed after a connectivity failure",
        default_value_t = 30,
        env = "BULWARK_CACHE_COOLDOWN"
    )]
    pub cache_cooldown: u64,
    #[arg(
        long,
        value_name = "MS",
        help = "Warn about cache writes slower than this (milliseconds)",
        default_value_t = 100,
        env = "BULWARK_CACHE_SLOW_THRESHOLD"
    )]
    pub cache_slow_threshold: u64,
    #[arg(
        long,
        value_name = "N",
        help = "Keys per scan page and per delete during invalidation",
        default_value_t = 1000,
        env = "BULWARK_CACHE_BATCH_SIZE"
    )]
    pub cache_batch_size: usize,

    // Rate limiting
    #[arg(
        long,
        value_name = "N",
        help = "Default requests allowed per window",
        default_value_t = 100,
        env = "BULWARK_RATE_LIMIT"
    )]
    pub rate_limit: u32,
    #[arg(
        long,
        value_name = "SECS",
        help = "Default window length in seconds",
        default_value_t = 60,
        env = "BULWARK_RATE_WINDOW"
    )]
    pub rate_window: u64,
    #[arg(
        long = "route-limit",
        value_name = "PATH=LIMIT/WINDOW",
        help = "Per-route override, repeatable (e.g. /api/login=5/60)",
        value_delimiter = ',',
        env = "BULWARK_ROUTE_LIMITS"
    )]
    pub route_limits: Vec<String>,
    #[arg(
        long,
        value_name = "SALT",
        help = "Salt for anonymous tracking key hashes",
        default_value = "",
        env = "BULWARK_KEY_SALT",
        hide_env_values = true
    )]
    pub key_salt: String,
    #[arg(
        long,
        help = "Use the first X-Forwarded-For entry as the client address",
        env = "BULWARK_TRUST_FORWARDED"
    )]
    pub trust_forwarded: bool,

    // Backpressure
    #[arg(
        long,
        value_name = "N",
        help = "Maximum concurrent requests",
        default_value_t = 1000,
        allow_negative_numbers = true,
        env = "BULWARK_MAX_CONCURRENT"
    )]
    pub max_concurrent: i64,

    // General options
    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "BULWARK_LOG_LEVEL"
    )]
    pub log_level: String,

    // Utility options
    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,
}

impl Config {
    /// Build configuration from environment variables and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if a value fails validation (zero limit or window,
    /// malformed route override, zero batch size, bad store settings).
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        Self::from_args(args)
    }

    pub fn from_args(args: Args) -> Result<Self> {
        let routes = args
            .route_limits
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(parse_route_override)
            .collect::<Result<Vec<_>>>()?;

        let heartbeat = (args.store_heartbeat > 0).then(|| Duration::from_secs(args.store_heartbeat));

        let config = Config {
            http: HttpConfig {
                host: args.http_host,
                port: args.http_port,
            },
            store: StoreSettings {
                kind: args.store,
                client: StoreConfig {
                    host: args.store_host,
                    port: args.store_port,
                    username: args.store_username,
                    password: args.store_password,
                    database: args.store_db,
                    tls: args.store_tls,
                    heartbeat,
                    ..Default::default()
                },
            },
            cache: CacheSettings {
                enabled: args.cache_enabled,
                default_ttl: Duration::from_secs(args.cache_ttl),
                codec: args.cache_codec,
                cooldown: Duration::from_secs(args.cache_cooldown),
                slow_write_threshold: Duration::from_millis(args.cache_slow_threshold),
                batch_size: args.cache_batch_size,
            },
            rate: RateConfig {
                default: RatePolicy::new(args.rate_limit, Duration::from_secs(args.rate_window)),
                routes,
            },
            keys: KeyConfig {
                salt: args.key_salt,
                trust_forwarded: args.trust_forwarded,
            },
            max_concurrent: args.max_concurrent,
            log_level: args.log_level,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.rate.default.limit == 0 {
            return Err(anyhow!("--rate-limit must be positive"));
        }
        if self.rate.default.window.is_zero() {
            return Err(anyhow!("--rate-window must be positive"));
        }
        if self.cache.batch_size == 0 {
            return Err(anyhow!("--cache-batch-size must be positive"));
        }
        if self.cache.default_ttl.is_zero() {
            return Err(anyhow!("--cache-ttl must be positive"));
        }
        if self.store.kind == StoreKind::Redis {
            self.store.client.validate()?;
        }
        Ok(())
    }

    /// Print all available environment variables and their descriptions
    fn print_env_vars() {
        println!("Bulwark Environment Variables");
        println!("=============================");
        println!();
        println!("All environment variables use the BULWARK_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("HTTP Configuration:");
        println!("  BULWARK_HTTP_HOST=<host>              HTTP host [default: 127.0.0.1]");
        println!("  BULWARK_HTTP_PORT=<port>              HTTP port [default: 8080]");
        println!();

        println!("Store Configuration:");
        println!("  BULWARK_STORE=<type>                  Store type: redis, memory [default: redis]");
        println!("  BULWARK_STORE_HOST=<host>             Redis host [default: 127.0.0.1]");
        println!("  BULWARK_STORE_PORT=<port>             Redis port [default: 6379]");
        println!("  BULWARK_STORE_USERNAME=<user>         Redis username");
        println!("  BULWARK_STORE_PASSWORD=<password>     Redis password");
        println!("  BULWARK_STORE_DB=<index>              Redis database index [default: 0]");
        println!("  BULWARK_STORE_TLS=true|false          Connect over TLS [default: false]");
        println!(
            "  BULWARK_STORE_HEARTBEAT=<secs>        Heartbeat interval, 0 disables [default: 5]"
        );
        println!();

        println!("Cache Configuration:");
        println!("  BULWARK_CACHE_ENABLED=true|false      Enable the cache layer [default: true]");
        println!("  BULWARK_CACHE_TTL=<secs>              Default TTL [default: 300]");
        println!("  BULWARK_CACHE_CODEC=<codec>           json, msgpack [default: json]");
        println!(
            "  BULWARK_CACHE_COOLDOWN=<secs>         Bypass period after a failure [default: 30]"
        );
        println!(
            "  BULWARK_CACHE_SLOW_THRESHOLD=<ms>     Slow write warning threshold [default: 100]"
        );
        println!(
            "  BULWARK_CACHE_BATCH_SIZE=<n>          Keys per invalidation batch [default: 1000]"
        );
        println!();

        println!("Rate Limit Configuration:");
        println!("  BULWARK_RATE_LIMIT=<n>                Requests per window [default: 100]");
        println!("  BULWARK_RATE_WINDOW=<secs>            Window length [default: 60]");
        println!(
            "  BULWARK_ROUTE_LIMITS=<list>           Comma-separated PATH=LIMIT/WINDOW overrides"
        );
        println!("  BULWARK_KEY_SALT=<salt>               Salt for anonymous key hashes");
        println!(
            "  BULWARK_TRUST_FORWARDED=true|false    Trust X-Forwarded-For [default: false]"
        );
        println!();

        println!("General Configuration:");
        println!("  BULWARK_MAX_CONCURRENT=<n>            Maximum concurrent requests [default: 1000]");
        println!(
            "  BULWARK_LOG_LEVEL=<level>             Log level: error, warn, info, debug, trace [default: info]"
        );
        println!();

        println!("Examples:");
        println!("  # Stricter limit on the login route");
        println!("  export BULWARK_ROUTE_LIMITS=/api/login=5/60");
        println!();
        println!("  # Run server (CLI args override env vars)");
        println!("  bulwark --rate-limit 200  # Will use 200, not BULWARK_RATE_LIMIT");
    }
}
