//! Per-route rate limit policies
//!
//! Routes are matched by longest path prefix on segment boundaries, so
//! `/api/login` covers `/api/login` and `/api/login/otp` but not
//! `/api/loginx`. Requests matching no override use the default policy.

use anyhow::{Context, Result, anyhow};
use bulwark::RatePolicy;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOverride {
    pub prefix: String,
    pub policy: RatePolicy,
}

/// Policy selected for a request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub policy: RatePolicy,
    /// Prefix of the matched override; windows are tracked per prefix so an
    /// override never shares a budget with the default policy
    pub scope: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct RoutePolicies {
    default: RatePolicy,
    // Longest prefix first
    overrides: Vec<RouteOverride>,
}

impl RoutePolicies {
    pub fn new(default: RatePolicy, mut overrides: Vec<RouteOverride>) -> Self {
        overrides.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { default, overrides }
    }

    pub fn default_policy(&self) -> RatePolicy {
        self.default
    }

    pub fn overrides(&self) -> &[RouteOverride] {
        &self.overrides
    }

    pub fn resolve(&self, path: &str) -> RouteMatch<'_> {
        self.overrides
            .iter()
            .find(|o| prefix_matches(&o.prefix, path))
            .map(|o| RouteMatch {
                policy: o.policy,
                scope: Some(o.prefix.as_str()),
            })
            .unwrap_or(RouteMatch {
                policy: self.default,
                scope: None,
            })
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Parse `PATH=LIMIT/WINDOW_SECS`, e.g. `/api/login=5/60`
pub fn parse_route_override(raw: &str) -> Result<RouteOverride> {
    let (prefix, budget) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid route limit '{raw}': expected PATH=LIMIT/WINDOW"))?;
    let (limit, window) = budget
        .split_once('/')
        .ok_or_else(|| anyhow!("Invalid route limit '{raw}': expected PATH=LIMIT/WINDOW"))?;

    let prefix = prefix.trim();
    if !prefix.starts_with('/') {
        return Err(anyhow!(
            "Invalid route limit '{raw}': path must start with '/'"
        ));
    }

    let limit: u32 = limit
        .trim()
        .parse()
        .with_context(|| format!("Invalid limit in route limit '{raw}'"))?;
    let window: u64 = window
        .trim()
        .parse()
        .with_context(|| format!("Invalid window in route limit '{raw}'"))?;
    if limit == 0 || window == 0 {
        return Err(anyhow!(
            "Invalid route limit '{raw}': limit and window must be positive"
        ));
    }

    Ok(RouteOverride {
        prefix: prefix.to_string(),
        policy: RatePolicy::new(limit, Duration::from_secs(window)),
    })
}
