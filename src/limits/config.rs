use std::num::NonZeroU32;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limits::{ConcurrencyLimiter, RateLimiter};
use crate::types::Result;

/// Default length of the rate limiting interval.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Per-session limit configuration.
///
/// Both limiters are off by default; a session only throttles or bounds
/// concurrency when the corresponding field is set. Every session built
/// from this configuration gets its own limiter instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LimitConfig {
    /// Maximum stream-creation attempts admitted per interval.
    /// `None` disables rate limiting.
    pub requests_per_interval: Option<NonZeroU32>,

    /// Length of the rate limiting interval.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// How long a throttled attempt may queue before failing.
    /// `None` waits indefinitely.
    #[serde(default, with = "humantime_serde")]
    pub throttle_timeout: Option<Duration>,

    /// Maximum concurrently in-flight streams per session.
    /// `None` disables concurrency limiting.
    pub max_concurrent_streams: Option<usize>,

    /// How long a stream attempt may queue for a free slot before failing.
    /// `None` waits indefinitely.
    #[serde(default, with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            requests_per_interval: None,
            interval: DEFAULT_INTERVAL,
            throttle_timeout: None,
            max_concurrent_streams: None,
            acquire_timeout: None,
        }
    }
}

impl LimitConfig {
    /// Shorthand for a limit of `requests` per second.
    #[must_use]
    pub fn per_second(requests: NonZeroU32) -> Self {
        Self {
            requests_per_interval: Some(requests),
            ..Self::default()
        }
    }

    /// Build the session's rate limiter, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured interval is invalid.
    pub fn rate_limiter(&self) -> Result<Option<RateLimiter>> {
        self.requests_per_interval
            .map(|capacity| RateLimiter::new(capacity, self.interval, self.throttle_timeout))
            .transpose()
    }

    /// Build the session's concurrency limiter, if one is configured.
    #[must_use]
    pub fn concurrency_limiter(&self) -> Option<ConcurrencyLimiter> {
        self.max_concurrent_streams
            .map(|max| ConcurrencyLimiter::new(max, self.acquire_timeout))
    }
}
