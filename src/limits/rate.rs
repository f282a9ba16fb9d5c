use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use tokio::time::timeout;

use crate::types::{ErrorKind, Result};

/// Token-bucket throttle bounding stream-creation attempts per interval.
///
/// The bucket refills one token every `interval / capacity` and bursts up
/// to `capacity`, so no more than `capacity` attempts are admitted per
/// rolling interval. An optional wait bound fails queued callers instead
/// of letting them wait indefinitely.
#[derive(Debug)]
pub struct RateLimiter {
    limiter: GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>,
    max_wait: Option<Duration>,
}

impl RateLimiter {
    /// Create a limiter admitting `capacity` attempts per `interval`.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidRateLimit`] if the per-token interval
    /// rounds down to zero.
    pub fn new(
        capacity: NonZeroU32,
        interval: Duration,
        max_wait: Option<Duration>,
    ) -> Result<Self> {
        let quota = Quota::with_period(interval / capacity.get())
            .ok_or(ErrorKind::InvalidRateLimit)?
            .allow_burst(capacity);

        Ok(Self {
            limiter: GovernorLimiter::direct(quota),
            max_wait,
        })
    }

    /// Wait for a token, bounded by the configured maximum wait.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ThrottleTimeout`] if no token became available
    /// within the wait bound.
    pub async fn throttle(&self) -> Result<()> {
        match self.max_wait {
            Some(limit) => timeout(limit, self.limiter.until_ready())
                .await
                .map_err(|_| ErrorKind::ThrottleTimeout { waited: limit }),
            None => {
                self.limiter.until_ready().await;
                Ok(())
            }
        }
    }

    /// Take a token if one is available right now.
    #[must_use]
    pub fn try_admit(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
