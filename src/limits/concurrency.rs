use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::types::{ErrorKind, Result};

/// Bounds the number of concurrently in-flight stream-creation attempts on
/// one session.
///
/// Callers beyond the bound queue in arrival order; a released slot is
/// handed directly to the head of the queue. An optional wait bound turns
/// an over-long queue stay into an error instead of waiting forever.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    acquire_timeout: Option<Duration>,
}

impl ConcurrencyLimiter {
    /// Create a limiter admitting at most `max_concurrent` streams at once.
    #[must_use]
    pub fn new(max_concurrent: usize, acquire_timeout: Option<Duration>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            acquire_timeout,
        }
    }

    /// Acquire a stream slot, waiting in FIFO order when all slots are
    /// taken. The slot is released by dropping the returned permit.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::AcquireTimeout`] if a wait bound is configured
    /// and no slot frees up in time.
    ///
    /// # Panics
    ///
    /// Panics if the semaphore is closed, which never happens since the
    /// limiter never closes it.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();

        let permit = match self.acquire_timeout {
            Some(limit) => timeout(limit, acquire)
                .await
                .map_err(|_| ErrorKind::AcquireTimeout { waited: limit })?,
            None => acquire.await,
        };

        Ok(permit.expect("Semaphore was closed unexpectedly"))
    }

    /// The configured bound.
    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// The number of slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
