//! One pooled transport connection to one origin.
//!
//! A [`Session`] owns the connection, an optional rate limiter and an
//! optional concurrency limiter, and mediates stream creation. It is
//! created and owned by the pool; callers only ever hold it behind an
//! `Arc`.

mod status;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error};
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::time::{sleep, Instant};

use crate::limits::{ConcurrencyLimiter, LimitConfig, RateLimiter};
use crate::transport::{
    CloseCause, Connection, RejectReason, RequestHead, ResponseHead, StreamTransport, TlsTrust,
    Transport,
};
use crate::types::{ErrorKind, Origin, Result};

pub use status::SessionStatus;

/// Per-session configuration, shared by every session the pool creates.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Close sessions with no stream activity for this long.
    /// `None` keeps idle sessions open.
    pub idle_timeout: Option<Duration>,
    /// Stream admission limits; each session builds its own limiters.
    pub limits: LimitConfig,
}

/// A pooled, reusable multiplexed connection to one origin.
pub struct Session {
    origin: Origin,
    id: u64,
    status: Mutex<SessionStatus>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    rate: Option<RateLimiter>,
    concurrency: Option<ConcurrencyLimiter>,
    last_activity: Mutex<Instant>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    /// Connect to `origin` and wrap the connection in a session.
    ///
    /// # Errors
    ///
    /// Returns the transport's connect error; the caller (the pool) must
    /// evict its entry in that case.
    pub(crate) async fn connect(
        transport: &dyn Transport,
        origin: Origin,
        trust: Option<&TlsTrust>,
        id: u64,
        config: &SessionConfig,
    ) -> Result<Arc<Self>> {
        let mut status = SessionStatus::ReadyToConnect;
        status.advance(SessionStatus::Connecting)?;

        let connection = match transport.connect(&origin, trust).await {
            Ok(connection) => connection,
            Err(err) => {
                let _ = status.advance(SessionStatus::Failed);
                debug!("session #{id} to {origin}: connect failed: {err}");
                return Err(err);
            }
        };
        status.advance(SessionStatus::Connected)?;
        debug!("session #{id} to {origin}: connected");

        let (closed_tx, _) = watch::channel(false);
        let session = Arc::new(Self {
            origin,
            id,
            status: Mutex::new(status),
            connection: Mutex::new(Some(Arc::clone(&connection))),
            rate: config.limits.rate_limiter()?,
            concurrency: config.limits.concurrency_limiter(),
            last_activity: Mutex::new(Instant::now()),
            closed_tx,
        });

        session.spawn_close_watcher(connection);
        if let Some(idle) = config.idle_timeout {
            session.spawn_idle_watchdog(idle);
        }

        Ok(session)
    }

    /// The origin this session is connected to.
    #[must_use]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Pool-assigned session identifier, for diagnostics.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The current lifecycle status.
    ///
    /// # Panics
    ///
    /// Panics if the status mutex is poisoned.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap()
    }

    /// Create a stream for one request/response exchange.
    ///
    /// Admission order is rate limit, then concurrency limit, then the
    /// transport, so an attempt that exceeds a local limit never reaches
    /// the transport.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::SessionUnusable`] if the session has terminated
    /// - [`ErrorKind::ThrottleTimeout`] / [`ErrorKind::AcquireTimeout`]
    ///   from the limiters
    /// - [`ErrorKind::StreamRejected`] from the transport; transient
    ///   rejections terminate this session and are marked retryable so
    ///   the caller can try again on a fresh one
    pub async fn create_stream(self: &Arc<Self>, head: RequestHead) -> Result<SessionStream> {
        if !self.status().is_connected() {
            return Err(self.unusable());
        }

        if let Some(rate) = &self.rate {
            rate.throttle().await?;
        }

        let permit = match &self.concurrency {
            Some(limiter) => Some(limiter.acquire().await?),
            None => None,
        };

        let connection = self
            .connection
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| self.unusable())?;
        self.touch();

        let mut stream = match connection.open_stream(head).await {
            Ok(stream) => stream,
            Err(reason) => return Err(self.classify_rejection(reason)),
        };

        // a stream that already carries an identifier is ready
        if stream.id().is_none() {
            if let Err(reason) = stream.ready().await {
                return Err(self.classify_rejection(reason));
            }
        }

        Ok(SessionStream {
            inner: stream,
            permit,
            session: Arc::downgrade(self),
            done: false,
        })
    }

    /// Actively close the session. Idempotent.
    pub fn end(&self) {
        self.end_with(false);
    }

    /// Resolves once the session has terminated.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn unusable(&self) -> ErrorKind {
        ErrorKind::SessionUnusable {
            origin: self.origin.clone(),
            status: self.status(),
        }
    }

    /// Transient rejections tear the session down so the next attempt
    /// gets a fresh one; everything else only fails the call.
    fn classify_rejection(&self, reason: RejectReason) -> ErrorKind {
        let retryable = reason.is_transient();
        if retryable {
            debug!(
                "session #{} to {}: transient stream rejection ({reason}), closing session",
                self.id, self.origin
            );
            self.end();
        }
        ErrorKind::StreamRejected { reason, retryable }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn end_with(&self, failed: bool) {
        {
            let mut status = self.status.lock().unwrap();
            if *status >= SessionStatus::Closing {
                return;
            }
            let _ = status.advance(SessionStatus::Closing);
        }

        if let Some(connection) = self.connection.lock().unwrap().take() {
            connection.close();
        }

        {
            let mut status = self.status.lock().unwrap();
            let _ = status.advance(if failed {
                SessionStatus::Failed
            } else {
                SessionStatus::Closed
            });
        }

        // send_replace stores the value even with no subscriber yet
        self.closed_tx.send_replace(true);
    }

    fn spawn_close_watcher(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            let cause = connection.closed().await;
            let Some(session) = session.upgrade() else {
                return;
            };
            match &cause {
                CloseCause::GoAway => debug!(
                    "session #{} to {}: the session has ended due to a goaway frame",
                    session.id, session.origin
                ),
                CloseCause::Error(err) => error!(
                    "session #{} to {}: session error: {err}",
                    session.id, session.origin
                ),
                CloseCause::Closed => debug!(
                    "session #{} to {}: closed by the transport",
                    session.id, session.origin
                ),
            }
            session.end_with(matches!(cause, CloseCause::Error(_)));
        });
    }

    fn spawn_idle_watchdog(self: &Arc<Self>, idle: Duration) {
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let elapsed = {
                    let Some(session) = session.upgrade() else {
                        return;
                    };
                    if session.status().is_terminal() {
                        return;
                    }
                    let elapsed = session.last_activity.lock().unwrap().elapsed();
                    elapsed
                };

                if elapsed >= idle {
                    if let Some(session) = session.upgrade() {
                        debug!(
                            "session #{} to {}: idle for {}ms, closing",
                            session.id,
                            session.origin,
                            elapsed.as_millis()
                        );
                        session.end();
                    }
                    return;
                }

                sleep(idle - elapsed).await;
            }
        });
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("origin", &self.origin)
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// One request/response exchange on a session.
///
/// Holds the session's concurrency slot until the exchange completes,
/// errors, aborts or the stream is dropped, whichever comes first; the
/// slot is released exactly once.
pub struct SessionStream {
    inner: Box<dyn StreamTransport>,
    permit: Option<OwnedSemaphorePermit>,
    session: Weak<Session>,
    done: bool,
}

impl SessionStream {
    /// The transport-assigned stream identifier, if any.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.inner.id()
    }

    /// Send the request body and close the sending side.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::StreamRejected`] on transport failure.
    pub async fn send_body(&mut self, body: Bytes) -> Result<()> {
        let result = self.inner.send_body(body).await;
        self.observe(result)
    }

    /// Await the response status and headers.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::StreamRejected`] on transport failure.
    pub async fn response(&mut self) -> Result<ResponseHead> {
        let result = self.inner.response().await;
        self.observe(result)
    }

    /// Await the complete response body. Completes the exchange and
    /// releases the concurrency slot.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::StreamRejected`] on transport failure.
    pub async fn body(&mut self) -> Result<Bytes> {
        let result = self.inner.body().await;
        let result = self.observe(result);
        self.finish();
        result
    }

    /// Abort the exchange and release the concurrency slot.
    pub fn abort(&mut self) {
        self.inner.abort();
        self.finish();
    }

    /// An `enhance your calm` on an established stream means the remote
    /// wants the client to back off as a whole; ending the session gets
    /// the next attempt a fresh one with fresh limits.
    fn observe<T>(&mut self, result: std::result::Result<T, RejectReason>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(reason) => {
                if reason == RejectReason::EnhanceYourCalm {
                    if let Some(session) = self.session.upgrade() {
                        debug!(
                            "session #{} to {}: stream asked to enhance its calm, closing session",
                            session.id, session.origin
                        );
                        session.end();
                    }
                }
                self.finish();
                Err(ErrorKind::StreamRejected {
                    retryable: reason.is_transient(),
                    reason,
                })
            }
        }
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.permit = None;
        if let Some(session) = self.session.upgrade() {
            session.touch();
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStream")
            .field("id", &self.id())
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
