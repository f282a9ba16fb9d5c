//! Origin-keyed session pooling.
//!
//! The pool maps every origin to at most one live session or one
//! in-flight connection attempt. Concurrent callers for the same origin
//! share the in-flight attempt, so a burst of requests to a new origin
//! opens exactly one transport connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;

use crate::session::{Session, SessionConfig};
use crate::transport::{TlsTrust, Transport};
use crate::types::{ErrorKind, Origin, Result};

/// The shared in-flight connection attempt for one origin. The error
/// side is `Arc`ed so every waiter can observe the same failure.
type SharedConnect = Shared<BoxFuture<'static, std::result::Result<Arc<Session>, Arc<ErrorKind>>>>;

struct Entry {
    session_id: u64,
    pending: SharedConnect,
}

/// Maps origins to sessions, deduplicating concurrent connection
/// attempts and evicting entries whose session terminated.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    sessions: DashMap<Origin, Entry>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    next_session_id: AtomicU64,
}

impl SessionPool {
    /// Create a pool creating sessions over `transport` with `config`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                sessions: DashMap::new(),
                transport,
                config,
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    /// Return the session for `origin`, connecting one if absent.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Connect`] when the transport cannot establish
    /// the connection; the failed entry is evicted so the next call
    /// retries instead of replaying the failure.
    pub async fn get_session(
        &self,
        origin: &Origin,
        trust: Option<&TlsTrust>,
    ) -> Result<Arc<Session>> {
        loop {
            let (session_id, pending) = self.entry_for(origin, trust);

            match pending.await {
                Ok(session) => {
                    if session.status().is_connected() {
                        return Ok(session);
                    }
                    // the session died before its eviction watcher ran;
                    // drop the stale entry and connect anew
                    self.inner.evict(origin, session_id);
                }
                Err(err) => {
                    self.inner.evict(origin, session_id);
                    return Err(surface_connect_error(origin, &err));
                }
            }
        }
    }

    /// End every pooled session and clear the map.
    pub async fn end(&self) {
        let pendings: Vec<SharedConnect> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().pending.clone())
            .collect();
        self.inner.sessions.clear();

        for pending in pendings {
            if let Ok(session) = pending.await {
                session.end();
                session.closed().await;
            }
        }
    }

    /// The number of pooled entries (live sessions plus in-flight
    /// connection attempts).
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    fn entry_for(&self, origin: &Origin, trust: Option<&TlsTrust>) -> (u64, SharedConnect) {
        use dashmap::mapref::entry::Entry as MapEntry;

        match self.inner.sessions.entry(origin.clone()) {
            MapEntry::Occupied(entry) => (entry.get().session_id, entry.get().pending.clone()),
            MapEntry::Vacant(slot) => {
                let session_id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
                let pending = self.connect_future(origin.clone(), trust.cloned(), session_id);
                slot.insert(Entry {
                    session_id,
                    pending: pending.clone(),
                });
                (session_id, pending)
            }
        }
    }

    fn connect_future(
        &self,
        origin: Origin,
        trust: Option<TlsTrust>,
        session_id: u64,
    ) -> SharedConnect {
        let inner = Arc::downgrade(&self.inner);
        let transport = Arc::clone(&self.inner.transport);
        let config = self.inner.config.clone();

        async move {
            let session = Session::connect(
                transport.as_ref(),
                origin.clone(),
                trust.as_ref(),
                session_id,
                &config,
            )
            .await
            .map_err(Arc::new)?;

            // evict the entry once this session terminates, unless a
            // newer session already took its place
            let watched = Arc::clone(&session);
            tokio::spawn(async move {
                watched.closed().await;
                debug!(
                    "session #{} to {} terminated, evicting pool entry",
                    watched.id(),
                    watched.origin()
                );
                if let Some(inner) = inner.upgrade() {
                    inner.evict(watched.origin(), session_id);
                }
            });

            Ok(session)
        }
        .boxed()
        .shared()
    }
}

impl PoolInner {
    fn evict(&self, origin: &Origin, session_id: u64) {
        self.sessions
            .remove_if(origin, |_, entry| entry.session_id == session_id);
    }
}

/// Re-shape a shared connect failure into a per-caller error.
fn surface_connect_error(origin: &Origin, err: &ErrorKind) -> ErrorKind {
    match err {
        ErrorKind::Connect { origin, reason } => ErrorKind::Connect {
            origin: origin.clone(),
            reason: reason.clone(),
        },
        other => ErrorKind::Connect {
            origin: origin.clone(),
            reason: other.to_string(),
        },
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}
