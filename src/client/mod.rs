//! Handler of request sending.
//!
//! This module defines two structs, [`Client`] and [`ClientBuilder`].
//! `Client` hands out request builders and owns the session pool;
//! `ClientBuilder` exposes a finer level of granularity for building
//! a `Client`.

use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method};
use typed_builder::TypedBuilder;
use url::Url;

use crate::limits::LimitConfig;
use crate::pool::SessionPool;
use crate::request::RequestBuilder;
use crate::response::Response;
use crate::session::{Session, SessionConfig};
use crate::transport::{H2Transport, TlsTrust, Transport};
use crate::types::{Origin, Result};

/// Builder for [`Client`].
///
/// See crate-level documentation for usage example.
#[derive(TypedBuilder, Debug, Clone)]
#[builder(field_defaults(default, setter(into)))]
pub struct ClientBuilder {
    /// Close sessions that stay idle for this long.
    ///
    /// Idle means no stream was created or completed on the session.
    /// `None` keeps idle sessions open until the remote closes them.
    idle_timeout: Option<Duration>,

    /// Per-session stream admission limits.
    ///
    /// Both the rate limiter and the concurrency limiter are off by
    /// default; see [`LimitConfig`].
    limits: LimitConfig,

    /// Total-request timeout applied to every request unless overridden
    /// per request.
    timeout: Option<Duration>,

    /// Response-wait timeout applied to every request unless overridden
    /// per request.
    response_timeout: Option<Duration>,

    /// Headers sent with every request. Per-request headers take
    /// precedence.
    headers: HeaderMap,

    /// Base URL for requests with a relative URL.
    base_url: Option<Url>,

    /// TLS trust anchors for `https` origins, overridable per request.
    trust: Option<TlsTrust>,

    /// The transport establishing connections; the `h2`-backed transport
    /// by default.
    transport: Option<Arc<dyn Transport>>,
}

impl Default for ClientBuilder {
    #[must_use]
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientBuilder {
    /// Instantiates a [`Client`].
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the configured rate limit interval is invalid.
    pub fn client(self) -> Result<Client> {
        // surface a bad rate limit at build time, not on the first request
        let _ = self.limits.rate_limiter()?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(H2Transport) as Arc<dyn Transport>);

        let pool = SessionPool::new(
            transport,
            SessionConfig {
                idle_timeout: self.idle_timeout,
                limits: self.limits,
            },
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                pool,
                headers: self.headers,
                base_url: self.base_url,
                trust: self.trust,
                timeout: self.timeout,
                response_timeout: self.response_timeout,
            }),
        })
    }
}

/// An HTTP/2 client sharing one session per origin across all requests.
///
/// Cheap to clone; clones share the same pool.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    pool: SessionPool,
    headers: HeaderMap,
    base_url: Option<Url>,
    trust: Option<TlsTrust>,
    timeout: Option<Duration>,
    response_timeout: Option<Duration>,
}

impl Client {
    /// Build a request with an explicit method.
    #[must_use]
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(
            self.inner.pool.clone(),
            method,
            url,
            self.inner.base_url.as_ref(),
            self.inner.headers.clone(),
            self.inner.timeout,
            self.inner.response_timeout,
            self.inner.trust.clone(),
        )
    }

    /// Build a `GET` request.
    #[must_use]
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Build a `POST` request.
    #[must_use]
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Build a `PUT` request.
    #[must_use]
    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Build a `DELETE` request.
    #[must_use]
    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Build a `HEAD` request.
    #[must_use]
    pub fn head(&self, url: &str) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Build an `OPTIONS` request.
    #[must_use]
    pub fn options(&self, url: &str) -> RequestBuilder {
        self.request(Method::OPTIONS, url)
    }

    /// Build a `PATCH` request.
    #[must_use]
    pub fn patch(&self, url: &str) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// The session for `origin`, connecting one if absent.
    ///
    /// # Errors
    ///
    /// Returns the transport's connect error.
    pub async fn session(&self, origin: &Origin) -> Result<Arc<Session>> {
        self.inner
            .pool
            .get_session(origin, self.inner.trust.as_ref())
            .await
    }

    /// The pool backing this client.
    #[must_use]
    pub fn pool(&self) -> &SessionPool {
        &self.inner.pool
    }

    /// End every pooled session.
    pub async fn end(&self) {
        self.inner.pool.end().await;
    }
}

/// A convenience function to send a single `GET` request.
///
/// For anything beyond a one-off request, build a [`Client`] and reuse it
/// so sessions are pooled.
///
/// # Errors
///
/// See [`ClientBuilder::client`] and [`RequestBuilder::send`].
pub async fn get(url: &str) -> Result<Response> {
    ClientBuilder::default().client()?.get(url).send().await
}
