//! The wire-level transport boundary.
//!
//! The core of the crate never touches HTTP/2 framing. It talks to a
//! [`Transport`] which hands out [`Connection`]s, which in turn hand out
//! [`StreamTransport`]s, one per request/response exchange. Termination
//! and readiness are surfaced as futures rather than event listeners, so
//! there is nothing to unsubscribe on teardown.
//!
//! [`H2Transport`] implements the family on top of the `h2` crate; tests
//! substitute scripted implementations.

mod h2;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::types::{Origin, Result};

pub use self::h2::H2Transport;

/// DER-encoded root certificates to trust when connecting to a `https`
/// origin. Loading certificates from disk is the caller's business.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsTrust {
    /// DER-encoded root certificates.
    pub roots: Vec<Vec<u8>>,
}

impl TlsTrust {
    /// Trust the given DER-encoded root certificate.
    #[must_use]
    pub fn from_der(root: Vec<u8>) -> Self {
        Self { roots: vec![root] }
    }
}

/// The header block opening one request/response exchange.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method
    pub method: Method,
    /// Origin supplying the `:scheme` and `:authority` pseudo headers
    pub origin: Origin,
    /// Path plus rendered query string for the `:path` pseudo header
    pub path_and_query: String,
    /// Regular request headers
    pub headers: HeaderMap,
}

/// Status and headers of a response, before any body data.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Response status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
}

/// Why the transport rejected or tore down a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The stream was closed before the exchange completed
    StreamClosed,
    /// The remote refused to accept the stream
    RefusedStream,
    /// The remote asked the client to open fewer streams
    EnhanceYourCalm,
    /// The stream was cancelled
    Cancelled,
    /// Any other transport-level failure
    Other(String),
}

impl RejectReason {
    /// Transient rejections are worth retrying on a fresh session; the
    /// rest are surfaced as-is.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamClosed => write!(f, "stream closed"),
            Self::RefusedStream => write!(f, "refused stream"),
            Self::EnhanceYourCalm => write!(f, "enhance your calm"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

/// Why a connection terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The connection closed normally
    Closed,
    /// The remote retired the connection with a goaway frame
    GoAway,
    /// The connection failed
    Error(String),
}

/// Establishes connections to origins.
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Connect to `origin`, using `trust` as TLS trust anchors where the
    /// scheme requires it.
    async fn connect(&self, origin: &Origin, trust: Option<&TlsTrust>)
        -> Result<Arc<dyn Connection>>;
}

/// One established, multiplexed connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Open a new stream carrying `head`.
    async fn open_stream(
        &self,
        head: RequestHead,
    ) -> std::result::Result<Box<dyn StreamTransport>, RejectReason>;

    /// Resolves once the connection has terminated, for whatever cause.
    /// May be awaited by any number of callers.
    async fn closed(&self) -> CloseCause;

    /// Actively close the connection.
    fn close(&self);
}

/// One request/response exchange multiplexed on a connection.
#[async_trait]
pub trait StreamTransport: Send + 'static {
    /// The transport-assigned stream identifier, if one has been assigned
    /// already. A stream with an identifier is ready for use.
    fn id(&self) -> Option<u64>;

    /// Wait until the remote accepted the stream.
    async fn ready(&mut self) -> std::result::Result<(), RejectReason>;

    /// Send the request body and close the sending side. An empty body
    /// just ends the stream.
    async fn send_body(&mut self, body: Bytes) -> std::result::Result<(), RejectReason>;

    /// Await the response status and headers.
    async fn response(&mut self) -> std::result::Result<ResponseHead, RejectReason>;

    /// Await the complete response body.
    async fn body(&mut self) -> std::result::Result<Bytes, RejectReason>;

    /// Abort the exchange.
    fn abort(&mut self);
}
