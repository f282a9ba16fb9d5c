use std::time::Duration;

use http::Method;
use thiserror::Error;
use url::Url;

use crate::session::SessionStatus;
use crate::transport::RejectReason;
use crate::types::Origin;

/// Convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Possible errors when interacting with `filament`
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The transport could not establish a connection to the origin
    #[error("Failed to connect to '{origin}': {reason}")]
    Connect {
        /// The origin the connection was meant for
        origin: Origin,
        /// Why the connection attempt failed
        reason: String,
    },

    /// The transport rejected or tore down a stream
    #[error("The remote rejected the stream: {reason}")]
    StreamRejected {
        /// The transport-level rejection reason
        reason: RejectReason,
        /// Whether a fresh session is worth another attempt
        retryable: bool,
    },

    /// A stream was requested on a session that has already terminated
    #[error("Cannot create a stream on the session to '{origin}' with the status '{status}'")]
    SessionUnusable {
        /// The origin of the dead session
        origin: Origin,
        /// The status the session was found in
        status: SessionStatus,
    },

    /// The rate limiter did not hand out a token within its wait bound
    #[error("Gave up waiting for a rate limiter token after {}ms", waited.as_millis())]
    ThrottleTimeout {
        /// The configured wait bound
        waited: Duration,
    },

    /// The concurrency limiter did not free a slot within its wait bound
    #[error("Gave up waiting for a free stream slot after {}ms", waited.as_millis())]
    AcquireTimeout {
        /// The configured wait bound
        waited: Duration,
    },

    /// The total-request deadline elapsed before the exchange completed
    #[error("The {method} request to '{url}' timed out after {}ms!", after.as_millis())]
    RequestTimeout {
        /// HTTP method of the timed-out request
        method: Method,
        /// URL of the timed-out request
        url: Url,
        /// The configured total-request timeout
        after: Duration,
    },

    /// No response headers arrived before the response-wait deadline
    #[error("The {method} request to '{url}' received no response within {}ms!", after.as_millis())]
    ResponseTimeout {
        /// HTTP method of the timed-out request
        method: Method,
        /// URL of the timed-out request
        url: Url,
        /// The configured response-wait timeout
        after: Duration,
    },

    /// The response status was not in the caller's expected set
    #[error("The response for the {method} request to '{url}' returned the status {status}, expected the status to be {expected}{detail}!")]
    UnexpectedStatus {
        /// HTTP method of the request
        method: Method,
        /// URL of the request
        url: Url,
        /// The status the server actually returned
        status: u16,
        /// Human-readable rendering of the expected set
        expected: String,
        /// Diagnostic body excerpt for 4xx/5xx responses, empty otherwise
        detail: String,
    },

    /// A session status would move backwards
    #[error("Cannot set the status '{to}' on a session whose status is already '{from}'")]
    InvalidTransition {
        /// The current status
        from: SessionStatus,
        /// The rejected target status
        to: SessionStatus,
    },

    /// The configured rate limit interval cannot be represented
    #[error("Invalid rate limit: the interval per admitted request must be non-zero")]
    InvalidRateLimit,

    /// An URL with an invalid host was found
    #[error("URL is missing a host")]
    InvalidUrlHost,

    /// The given string can not be parsed into a valid URL
    #[error("Cannot parse '{0}' as a URL: {1}")]
    ParseUrl(String, url::ParseError),

    /// The given header name or value could not be parsed
    #[error("Header could not be parsed: {0}")]
    InvalidHeader(String),

    /// The given number is not a valid HTTP status code
    #[error("Invalid expected status code: {0}")]
    InvalidStatusCode(u16),

    /// A request body could not be serialized, or a response body could not
    /// be deserialized
    #[error("Failed to encode or decode json data: {0}")]
    Json(#[from] serde_json::Error),

    /// A transport failure while the exchange was already under way
    #[error("The {method} request to '{url}' errored: {source}")]
    Request {
        /// HTTP method of the failed request
        method: Method,
        /// URL of the failed request
        url: Url,
        /// The underlying failure
        #[source]
        source: Box<ErrorKind>,
    },
}

impl ErrorKind {
    /// Whether this failure warrants another stream-creation attempt
    /// against a fresh session.
    #[must_use]
    pub fn is_retryable_stream(&self) -> bool {
        matches!(self, Self::StreamRejected { retryable: true, .. })
    }
}
