//! `filament` is a pooled, rate-limited HTTP/2 client.
//!
//! Sessions are pooled per origin: any number of concurrent requests to
//! the same origin share one multiplexed connection, and concurrent
//! requests to a new origin trigger exactly one connect. Stream creation
//! is throttled by an optional per-session token bucket and an optional
//! FIFO concurrency bound, and transient transport rejections are retried
//! on a fresh session with linear backoff.
//!
//! "Hello world" example:
//! ```no_run
//! use filament::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let response = filament::get("http://localhost:8000/status").await?;
//!     println!("{}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! For more specific use-cases build a client yourself using the
//! [`ClientBuilder`], which grants full flexibility:
//!
//! ```no_run
//! use std::time::Duration;
//! use filament::{ClientBuilder, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = ClientBuilder::builder()
//!         .idle_timeout(Duration::from_secs(600))
//!         .timeout(Duration::from_secs(20))
//!         .build()
//!         .client()?;
//!
//!     let mut response = client
//!         .get("http://localhost:8000/things")
//!         .query([("page", "1")])
//!         .expect([200])
//!         .send()
//!         .await?;
//!
//!     println!("{}", response.text().await?);
//!     client.end().await;
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

mod client;
mod limits;
mod pool;
mod request;
mod response;
mod session;
mod transport;
mod types;

pub use client::{get, Client, ClientBuilder};
pub use limits::{ConcurrencyLimiter, LimitConfig, RateLimiter};
pub use pool::SessionPool;
pub use request::RequestBuilder;
pub use response::Response;
pub use session::{Session, SessionConfig, SessionStatus, SessionStream};
pub use transport::{
    CloseCause, Connection, H2Transport, RejectReason, RequestHead, ResponseHead, StreamTransport,
    TlsTrust, Transport,
};
pub use types::{Cookie, ErrorKind, Origin, Result};
