//! Per-session stream admission control.
//!
//! Two independent disciplines compose in front of every stream-creation
//! attempt:
//!
//! - [`RateLimiter`]: a token bucket bounding attempts per time interval
//! - [`ConcurrencyLimiter`]: a FIFO counting semaphore bounding attempts
//!   in flight at once
//!
//! Limiters are owned by their session and never shared across sessions.
//! [`LimitConfig`] carries the knobs for both.

mod concurrency;
mod config;
mod rate;

pub use concurrency::ConcurrencyLimiter;
pub use config::LimitConfig;
pub use rate::RateLimiter;
