//! Floodgate - Request Rate Limiting Core
//!
//! This crate decides whether a request from a given identifier is within
//! its budget right now. Limiters count either in process, with fixed
//! windows, or in a Redis instance shared by every service replica, with
//! sliding-window logs. A fixed registry holds one limiter per protected
//! endpoint class.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::FloodgateConfig;
pub use error::{FloodgateError, Result};
pub use ratelimit::{Backend, Decision, EndpointClass, LimiterRegistry, Policy, RateLimiter};
