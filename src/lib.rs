//! Adaptive, latency-driven concurrency limits for shedding load before a server saturates.
//!
//! A [RequestLimiter] hands out a bounded number of [Listener]s. Each admitted request reports
//! how it ended, and the latency it observed adjusts the limit through the [Gradient2] algorithm.
//! When no capacity is left, requests are rejected immediately with [Overloaded].
//!
//! A [LimiterRegistry] holds the named `write` and `special-path` limiters, and a [RequestGate]
//! decides which of them, if any, an HTTP request must pass through.
//!
//! [Gradient2]: limits::Gradient2

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

mod config;
mod gate;
mod internal_events;
mod limiter;
pub mod limits;
mod moving_avg;
mod registry;

pub use config::{ConfigError, LimitConfig, RegistryConfig};
pub use gate::{Classify, DisableLimiting, GateRequest, Overloaded, RequestGate};
pub use limiter::{LimiterState, Listener, Outcome, RequestLimiter};
pub use registry::{LimiterName, LimiterRegistry, UnknownLimiter};
