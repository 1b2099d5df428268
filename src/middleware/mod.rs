//! Middleware for observability.
//!
//! Request logging with latency tracking.

pub mod logging;
