//! Core building blocks: configuration, errors, metrics and the
//! resilience primitives (rate limiting, circuit breaking, retry, audit).

pub mod audit;
pub mod breaker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
