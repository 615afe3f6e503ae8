//! Shared resilience primitives for the OpenData gateway crates.
//!
//! This crate hosts **generic, reusable** building blocks with no coupling
//! to any particular upstream API: rate limiting, circuit breaking, and
//! retry logic. The domain-facing composition of these primitives lives in
//! `opendata-infra`.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use resilience::{
    retry_with_policy, AcquireOutcome, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitState, Clock, ConfigError,
    ConfigResult, LimiterStatus, MockClock, RateLimiterConfig, RateLimiterConfigBuilder,
    RetryConfig, RetryConfigBuilder, RetryDecision, RetryError, RetryExecutor, RetryOutcome,
    RetryPolicy, SystemClock, ThrottlePolicy, TokenBucketLimiter,
};
