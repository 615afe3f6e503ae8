//! Resilience patterns for fault tolerance when calling remote dependencies
//!
//! This module provides **generic, reusable** resilience patterns:
//! - **Token Bucket Rate Limiting**: admits or delays work against a capped,
//!   steadily-refilling token budget, with an optional burst bucket
//! - **Circuit Breaker**: detects repeated upstream failures and stops
//!   calling the dependency until it has had time to recover
//! - **Retry Logic**: bounded retry with exponential backoff and jitter
//!
//! The implementations are:
//! - Generic over error types (the retry executor works with any `E`)
//! - Testable with a clock abstraction (`MockClock`)
//! - Framework-agnostic with minimal dependencies
//!
//! Shared instances (one limiter and one breaker per guarded upstream) are
//! cheap to clone: clones share state through internal `Arc`s. Retry state
//! is call-scoped and never shared.

pub mod circuit_breaker;
pub mod clock;
pub mod rate_limiter;
pub mod retry;

use thiserror::Error;

/// Simple configuration error for validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    /// Build an `Invalid` error from anything stringly
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type using simple config errors
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export clock types
pub use clock::{Clock, MockClock, SystemClock};

// Re-export circuit breaker types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState,
};

// Re-export rate limiter types
pub use rate_limiter::{
    AcquireOutcome, LimiterStatus, RateLimiterConfig, RateLimiterConfigBuilder, ThrottlePolicy,
    TokenBucketLimiter,
};

// Re-export retry types
pub use retry::{
    full_jitter, policies, retry_with_policy, RetryConfig, RetryConfigBuilder, RetryDecision,
    RetryError, RetryExecutor, RetryOutcome, RetryPolicy,
};
