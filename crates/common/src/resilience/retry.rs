//! Bounded retry with exponential backoff and jitter
//!
//! The executor runs an explicit attempt loop rather than a wrapped call
//! stack, so the suspension point (the backoff sleep) and the cancellation
//! path are visible in one place. Whether an error is worth retrying is
//! delegated to a [`RetryPolicy`], keeping the executor generic over error
//! types.
//!
//! A terminal failure always surfaces the last observed error itself, so
//! callers inspect the concrete cause rather than a "retries exhausted"
//! wrapper.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ConfigError, ConfigResult};

/// Errors that can terminate a retry loop
///
/// `Exhausted` and `NonRetryable` both carry the concrete error observed on
/// the final attempt as their source.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All attempts were used up; `source` is the last observed error
    #[error("All {attempts} attempts failed, last error: {source}")]
    Exhausted { attempts: u32, source: E },

    /// The operation failed with an error the policy refuses to retry
    #[error("Operation failed with non-retryable error: {source}")]
    NonRetryable { source: E },

    /// The caller aborted the operation mid-backoff or mid-attempt
    #[error("Operation cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// The concrete error observed on the final attempt, if one exists
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including summary statistics
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: RetryResult<T, E>,
    /// Number of attempts started (1-based)
    pub attempts: u32,
    /// Accumulated backoff delay across attempts
    pub total_delay: Duration,
    started_at: Instant,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Total elapsed time from the first attempt to completion
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Trait for determining whether an error should be retried
pub trait RetryPolicy<E> {
    /// Decide whether the error should be retried and optionally override
    /// the backoff delay
    fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision;
}

/// Decision for whether to retry an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation with the default backoff delay
    Retry,
    /// Retry the operation after a specific delay (e.g. a server-provided
    /// retry-after hint)
    RetryAfter(Duration),
    /// Don't retry the operation
    Stop,
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries beyond the first attempt (total attempts is
    /// `max_retries + 1`)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied to the delay for each subsequent retry
    pub backoff_multiplier: f64,
    /// Upper bound on the computed delay, applied before jitter
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::invalid("base_delay must be greater than zero"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid("backoff_multiplier must be at least 1.0"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid("max_delay must be at least base_delay"));
        }
        Ok(())
    }

    /// Nominal delay for the given 0-indexed attempt:
    /// `min(base_delay * backoff_multiplier^attempt, max_delay)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let nominal =
            self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(nominal.min(self.max_delay.as_secs_f64()))
    }
}

/// Builder for RetryConfig with fluent API
#[derive(Debug)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl Default for RetryConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self { config: RetryConfig::default() }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn build(self) -> ConfigResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Apply full jitter: multiply the delay by a uniform random factor in
/// `[0.5, 1.5]`
///
/// Spreads concurrent callers' retries over a window so they do not hammer
/// a recovering upstream in lockstep.
pub fn full_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..=1.5);
    delay.mul_f64(factor)
}

/// The main retry executor
///
/// Runs the operation up to `max_retries + 1` times, sleeping a jittered
/// exponential backoff between attempts. The backoff sleep races the
/// supplied cancellation token; the in-flight operation itself is expected
/// to observe the same token internally if it needs to be abortable.
pub struct RetryExecutor<P> {
    config: RetryConfig,
    policy: P,
}

impl<P> RetryExecutor<P> {
    /// Create a new retry executor with the given configuration and policy
    pub fn new(config: RetryConfig, policy: P) -> Self {
        Self { config, policy }
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> RetryResult<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(cancel, operation).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        P: RetryPolicy<E>,
        E: fmt::Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started_at = Instant::now();
        let mut attempt: u32 = 0;
        let mut total_delay = Duration::ZERO;

        loop {
            let attempts = attempt + 1;
            debug!(attempt = attempts, max = self.config.max_retries + 1, "executing operation");

            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "operation succeeded after retries");
                    }
                    return RetryOutcome { result: Ok(value), attempts, total_delay, started_at };
                }
                Err(error) => {
                    let delay = match self.policy.should_retry(&error, attempt) {
                        RetryDecision::Stop => {
                            debug!(error = ?error, "policy declined to retry");
                            return RetryOutcome {
                                result: Err(RetryError::NonRetryable { source: error }),
                                attempts,
                                total_delay,
                                started_at,
                            };
                        }
                        _ if attempt >= self.config.max_retries => {
                            warn!(attempts, error = ?error, "retry budget exhausted");
                            return RetryOutcome {
                                result: Err(RetryError::Exhausted { attempts, source: error }),
                                attempts,
                                total_delay,
                                started_at,
                            };
                        }
                        RetryDecision::Retry => full_jitter(self.config.backoff_delay(attempt)),
                        RetryDecision::RetryAfter(custom) => custom,
                    };

                    warn!(attempt = attempts, ?delay, error = ?error, "attempt failed, backing off");

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(attempts, "retry loop cancelled during backoff");
                            return RetryOutcome {
                                result: Err(RetryError::Cancelled { attempts }),
                                attempts,
                                total_delay,
                                started_at,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    total_delay += delay;
                    attempt += 1;
                }
            }
        }
    }
}

/// Convenience function to create a retry executor and execute an operation
/// with no external cancellation signal
pub async fn retry_with_policy<F, Fut, T, E, P>(
    config: RetryConfig,
    policy: P,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
    E: fmt::Debug,
{
    let executor = RetryExecutor::new(config, policy);
    executor.execute(&CancellationToken::new(), operation).await
}

/// Pre-defined retry policies for common scenarios
pub mod policies {
    use super::*;

    /// Always retry policy - retries on any error
    #[derive(Debug, Clone)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Retry
        }
    }

    /// Never retry policy - the first failure is terminal
    #[derive(Debug, Clone)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> RetryDecision {
            RetryDecision::Stop
        }
    }

    /// Predicate-based retry policy
    #[derive(Debug)]
    pub struct PredicateRetry<F> {
        predicate: F,
    }

    impl<F> PredicateRetry<F> {
        pub fn new(predicate: F) -> Self {
            Self { predicate }
        }
    }

    impl<F, E> RetryPolicy<E> for PredicateRetry<F>
    where
        F: Fn(&E, u32) -> bool,
    {
        fn should_retry(&self, error: &E, attempt: u32) -> RetryDecision {
            if (self.predicate)(error, attempt) {
                RetryDecision::Retry
            } else {
                RetryDecision::Stop
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::policies::*;
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[test]
    fn test_backoff_delay_grows_exponentially() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        };

        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_delay_clamped_to_max() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(30), Duration::from_millis(500));
    }

    #[test]
    fn test_full_jitter_bounds() {
        let delay = Duration::from_millis(200);
        for _ in 0..200 {
            let jittered = full_jitter(delay);
            assert!(jittered >= Duration::from_millis(100), "below 0.5x: {jittered:?}");
            assert!(jittered <= Duration::from_millis(300), "above 1.5x: {jittered:?}");
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::builder().base_delay(Duration::ZERO).build().is_err());
        assert!(RetryConfig::builder().backoff_multiplier(0.5).build().is_err());
        assert!(RetryConfig::builder()
            .base_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(1))
            .build()
            .is_err());
        assert!(RetryConfig::builder().max_retries(0).build().is_ok());
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let executor = RetryExecutor::new(fast_config(3), AlwaysRetry);
        let result = executor
            .execute(&CancellationToken::new(), || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError("transient"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("should recover"), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let executor = RetryExecutor::new(fast_config(2), AlwaysRetry);
        let outcome = executor
            .execute_with_outcome(&CancellationToken::new(), || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("persistent"))
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match outcome.result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source, TestError("persistent"));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_is_terminal_on_first_failure() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let executor = RetryExecutor::new(fast_config(5), NeverRetry);
        let result = executor
            .execute(&CancellationToken::new(), || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("fatal"))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        match result {
            Err(RetryError::NonRetryable { source }) => assert_eq!(source, TestError("fatal")),
            other => panic!("expected NonRetryable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_predicate_policy_distinguishes_errors() {
        let policy = PredicateRetry::new(|error: &TestError, _| error.0 == "transient");
        let executor = RetryExecutor::new(fast_config(3), policy);

        let result = executor
            .execute(&CancellationToken::new(), || async { Err::<(), _>(TestError("fatal")) })
            .await;

        assert!(matches!(result, Err(RetryError::NonRetryable { .. })));
    }

    #[tokio::test]
    async fn test_retry_after_overrides_backoff() {
        struct HintPolicy;
        impl RetryPolicy<TestError> for HintPolicy {
            fn should_retry(&self, _error: &TestError, _attempt: u32) -> RetryDecision {
                RetryDecision::RetryAfter(Duration::from_millis(1))
            }
        }

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        // Long base delay: only the hint can keep this test fast
        let config = RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        };
        let executor = RetryExecutor::new(config, HintPolicy);
        let outcome = executor
            .execute_with_outcome(&CancellationToken::new(), || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("throttled"))
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert!(outcome.total_delay < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        };
        let executor = RetryExecutor::new(config, AlwaysRetry);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let outcome = executor
            .execute_with_outcome(&cancel, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(TestError("transient"))
                }
            })
            .await;

        assert!(matches!(outcome.result, Err(RetryError::Cancelled { attempts: 1 })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "no further attempts after cancel");
        assert!(started.elapsed() < Duration::from_secs(1), "cancel must abort the backoff");
    }
}
