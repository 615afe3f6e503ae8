//! Composition root guarding every outbound upstream call
//!
//! [`ResilientCaller`] threads a call through the guard pipeline in strict
//! order: rate limiter, then circuit breaker, then the retry loop around
//! the transport. Limiter state always settles before breaker or retry
//! logic runs, so a rate-limited call can never touch the breaker's
//! counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opendata_common::resilience::{
    AcquireOutcome, CircuitBreaker, CircuitBreakerConfig, Clock, ConfigResult, LimiterStatus,
    RateLimiterConfig, RetryConfig, RetryDecision, RetryError, RetryExecutor, RetryPolicy,
    SystemClock, ThrottlePolicy, TokenBucketLimiter,
};
use opendata_common::CircuitBreakerMetrics;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::errors::CallError;
use super::transport::{ApiRequest, Transport};

/// Recognized configuration surface for one guarded upstream dependency
///
/// Defaults mirror a modest public-data API budget: 100 sustained requests
/// per minute with a burst allowance of 20, a breaker that opens after 3
/// consecutive failures and probes again after 30 seconds, and up to 3
/// retries backing off from 1 second.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub rate_limit_capacity: f64,
    pub rate_limit_refill_per_second: f64,
    /// Burst bucket capacity; zero disables the burst bucket entirely
    pub burst_capacity: f64,
    pub burst_refill_per_second: f64,
    pub circuit_failure_threshold: u32,
    pub circuit_success_threshold: u32,
    pub circuit_recovery_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_backoff_multiplier: f64,
    pub retry_max_delay: Duration,
    /// Default budget for waiting out a limiter denial before failing fast
    pub max_wait: Duration,
    /// Response to upstream 429s
    pub throttle: ThrottlePolicy,
    /// Upper bound on the encoded request parameter payload
    pub max_request_size: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rate_limit_capacity: 100.0,
            rate_limit_refill_per_second: 100.0 / 60.0,
            burst_capacity: 20.0,
            burst_refill_per_second: 20.0 / 60.0,
            circuit_failure_threshold: 3,
            circuit_success_threshold: 3,
            circuit_recovery_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_backoff_multiplier: 2.0,
            retry_max_delay: Duration::from_secs(60),
            max_wait: Duration::from_secs(30),
            throttle: ThrottlePolicy::default(),
            max_request_size: 1024 * 1024,
        }
    }
}

impl GuardConfig {
    fn limiter_config(&self) -> RateLimiterConfig {
        let burst = (self.burst_capacity > 0.0)
            .then_some((self.burst_capacity, self.burst_refill_per_second));
        RateLimiterConfig {
            capacity: self.rate_limit_capacity,
            refill_per_second: self.rate_limit_refill_per_second,
            burst,
            throttle: self.throttle,
        }
    }

    fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: self.circuit_success_threshold,
            recovery_timeout: self.circuit_recovery_timeout,
        }
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            backoff_multiplier: self.retry_backoff_multiplier,
            max_delay: self.retry_max_delay,
        }
    }
}

/// Per-call overrides supplied by the dispatch layer
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the configured limiter wait budget
    pub max_wait: Option<Duration>,
    /// Abort the whole call (waits included) after this long
    pub deadline: Option<Duration>,
    /// External cancellation signal
    pub cancel: Option<CancellationToken>,
}

/// Terminal failure of a guarded call: the concrete classified error plus
/// attempt bookkeeping
///
/// `attempts` counts attempts started against the transport (zero when the
/// call never got past validation, the limiter, or the breaker gate);
/// `elapsed` spans the whole call including waits.
#[derive(Debug)]
pub struct CallFailure {
    pub error: CallError,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (attempts: {}, elapsed: {:?})", self.error, self.attempts, self.elapsed)
    }
}

impl std::error::Error for CallFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl CallFailure {
    /// Consume the failure and return the classified error alone
    pub fn into_error(self) -> CallError {
        self.error
    }
}

/// Combined snapshot of the guard state, for status surfaces
#[derive(Debug, Clone)]
pub struct GuardStatus {
    pub limiter: LimiterStatus,
    pub breaker: CircuitBreakerMetrics,
}

/// Retry policy consulting the classified error taxonomy
///
/// Transient kinds are retried; a throttled upstream's `Retry-After` hint
/// overrides the computed backoff.
#[derive(Debug, Clone)]
pub struct TransientRetry;

impl RetryPolicy<CallError> for TransientRetry {
    fn should_retry(&self, error: &CallError, _attempt: u32) -> RetryDecision {
        match error {
            CallError::UpstreamThrottled { retry_after: Some(hint) } => {
                RetryDecision::RetryAfter(*hint)
            }
            error if error.is_retryable() => RetryDecision::Retry,
            _ => RetryDecision::Stop,
        }
    }
}

/// Guarded access to one upstream dependency
///
/// Owns the limiter and breaker for that dependency; construct one caller
/// per upstream and share it (via `Clone` or `Arc`) across every task that
/// talks to it. There is deliberately no process-wide registry.
pub struct ResilientCaller<T: Transport, C: Clock = SystemClock> {
    transport: Arc<T>,
    limiter: TokenBucketLimiter<Arc<C>>,
    breaker: CircuitBreaker<Arc<C>>,
    retry: RetryConfig,
    config: GuardConfig,
    clock: Arc<C>,
}

impl<T: Transport> ResilientCaller<T, SystemClock> {
    /// Create a caller with the system clock
    pub fn new(config: GuardConfig, transport: T) -> ConfigResult<Self> {
        Self::with_clock(config, transport, SystemClock)
    }
}

impl<T: Transport, C: Clock> ResilientCaller<T, C> {
    /// Create a caller with a custom clock (useful for testing)
    pub fn with_clock(config: GuardConfig, transport: T, clock: C) -> ConfigResult<Self> {
        let clock = Arc::new(clock);
        let limiter =
            TokenBucketLimiter::with_clock(config.limiter_config(), Arc::clone(&clock))?;
        let breaker = CircuitBreaker::with_clock(config.breaker_config(), Arc::clone(&clock))?;
        let retry = config.retry_config();
        retry.validate()?;

        Ok(Self { transport: Arc::new(transport), limiter, breaker, retry, config, clock })
    }

    /// Execute a guarded call with default options
    pub async fn call(&self, request: ApiRequest) -> Result<serde_json::Value, CallFailure> {
        self.call_with_options(request, CallOptions::default()).await
    }

    /// Execute a guarded call: limiter, then breaker, then retried transport
    #[instrument(skip(self, request, options), fields(action = %request.action))]
    pub async fn call_with_options(
        &self,
        request: ApiRequest,
        options: CallOptions,
    ) -> Result<serde_json::Value, CallFailure> {
        let started = self.clock.now();

        // Deadline and external cancellation collapse into one signal; the
        // timer task is aborted once the call resolves.
        let guard = options.cancel.clone().unwrap_or_default().child_token();
        let deadline_timer = options.deadline.map(|deadline| {
            let guard = guard.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                guard.cancel();
            })
        });

        let max_wait = options.max_wait.unwrap_or(self.config.max_wait);
        let (result, attempts) = self.drive(&request, &guard, max_wait).await;

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        result.map_err(|error| {
            let elapsed = self.clock.now().duration_since(started);
            CallFailure { error, attempts, elapsed }
        })
    }

    /// Snapshot of limiter and breaker state
    pub fn status(&self) -> GuardStatus {
        GuardStatus { limiter: self.limiter.status(), breaker: self.breaker.metrics() }
    }

    async fn drive(
        &self,
        request: &ApiRequest,
        guard: &CancellationToken,
        max_wait: Duration,
    ) -> (Result<serde_json::Value, CallError>, u32) {
        if let Err(error) = request.validate(self.config.max_request_size) {
            return (Err(error), 0);
        }

        // Rate limiter first: a denied call must settle (or fail) before the
        // breaker sees anything.
        let mut waited = Duration::ZERO;
        loop {
            match self.limiter.acquire(1.0) {
                AcquireOutcome::Admitted => break,
                AcquireOutcome::Denied { retry_after } => {
                    if waited + retry_after > max_wait {
                        debug!(?retry_after, ?max_wait, "rate limit wait exceeds budget");
                        return (Err(CallError::RateLimited { retry_after }), 0);
                    }
                    tokio::select! {
                        _ = guard.cancelled() => return (Err(CallError::Cancelled), 0),
                        _ = tokio::time::sleep(retry_after) => waited += retry_after,
                    }
                }
            }
        }

        // Breaker gate: short-circuit before any retry bookkeeping.
        if !self.breaker.can_execute() {
            warn!("call short-circuited by open circuit breaker");
            return (
                Err(CallError::CircuitOpen { retry_in: self.breaker.remaining_recovery() }),
                0,
            );
        }

        // The pre-gate admission covers the first attempt; later attempts
        // re-check so a breaker opened mid-sequence blocks them.
        let admitted = Arc::new(AtomicBool::new(true));

        let executor = RetryExecutor::new(self.retry.clone(), TransientRetry);
        let outcome = executor
            .execute_with_outcome(guard, || {
                let transport = Arc::clone(&self.transport);
                let limiter = self.limiter.clone();
                let breaker = self.breaker.clone();
                let admitted = Arc::clone(&admitted);
                let request = request.clone();
                let guard = guard.clone();
                async move {
                    if !admitted.swap(false, Ordering::SeqCst) && !breaker.can_execute() {
                        return Err(CallError::CircuitOpen {
                            retry_in: breaker.remaining_recovery(),
                        });
                    }

                    let result = tokio::select! {
                        _ = guard.cancelled() => {
                            breaker.release_probe();
                            return Err(CallError::Cancelled);
                        }
                        result = transport.execute(&request) => result,
                    };

                    // Every attempt that completed against the transport is
                    // reported: upstream-fault kinds as failures, any
                    // completed HTTP exchange as success. A 429 additionally
                    // shrinks the limiter's effective rate.
                    match &result {
                        Ok(_) => breaker.record_success(),
                        Err(CallError::UpstreamThrottled { .. }) => {
                            limiter.note_throttled();
                            breaker.record_success();
                        }
                        Err(CallError::UpstreamClient { .. }) => breaker.record_success(),
                        Err(
                            CallError::UpstreamServer { .. }
                            | CallError::TransportTimeout { .. }
                            | CallError::Transport { .. },
                        ) => breaker.record_failure(),
                        Err(_) => {}
                    }

                    result
                }
            })
            .await;

        let attempts = outcome.attempts;
        let result = match outcome.into_result() {
            Ok(value) => Ok(value),
            Err(RetryError::Exhausted { source, .. })
            | Err(RetryError::NonRetryable { source }) => Err(source),
            Err(RetryError::Cancelled { .. }) => Err(CallError::Cancelled),
        };
        (result, attempts)
    }
}

impl<T: Transport, C: Clock> Clone for ResilientCaller<T, C> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            limiter: self.limiter.clone(),
            breaker: self.breaker.clone(),
            retry: self.retry.clone(),
            config: self.config.clone(),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T: Transport, C: Clock> std::fmt::Debug for ResilientCaller<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientCaller").field("config", &self.config).finish()
    }
}
