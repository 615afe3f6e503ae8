//! Circuit breaker state machine for failure isolation
//!
//! The breaker tracks consecutive outcomes of calls that actually reached
//! the guarded dependency and short-circuits new calls once the dependency
//! looks down, giving it room to recover. Recovery is probed through a
//! single trial call at a time: admitting exactly one half-open probe
//! prevents a thundering herd of recovery checks from re-overwhelming an
//! upstream that has only just come back.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::{ConfigError, ConfigResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing a single trial call to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
///
/// Half-open concurrency is fixed at one trial call and is deliberately not
/// configurable.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes needed to close the circuit from
    /// half-open
    pub success_threshold: u32,
    /// Time to wait before transitioning from open to half-open
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::invalid("recovery_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_short_circuits: u64,
    /// Time spent in the current state
    pub time_in_state: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    changed_at: Instant,
    total_calls: u64,
    total_short_circuits: u64,
}

impl BreakerInner {
    fn transition(&mut self, state: CircuitState, now: Instant) {
        self.state = state;
        self.changed_at = now;
    }
}

/// Circuit breaker guarding a single upstream dependency
///
/// All state lives behind one mutex so the check-then-act transitions are
/// serialized; the lock protects only in-memory counter updates and is
/// never held across I/O. Clones share state, so one breaker instance can
/// be handed to every concurrent caller of the same dependency.
///
/// The failure and success counters are driven exclusively through
/// [`record_success`](Self::record_success) /
/// [`record_failure`](Self::record_failure) by calls that actually reached
/// the transport; admission checks alone never change them.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    clock: Arc<C>,
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker with the given configuration using the
    /// system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        let now = clock.now();
        let inner = BreakerInner {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probe_in_flight: false,
            changed_at: now,
            total_calls: 0,
            total_short_circuits: 0,
        };

        Ok(Self { config, inner: Arc::new(Mutex::new(inner)), clock: Arc::new(clock) })
    }

    /// Check whether a call may proceed, reserving the trial slot when the
    /// breaker is probing recovery
    ///
    /// In `Open`, the first check after `recovery_timeout` has elapsed
    /// flips the breaker to `HalfOpen` and admits the caller as the trial
    /// call; every other caller stays short-circuited until that trial
    /// resolves through [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure), or
    /// [`release_probe`](Self::release_probe).
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                inner.total_calls += 1;
                true
            }
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .map_or(true, |at| now.duration_since(at) >= self.config.recovery_timeout);
                if recovered {
                    inner.transition(CircuitState::HalfOpen, now);
                    inner.consecutive_successes = 0;
                    inner.probe_in_flight = true;
                    inner.total_calls += 1;
                    info!("circuit breaker half-open, admitting trial call");
                    true
                } else {
                    inner.total_short_circuits += 1;
                    debug!("circuit breaker open, short-circuiting call");
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.total_short_circuits += 1;
                    debug!("circuit breaker half-open with trial in flight, short-circuiting");
                    false
                } else {
                    inner.probe_in_flight = true;
                    inner.total_calls += 1;
                    true
                }
            }
        }
    }

    /// Record a successful call that reached the transport
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.transition(CircuitState::Closed, now);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    info!("circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Open => {
                warn!("success recorded while circuit is open");
            }
        }
    }

    /// Record a failed call that reached the transport
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.transition(CircuitState::Open, now);
                    inner.opened_at = Some(now);
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // The trial failed: back to open, recovery timer restarts
                inner.probe_in_flight = false;
                inner.consecutive_successes = 0;
                inner.transition(CircuitState::Open, now);
                inner.opened_at = Some(now);
                warn!("trial call failed, circuit breaker reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Release a trial slot reserved by [`can_execute`](Self::can_execute)
    /// for a call that never completed (e.g. cancelled mid-flight)
    ///
    /// The abandoned trial counts as neither success nor failure.
    pub fn release_probe(&self) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            inner.probe_in_flight = false;
            debug!("trial call abandoned, releasing probe slot");
        }
    }

    /// Remaining time until an open breaker will admit a trial call
    ///
    /// Returns `None` unless the breaker is currently open.
    pub fn remaining_recovery(&self) -> Option<Duration> {
        let now = self.clock.now();
        let inner = self.lock_inner();
        if inner.state != CircuitState::Open {
            return None;
        }
        inner
            .opened_at
            .map(|at| self.config.recovery_timeout.saturating_sub(now.duration_since(at)))
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    /// Get a snapshot of current circuit breaker metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = self.clock.now();
        let inner = self.lock_inner();
        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            total_short_circuits: inner.total_short_circuits,
            time_in_state: now.duration_since(inner.changed_at),
        }
    }

    /// Reset the circuit breaker to the closed state
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.lock_inner();
        inner.transition(CircuitState::Closed, now);
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        info!("circuit breaker manually reset to closed state");
    }

    fn lock_inner(&self) -> MutexGuard<'_, BreakerInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Circuit breaker state lock poisoned");
                poisoned.into_inner()
            }
        }
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        // Default config is statically valid
        match Self::new(CircuitBreakerConfig::default()) {
            Ok(breaker) => breaker,
            Err(_) => unreachable!("default circuit breaker config is valid"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::MockClock;

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker<MockClock>, MockClock) {
        let clock = MockClock::new();
        let breaker =
            CircuitBreaker::with_clock(config, clock.clone()).expect("test config should be valid");
        (breaker, clock)
    }

    fn config(failures: u32, successes: u32, recovery: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            recovery_timeout: recovery,
        }
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    #[test]
    fn test_config_validation() {
        assert!(CircuitBreakerConfig::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().success_threshold(0).build().is_err());
        assert!(CircuitBreakerConfig::builder().recovery_timeout(Duration::ZERO).build().is_err());
        assert!(CircuitBreakerConfig::builder().build().is_ok());
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let (breaker, _clock) = breaker(config(3, 1, Duration::from_secs(30)));

        for _ in 0..3 {
            assert!(breaker.can_execute());
            breaker.record_failure();
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute(), "open breaker must short-circuit");
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (breaker, _clock) = breaker(config(3, 1, Duration::from_secs(30)));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_after_recovery_timeout() {
        let (breaker, clock) = breaker(config(1, 1, Duration::from_secs(30)));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(29));
        assert!(!breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_single_trial_call_in_half_open() {
        let (breaker, clock) = breaker(config(1, 1, Duration::from_secs(10)));

        breaker.record_failure();
        clock.advance(Duration::from_secs(10));

        assert!(breaker.can_execute(), "first caller becomes the trial");
        assert!(!breaker.can_execute(), "concurrent callers stay denied");
        assert!(!breaker.can_execute());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens_and_resets_timer() {
        let (breaker, clock) = breaker(config(1, 1, Duration::from_secs(10)));

        breaker.record_failure();
        clock.advance(Duration::from_secs(10));
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Recovery timer restarted: 5s is not enough
        clock.advance(Duration::from_secs(5));
        assert!(!breaker.can_execute());
        clock.advance(Duration::from_secs(5));
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_success_threshold_closes_circuit() {
        let (breaker, clock) = breaker(config(1, 2, Duration::from_secs(10)));

        breaker.record_failure();
        clock.advance(Duration::from_secs(10));

        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen, "one success is not enough");

        assert!(breaker.can_execute(), "next trial admitted after the first resolved");
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_release_probe_allows_new_trial() {
        let (breaker, clock) = breaker(config(1, 1, Duration::from_secs(10)));

        breaker.record_failure();
        clock.advance(Duration::from_secs(10));

        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());

        // Abandoned trial neither closes nor reopens the circuit
        breaker.release_probe();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_remaining_recovery() {
        let (breaker, clock) = breaker(config(1, 1, Duration::from_secs(30)));

        assert_eq!(breaker.remaining_recovery(), None);
        breaker.record_failure();
        clock.advance(Duration::from_secs(10));
        assert_eq!(breaker.remaining_recovery(), Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_metrics_snapshot() {
        let (breaker, _clock) = breaker(config(2, 1, Duration::from_secs(30)));

        assert!(breaker.can_execute());
        breaker.record_failure();
        assert!(breaker.can_execute());
        breaker.record_failure();
        assert!(!breaker.can_execute());

        let metrics = breaker.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.consecutive_failures, 2);
        assert_eq!(metrics.total_calls, 2);
        assert_eq!(metrics.total_short_circuits, 1);
    }

    #[test]
    fn test_reset() {
        let (breaker, _clock) = breaker(config(1, 1, Duration::from_secs(30)));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_clones_share_state() {
        let (breaker, _clock) = breaker(config(1, 1, Duration::from_secs(30)));
        let other = breaker.clone();

        breaker.record_failure();
        assert_eq!(other.state(), CircuitState::Open);
    }
}
