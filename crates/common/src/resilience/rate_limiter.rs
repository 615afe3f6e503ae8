//! Token bucket rate limiting for outbound calls
//!
//! The limiter owns a primary bucket sized for the sustained request rate
//! and an optional burst bucket consulted only when the primary is
//! exhausted, so short spikes get through without raising the steady rate.
//! Refill is lazy: tokens are recomputed from elapsed time on every
//! `acquire`, never by a background timer.
//!
//! Being rate limited is an expected condition, not an exceptional one, so
//! `acquire` returns an [`AcquireOutcome`] instead of an error. A denied
//! caller is told the minimum wait after which the request can be admitted
//! and decides for itself whether to block or fail fast.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::{ConfigError, ConfigResult};

/// Outcome of a token acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquireOutcome {
    /// The cost was covered; the call may proceed immediately
    Admitted,
    /// Not enough tokens; `retry_after` is the minimum wait until the cost
    /// can be covered by whichever bucket refills first
    Denied {
        /// Minimum wait before a retried `acquire` can succeed
        retry_after: Duration,
    },
}

impl AcquireOutcome {
    /// Whether the call was admitted
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Policy applied when the upstream reports it is throttling us (HTTP 429)
///
/// While the cooldown window is active, the effective refill rate of both
/// buckets is multiplied by `rate_factor`, shrinking sustained throughput
/// until the upstream has had room to recover. Repeated reports extend the
/// window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottlePolicy {
    /// Multiplier applied to refill rates during the cooldown, in `(0, 1]`
    pub rate_factor: f64,
    /// How long a single throttle report suppresses the refill rate
    pub cooldown: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self { rate_factor: 0.5, cooldown: Duration::from_secs(30) }
    }
}

impl ThrottlePolicy {
    fn validate(&self) -> ConfigResult<()> {
        if !(self.rate_factor > 0.0 && self.rate_factor <= 1.0) {
            return Err(ConfigError::invalid("throttle rate_factor must be in (0, 1]"));
        }
        if self.cooldown.is_zero() {
            return Err(ConfigError::invalid("throttle cooldown must be greater than zero"));
        }
        Ok(())
    }
}

/// Configuration for the token bucket rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Maximum number of tokens the primary bucket can hold
    pub capacity: f64,
    /// Tokens added to the primary bucket per second
    pub refill_per_second: f64,
    /// Optional burst bucket: `(capacity, refill_per_second)`
    pub burst: Option<(f64, f64)>,
    /// Response to upstream throttling reports
    pub throttle: ThrottlePolicy,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            refill_per_second: 100.0 / 60.0,
            burst: Some((20.0, 20.0 / 60.0)),
            throttle: ThrottlePolicy::default(),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration builder
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.capacity > 0.0) {
            return Err(ConfigError::invalid("capacity must be greater than 0"));
        }
        if !(self.refill_per_second > 0.0) {
            return Err(ConfigError::invalid("refill_per_second must be greater than 0"));
        }
        if let Some((capacity, refill)) = self.burst {
            if !(capacity > 0.0) {
                return Err(ConfigError::invalid("burst capacity must be greater than 0"));
            }
            if !(refill > 0.0) {
                return Err(ConfigError::invalid("burst refill_per_second must be greater than 0"));
            }
        }
        self.throttle.validate()
    }
}

/// Builder for RateLimiterConfig
#[derive(Debug)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl Default for RateLimiterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterConfigBuilder {
    pub fn new() -> Self {
        Self { config: RateLimiterConfig::default() }
    }

    pub fn capacity(mut self, capacity: f64) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn refill_per_second(mut self, rate: f64) -> Self {
        self.config.refill_per_second = rate;
        self
    }

    pub fn burst(mut self, capacity: f64, refill_per_second: f64) -> Self {
        self.config.burst = Some((capacity, refill_per_second));
        self
    }

    pub fn no_burst(mut self) -> Self {
        self.config.burst = None;
        self
    }

    pub fn throttle(mut self, policy: ThrottlePolicy) -> Self {
        self.config.throttle = policy;
        self
    }

    pub fn build(self) -> ConfigResult<RateLimiterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time snapshot of limiter state, for status surfaces
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterStatus {
    /// Tokens currently available in the primary bucket
    pub tokens: f64,
    /// Primary bucket capacity
    pub capacity: f64,
    /// Configured (un-throttled) primary refill rate
    pub refill_per_second: f64,
    /// Tokens currently available in the burst bucket, if one exists
    pub burst_tokens: Option<f64>,
    /// Whether a throttle cooldown is currently suppressing the refill rate
    pub throttled: bool,
}

/// A single bucket: current tokens plus its refill parameters
#[derive(Debug)]
struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_second: f64, now: Instant) -> Self {
        Self { capacity, tokens: capacity, refill_per_second, last_refill: now }
    }

    /// Add tokens for the time elapsed since the last refill, capped at
    /// capacity. Idempotent for a fixed `now`.
    fn refill(&mut self, now: Instant, rate_factor: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let added = elapsed.as_secs_f64() * self.refill_per_second * rate_factor;
        self.tokens = (self.tokens + added).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, cost: f64) -> bool {
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Minimum wait until `cost` tokens will be available at the current
    /// effective refill rate
    fn wait_for(&self, cost: f64, rate_factor: f64) -> Duration {
        let missing = cost - self.tokens;
        if missing <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(missing / (self.refill_per_second * rate_factor))
    }
}

#[derive(Debug)]
struct LimiterState {
    primary: Bucket,
    burst: Option<Bucket>,
    throttled_until: Option<Instant>,
}

impl LimiterState {
    /// Current refill multiplier, clearing an expired cooldown as a side
    /// effect
    fn rate_factor(&mut self, now: Instant, policy: ThrottlePolicy) -> f64 {
        match self.throttled_until {
            Some(until) if now < until => policy.rate_factor,
            Some(_) => {
                self.throttled_until = None;
                1.0
            }
            None => 1.0,
        }
    }
}

/// Token bucket rate limiter with an optional burst bucket
///
/// One instance guards one upstream dependency and is shared by every
/// concurrent caller of that dependency; clones share state. All
/// check-then-act sequences (read timestamp, compute refill, subtract
/// tokens) run under a single mutex, and the lock is never held across a
/// suspension point: waiting out a denial is the caller's job.
///
/// # Examples
///
/// ```rust
/// use opendata_common::resilience::{AcquireOutcome, RateLimiterConfig, TokenBucketLimiter};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let limiter = TokenBucketLimiter::new(RateLimiterConfig::default())?;
///
/// match limiter.acquire(1.0) {
///     AcquireOutcome::Admitted => println!("Request allowed"),
///     AcquireOutcome::Denied { retry_after } => {
///         println!("Rate limited, retry in {retry_after:?}")
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct TokenBucketLimiter<C: Clock = SystemClock> {
    config: RateLimiterConfig,
    state: Arc<Mutex<LimiterState>>,
    clock: Arc<C>,
}

impl TokenBucketLimiter<SystemClock> {
    /// Create a new limiter with the system clock
    pub fn new(config: RateLimiterConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> TokenBucketLimiter<C> {
    /// Create a new limiter with a custom clock (useful for testing)
    pub fn with_clock(config: RateLimiterConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        let now = clock.now();
        let state = LimiterState {
            primary: Bucket::new(config.capacity, config.refill_per_second, now),
            burst: config.burst.map(|(capacity, refill)| Bucket::new(capacity, refill, now)),
            throttled_until: None,
        };

        Ok(Self { config, state: Arc::new(Mutex::new(state)), clock: Arc::new(clock) })
    }

    /// Try to cover `cost` tokens, preferring the primary bucket
    ///
    /// Both buckets are refilled for elapsed time on every call, admitted
    /// or denied. A denial reports the minimum wait across the two buckets;
    /// the caller chooses whether to sleep that long or fail fast.
    pub fn acquire(&self, cost: f64) -> AcquireOutcome {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let factor = state.rate_factor(now, self.config.throttle);

        state.primary.refill(now, factor);
        if state.primary.try_take(cost) {
            debug!(remaining = state.primary.tokens, "rate limiter admitted call");
            return AcquireOutcome::Admitted;
        }

        if let Some(burst) = state.burst.as_mut() {
            burst.refill(now, factor);
            if burst.try_take(cost) {
                debug!(remaining = burst.tokens, "rate limiter admitted call from burst bucket");
                return AcquireOutcome::Admitted;
            }
        }

        let mut retry_after = state.primary.wait_for(cost, factor);
        if let Some(burst) = state.burst.as_ref() {
            retry_after = retry_after.min(burst.wait_for(cost, factor));
        }

        debug!(?retry_after, "rate limiter denied call");
        AcquireOutcome::Denied { retry_after }
    }

    /// Record that the upstream reported throttling (HTTP 429)
    ///
    /// Starts or extends a cooldown window during which the effective
    /// refill rate is reduced per the configured [`ThrottlePolicy`], so
    /// sustained throughput self-corrects toward what the upstream will
    /// accept.
    pub fn note_throttled(&self) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        // Refill at the pre-cooldown rate before the factor changes
        let factor = state.rate_factor(now, self.config.throttle);
        state.primary.refill(now, factor);
        if let Some(burst) = state.burst.as_mut() {
            burst.refill(now, factor);
        }
        state.throttled_until = Some(now + self.config.throttle.cooldown);
        warn!(
            cooldown = ?self.config.throttle.cooldown,
            rate_factor = self.config.throttle.rate_factor,
            "upstream throttling reported, reducing refill rate"
        );
    }

    /// Get the current number of available primary-bucket tokens
    pub fn available_tokens(&self) -> f64 {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let factor = state.rate_factor(now, self.config.throttle);
        state.primary.refill(now, factor);
        state.primary.tokens
    }

    /// Snapshot of the limiter state for status surfaces
    pub fn status(&self) -> LimiterStatus {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let factor = state.rate_factor(now, self.config.throttle);
        state.primary.refill(now, factor);
        if let Some(burst) = state.burst.as_mut() {
            burst.refill(now, factor);
        }
        LimiterStatus {
            tokens: state.primary.tokens,
            capacity: self.config.capacity,
            refill_per_second: self.config.refill_per_second,
            burst_tokens: state.burst.as_ref().map(|b| b.tokens),
            throttled: state.throttled_until.is_some(),
        }
    }

    /// Reset both buckets to full capacity and clear any throttle cooldown
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.primary.tokens = self.config.capacity;
        state.primary.last_refill = now;
        if let Some(burst) = state.burst.as_mut() {
            burst.tokens = burst.capacity;
            burst.last_refill = now;
        }
        state.throttled_until = None;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Rate limiter state lock poisoned");
                poisoned.into_inner()
            }
        }
    }
}

impl<C: Clock> Clone for TokenBucketLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock> std::fmt::Debug for TokenBucketLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter").field("config", &self.config).finish()
    }
}
