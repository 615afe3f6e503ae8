//! Classified error taxonomy for guarded upstream calls
//!
//! Every failure an outbound call can produce is classified exactly once,
//! at the point the transport or validation layer detects it, into one of a
//! closed set of kinds. The retry and circuit breaker logic consume the
//! classification; callers never see a raw transport error.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Boxed error type for carrying an underlying cause
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The closed set of failure kinds, in taxonomy order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Malformed request; never retried
    Validation,
    /// Denied by our own rate limiter; retried only by the caller's own
    /// backoff, never by the retry policy
    RateLimited,
    /// Upstream 4xx other than 429; not retried
    UpstreamClient,
    /// Upstream 429; retryable, and reported back to the rate limiter
    UpstreamThrottled,
    /// Upstream 5xx; retryable
    UpstreamServer,
    /// Connection or read timeout; retryable
    TransportTimeout,
    /// Connection reset/refused or other transport fault; retryable
    Transport,
    /// Short-circuited by the circuit breaker; not retried
    CircuitOpen,
    /// Caller-initiated abort; never retried
    Cancelled,
}

impl ErrorKind {
    /// Whether errors of this kind are worth retrying within a single
    /// logical call
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::UpstreamThrottled | Self::UpstreamServer | Self::TransportTimeout | Self::Transport
        )
    }
}

/// A classified failure of a guarded upstream call
///
/// Constructed once per failure and immutable thereafter; the retry policy
/// and circuit breaker only inspect it.
#[derive(Debug, Error)]
pub enum CallError {
    /// The request failed validation before any network activity
    #[error("Invalid request: {message}")]
    Validation { message: String },

    /// The local rate limiter denied the call
    #[error("Rate limit exceeded, retry in {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The upstream rejected the request (4xx other than 429)
    #[error("Upstream client error ({status}): {message}")]
    UpstreamClient { status: u16, message: String },

    /// The upstream reported throttling (429)
    #[error("Upstream throttled (429)")]
    UpstreamThrottled { retry_after: Option<Duration> },

    /// The upstream failed (5xx)
    #[error("Upstream server error ({status}): {message}")]
    UpstreamServer { status: u16, message: String },

    /// The transport timed out before a response arrived
    #[error("Transport timeout after {elapsed:?}")]
    TransportTimeout { elapsed: Duration },

    /// The transport failed below the HTTP layer
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// The circuit breaker short-circuited the call
    #[error("Circuit breaker open")]
    CircuitOpen { retry_in: Option<Duration> },

    /// The caller aborted the call
    #[error("Call cancelled")]
    Cancelled,
}

impl CallError {
    /// The kind of this error within the closed taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::UpstreamClient { .. } => ErrorKind::UpstreamClient,
            Self::UpstreamThrottled { .. } => ErrorKind::UpstreamThrottled,
            Self::UpstreamServer { .. } => ErrorKind::UpstreamServer,
            Self::TransportTimeout { .. } => ErrorKind::TransportTimeout,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether this error should be retried within a single logical call
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// The upstream HTTP status, for errors that carry one
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::UpstreamClient { status, .. } | Self::UpstreamServer { status, .. } => {
                Some(*status)
            }
            Self::UpstreamThrottled { .. } => Some(429),
            _ => None,
        }
    }

    /// A server- or limiter-provided hint for when to try again
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            Self::UpstreamThrottled { retry_after } => *retry_after,
            Self::CircuitOpen { retry_in } => *retry_in,
            _ => None,
        }
    }

    /// Build a validation error from anything stringly
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Build a transport error without an underlying cause
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), source: None }
    }
}

/// Maximum number of body bytes echoed into an error message
const BODY_SNIPPET_LEN: usize = 500;

/// Classify a non-success HTTP status into a `CallError`
///
/// `retry_after` is the parsed `Retry-After` header, when the upstream sent
/// one. The body is only echoed into the message (truncated), never
/// interpreted.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> CallError {
    let snippet: String = body.chars().take(BODY_SNIPPET_LEN).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        CallError::UpstreamThrottled { retry_after }
    } else if status.is_server_error() {
        CallError::UpstreamServer { status: status.as_u16(), message: snippet }
    } else {
        CallError::UpstreamClient { status: status.as_u16(), message: snippet }
    }
}

/// Classify a transport-level `reqwest` failure into a `CallError`
///
/// `elapsed` is how long the attempt ran before the transport gave up.
pub fn classify_transport(error: reqwest::Error, elapsed: Duration) -> CallError {
    if error.is_timeout() {
        CallError::TransportTimeout { elapsed }
    } else if error.is_connect() {
        CallError::Transport {
            message: "connection failed".to_string(),
            source: Some(Box::new(error)),
        }
    } else {
        CallError::Transport { message: error.to_string(), source: Some(Box::new(error)) }
    }
}
