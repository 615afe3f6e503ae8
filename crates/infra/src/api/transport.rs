//! Request descriptor and transport contract for upstream calls
//!
//! The transport is the only component that talks HTTP. It accepts an
//! [`ApiRequest`], performs exactly one attempt, and returns either the
//! decoded JSON payload or a classified [`CallError`]. Response bodies are
//! never interpreted beyond status-code classification.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use tracing::debug;
use url::Url;

use super::errors::{classify_status, classify_transport, CallError};

/// HTTP methods the upstream read-only API is called with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMethod {
    #[default]
    Get,
    Post,
}

/// Descriptor for one idempotent upstream API call
///
/// `action` is the API operation name appended to the transport's base URL
/// (e.g. `package_search`); `params` are sent as query parameters for GET
/// and as a JSON object for POST.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub action: String,
    pub params: Vec<(String, String)>,
    pub method: RequestMethod,
}

impl ApiRequest {
    /// Create a GET request for the given API action
    pub fn get(action: impl Into<String>) -> Self {
        Self { action: action.into(), params: Vec::new(), method: RequestMethod::Get }
    }

    /// Create a POST request for the given API action
    pub fn post(action: impl Into<String>) -> Self {
        Self { action: action.into(), params: Vec::new(), method: RequestMethod::Post }
    }

    /// Add a request parameter
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Validate the request before it is allowed near the network
    ///
    /// `max_request_size` bounds the encoded parameter payload.
    pub fn validate(&self, max_request_size: usize) -> Result<(), CallError> {
        if self.action.is_empty() {
            return Err(CallError::validation("action must be a non-empty string"));
        }
        if self.action.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(CallError::validation(format!(
                "action must not contain whitespace or path separators: {:?}",
                self.action
            )));
        }
        let encoded: usize =
            self.params.iter().map(|(k, v)| k.len() + v.len() + 2).sum::<usize>() + self.action.len();
        if encoded > max_request_size {
            return Err(CallError::validation(format!(
                "request too large: {encoded} bytes (limit {max_request_size})"
            )));
        }
        Ok(())
    }
}

/// Narrow contract for the component that actually performs an HTTP attempt
///
/// One call to `execute` is one attempt; retry, rate limiting, and circuit
/// breaking all live above this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a single attempt of the request
    async fn execute(&self, request: &ApiRequest) -> Result<serde_json::Value, CallError>;
}

/// Configuration for the HTTP transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the upstream API (e.g. `https://data.example.org/api/3/action`)
    pub base_url: String,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout, connect included
    pub request_timeout: Duration,
    /// Upper bound on accepted response bodies, enforced via `Content-Length`
    pub max_response_size: u64,
    /// `User-Agent` header sent with every request
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.boston.gov/api/3/action".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_response_size: 10 * 1024 * 1024,
            user_agent: concat!("opendata-gateway/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TransportConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), CallError> {
        Url::parse(&self.base_url)
            .map_err(|e| CallError::validation(format!("invalid base_url: {e}")))?;
        if self.request_timeout.is_zero() {
            return Err(CallError::validation("request_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// HTTP transport over a pooled `reqwest` client
pub struct HttpTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpTransport {
    /// Create a transport with a connection-pooled client
    pub fn new(config: TransportConfig) -> Result<Self, CallError> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| CallError::Transport {
                message: "failed to build HTTP client".to_string(),
                source: Some(Box::new(e)),
            })?;

        Ok(Self { client, config })
    }

    fn url_for(&self, action: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), action)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<serde_json::Value, CallError> {
        let url = self.url_for(&request.action);
        let started = Instant::now();

        debug!(%url, method = ?request.method, "upstream request");

        let builder = match request.method {
            RequestMethod::Get => self.client.get(&url).query(&request.params),
            RequestMethod::Post => {
                let body: BTreeMap<&str, &str> =
                    request.params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                self.client.post(&url).json(&body)
            }
        };

        let response =
            builder.send().await.map_err(|e| classify_transport(e, started.elapsed()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        if let Some(length) = response.content_length() {
            if length > self.config.max_response_size {
                return Err(CallError::transport(format!(
                    "response too large: {length} bytes (limit {})",
                    self.config.max_response_size
                )));
            }
        }

        response.json().await.map_err(|e| CallError::Transport {
            message: "invalid JSON response".to_string(),
            source: Some(Box::new(e)),
        })
    }
}
