//! Retrying HTTP transport.
//!
//! [`Transport::send`] issues one logical request against the session's base
//! address. Transient network faults are retried with exponential backoff
//! according to a [`RetryPolicy`]; a response with an unexpected status code
//! is never retried and surfaces as [`ProviderError::RemoteRejected`], since
//! repeating a non-idempotent write could duplicate its side effects.
//!
//! The wire is abstracted behind the [`HttpClient`] trait so the engine can
//! be exercised against [`FakeRemote`](crate::testing::FakeRemote). The
//! production client is [`UreqClient`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::ProviderError;

/// HTTP method of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `DELETE`
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        })
    }
}

/// One query parameter of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParam {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: String,
    /// Whether the value must be masked in logs.
    pub sensitive: bool,
}

/// A request relative to the session base address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    /// HTTP method.
    pub method: Method,
    /// Path below the base address, without a leading slash.
    pub path: String,
    /// Query parameters, in order.
    pub query: Vec<QueryParam>,
}

impl RemoteRequest {
    /// Create a request with no parameters.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into().trim_start_matches('/').to_string(),
            query: Vec::new(),
        }
    }

    /// Append a parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value, false);
        self
    }

    /// Append a parameter whose value is masked in logs.
    pub fn sensitive_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(name, value, true);
        self
    }

    /// Append a parameter in place.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>, sensitive: bool) {
        self.query.push(QueryParam {
            name: name.into(),
            value: value.into(),
            sensitive,
        });
    }

    /// Look up the first value of a parameter.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }
}

impl fmt::Display for RemoteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)?;
        for (i, p) in self.query.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            let value = if p.sensitive { "***" } else { p.value.as_str() };
            write!(f, "{}{}={}", sep, p.name, value)?;
        }
        Ok(())
    }
}

/// A fully addressed call handed to an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpCall {
    /// Absolute URL without the query string.
    pub url: String,
    /// The request being sent.
    pub request: RemoteRequest,
    /// Value of the `Authorization` header.
    pub authorization: String,
}

/// A response as received from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// Status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl RawResponse {
    /// Create a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Decode the body as JSON.
    ///
    /// An empty body decodes as `null`; anything else that is not JSON is a
    /// [`ProviderError::MalformedResponse`].
    pub fn json(&self) -> Result<serde_json::Value, ProviderError> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&self.body).map_err(|e| {
            ProviderError::MalformedResponse(format!("response body is not valid JSON: {}", e))
        })
    }
}

/// A failure to exchange a request with the service.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct NetworkFault {
    /// Description of the failure.
    pub message: String,
    /// Whether the fault is worth retrying (refused connection, timeout).
    pub transient: bool,
}

impl NetworkFault {
    /// A fault worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// A fault that will not go away by retrying.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// The wire beneath a [`Transport`].
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform exactly one exchange. Any received status is a success here.
    async fn execute(&self, call: HttpCall) -> Result<RawResponse, NetworkFault>;
}

/// Bounded exponential backoff for transient network faults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier applied per retry.
    pub backoff_factor: f64,
    /// Upper bound on a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// A policy with millisecond delays, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 1,
            backoff_factor: 1.0,
            max_delay_ms: 1,
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Issues requests against one SonarCloud base address.
#[derive(Clone)]
pub struct Transport {
    client: Arc<dyn HttpClient>,
    base_url: String,
    authorization: String,
    retry: RetryPolicy,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Create a transport for the given connection over `client`.
    pub fn new(config: &ConnectionConfig, client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            base_url: config.base_url(),
            authorization: basic_auth(&config.user, &config.pass),
            retry: config.retry.clone(),
        }
    }

    /// The base address, ending in `/`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The retry policy in effect.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Send a request, expecting `expected_status`.
    pub async fn send(
        &self,
        request: &RemoteRequest,
        expected_status: u16,
    ) -> Result<RawResponse, ProviderError> {
        let call = HttpCall {
            url: format!("{}{}", self.base_url, request.path),
            request: request.clone(),
            authorization: self.authorization.clone(),
        };
        let max_attempts = self.retry.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(request = %request, attempt, "Sending request");
            match self.client.execute(call.clone()).await {
                Ok(response) if response.status == expected_status => {
                    debug!(request = %request, status = response.status, "Request succeeded");
                    return Ok(response);
                }
                Ok(response) => {
                    warn!(
                        request = %request,
                        status = response.status,
                        expected = expected_status,
                        "Remote rejected request"
                    );
                    return Err(ProviderError::RemoteRejected {
                        status: response.status,
                        body: response.body,
                    });
                }
                Err(fault) if fault.transient && attempt < max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    warn!(
                        request = %request,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %fault,
                        "Transient network failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(fault) => {
                    warn!(request = %request, attempt, error = %fault, "Giving up on request");
                    return Err(ProviderError::Transport {
                        attempts: attempt,
                        message: fault.message,
                    });
                }
            }
        }
    }
}

fn basic_auth(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
}

/// [`HttpClient`] backed by a blocking `ureq` agent run on tokio's blocking
/// pool.
#[derive(Clone)]
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    /// Create a client with a global per-request timeout.
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: config.into(),
        }
    }

    fn execute_blocking(agent: &ureq::Agent, call: &HttpCall) -> Result<RawResponse, ureq::Error> {
        let pairs = call
            .request
            .query
            .iter()
            .map(|p| (p.name.as_str(), p.value.as_str()));
        let auth = call.authorization.as_str();

        let mut response = match call.request.method {
            Method::Get => agent
                .get(&call.url)
                .header("Authorization", auth)
                .query_pairs(pairs)
                .call()?,
            Method::Delete => agent
                .delete(&call.url)
                .header("Authorization", auth)
                .query_pairs(pairs)
                .call()?,
            Method::Post => agent
                .post(&call.url)
                .header("Authorization", auth)
                .query_pairs(pairs)
                .send_empty()?,
        };

        let status = response.status().as_u16();
        let body = response.body_mut().read_to_string()?;
        Ok(RawResponse { status, body })
    }
}

#[async_trait::async_trait]
impl HttpClient for UreqClient {
    async fn execute(&self, call: HttpCall) -> Result<RawResponse, NetworkFault> {
        let agent = self.agent.clone();
        let outcome = tokio::task::spawn_blocking(move || Self::execute_blocking(&agent, &call))
            .await
            .map_err(|e| NetworkFault::permanent(format!("request task failed: {}", e)))?;

        outcome.map_err(|err| {
            let transient = matches!(
                err,
                ureq::Error::Io(_)
                    | ureq::Error::Timeout(_)
                    | ureq::Error::ConnectionFailed
                    | ureq::Error::HostNotFound
            );
            NetworkFault {
                message: err.to_string(),
                transient,
            }
        })
    }
}
