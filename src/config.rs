//! Connection configuration.
//!
//! A [`ConnectionConfig`] is supplied once, at session start. It can be
//! deserialized from the provider configuration block or assembled from the
//! environment:
//!
//! | field    | variables                              | default |
//! |----------|----------------------------------------|---------|
//! | `user`   | `SONAR_USER`, `SONARCLOUD_USER`        |         |
//! | `pass`   | `SONAR_PASS`, `SONARCLOUD_PASS`        |         |
//! | `host`   | `SONAR_HOST`, `SONARCLOUD_HOST`        |         |
//! | `scheme` | `SONAR_SCHEME`, `SONARCLOUD_SCHEME`    | `https` |
//!
//! SonarCloud user tokens are passed as `user` with an empty `pass`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::transport::RetryPolicy;
use crate::validation::Diagnostic;

const DEFAULT_SCHEME: &str = "https";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How to reach and authenticate against the SonarCloud API.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// `http` or `https`.
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Host name, optionally with a port.
    pub host: String,
    /// Basic-auth user, or a user token.
    pub user: String,
    /// Basic-auth password; empty when `user` is a token.
    #[serde(default)]
    pub pass: String,
    /// Per-request timeout, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry policy for transient network failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_scheme() -> String {
    DEFAULT_SCHEME.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ConnectionConfig {
    /// Create an `https` configuration with default timeout and retry.
    pub fn new(host: impl Into<String>, user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            scheme: default_scheme(),
            host: host.into(),
            user: user.into(),
            pass: pass.into(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
        }
    }

    /// Read the configuration from `SONAR_*` / `SONARCLOUD_*` variables.
    pub fn from_env() -> Result<Self, ProviderError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ProviderError> {
        let first = |names: [&str; 2]| names.iter().find_map(|n| lookup(*n));
        let required = |names: [&str; 2]| {
            first(names).ok_or_else(|| {
                ProviderError::Configuration(format!("{} or {} must be set", names[0], names[1]))
            })
        };

        let mut config = Self::new(
            required(["SONAR_HOST", "SONARCLOUD_HOST"])?,
            required(["SONAR_USER", "SONARCLOUD_USER"])?,
            first(["SONAR_PASS", "SONARCLOUD_PASS"]).unwrap_or_default(),
        );
        if let Some(scheme) = first(["SONAR_SCHEME", "SONARCLOUD_SCHEME"]) {
            config.scheme = scheme;
        }
        Ok(config)
    }

    /// Deserialize a configuration block.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProviderError> {
        serde_json::from_value(value)
            .map_err(|e| ProviderError::Configuration(format!("invalid provider config: {}", e)))
    }

    /// Use a different scheme.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Use a different retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// The address every request path is joined to, ending in `/`.
    pub fn base_url(&self) -> String {
        format!(
            "{}://{}/",
            self.scheme,
            self.host.trim_end_matches('/')
        )
    }

    /// Check the configuration, returning diagnostics for every problem.
    pub fn validate(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        if self.host.trim().is_empty() {
            diagnostics.push(Diagnostic::error("Missing host").with_attribute("host"));
        } else if self.host.contains("://") {
            diagnostics.push(
                Diagnostic::error("Host must not include a scheme")
                    .with_detail("Set the scheme separately")
                    .with_attribute("host"),
            );
        }
        if self.user.is_empty() {
            diagnostics.push(Diagnostic::error("Missing user").with_attribute("user"));
        }
        if self.scheme != "http" && self.scheme != "https" {
            diagnostics.push(
                Diagnostic::error(format!("Unsupported scheme '{}'", self.scheme))
                    .with_detail("Expected 'http' or 'https'")
                    .with_attribute("scheme"),
            );
        } else if self.scheme == "http" {
            diagnostics.push(
                Diagnostic::warning("Credentials will be sent unencrypted over http")
                    .with_attribute("scheme"),
            );
        }
        if self.retry.max_attempts == 0 {
            diagnostics.push(
                Diagnostic::error("retry.max_attempts must be at least 1")
                    .with_attribute("retry.max_attempts"),
            );
        }
        if self.timeout_secs == 0 {
            diagnostics.push(
                Diagnostic::error("timeout_secs must be positive").with_attribute("timeout_secs"),
            );
        }
        diagnostics
    }
}
