//! Connected sessions.
//!
//! A [`Session`] only exists once the health gate has passed, so holding one
//! is proof that the server was reachable and supported at connect time.

use std::sync::Arc;

use tracing::{error, info, instrument};

use crate::config::ConnectionConfig;
use crate::error::ProviderError;
use crate::health::{self, ServerVersion};
use crate::transport::{HttpClient, Transport, UreqClient};
use crate::validation::Diagnostic;

/// A validated, health-checked connection to one SonarCloud server.
#[derive(Debug, Clone)]
pub struct Session {
    transport: Transport,
    version: ServerVersion,
}

impl Session {
    /// Connect over HTTP using the production client.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, ProviderError> {
        Self::connect_with(config, Arc::new(UreqClient::new(config.timeout()))).await
    }

    /// Connect over the given client.
    ///
    /// The configuration is validated, then the health gate runs exactly once.
    #[instrument(skip(config, client), fields(host = %config.host))]
    pub async fn connect_with(
        config: &ConnectionConfig,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self, ProviderError> {
        let errors: Vec<Diagnostic> = config
            .validate()
            .into_iter()
            .filter(Diagnostic::is_error)
            .collect();
        if !errors.is_empty() {
            let summary = errors
                .iter()
                .map(|d| d.summary.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            error!(errors = %summary, "Invalid connection configuration");
            return Err(ProviderError::Configuration(summary));
        }

        let transport = Transport::new(config, client);
        let version = health::check(&transport).await?;
        info!(version = %version, base_url = transport.base_url(), "Session established");

        Ok(Self { transport, version })
    }

    /// The transport shared by every engine of this session.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The version reported by the server at connect time.
    pub fn server_version(&self) -> &ServerVersion {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthError, VERSION_PATH};
    use crate::testing::FakeRemote;
    use crate::transport::{Method, RetryPolicy};

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("sonar.example.com", "admin", "admin")
            .with_retry(RetryPolicy::immediate(2))
    }

    #[tokio::test]
    async fn test_connect_runs_health_gate_once() {
        let remote = FakeRemote::new();
        remote.reply(Method::Get, VERSION_PATH, 200, "9.4.0");

        let session = Session::connect_with(&config(), Arc::new(remote.clone()))
            .await
            .unwrap();

        assert_eq!(session.server_version().major(), 9);
        assert_eq!(session.transport().base_url(), "https://sonar.example.com/");
        assert_eq!(remote.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_fails_on_old_server() {
        let remote = FakeRemote::new();
        remote.reply(Method::Get, VERSION_PATH, 200, "7.9");

        let err = Session::connect_with(&config(), Arc::new(remote))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Health(HealthError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config_without_calling() {
        let remote = FakeRemote::new();
        let config = ConnectionConfig::new("", "admin", "admin");

        let err = Session::connect_with(&config, Arc::new(remote.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_http_scheme_warning_does_not_block() {
        let remote = FakeRemote::new();
        remote.reply(Method::Get, VERSION_PATH, 200, "8.0");
        let config = config().with_scheme("http");

        let session = Session::connect_with(&config, Arc::new(remote)).await.unwrap();
        assert_eq!(session.transport().base_url(), "http://sonar.example.com/");
    }
}
