//! Session preflight check.
//!
//! Before any resource is reconciled the server must be reachable and report
//! a supported version. `api/server/version` answers with a plain-text dotted
//! version such as `8.9.1.44547`; only the major component is compared.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::{error, info, instrument};

use crate::error::ProviderError;
use crate::transport::{Method, RemoteRequest, Transport};

/// Path of the version-reporting endpoint.
pub const VERSION_PATH: &str = "api/server/version";

/// Oldest supported major version.
pub const MIN_SUPPORTED_MAJOR: u64 = 8;

/// Why the preflight check failed.
#[derive(Debug, Error)]
pub enum HealthError {
    /// The version endpoint could not be reached.
    #[error("unable to reach the server: {0}")]
    Unreachable(String),

    /// The version endpoint answered with something other than 200.
    #[error("version endpoint returned status {0}, expected 200")]
    UnexpectedStatus(u16),

    /// The body was not a dotted numeric version.
    #[error("unable to parse server version from '{0}'")]
    Unparseable(String),

    /// The server is older than the minimum supported version.
    #[error("unsupported server version {found}; minimum supported major version is {minimum}")]
    Unsupported {
        /// The version the server reported.
        found: ServerVersion,
        /// The minimum supported major version.
        minimum: u64,
    },
}

impl HealthError {
    /// Whether the failure is a network-level one rather than a bad answer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// A dotted server version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    components: Vec<u64>,
}

impl ServerVersion {
    /// The major version.
    pub fn major(&self) -> u64 {
        self.components[0]
    }

    /// All numeric components, most significant first.
    pub fn components(&self) -> &[u64] {
        &self.components
    }
}

impl FromStr for ServerVersion {
    type Err = HealthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let components = trimmed
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| HealthError::Unparseable(trimmed.to_string()))?;
        // split always yields at least one part, so an empty body fails to parse above
        Ok(Self { components })
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(u64::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Check that the server is reachable and supported.
#[instrument(skip(transport), fields(base_url = %transport.base_url()), name = "health.check")]
pub async fn check(transport: &Transport) -> Result<ServerVersion, HealthError> {
    let request = RemoteRequest::new(Method::Get, VERSION_PATH);
    let response = match transport.send(&request, 200).await {
        Ok(response) => response,
        Err(ProviderError::RemoteRejected { status, .. }) => {
            error!(status, "Version endpoint did not return 200");
            return Err(HealthError::UnexpectedStatus(status));
        }
        Err(e) => {
            error!(error = %e, "Unable to reach server");
            return Err(HealthError::Unreachable(e.to_string()));
        }
    };

    let version: ServerVersion = response.body.parse()?;
    if version.major() < MIN_SUPPORTED_MAJOR {
        error!(version = %version, "Unsupported server version");
        return Err(HealthError::Unsupported {
            found: version,
            minimum: MIN_SUPPORTED_MAJOR,
        });
    }

    info!(version = %version, "Server version supported");
    Ok(version)
}
