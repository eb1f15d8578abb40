//! Error types for the SonarCloud provider.

use thiserror::Error;

use crate::health::HealthError;
use crate::reconcile::PartialFailure;

/// Errors that can occur while reconciling resources.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The remote service could not be reached, even after retrying.
    #[error("Transport error after {attempts} attempt(s): {message}")]
    Transport {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Description of the last network failure.
        message: String,
    },

    /// The remote service answered with an unexpected status code.
    #[error("Remote rejected request with status {status}: {body}")]
    RemoteRejected {
        /// The status code that was received.
        status: u16,
        /// The response body, as returned by the service.
        body: String,
    },

    /// A response could not be decoded into the expected shape.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The requested remote object does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Some, but not all, items of a set delta were applied.
    #[error(transparent)]
    PartialFailure(#[from] PartialFailure),

    /// An attribute that forces replacement was passed to an in-place update.
    #[error("Attribute '{attribute}' of {resource_type} cannot be updated in place; replace the resource instead")]
    ReplacementRequired {
        /// The resource type being updated.
        resource_type: String,
        /// The attribute that forces replacement.
        attribute: String,
    },

    /// The session preflight check failed.
    #[error("Health check failed: {0}")]
    Health(#[from] HealthError),

    /// A validation error occurred.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A resource descriptor is internally inconsistent.
    #[error("Invalid descriptor for {resource_type}: {reason}")]
    InvalidDescriptor {
        /// The resource type whose descriptor was rejected.
        resource_type: String,
        /// Why the descriptor was rejected.
        reason: String,
    },

    /// The requested resource type is unknown.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// Operation not implemented for this resource type.
    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Broad classification of a [`ProviderError`], used by callers to pick a
/// recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The remote state is unknown; retrying later may succeed.
    Unreachable,
    /// The remote object definitively does not exist; re-create it.
    Absent,
    /// The service refused the request or answered with garbage.
    Rejected,
    /// Local input or configuration is wrong; fix the declaration.
    Invalid,
    /// Some remote changes were applied before a failure.
    Partial,
}

impl ErrorCategory {
    /// Whether an operation failing with this category is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable | Self::Partial)
    }
}

impl ProviderError {
    /// Get the error message as a string.
    ///
    /// Structured variants return a short summary; use `Display` for the
    /// full text.
    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message, .. } => message,
            Self::RemoteRejected { body, .. } => body,
            Self::MalformedResponse(msg) => msg,
            Self::NotFound(msg) => msg,
            Self::PartialFailure(_) => "set reconciliation stopped part way",
            Self::ReplacementRequired { attribute, .. } => attribute,
            Self::Health(_) => "health check failed (see Display output)",
            Self::Validation(msg) => msg,
            Self::Configuration(msg) => msg,
            Self::InvalidDescriptor { reason, .. } => reason,
            Self::UnknownResource(msg) => msg,
            Self::Unimplemented(msg) => msg,
            Self::Serialization(_err) => "serialization error (see Debug output)",
        }
    }

    /// Classify this error for recovery decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport { .. } => ErrorCategory::Unreachable,
            Self::Health(err) if err.is_transport() => ErrorCategory::Unreachable,
            Self::NotFound(_) => ErrorCategory::Absent,
            Self::RemoteRejected { .. } | Self::MalformedResponse(_) | Self::Health(_) => {
                ErrorCategory::Rejected
            }
            Self::PartialFailure(_) => ErrorCategory::Partial,
            Self::ReplacementRequired { .. }
            | Self::Validation(_)
            | Self::Configuration(_)
            | Self::InvalidDescriptor { .. }
            | Self::UnknownResource(_)
            | Self::Unimplemented(_)
            | Self::Serialization(_) => ErrorCategory::Invalid,
        }
    }

    /// Whether the service answered with one of the given status codes.
    pub fn is_status(&self, statuses: &[u16]) -> bool {
        matches!(self, Self::RemoteRejected { status, .. } if statuses.contains(status))
    }
}
