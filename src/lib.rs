//! Hemmer SonarCloud Provider
//!
//! This crate reconciles declared SonarCloud objects (users, groups, projects,
//! quality gates, permissions and more) against a live SonarCloud or
//! SonarQube server over its web API.
//!
//! # Overview
//!
//! The crate provides:
//!
//! - **Transport**: a retrying HTTP client with basic auth and bounded backoff
//! - **Health gate**: a one-time server version check when a session connects
//! - **Resource descriptors**: declarative endpoint, key and field bindings per
//!   resource type, checked for consistency when built
//! - **Engine**: generic create, read, update, delete and import driven by a
//!   descriptor
//! - **Set reconciler**: add/remove deltas for set-valued attributes such as
//!   permissions
//! - **ProviderService trait**: a JSON-in/JSON-out facade keyed by resource type
//! - **Logging**: integration with `tracing` for structured logging
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_provider_sonarcloud::{
//!     init_logging, ConnectionConfig, ProviderService, SonarCloudProvider,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!
//!     // SONAR_HOST, SONAR_USER and SONAR_PASS
//!     let config = ConnectionConfig::from_env()?;
//!     let provider = SonarCloudProvider::connect(&config).await?;
//!
//!     let desired = json!({"name": "developers", "description": "Everyone who ships"});
//!     let plan = provider.plan("sonarcloud_group", None, desired).await?;
//!     let state = provider.create("sonarcloud_group", plan.planned_state).await?;
//!     tracing::info!(id = %state["id"], "Group created");
//!     Ok(())
//! }
//! ```
//!
//! # Lifecycle
//!
//! Every resource state carries its remote reference under `"id"`. A read
//! that finds nothing returns `None`, and the caller should forget the
//! object. An update that touches an attribute marked `force_new` is refused;
//! plan it first and call `replace` when the plan says so.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod health;
pub mod logging;
pub mod provider;
pub mod reconcile;
pub mod resources;
pub mod session;
pub mod testing;
pub mod transport;
pub mod types;
pub mod validation;

// Re-export main types at crate root
pub use config::ConnectionConfig;
pub use descriptor::{Attribute, AttributeType, Endpoint, Param, RefStrategy, ResourceDescriptor};
pub use engine::Engine;
pub use error::{ErrorCategory, ProviderError};
pub use health::{HealthError, ServerVersion};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::{ProviderService, SonarCloudProvider};
pub use reconcile::{ApplyOrder, PartialFailure, SetDelta};
pub use resources::Catalog;
pub use session::Session;
pub use transport::{RetryPolicy, Transport};
pub use types::{
    AttributeChange, Created, DesiredState, ImportedResource, ObservedState, PlanResult,
    ProviderMetadata, ReadOutcome, RemoteObjectRef, State,
};
pub use validation::{is_valid, validate, validate_result, Diagnostic, DiagnosticSeverity};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tracing;
