//! Provider facade.
//!
//! This module provides the [`ProviderService`] trait, a JSON-in/JSON-out view
//! of the resource lifecycle keyed by resource type name, and
//! [`SonarCloudProvider`], which implements it by dispatching to an
//! [`Engine`] per call.
//!
//! Resource states are JSON objects holding the attribute values plus the
//! reference under `"id"`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConnectionConfig;
use crate::engine::Engine;
use crate::error::ProviderError;
use crate::resources::Catalog;
use crate::session::Session;
use crate::transport::HttpClient;
use crate::types::{
    scalar_text, AttributeChange, Created, ImportedResource, PlanResult, ProviderMetadata,
    ReadOutcome, RemoteObjectRef, State,
};
use crate::validation::{self, Diagnostic, ID_ATTRIBUTE};

/// Lifecycle operations over JSON resource states.
///
/// # Example
///
/// ```ignore
/// use hemmer_provider_sonarcloud::{ConnectionConfig, ProviderService, SonarCloudProvider};
/// use serde_json::json;
///
/// let provider = SonarCloudProvider::connect(&ConnectionConfig::from_env()?).await?;
/// let state = provider
///     .create("sonarcloud_group", json!({"name": "developers"}))
///     .await?;
/// println!("created group {}", state["id"]);
/// ```
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// Return the supported resource types.
    fn metadata(&self) -> ProviderMetadata;

    /// Validate a resource's configuration before planning.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let _ = (resource_type, config);
        Ok(vec![])
    }

    /// Plan changes for a resource.
    ///
    /// A `null` proposed state plans the deletion of `prior_state`.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError>;

    /// Create a new resource.
    async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError>;

    /// Read the current state of a resource; `None` when it no longer exists.
    async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Option<Value>, ProviderError>;

    /// Update an existing resource in place.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError>;

    /// Delete a resource.
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError>;

    /// Replace a resource whose planned change cannot be applied in place.
    async fn replace(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.delete(resource_type, prior_state).await?;
        self.create(resource_type, planned_state).await
    }

    /// Import existing infrastructure into management.
    async fn import_resource(
        &self,
        resource_type: &str,
        _id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        Err(ProviderError::Unimplemented(format!(
            "Import not supported for resource type: {}",
            resource_type
        )))
    }
}

/// The SonarCloud provider.
#[derive(Debug, Clone)]
pub struct SonarCloudProvider {
    session: Session,
    catalog: Catalog,
}

impl SonarCloudProvider {
    /// Connect to the configured server with the production HTTP client.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, ProviderError> {
        Self::new(Session::connect(config).await?, Catalog::sonarcloud()?)
    }

    /// Connect over the given HTTP client.
    pub async fn connect_with(
        config: &ConnectionConfig,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self, ProviderError> {
        Self::new(
            Session::connect_with(config, client).await?,
            Catalog::sonarcloud()?,
        )
    }

    /// Serve the given catalog over an established session.
    pub fn new(session: Session, catalog: Catalog) -> Result<Self, ProviderError> {
        if catalog.is_empty() {
            return Err(ProviderError::Configuration(
                "resource catalog is empty".to_string(),
            ));
        }
        Ok(Self { session, catalog })
    }

    /// The underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The served catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn engine(&self, resource_type: &str) -> Result<Engine<'_>, ProviderError> {
        let descriptor = self
            .catalog
            .get(resource_type)
            .ok_or_else(|| ProviderError::UnknownResource(resource_type.to_string()))?;
        Ok(Engine::new(&self.session, descriptor))
    }
}

/// Desired attributes, then create-time computed ones, then observed ones.
fn created_state(desired: State, created: Created, observed: Option<State>) -> Value {
    let mut state = desired;
    state.merge(&created.computed);
    if let Some(observed) = observed {
        state.merge(&observed);
    }
    with_id(state, created.reference)
}

/// Observe a freshly created object.
///
/// The object already exists remotely, so a failed or empty read must not
/// lose its reference.
async fn read_back(engine: &Engine<'_>, created: &Created, desired: &State) -> Option<State> {
    match engine.read(&created.reference, desired).await {
        Ok(ReadOutcome::Found { observed, .. }) => Some(observed),
        Ok(ReadOutcome::Absent) => {
            warn!(reference = %created.reference, "Created resource not yet visible");
            None
        }
        Err(e) => {
            warn!(reference = %created.reference, error = %e, "Read after create failed");
            None
        }
    }
}

/// Split a resource state into its reference and its attributes.
fn split_state(value: Value) -> Result<(Option<RemoteObjectRef>, State), ProviderError> {
    let mut state = State::from_value(value)?;
    let reference = match state.remove(ID_ATTRIBUTE) {
        Some(id) => {
            let id = scalar_text(&id).ok_or_else(|| {
                ProviderError::Validation(format!("'{}' must be a string", ID_ATTRIBUTE))
            })?;
            Some(RemoteObjectRef::parse(id)?)
        }
        None => None,
    };
    Ok((reference, state))
}

fn require_reference(
    value: Value,
    resource_type: &str,
) -> Result<(RemoteObjectRef, State), ProviderError> {
    match split_state(value)? {
        (Some(reference), state) => Ok((reference, state)),
        (None, _) => Err(ProviderError::Validation(format!(
            "{} state has no '{}'",
            resource_type, ID_ATTRIBUTE
        ))),
    }
}

/// Drop server-computed attributes from a planned state; they are never sent.
fn configurable(engine: &Engine<'_>, mut state: State) -> State {
    for attr in engine
        .descriptor()
        .attributes
        .iter()
        .filter(|a| !a.flags.is_configurable())
    {
        state.remove(&attr.name);
    }
    state
}

fn with_id(state: State, reference: RemoteObjectRef) -> Value {
    state.with(ID_ATTRIBUTE, reference.into_string()).to_value()
}

#[async_trait::async_trait]
impl ProviderService for SonarCloudProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            resources: self.catalog.names().map(str::to_string).collect(),
            importable: self
                .catalog
                .iter()
                .filter(|d| d.is_importable())
                .map(|d| d.name.clone())
                .collect(),
        }
    }

    #[instrument(skip(self, config))]
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        debug!("ValidateResourceConfig called");
        let engine = self.engine(resource_type)?;
        let diagnostics = validation::validate(engine.descriptor(), &config);
        if diagnostics.iter().any(Diagnostic::is_error) {
            warn!(diagnostics = diagnostics.len(), "ValidateResourceConfig completed with errors");
        } else {
            info!("ValidateResourceConfig completed successfully");
        }
        Ok(diagnostics)
    }

    #[instrument(skip(self, prior_state, proposed_state))]
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        debug!(is_create = prior_state.is_none(), "Plan called");
        let engine = self.engine(resource_type)?;
        let prior = prior_state.map(split_state).transpose()?;

        if proposed_state.is_null() {
            let changes: Vec<AttributeChange> = prior
                .map(|(_, state)| {
                    state
                        .iter()
                        .map(|(name, value)| AttributeChange::removed(name, value.clone()))
                        .collect()
                })
                .unwrap_or_default();
            return Ok(PlanResult::from_changes(Value::Null, changes));
        }

        let (_, proposed) = split_state(proposed_state)?;
        let proposed = configurable(&engine, proposed);
        let (reference, prior) = match prior {
            Some((reference, state)) => (reference, Some(state)),
            None => (None, None),
        };
        let mut plan = engine.plan(prior.as_ref(), &proposed)?;
        let keeps_id = !plan.requires_replace;
        match (reference, &mut plan.planned_state) {
            (Some(reference), Value::Object(map)) if keeps_id => {
                map.insert(ID_ATTRIBUTE.to_string(), Value::String(reference.into_string()));
            }
            _ => {}
        }
        info!(
            changes = plan.changes.len(),
            requires_replace = plan.requires_replace,
            "Plan completed successfully"
        );
        Ok(plan)
    }

    #[instrument(skip(self, planned_state))]
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value, ProviderError> {
        info!("Create called");
        let engine = self.engine(resource_type)?;
        let (_, desired) = split_state(planned_state)?;
        let desired = configurable(&engine, desired);

        let created = engine.create(&desired).await.inspect_err(|e| {
            error!(error = %e, "Create failed");
        })?;

        let observed = read_back(&engine, &created, &desired).await;
        info!(reference = %created.reference, "Create completed successfully");
        Ok(created_state(desired, created, observed))
    }

    #[instrument(skip(self, current_state))]
    async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Option<Value>, ProviderError> {
        debug!("Read called");
        let engine = self.engine(resource_type)?;
        let (reference, mut state) = require_reference(current_state, resource_type)?;

        match engine.read(&reference, &state).await {
            Ok(ReadOutcome::Found {
                reference,
                observed,
            }) => {
                state.merge(&observed);
                debug!("Read completed successfully");
                Ok(Some(with_id(state, reference)))
            }
            Ok(ReadOutcome::Absent) => {
                info!(reference = %reference, "Resource is gone");
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, "Read failed");
                Err(e)
            }
        }
    }

    #[instrument(skip(self, prior_state, planned_state))]
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        info!("Update called");
        let engine = self.engine(resource_type)?;
        let (reference, previous) = require_reference(prior_state, resource_type)?;
        let (_, desired) = split_state(planned_state)?;
        let desired = configurable(&engine, desired);

        let observed = engine
            .update(&reference, &desired, &previous)
            .await
            .inspect_err(|e| error!(error = %e, "Update failed"))?;

        let mut state = desired;
        for attr in engine.descriptor().attributes.iter().filter(|a| a.flags.computed) {
            if state.contains(&attr.name) {
                continue;
            }
            if let Some(value) = previous.get(&attr.name) {
                state.insert(attr.name.clone(), value.clone());
            }
        }
        state.merge(&observed);
        info!("Update completed successfully");
        Ok(with_id(state, reference))
    }

    #[instrument(skip(self, current_state))]
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<(), ProviderError> {
        info!("Delete called");
        let engine = self.engine(resource_type)?;
        let (reference, state) = require_reference(current_state, resource_type)?;

        engine
            .delete(reference, &state)
            .await
            .inspect_err(|e| error!(error = %e, "Delete failed"))?;
        info!("Delete completed successfully");
        Ok(())
    }

    #[instrument(skip(self, prior_state, planned_state))]
    async fn replace(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        info!("Replace called");
        let engine = self.engine(resource_type)?;
        let (reference, previous) = require_reference(prior_state, resource_type)?;
        let (_, desired) = split_state(planned_state)?;
        let desired = configurable(&engine, desired);

        let created = engine
            .replace(reference, &previous, &desired)
            .await
            .inspect_err(|e| error!(error = %e, "Replace failed"))?;
        let observed = read_back(&engine, &created, &desired).await;
        info!(reference = %created.reference, "Replace completed successfully");
        Ok(created_state(desired, created, observed))
    }

    #[instrument(skip(self))]
    async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        info!("ImportResource called");
        let engine = self.engine(resource_type)?;
        let (reference, state) = engine
            .import(id)
            .await
            .inspect_err(|e| error!(error = %e, "ImportResource failed"))?;
        info!(reference = %reference, "ImportResource completed successfully");
        Ok(vec![ImportedResource::new(
            resource_type,
            with_id(state, reference),
        )])
    }
}
