//! Descriptor-driven reconciliation engine.
//!
//! An [`Engine`] pairs a connected [`Session`] with one
//! [`ResourceDescriptor`] and drives the lifecycle of objects of that type:
//!
//! ```text
//! Unmanaged --create--> Tracked --update--> Tracked
//!     ^                    |  \
//!     |                    |   `--replacing change--> delete + create --> Tracked (new ref)
//!     `---- read: Absent --+---- delete
//! ```
//!
//! All remote calls of one operation are awaited in sequence. Nothing here is
//! specific to any one resource type; the descriptor supplies the endpoints,
//! keys and field bindings.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::descriptor::{
    Attribute, Endpoint, ImportSpec, ItemsAt, KeySource, ParamSource, RefStrategy,
    ResourceDescriptor, SetSpec, WhenAbsent,
};
use crate::error::ProviderError;
use crate::reconcile::{self, ApplyOrder, SetOperations};
use crate::session::Session;
use crate::transport::{RawResponse, RemoteRequest, Transport};
use crate::types::{
    scalar_text, AttributeChange, Created, DesiredState, ObservedState, PlanResult, ReadOutcome,
    RemoteObjectRef, State,
};
use crate::validation::{self, Diagnostic};

/// Runs lifecycle operations for one resource type over one session.
#[derive(Debug, Clone, Copy)]
pub struct Engine<'s> {
    transport: &'s Transport,
    descriptor: &'s ResourceDescriptor,
}

impl<'s> Engine<'s> {
    /// Create an engine. Only a connected session can provide the transport.
    pub fn new(session: &'s Session, descriptor: &'s ResourceDescriptor) -> Self {
        Self {
            transport: session.transport(),
            descriptor,
        }
    }

    /// The descriptor this engine drives.
    pub fn descriptor(&self) -> &'s ResourceDescriptor {
        self.descriptor
    }

    /// Create the object described by `desired`.
    ///
    /// On success the returned reference is the only handle to the new
    /// object. Set-valued attributes are added after the create call; if one
    /// of those additions fails the error is a
    /// [`ProviderError::PartialFailure`] and the object exists remotely.
    #[instrument(skip(self, desired), fields(resource_type = %self.descriptor.name))]
    pub async fn create(&self, desired: &DesiredState) -> Result<Created, ProviderError> {
        self.check(desired)?;

        let spec = &self.descriptor.create;
        let body = match &spec.endpoint {
            Some(endpoint) => {
                let request = self.request(endpoint, desired, None, None)?;
                let response = self.transport.send(&request, endpoint.expected_status).await?;
                response.json()?
            }
            None => Value::Null,
        };

        let reference = match &spec.reference {
            RefStrategy::ResponseField(pointer) => body
                .pointer(pointer)
                .and_then(scalar_text)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    ProviderError::MalformedResponse(format!(
                        "create response for {} has no identifier at {}",
                        self.descriptor.name, pointer
                    ))
                })
                .and_then(RemoteObjectRef::parse)?,
            RefStrategy::Derived {
                attributes,
                separator,
            } => self.derive_reference(desired, attributes, separator)?,
            RefStrategy::Generated => RemoteObjectRef::parse(Uuid::new_v4().to_string())?,
        };

        let mut computed = State::new();
        for capture in &spec.captures {
            let value = body.pointer(&capture.pointer).ok_or_else(|| {
                ProviderError::MalformedResponse(format!(
                    "create response for {} has no {} at {}",
                    self.descriptor.name, capture.attribute, capture.pointer
                ))
            })?;
            computed.insert(capture.attribute.clone(), self.decode(&capture.attribute, value)?);
        }

        for set in &self.descriptor.sets {
            let items = desired.get_items(&set.attribute);
            let ops = EndpointSet::new(self, set, desired);
            reconcile::reconcile(
                &reference,
                items,
                Vec::<String>::new(),
                ApplyOrder::default(),
                &ops,
            )
            .await?;
        }

        info!(reference = %reference, "Created resource");
        Ok(Created {
            reference,
            computed,
        })
    }

    /// Read the object back.
    ///
    /// Returns [`ReadOutcome::Absent`] when the service no longer knows the
    /// object; the caller must then stop tracking `reference`.
    #[instrument(skip(self, reference, desired), fields(resource_type = %self.descriptor.name, reference = %reference))]
    pub async fn read(
        &self,
        reference: &RemoteObjectRef,
        desired: &DesiredState,
    ) -> Result<ReadOutcome, ProviderError> {
        let spec = &self.descriptor.read;
        let request = self.request(&spec.endpoint, desired, Some(reference), None)?;
        let response = match self.transport.send(&request, spec.endpoint.expected_status).await {
            Ok(response) => response,
            Err(e) if e.is_status(&spec.absent_statuses) => {
                info!("Resource no longer exists");
                return Ok(ReadOutcome::Absent);
            }
            Err(e) => return Err(e),
        };

        let Some(item) = self.find_item(&response, reference, desired)? else {
            info!("Resource not found in read response");
            return Ok(ReadOutcome::Absent);
        };

        let mut observed = State::new();
        for binding in &spec.fields {
            if let Some(value) = item.pointer(&binding.pointer).filter(|v| !v.is_null()) {
                observed.insert(binding.attribute.clone(), self.decode(&binding.attribute, value)?);
            }
        }

        let reference = match &spec.reference_field {
            Some(pointer) => item
                .pointer(pointer)
                .and_then(scalar_text)
                .ok_or_else(|| {
                    ProviderError::MalformedResponse(format!(
                        "read response item for {} has no identifier at {}",
                        self.descriptor.name, pointer
                    ))
                })
                .and_then(RemoteObjectRef::parse)?,
            None => RemoteObjectRef::parse(reference.as_str())?,
        };

        debug!(attributes = observed.len(), "Read resource");
        Ok(ReadOutcome::Found {
            reference,
            observed,
        })
    }

    /// Apply the difference between `previous` and `desired` in place.
    ///
    /// Fails with [`ProviderError::ReplacementRequired`] before any remote
    /// call if an attribute that forces replacement changed.
    #[instrument(skip(self, reference, desired, previous), fields(resource_type = %self.descriptor.name, reference = %reference))]
    pub async fn update(
        &self,
        reference: &RemoteObjectRef,
        desired: &DesiredState,
        previous: &DesiredState,
    ) -> Result<ObservedState, ProviderError> {
        self.check(desired)?;

        let changed = self.changed_attributes(previous, desired);
        if let Some(attr) = changed.iter().find(|a| a.force_new) {
            warn!(attribute = %attr.name, "Update refused, attribute forces replacement");
            return Err(ProviderError::ReplacementRequired {
                resource_type: self.descriptor.name.clone(),
                attribute: attr.name.clone(),
            });
        }

        for update in &self.descriptor.updates {
            if !changed.iter().any(|a| update.attributes.contains(&a.name)) {
                continue;
            }
            let request = self.request(&update.endpoint, desired, Some(reference), None)?;
            self.transport
                .send(&request, update.endpoint.expected_status)
                .await?;
            debug!(endpoint = %update.endpoint.path, "Applied update");
        }

        for attr in changed.iter().filter(|a| a.is_set_valued()) {
            let Some(set) = self.descriptor.set_spec(&attr.name) else {
                continue;
            };
            let current = match self.read(reference, desired).await? {
                ReadOutcome::Found { observed, .. } => observed.get_items(&attr.name),
                ReadOutcome::Absent => return Err(self.not_found(reference)),
            };
            let ops = EndpointSet::new(self, set, desired);
            reconcile::reconcile(
                reference,
                desired.get_items(&attr.name),
                current,
                ApplyOrder::default(),
                &ops,
            )
            .await?;
        }

        match self.read(reference, desired).await? {
            ReadOutcome::Found { observed, .. } => {
                info!(changed = changed.len(), "Updated resource");
                Ok(observed)
            }
            ReadOutcome::Absent => Err(self.not_found(reference)),
        }
    }

    /// Delete the object, consuming its reference.
    ///
    /// An object that is already gone counts as deleted.
    #[instrument(skip(self, reference, desired), fields(resource_type = %self.descriptor.name, reference = %reference))]
    pub async fn delete(
        &self,
        reference: RemoteObjectRef,
        desired: &DesiredState,
    ) -> Result<(), ProviderError> {
        match &self.descriptor.delete.endpoint {
            Some(endpoint) => {
                let request = self.request(endpoint, desired, Some(&reference), None)?;
                match self.transport.send(&request, endpoint.expected_status).await {
                    Ok(_) => info!("Deleted resource"),
                    Err(e) if e.is_status(&self.descriptor.delete.not_found_statuses) => {
                        info!("Resource already deleted");
                    }
                    Err(e) => return Err(e),
                }
            }
            None => {
                for set in &self.descriptor.sets {
                    let ops = EndpointSet::new(self, set, desired);
                    reconcile::reconcile(
                        &reference,
                        Vec::<String>::new(),
                        desired.get_items(&set.attribute),
                        ApplyOrder::default(),
                        &ops,
                    )
                    .await?;
                }
                info!("Removed every set item");
            }
        }
        Ok(())
    }

    /// Adopt an existing object identified by `external_id`.
    ///
    /// Returns the reference and the observed attributes merged over the
    /// attributes seeded from the identifier.
    #[instrument(skip(self), fields(resource_type = %self.descriptor.name))]
    pub async fn import(
        &self,
        external_id: &str,
    ) -> Result<(RemoteObjectRef, DesiredState), ProviderError> {
        let mut seeded = State::new();
        let reference = match &self.descriptor.import {
            ImportSpec::Unsupported => {
                return Err(ProviderError::Unimplemented(format!(
                    "import is not supported for {}",
                    self.descriptor.name
                )));
            }
            ImportSpec::Reference => RemoteObjectRef::parse(external_id)?,
            ImportSpec::Attributes {
                attributes,
                separator,
            } => {
                let parts: Vec<&str> = external_id.split(separator.as_str()).collect();
                if parts.len() != attributes.len() || parts.iter().any(|p| p.is_empty()) {
                    return Err(ProviderError::Validation(format!(
                        "import id '{}' for {} must have the form {}",
                        external_id,
                        self.descriptor.name,
                        attributes.join(separator)
                    )));
                }
                for (name, part) in attributes.iter().zip(parts) {
                    seeded.insert(name.clone(), self.decode(name, &Value::from(part))?);
                }
                match &self.descriptor.create.reference {
                    RefStrategy::Derived {
                        attributes,
                        separator,
                    } => self.derive_reference(&seeded, attributes, separator)?,
                    _ => RemoteObjectRef::parse(external_id)?,
                }
            },
        };

        match self.read(&reference, &seeded).await? {
            ReadOutcome::Found {
                reference,
                observed,
            } => {
                seeded.merge(&observed);
                info!(reference = %reference, "Imported resource");
                Ok((reference, seeded))
            },
            ReadOutcome::Absent => Err(ProviderError::NotFound(format!(
                "{} '{}'",
                self.descriptor.name, external_id
            ))),
        }
    }

    /// Compute the changes needed to go from `prior` to `proposed`.
    ///
    /// No remote call is made. Computed attributes of `prior` are carried
    /// into the planned state unless the object is replaced.
    pub fn plan(
        &self,
        prior: Option<&State>,
        proposed: &DesiredState,
    ) -> Result<PlanResult, ProviderError> {
        self.check(proposed)?;

        let Some(prior) = prior else {
            let changes = self
                .descriptor
                .attributes
                .iter()
                .filter_map(|a| {
                    proposed
                        .get(&a.name)
                        .map(|v| AttributeChange::added(&a.name, v.clone()))
                })
                .collect();
            return Ok(PlanResult::from_changes(proposed.to_value(), changes));
        };

        let changes: Vec<AttributeChange> = self
            .changed_attributes(prior, proposed)
            .into_iter()
            .map(|attr| {
                let change = AttributeChange::new(
                    &attr.name,
                    prior.get(&attr.name).cloned(),
                    proposed.get(&attr.name).cloned(),
                );
                if attr.force_new {
                    change.replacing()
                } else {
                    change
                }
            })
            .collect();

        let mut planned = proposed.clone();
        if !changes.iter().any(|c| c.forces_replacement) {
            for attr in self.descriptor.attributes.iter().filter(|a| a.flags.computed) {
                if planned.contains(&attr.name) {
                    continue;
                }
                if let Some(value) = prior.get(&attr.name) {
                    planned.insert(attr.name.clone(), value.clone());
                }
            }
        }

        Ok(PlanResult::from_changes(planned.to_value(), changes))
    }

    /// Replace the object: delete it, then create it from `desired`.
    pub async fn replace(
        &self,
        reference: RemoteObjectRef,
        previous: &DesiredState,
        desired: &DesiredState,
    ) -> Result<Created, ProviderError> {
        info!(
            resource_type = %self.descriptor.name,
            reference = %reference,
            "Replacing resource"
        );
        self.check(desired)?;
        self.delete(reference, previous).await?;
        self.create(desired).await
    }

    fn check(&self, desired: &DesiredState) -> Result<(), ProviderError> {
        validation::validate_result(self.descriptor, &desired.to_value()).map_err(|diagnostics| {
            let summary = diagnostics
                .iter()
                .filter(|d| d.is_error())
                .map(describe)
                .collect::<Vec<_>>()
                .join("; ");
            ProviderError::Validation(format!("{}: {}", self.descriptor.name, summary))
        })
    }

    fn request(
        &self,
        endpoint: &Endpoint,
        desired: &DesiredState,
        reference: Option<&RemoteObjectRef>,
        item: Option<&str>,
    ) -> Result<RemoteRequest, ProviderError> {
        let mut request = RemoteRequest::new(endpoint.method, &endpoint.path);
        for param in &endpoint.params {
            match &param.source {
                ParamSource::Attribute { name, when_absent } => {
                    let attr = self.descriptor.attribute(name);
                    let value = desired
                        .get(name)
                        .or_else(|| attr.and_then(|a| a.default.as_ref()))
                        .and_then(scalar_text);
                    let sensitive = attr.map(|a| a.flags.sensitive).unwrap_or(false);
                    match (value, when_absent) {
                        (Some(value), _) => request.push(&param.name, value, sensitive),
                        (None, WhenAbsent::Empty) => request.push(&param.name, "", sensitive),
                        (None, WhenAbsent::Skip) => {}
                    }
                }
                ParamSource::Reference => {
                    let reference = reference.ok_or_else(|| {
                        ProviderError::Validation(format!(
                            "{} {} needs a reference",
                            endpoint.method, endpoint.path
                        ))
                    })?;
                    request.push(&param.name, reference.as_str(), false);
                }
                ParamSource::Literal(value) => request.push(&param.name, value.as_str(), false),
                ParamSource::Item => {
                    let item = item.ok_or_else(|| {
                        ProviderError::Validation(format!(
                            "{} {} needs a set item",
                            endpoint.method, endpoint.path
                        ))
                    })?;
                    request.push(&param.name, item, false);
                }
            }
        }
        Ok(request)
    }

    fn find_item(
        &self,
        response: &RawResponse,
        reference: &RemoteObjectRef,
        desired: &DesiredState,
    ) -> Result<Option<Value>, ProviderError> {
        let spec = &self.descriptor.read;
        let body = response.json()?;
        let items: Vec<Value> = match &spec.items {
            ItemsAt::Root if body.is_object() => vec![body],
            ItemsAt::Root => Vec::new(),
            ItemsAt::Pointer(pointer) => match body.pointer(pointer) {
                Some(Value::Array(items)) => items.clone(),
                _ => {
                    return Err(ProviderError::MalformedResponse(format!(
                        "read response for {} has no array at {}",
                        self.descriptor.name, pointer
                    )))
                }
            },
        };

        let mut wanted = Vec::with_capacity(spec.keys.len());
        for key in &spec.keys {
            let local = match &key.source {
                KeySource::Reference => reference.as_str().to_string(),
                KeySource::Attribute(name) => desired.get_text(name).ok_or_else(|| {
                    ProviderError::Validation(format!(
                        "{} key attribute '{}' is unset",
                        self.descriptor.name, name
                    ))
                })?,
            };
            wanted.push((key.pointer.as_str(), local.to_lowercase()));
        }

        let mut matches = items.into_iter().filter(|item| {
            wanted.iter().all(|(pointer, local)| {
                item.pointer(pointer)
                    .and_then(scalar_text)
                    .is_some_and(|remote| remote.to_lowercase() == *local)
            })
        });
        let found = matches.next();
        if found.is_some() && matches.next().is_some() {
            warn!("Several items match the declared keys, using the first");
        }
        Ok(found)
    }

    fn derive_reference(
        &self,
        state: &State,
        attributes: &[String],
        separator: &str,
    ) -> Result<RemoteObjectRef, ProviderError> {
        let parts = attributes
            .iter()
            .map(|name| {
                state.get_text(name).ok_or_else(|| {
                    ProviderError::Validation(format!(
                        "{} reference attribute '{}' is unset",
                        self.descriptor.name, name
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        RemoteObjectRef::parse(parts.join(separator))
    }

    fn decode(&self, attribute: &str, value: &Value) -> Result<Value, ProviderError> {
        let attr = self.descriptor.attribute(attribute).ok_or_else(|| {
            ProviderError::InvalidDescriptor {
                resource_type: self.descriptor.name.clone(),
                reason: format!("unknown attribute '{}'", attribute),
            }
        })?;
        attr.attr_type.coerce(value).ok_or_else(|| {
            ProviderError::MalformedResponse(format!(
                "{}.{} cannot be decoded from {}",
                self.descriptor.name, attribute, value
            ))
        })
    }

    fn changed_attributes(&self, before: &State, after: &State) -> Vec<&'s Attribute> {
        self.descriptor
            .attributes
            .iter()
            .filter(|a| a.flags.is_configurable())
            .filter(|a| {
                let old = before.get(&a.name).or(a.default.as_ref());
                let new = after.get(&a.name).or(a.default.as_ref());
                if a.is_set_valued() {
                    item_set(old) != item_set(new)
                } else {
                    old.map(|v| self.decode(&a.name, v).unwrap_or_else(|_| v.clone()))
                        != new.map(|v| self.decode(&a.name, v).unwrap_or_else(|_| v.clone()))
                }
            })
            .collect()
    }

    fn not_found(&self, reference: &RemoteObjectRef) -> ProviderError {
        ProviderError::NotFound(format!("{} '{}'", self.descriptor.name, reference))
    }
}

fn item_set(value: Option<&Value>) -> BTreeSet<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
        _ => BTreeSet::new(),
    }
}

fn describe(diagnostic: &Diagnostic) -> String {
    match &diagnostic.detail {
        Some(detail) => format!("{} ({})", diagnostic.summary, detail),
        None => diagnostic.summary.clone(),
    }
}

/// Per-item calls of one set-valued attribute, built from its [`SetSpec`].
struct EndpointSet<'e, 's> {
    engine: &'e Engine<'s>,
    spec: &'s SetSpec,
    desired: &'e DesiredState,
}

impl<'e, 's> EndpointSet<'e, 's> {
    fn new(engine: &'e Engine<'s>, spec: &'s SetSpec, desired: &'e DesiredState) -> Self {
        Self {
            engine,
            spec,
            desired,
        }
    }
}

#[async_trait]
impl<'e, 's> SetOperations for EndpointSet<'e, 's> {
    async fn add(&self, reference: &RemoteObjectRef, item: &str) -> Result<(), ProviderError> {
        let endpoint = &self.spec.add;
        let request = self
            .engine
            .request(endpoint, self.desired, Some(reference), Some(item))?;
        self.engine
            .transport
            .send(&request, endpoint.expected_status)
            .await?;
        Ok(())
    }

    async fn remove(&self, reference: &RemoteObjectRef, item: &str) -> Result<(), ProviderError> {
        let endpoint = &self.spec.remove;
        let request = self
            .engine
            .request(endpoint, self.desired, Some(reference), Some(item))?;
        match self
            .engine
            .transport
            .send(&request, endpoint.expected_status)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_status(&self.engine.descriptor.delete.not_found_statuses) => {
                debug!(item, "Set item already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::reconcile::SetChange;
    use crate::resources::Catalog;
    use crate::testing::{assert_absent, assert_partial_failure, assert_rejected, FakeRemote};
    use crate::transport::{Method, RetryPolicy};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    async fn session(remote: &FakeRemote) -> Session {
        let config = ConnectionConfig::new("sonar.example.com", "admin", "admin")
            .with_retry(RetryPolicy::no_retry());
        Session::connect_with(&config, Arc::new(remote.clone()))
            .await
            .unwrap()
    }

    fn reference(id: &str) -> RemoteObjectRef {
        RemoteObjectRef::parse(id).unwrap()
    }

    fn permissions(items: &[&str]) -> State {
        State::new()
            .with("login_name", "jdoe")
            .with("project_key", "proj")
            .with("permissions", json!(items))
    }

    #[tokio::test]
    async fn test_create_then_read_reports_desired_values() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(
            Method::Post,
            "api/user_groups/create",
            200,
            json!({"group": {"id": 42, "name": "devs"}}),
        );
        remote.reply_json(
            Method::Get,
            "api/user_groups/search",
            200,
            json!({"groups": [
                {"id": 41, "name": "devs-old"},
                {"id": 42, "name": "devs", "description": "Developers"}
            ]}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());

        let desired = State::new()
            .with("name", "devs")
            .with("description", "Developers");
        let created = assert_ok!(engine.create(&desired).await);
        assert_eq!(created.reference.as_str(), "42");
        assert!(created.computed.is_empty());

        let create = &remote.calls_to(Method::Post, "api/user_groups/create")[0];
        assert_eq!(create.request.query_value("name"), Some("devs"));
        assert_eq!(create.request.query_value("description"), Some("Developers"));
        assert_eq!(create.request.query_value("organization"), None);

        match assert_ok!(engine.read(&created.reference, &desired).await) {
            ReadOutcome::Found {
                reference,
                observed,
            } => {
                assert_eq!(reference.as_str(), "42");
                assert_eq!(observed, desired);
            },
            ReadOutcome::Absent => panic!("expected the group to be found"),
        }
    }

    #[tokio::test]
    async fn test_read_is_idempotent_and_read_only() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(
            Method::Get,
            "api/user_groups/search",
            200,
            json!({"groups": [{"id": 7, "name": "devs"}]}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());
        let desired = State::new().with("name", "devs");

        let first = assert_ok!(engine.read(&reference("7"), &desired).await);
        let second = assert_ok!(engine.read(&reference("7"), &desired).await);
        assert_eq!(first, second);
        assert!(remote
            .calls()
            .iter()
            .all(|c| c.request.method == Method::Get));
    }

    #[tokio::test]
    async fn test_read_matches_profile_by_name_and_refreshes_key() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(
            Method::Get,
            "api/qualityprofiles/search",
            200,
            json!({"profiles": [
                {"key": "AU-js", "name": "Strict", "language": "js"},
                {"key": "AU-java", "name": "strict", "language": "java"},
            ]}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_qualityprofile").unwrap());
        let desired = State::new().with("name", "Strict").with("language", "java");

        match assert_ok!(engine.read(&reference("AU-old"), &desired).await) {
            ReadOutcome::Found {
                reference,
                observed,
            } => {
                assert_eq!(reference.as_str(), "AU-java");
                assert_eq!(observed.get_text("language").as_deref(), Some("java"));
            }
            ReadOutcome::Absent => panic!("expected the profile to be found"),
        }
    }

    #[tokio::test]
    async fn test_read_absent() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply(Method::Get, "api/qualitygates/show", 404, "");
        remote.reply_json(Method::Get, "api/user_groups/search", 200, json!({"groups": []}));
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();

        let gate = Engine::new(&session, catalog.get("sonarcloud_qualitygate").unwrap());
        let desired = State::new().with("name", "strict");
        assert_absent(&assert_ok!(gate.read(&reference("5"), &desired).await));

        let group = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());
        let desired = State::new().with("name", "devs");
        assert_absent(&assert_ok!(group.read(&reference("7"), &desired).await));
    }

    #[tokio::test]
    async fn test_read_rejects_unexpected_shape() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(Method::Get, "api/user_groups/search", 200, json!({"paging": {}}));
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());

        let err = assert_err!(
            engine
                .read(&reference("7"), &State::new().with("name", "devs"))
                .await
        );
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_read_decodes_stringly_typed_integers() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(
            Method::Get,
            "api/qualitygates/show",
            200,
            json!({"id": 3, "name": "strict", "conditions": [
                {"id": 9, "metric": "coverage", "op": "LT", "error": "80"}
            ]}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(
            &session,
            catalog.get("sonarcloud_qualitygate_condition").unwrap(),
        );
        let desired = State::new()
            .with("gateid", 3)
            .with("error", 80)
            .with("metric", "coverage")
            .with("op", "LT");

        let outcome = assert_ok!(engine.read(&reference("9"), &desired).await);
        let observed = outcome.observed().unwrap();
        assert_eq!(observed.get("error"), Some(&json!(80)));
        assert_eq!(observed.get_text("metric").as_deref(), Some("coverage"));

        let show = &remote.calls_to(Method::Get, "api/qualitygates/show")[0];
        assert_eq!(show.request.query_value("id"), Some("3"));
    }

    #[tokio::test]
    async fn test_create_sends_defaults_and_marks_secrets() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(
            Method::Post,
            "api/users/create",
            200,
            json!({"user": {"login": "jdoe", "name": "John"}}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_user").unwrap());

        let desired = State::new()
            .with("login", "jdoe")
            .with("name", "John")
            .with("password", "hunter2");
        let created = assert_ok!(engine.create(&desired).await);
        assert_eq!(created.reference.as_str(), "jdoe");

        let call = &remote.calls_to(Method::Post, "api/users/create")[0];
        assert_eq!(call.request.query_value("local"), Some("true"));
        assert_eq!(call.request.query_value("email"), None);
        let password = call
            .request
            .query
            .iter()
            .find(|p| p.name == "password")
            .unwrap();
        assert!(password.sensitive);
        assert!(!call.request.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_create_captures_token() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(
            Method::Post,
            "api/user_tokens/generate",
            200,
            json!({"login": "jdoe", "name": "ci", "token": "squ_abc"}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_user_token").unwrap());

        let desired = State::new().with("login_name", "jdoe").with("name", "ci");
        let created = assert_ok!(engine.create(&desired).await);
        assert_eq!(created.reference.as_str(), "jdoe/ci");
        assert_eq!(created.computed.get_text("token").as_deref(), Some("squ_abc"));
    }

    #[tokio::test]
    async fn test_create_rejects_response_without_identifier() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(Method::Post, "api/user_groups/create", 200, json!({"group": {}}));
        remote.reply_json(Method::Post, "api/user_tokens/generate", 200, json!({"login": "jdoe"}));
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();

        let group = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());
        let err = assert_err!(group.create(&State::new().with("name", "devs")).await);
        assert!(matches!(err, ProviderError::MalformedResponse(_)));

        let token = Engine::new(&session, catalog.get("sonarcloud_user_token").unwrap());
        let desired = State::new().with("login_name", "jdoe").with("name", "ci");
        let err = assert_err!(token.create(&desired).await);
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_create_validates_before_calling() {
        let remote = FakeRemote::with_version("9.9");
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());
        remote.clear_calls();

        let err = assert_err!(engine.create(&State::new().with("description", "x")).await);
        match err {
            ProviderError::Validation(msg) => assert!(msg.contains("'name'"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_refuses_replacing_change_without_calls() {
        let remote = FakeRemote::with_version("9.9");
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_user").unwrap());
        remote.clear_calls();

        let previous = State::new().with("login", "jdoe").with("name", "John");
        let desired = State::new().with("login", "jane").with("name", "John");
        let err = assert_err!(engine.update(&reference("jdoe"), &desired, &previous).await);
        match err {
            ProviderError::ReplacementRequired {
                resource_type,
                attribute,
            } => {
                assert_eq!(resource_type, "sonarcloud_user");
                assert_eq!(attribute, "login");
            },
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_update_calls_only_affected_endpoints() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply(Method::Post, "api/users/update", 200, "{}");
        remote.reply_json(
            Method::Get,
            "api/users/search",
            200,
            json!({"users": [{"login": "jdoe", "name": "John", "local": true}]}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_user").unwrap());

        let previous = State::new()
            .with("login", "jdoe")
            .with("name", "John")
            .with("email", "john@example.com");
        let desired = State::new().with("login", "jdoe").with("name", "John");
        let observed = assert_ok!(engine.update(&reference("jdoe"), &desired, &previous).await);
        assert_eq!(observed.get("is_local"), Some(&json!(true)));
        assert!(!observed.contains("email"));

        let updates = remote.calls_to(Method::Post, "api/users/update");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].request.query_value("login"), Some("jdoe"));
        assert_eq!(updates[0].request.query_value("email"), Some(""));
        assert!(remote
            .calls_to(Method::Post, "api/users/change_password")
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_of_missing_object_is_not_found() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply(Method::Post, "api/user_groups/update", 200, "{}");
        remote.reply_json(Method::Get, "api/user_groups/search", 200, json!({"groups": []}));
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());

        let previous = State::new().with("name", "devs");
        let desired = State::new().with("name", "devs").with("description", "x");
        let err = assert_err!(engine.update(&reference("7"), &desired, &previous).await);
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply(Method::Post, "api/user_groups/delete", 404, "");
        remote.reply(Method::Post, "api/user_groups/delete", 500, "boom");
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());
        let desired = State::new().with("name", "devs");

        assert_ok!(engine.delete(reference("7"), &desired).await);
        let err = assert_err!(engine.delete(reference("7"), &desired).await);
        assert!(err.is_status(&[500]));
    }

    #[tokio::test]
    async fn test_permission_set_lifecycle() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply(Method::Post, "api/permissions/add_user", 204, "");
        remote.reply(Method::Post, "api/permissions/remove_user", 204, "");
        remote.reply_json(
            Method::Get,
            "api/permissions/users",
            200,
            json!({"users": [{"login": "jdoe", "permissions": ["admin", "scan"]}]}),
        );
        remote.reply_json(
            Method::Get,
            "api/permissions/users",
            200,
            json!({"users": [
                {"login": "jdoe2", "permissions": ["admin"]},
                {"login": "jdoe", "permissions": ["provisioning", "scan"]}
            ]}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_user_permissions").unwrap());

        let initial = permissions(&["scan", "admin"]);
        let created = assert_ok!(engine.create(&initial).await);
        assert!(Uuid::parse_str(created.reference.as_str()).is_ok());
        let adds = remote.calls_to(Method::Post, "api/permissions/add_user");
        assert_eq!(adds.len(), 2);
        assert_eq!(adds[0].request.query_value("permission"), Some("admin"));
        assert_eq!(adds[1].request.query_value("permission"), Some("scan"));
        assert_eq!(adds[0].request.query_value("login"), Some("jdoe"));
        assert_eq!(adds[0].request.query_value("projectKey"), Some("proj"));

        remote.clear_calls();
        let desired = permissions(&["scan", "provisioning"]);
        let observed = assert_ok!(engine.update(&created.reference, &desired, &initial).await);
        assert_eq!(observed.get_items("permissions"), vec!["provisioning", "scan"]);
        assert_eq!(
            remote.call_log(),
            vec![
                "GET api/permissions/users",
                "POST api/permissions/remove_user",
                "POST api/permissions/add_user",
                "GET api/permissions/users",
            ]
        );
        let calls = remote.calls();
        assert_eq!(calls[0].request.query_value("q"), Some("jdoe"));
        assert_eq!(calls[0].request.query_value("ps"), Some("100"));
        assert_eq!(calls[1].request.query_value("permission"), Some("admin"));
        assert_eq!(calls[2].request.query_value("permission"), Some("provisioning"));

        remote.clear_calls();
        assert_ok!(engine.delete(created.reference, &desired).await);
        let removed: Vec<_> = remote
            .calls_to(Method::Post, "api/permissions/remove_user")
            .iter()
            .filter_map(|c| c.request.query_value("permission").map(str::to_string))
            .collect();
        assert_eq!(removed, vec!["provisioning", "scan"]);
        assert_eq!(remote.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_permission_set_must_not_be_empty() {
        let remote = FakeRemote::with_version("9.9");
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_user_permissions").unwrap());
        remote.clear_calls();

        let err = assert_err!(engine.create(&permissions(&[])).await);
        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(err.to_string().contains("at least 1"));

        let initial = permissions(&["admin"]);
        let err = assert_err!(engine.update(&reference("p1"), &permissions(&[]), &initial).await);
        assert!(matches!(err, ProviderError::Validation(_)));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_permission_create_partial_failure() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply(Method::Post, "api/permissions/add_user", 204, "");
        remote.reply(Method::Post, "api/permissions/add_user", 400, "unknown permission");
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_user_permissions").unwrap());

        let err = assert_err!(engine.create(&permissions(&["admin", "bogus"])).await);
        assert_eq!(err.category(), crate::error::ErrorCategory::Partial);
        let failure = assert_partial_failure(
            &err,
            &[SetChange::Add("admin".to_string())],
            &SetChange::Add("bogus".to_string()),
        );
        assert_rejected(&failure.source, 400);
    }

    #[tokio::test]
    async fn test_import_by_attributes() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(
            Method::Get,
            "api/user_tokens/search",
            200,
            json!({"login": "jdoe", "userTokens": [{"name": "ci", "createdAt": "2024-01-01"}]}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_user_token").unwrap());

        let (reference, state) = assert_ok!(engine.import("jdoe/ci").await);
        assert_eq!(reference.as_str(), "jdoe/ci");
        assert_eq!(state.get_text("login_name").as_deref(), Some("jdoe"));
        assert_eq!(state.get_text("name").as_deref(), Some("ci"));
        let search = &remote.calls_to(Method::Get, "api/user_tokens/search")[0];
        assert_eq!(search.request.query_value("login"), Some("jdoe"));

        let err = assert_err!(engine.import("jdoe/release").await);
        assert!(matches!(err, ProviderError::NotFound(_)));

        let err = assert_err!(engine.import("jdoe").await);
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_import_unsupported() {
        let remote = FakeRemote::with_version("9.9");
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(
            &session,
            catalog.get("sonarcloud_qualitygate_condition").unwrap(),
        );

        let err = assert_err!(engine.import("9").await);
        assert!(matches!(err, ProviderError::Unimplemented(_)));
    }

    #[tokio::test]
    async fn test_plan() {
        let remote = FakeRemote::with_version("9.9");
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let group = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());
        remote.clear_calls();

        let desired = State::new().with("name", "devs").with("description", "a");
        let create = assert_ok!(group.plan(None, &desired));
        assert_eq!(create.changes.len(), 2);
        assert!(!create.requires_replace);

        let same = assert_ok!(group.plan(Some(&desired), &desired));
        assert!(same.is_empty());

        let described = desired.clone().with("description", "b");
        let in_place = assert_ok!(group.plan(Some(&desired), &described));
        assert_eq!(in_place.changes.len(), 1);
        assert!(!in_place.requires_replace);

        let renamed = desired.clone().with("name", "ops");
        let replacing = assert_ok!(group.plan(Some(&desired), &renamed));
        assert!(replacing.requires_replace);
        assert!(replacing.changes[0].forces_replacement);

        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_plan_carries_computed_and_defaults() {
        let remote = FakeRemote::with_version("9.9");
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();

        let token = Engine::new(&session, catalog.get("sonarcloud_user_token").unwrap());
        let proposed = State::new().with("login_name", "jdoe").with("name", "ci");
        let prior = proposed.clone().with("token", "squ_abc");
        let plan = assert_ok!(token.plan(Some(&prior), &proposed));
        assert!(plan.is_empty());
        assert_eq!(plan.planned_state["token"], "squ_abc");

        let user = Engine::new(&session, catalog.get("sonarcloud_user").unwrap());
        let proposed = State::new().with("login", "jdoe").with("name", "John");
        let prior = proposed.clone().with("is_local", true);
        assert!(assert_ok!(user.plan(Some(&prior), &proposed)).is_empty());

        let external = proposed.clone().with("is_local", false);
        assert!(assert_ok!(user.plan(Some(&prior), &external)).requires_replace);
    }

    #[tokio::test]
    async fn test_replace_deletes_then_creates() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply(Method::Post, "api/user_groups/delete", 204, "");
        remote.reply_json(
            Method::Post,
            "api/user_groups/create",
            200,
            json!({"group": {"id": 8, "name": "ops"}}),
        );
        let session = session(&remote).await;
        let catalog = Catalog::sonarcloud().unwrap();
        let engine = Engine::new(&session, catalog.get("sonarcloud_group").unwrap());
        remote.clear_calls();

        let previous = State::new().with("name", "devs");
        let desired = State::new().with("name", "ops");
        let created = assert_ok!(engine.replace(reference("7"), &previous, &desired).await);
        assert_eq!(created.reference.as_str(), "8");
        assert_eq!(
            remote.call_log(),
            vec!["POST api/user_groups/delete", "POST api/user_groups/create"]
        );
    }
}
