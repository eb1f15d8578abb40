//! Core value types shared by the engine and the provider facade.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProviderError;

/// Opaque handle identifying one object on the remote service.
///
/// A reference is never empty. It is intentionally not `Clone`: exactly one
/// declaration owns a reference, [`Engine::delete`](crate::engine::Engine::delete)
/// consumes it, and a successful read hands back a fresh one.
#[derive(Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RemoteObjectRef(String);

impl RemoteObjectRef {
    /// Parse a reference from an identifier string.
    ///
    /// Fails with [`ProviderError::Validation`] if the identifier is empty.
    pub fn parse(id: impl Into<String>) -> Result<Self, ProviderError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ProviderError::Validation(
                "remote object reference must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the reference, returning the identifier string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RemoteObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attribute values for one object, keyed by attribute name.
///
/// `null` values are never stored: inserting `null` removes the attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(BTreeMap<String, Value>);

/// The caller-declared attribute values for an object.
pub type DesiredState = State;

/// The attribute values reported by the remote service.
pub type ObservedState = State;

impl State {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a state from a JSON object. `null` members are dropped.
    pub fn from_value(value: Value) -> Result<Self, ProviderError> {
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            Value::Null => Ok(Self::new()),
            other => Err(ProviderError::Validation(format!(
                "expected a JSON object for resource state, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Convert this state into a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set an attribute. Inserting `null` removes it.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        match value.into() {
            Value::Null => {
                self.0.remove(&name);
            }
            v => {
                self.0.insert(name, v);
            }
        }
    }

    /// Remove an attribute, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    /// Get an attribute value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Whether the attribute is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Get an attribute rendered as a request parameter string.
    ///
    /// Strings are returned as-is, numbers and booleans by their JSON text.
    /// Arrays and objects have no scalar rendering.
    pub fn get_text(&self, name: &str) -> Option<String> {
        self.get(name).and_then(scalar_text)
    }

    /// Get a set-valued attribute as its string items.
    pub fn get_items(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
            _ => Vec::new(),
        }
    }

    /// Iterate over attribute names and values in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of attributes present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no attributes are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` onto this state; attributes in `other` win.
    pub fn merge(&mut self, other: &State) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl FromIterator<(String, Value)> for State {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut state = State::new();
        for (k, v) in iter {
            state.insert(k, v);
        }
        state
    }
}

/// Render a scalar JSON value as parameter text.
pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The result of a successful create.
#[derive(Debug, PartialEq)]
pub struct Created {
    /// The reference now owned by the declaration.
    pub reference: RemoteObjectRef,
    /// Server-computed attributes only available in the create response.
    pub computed: State,
}

/// The result of a read.
#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    /// The object exists; `reference` replaces the caller's reference.
    Found {
        /// The refreshed reference.
        reference: RemoteObjectRef,
        /// The attributes reported by the service.
        observed: ObservedState,
    },
    /// The object no longer exists remotely; the caller must stop tracking it.
    Absent,
}

impl ReadOutcome {
    /// Whether the object was found.
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found { .. })
    }

    /// The observed state, if found.
    pub fn observed(&self) -> Option<&ObservedState> {
        match self {
            Self::Found { observed, .. } => Some(observed),
            Self::Absent => None,
        }
    }
}

/// A change to a single attribute during a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The name of the attribute that changed.
    pub path: String,
    /// The value before the change (None if newly set).
    pub before: Option<Value>,
    /// The value after the change (None if removed).
    pub after: Option<Value>,
    /// Whether this change can only be applied by replacing the resource.
    #[serde(default)]
    pub forces_replacement: bool,
}

impl AttributeChange {
    /// Create a new attribute change.
    pub fn new(path: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            path: path.into(),
            before,
            after,
            forces_replacement: false,
        }
    }

    /// Create a change for a new attribute.
    pub fn added(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// Create a change for a removed attribute.
    pub fn removed(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, Some(value), None)
    }

    /// Create a change for a modified attribute.
    pub fn modified(path: impl Into<String>, before: Value, after: Value) -> Self {
        Self::new(path, Some(before), Some(after))
    }

    /// Mark the change as forcing replacement.
    pub fn replacing(mut self) -> Self {
        self.forces_replacement = true;
        self
    }
}

/// The result of a plan operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// The planned state after the operation.
    pub planned_state: Value,
    /// The list of attribute changes.
    pub changes: Vec<AttributeChange>,
    /// Whether the resource requires replacement.
    pub requires_replace: bool,
}

impl PlanResult {
    /// Create a plan result with no changes.
    pub fn no_change(state: Value) -> Self {
        Self {
            planned_state: state,
            changes: Vec::new(),
            requires_replace: false,
        }
    }

    /// Create a plan result from a list of changes.
    ///
    /// Replacement is required when any change forces it.
    pub fn from_changes(planned_state: Value, changes: Vec<AttributeChange>) -> Self {
        let requires_replace = changes.iter().any(|c| c.forces_replacement);
        Self {
            planned_state,
            changes,
            requires_replace,
        }
    }

    /// Whether the plan has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// An imported resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportedResource {
    /// The resource type.
    pub resource_type: String,
    /// The imported state, including its `id`.
    pub state: Value,
}

impl ImportedResource {
    /// Create a new imported resource.
    pub fn new(resource_type: impl Into<String>, state: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            state,
        }
    }
}

/// Provider metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// Supported resource type names, sorted.
    pub resources: Vec<String>,
    /// Resource types that support import.
    pub importable: Vec<String>,
}
