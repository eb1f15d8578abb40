//! Desired-state validation.
//!
//! This module checks a `serde_json::Value` against a [`ResourceDescriptor`]
//! before any remote call is made, producing [`Diagnostic`]s with the
//! offending attribute path.
//!
//! # Example
//!
//! ```
//! use hemmer_provider_sonarcloud::resources::Catalog;
//! use hemmer_provider_sonarcloud::validation::validate;
//! use serde_json::json;
//!
//! let catalog = Catalog::sonarcloud().unwrap();
//! let descriptor = catalog.get("sonarcloud_group").unwrap();
//!
//! let diagnostics = validate(descriptor, &json!({"name": "developers"}));
//! assert!(diagnostics.is_empty());
//!
//! let diagnostics = validate(descriptor, &json!({"name": 42}));
//! assert_eq!(diagnostics.len(), 1);
//! assert_eq!(diagnostics[0].attribute, Some("name".to_string()));
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::{Attribute, AttributeType, ResourceDescriptor};
use crate::types::json_type_name;

/// Attribute name under which provider states carry the reference.
pub const ID_ATTRIBUTE: &str = "id";

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// An error that prevents the operation from completing.
    Error,
    /// A warning that doesn't prevent the operation but should be addressed.
    Warning,
}

/// A diagnostic message from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: DiagnosticSeverity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The attribute path where the issue occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the attribute path for this diagnostic.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Whether this diagnostic is an error.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

/// Validate a desired state against a resource descriptor.
///
/// Returns a list of diagnostics for any validation errors found.
/// An empty list means the value is valid.
///
/// # Validation Rules
///
/// - The value must be an object
/// - Required attributes must be present and non-null
/// - Computed-only attributes must not be set by the caller
/// - Attribute types must match the descriptor
/// - Set-valued attributes must not repeat an item and must meet their
///   minimum item count
/// - Unknown attributes produce a warning
pub fn validate(descriptor: &ResourceDescriptor, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let obj = match value {
        Value::Object(map) => map,
        _ => {
            diagnostics.push(
                Diagnostic::error("Expected object")
                    .with_detail(format!("Got {}", json_type_name(value))),
            );
            return diagnostics;
        }
    };

    for attr in &descriptor.attributes {
        validate_attribute(attr, obj.get(&attr.name), &mut diagnostics);
    }

    for name in obj.keys() {
        if name != ID_ATTRIBUTE && descriptor.attribute(name).is_none() {
            diagnostics.push(
                Diagnostic::warning(format!("Unknown attribute '{}'", name))
                    .with_detail(format!("{} does not declare this attribute", descriptor.name))
                    .with_attribute(name.as_str()),
            );
        }
    }

    diagnostics
}

/// Validate a desired state, returning Ok if valid or Err with diagnostics.
///
/// Warnings alone do not make the value invalid.
pub fn validate_result(descriptor: &ResourceDescriptor, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(descriptor, value);
    if diagnostics.iter().any(Diagnostic::is_error) {
        Err(diagnostics)
    } else {
        Ok(())
    }
}

/// Check if a desired state is valid.
///
/// Use [`validate`] to get detailed error information.
pub fn is_valid(descriptor: &ResourceDescriptor, value: &Value) -> bool {
    !validate(descriptor, value).iter().any(Diagnostic::is_error)
}

fn validate_attribute(attr: &Attribute, value: Option<&Value>, diagnostics: &mut Vec<Diagnostic>) {
    let path = attr.name.as_str();
    match value {
        None | Some(Value::Null) => {
            if attr.flags.required {
                diagnostics.push(
                    Diagnostic::error(format!("Missing required attribute '{}'", path))
                        .with_detail("This attribute is required and must be provided")
                        .with_attribute(path),
                );
            }
        }
        Some(_) if !attr.flags.is_configurable() => {
            diagnostics.push(
                Diagnostic::error(format!("Attribute '{}' is computed", path))
                    .with_detail("The value is set by the server and cannot be configured")
                    .with_attribute(path),
            );
        }
        Some(v) => {
            validate_attribute_type(&attr.attr_type, v, path, diagnostics);
            if let Some(items) = v.as_array() {
                if items.len() < attr.min_items {
                    diagnostics.push(
                        Diagnostic::error(format!(
                            "Set '{}' needs at least {} item(s)",
                            path, attr.min_items
                        ))
                        .with_detail(format!("Got {}", items.len()))
                        .with_attribute(path),
                    );
                }
            }
        }
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        }
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        }
        AttributeType::Bool => {
            if !value.is_boolean() {
                diagnostics.push(type_error(path, "bool", value));
            }
        }
        AttributeType::Set(element_type) => {
            let Some(arr) = value.as_array() else {
                diagnostics.push(type_error(path, "set", value));
                return;
            };
            let mut seen = BTreeSet::new();
            for (i, elem) in arr.iter().enumerate() {
                let elem_path = format!("{}.{}", path, i);
                validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                if !seen.insert(elem.to_string()) {
                    diagnostics.push(
                        Diagnostic::error(format!("Duplicate item {} in set '{}'", elem, path))
                            .with_attribute(elem_path),
                    );
                }
            }
        }
    }
}

fn is_int64(value: &Value) -> bool {
    value.as_i64().is_some()
}

fn type_error(path: &str, expected: &str, value: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for '{}'", path))
        .with_detail(format!("Expected {}, got {}", expected, json_type_name(value)))
        .with_attribute(path)
}
