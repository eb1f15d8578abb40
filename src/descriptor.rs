//! Resource descriptors.
//!
//! A [`ResourceDescriptor`] is the static description of one resource type:
//! its typed attributes, the endpoints that create, read, update and delete
//! it, how its [`RemoteObjectRef`](crate::types::RemoteObjectRef) is obtained,
//! and how items in a read response are matched and decoded. The engine is
//! generic over descriptors; nothing in it knows about any one resource.
//!
//! Descriptors are assembled with [`ResourceDescriptor::builder`] and checked
//! once by [`ResourceDescriptorBuilder::build`]. Every invariant the engine
//! relies on (attributes referenced by endpoints exist, forces-replacement
//! attributes are never updatable, every mutable attribute has an update path)
//! is enforced there rather than on each call.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;
use crate::transport::Method;

/// The type of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// A string value.
    String,
    /// A 64-bit integer.
    Int64,
    /// A boolean value.
    Bool,
    /// A set of unique values of a single type, reconciled item by item.
    Set(Box<AttributeType>),
}

impl AttributeType {
    /// Create a set type.
    pub fn set(element_type: AttributeType) -> Self {
        Self::Set(Box::new(element_type))
    }

    /// Whether values of this type are reconciled as sets.
    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set(_))
    }

    /// Convert a value reported by the service into this type.
    ///
    /// The service reports some integers as strings and some identifiers as
    /// numbers, so scalars are converted where the text allows it. Returns
    /// `None` when no conversion exists.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (Self::String, Value::String(_)) => Some(value.clone()),
            (Self::String, Value::Number(n)) => Some(Value::String(n.to_string())),
            (Self::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
            (Self::Int64, Value::Number(n)) => n.as_i64().map(Value::from),
            (Self::Int64, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),
            (Self::Bool, Value::Bool(_)) => Some(value.clone()),
            (Self::Bool, Value::String(s)) => s.parse::<bool>().ok().map(Value::Bool),
            (Self::Set(element), Value::Array(items)) => items
                .iter()
                .map(|item| element.coerce(item))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            _ => None,
        }
    }
}

/// Describes how an attribute can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// The attribute is required in configuration.
    pub required: bool,
    /// The attribute is optional in configuration.
    pub optional: bool,
    /// The attribute is computed by the server (read-only).
    pub computed: bool,
    /// The attribute is sensitive and is masked in logs.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Create flags for a required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Create flags for an optional attribute.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Create flags for a computed attribute.
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }

    /// Whether the caller may set the attribute.
    pub fn is_configurable(&self) -> bool {
        self.required || self.optional
    }
}

/// Describes a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// The type of the attribute.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Flags describing how the attribute can be used.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Human-readable description of the attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Changing this attribute forces resource replacement.
    #[serde(default)]
    pub force_new: bool,
    /// Value used when the caller leaves the attribute unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Fewest items a set-valued attribute may hold.
    #[serde(default)]
    pub min_items: usize,
}

impl Attribute {
    /// Create a new attribute with the given type and flags.
    pub fn new(name: impl Into<String>, attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            name: name.into(),
            attr_type,
            flags,
            description: None,
            force_new: false,
            default: None,
            min_items: 0,
        }
    }

    /// Create a required string attribute.
    pub fn required_string(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::String, AttributeFlags::required())
    }

    /// Create an optional string attribute.
    pub fn optional_string(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::String, AttributeFlags::optional())
    }

    /// Create a computed string attribute.
    pub fn computed_string(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::String, AttributeFlags::computed())
    }

    /// Create a required int64 attribute.
    pub fn required_int64(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Int64, AttributeFlags::required())
    }

    /// Create an optional bool attribute.
    pub fn optional_bool(name: impl Into<String>) -> Self {
        Self::new(name, AttributeType::Bool, AttributeFlags::optional())
    }

    /// Create a required set-of-strings attribute.
    pub fn required_string_set(name: impl Into<String>) -> Self {
        Self::new(
            name,
            AttributeType::set(AttributeType::String),
            AttributeFlags::required(),
        )
    }

    /// Set the description for this attribute.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark this attribute as forcing resource replacement when changed.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Set a default value for this attribute.
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Require a set-valued attribute to hold at least `min_items` items.
    pub fn with_min_items(mut self, min_items: usize) -> Self {
        self.min_items = min_items;
        self
    }

    /// Mark this attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }

    /// Whether the attribute is reconciled as a set.
    pub fn is_set_valued(&self) -> bool {
        self.attr_type.is_set()
    }
}

/// What to send when the attribute behind a parameter is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WhenAbsent {
    /// Leave the parameter out.
    #[default]
    Skip,
    /// Send an empty value, clearing the field remotely.
    Empty,
}

/// Where a request parameter gets its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSource {
    /// An attribute of the desired state.
    Attribute {
        /// Attribute name.
        name: String,
        /// Behavior when the attribute is unset.
        when_absent: WhenAbsent,
    },
    /// The object's reference.
    Reference,
    /// A fixed value.
    Literal(String),
    /// The single set item of a set add/remove call.
    Item,
}

/// A request parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    /// Query parameter name.
    pub name: String,
    /// Where the value comes from.
    pub source: ParamSource,
}

impl Param {
    /// A parameter taken from an attribute, skipped when unset.
    pub fn attribute(name: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Attribute {
                name: attribute.into(),
                when_absent: WhenAbsent::Skip,
            },
        }
    }

    /// A parameter taken from an attribute, sent empty when unset.
    pub fn attribute_or_empty(name: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Attribute {
                name: attribute.into(),
                when_absent: WhenAbsent::Empty,
            },
        }
    }

    /// A parameter carrying the reference.
    pub fn reference(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Reference,
        }
    }

    /// A parameter with a fixed value.
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Literal(value.into()),
        }
    }

    /// A parameter carrying the set item.
    pub fn item(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ParamSource::Item,
        }
    }

    /// The attribute this parameter reads, if any.
    pub fn attribute_name(&self) -> Option<&str> {
        match &self.source {
            ParamSource::Attribute { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// One remote call template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// HTTP method.
    pub method: Method,
    /// Path below the base address.
    pub path: String,
    /// Parameters, in order.
    pub params: Vec<Param>,
    /// Status code that signals success.
    pub expected_status: u16,
}

impl Endpoint {
    /// A `GET` endpoint expecting 200.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            params: Vec::new(),
            expected_status: 200,
        }
    }

    /// A `POST` endpoint expecting 200.
    pub fn post(path: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            params: Vec::new(),
            expected_status: 200,
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Set the expected status code.
    pub fn expecting(mut self, status: u16) -> Self {
        self.expected_status = status;
        self
    }

    fn uses_item(&self) -> bool {
        self.params.iter().any(|p| p.source == ParamSource::Item)
    }

    fn uses_reference(&self) -> bool {
        self.params.iter().any(|p| p.source == ParamSource::Reference)
    }
}

/// How a new object's reference is obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefStrategy {
    /// Read from the create response at a JSON pointer.
    ResponseField(String),
    /// Join attribute values with a separator.
    Derived {
        /// Attributes joined, in order.
        attributes: Vec<String>,
        /// Separator between values.
        separator: String,
    },
    /// A random UUID, for objects with no remote identity of their own.
    Generated,
}

impl RefStrategy {
    /// Join the given attributes with `/`.
    pub fn derived(attributes: &[&str]) -> Self {
        Self::Derived {
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            separator: "/".to_string(),
        }
    }
}

/// Binds an attribute to a field of a response item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBinding {
    /// Attribute name.
    pub attribute: String,
    /// JSON pointer relative to the item, such as `/login`.
    pub pointer: String,
}

impl FieldBinding {
    /// Create a binding.
    pub fn new(attribute: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            pointer: pointer.into(),
        }
    }
}

/// What a response item's key field is compared against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// The declared value of an attribute.
    Attribute(String),
    /// The reference.
    Reference,
}

/// One key comparison used to find the declared object in a read response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBinding {
    /// Local side of the comparison.
    pub source: KeySource,
    /// JSON pointer relative to the item.
    pub pointer: String,
}

/// Where the items of a read response live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemsAt {
    /// The body is a single item.
    Root,
    /// The body holds an array of items at a JSON pointer.
    Pointer(String),
}

/// Create call template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateSpec {
    /// The create endpoint; `None` when creation consists only of set additions.
    pub endpoint: Option<Endpoint>,
    /// How the reference is obtained.
    pub reference: RefStrategy,
    /// Computed attributes only available in the create response.
    pub captures: Vec<FieldBinding>,
}

/// Read call template and response decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadSpec {
    /// The read/search endpoint.
    pub endpoint: Endpoint,
    /// Location of the item collection.
    pub items: ItemsAt,
    /// All keys must match (case-insensitively) for an item to be the object.
    pub keys: Vec<KeyBinding>,
    /// Item fields copied into the observed state.
    pub fields: Vec<FieldBinding>,
    /// Item field holding the reference, when the server assigns one.
    pub reference_field: Option<String>,
    /// Statuses meaning the object no longer exists.
    pub absent_statuses: Vec<u16>,
}

/// An update endpoint and the attributes it applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    /// Attributes whose change triggers this call.
    pub attributes: Vec<String>,
    /// The endpoint.
    pub endpoint: Endpoint,
}

/// Add/remove endpoints for one set-valued attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetSpec {
    /// The set-valued attribute.
    pub attribute: String,
    /// Adds one item.
    pub add: Endpoint,
    /// Removes one item.
    pub remove: Endpoint,
}

/// Delete call template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSpec {
    /// The delete endpoint; `None` when deletion removes every set item.
    pub endpoint: Option<Endpoint>,
    /// Statuses meaning the object was already gone.
    pub not_found_statuses: Vec<u16>,
}

/// How an externally supplied identifier seeds an import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportSpec {
    /// Import is not supported.
    #[default]
    Unsupported,
    /// The identifier is the reference; no attributes are seeded.
    Reference,
    /// The identifier is split into attribute values.
    Attributes {
        /// Attributes seeded, in order.
        attributes: Vec<String>,
        /// Separator between values.
        separator: String,
    },
}

/// Static description of one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource type name, such as `sonarcloud_user`.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Attributes, in declaration order.
    pub attributes: Vec<Attribute>,
    /// Create template.
    pub create: CreateSpec,
    /// Read template.
    pub read: ReadSpec,
    /// Update templates, applied in order.
    pub updates: Vec<UpdateSpec>,
    /// Set-valued attribute templates.
    pub sets: Vec<SetSpec>,
    /// Delete template.
    pub delete: DeleteSpec,
    /// Import strategy.
    pub import: ImportSpec,
}

impl ResourceDescriptor {
    /// Start building a descriptor.
    pub fn builder(name: impl Into<String>) -> ResourceDescriptorBuilder {
        ResourceDescriptorBuilder::new(name)
    }

    /// Look up an attribute.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Names of attributes that force replacement.
    pub fn force_new_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|a| a.force_new)
            .map(|a| a.name.as_str())
    }

    /// The set template for an attribute.
    pub fn set_spec(&self, attribute: &str) -> Option<&SetSpec> {
        self.sets.iter().find(|s| s.attribute == attribute)
    }

    /// Whether an externally supplied identifier can be imported.
    pub fn is_importable(&self) -> bool {
        self.import != ImportSpec::Unsupported
    }
}

/// Builder for [`ResourceDescriptor`].
#[derive(Debug, Clone)]
pub struct ResourceDescriptorBuilder {
    name: String,
    description: Option<String>,
    attributes: Vec<Attribute>,
    create: Option<CreateSpec>,
    read: Option<ReadSpec>,
    updates: Vec<UpdateSpec>,
    sets: Vec<SetSpec>,
    delete: DeleteSpec,
    import: ImportSpec,
}

impl ResourceDescriptorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            attributes: Vec::new(),
            create: None,
            read: None,
            updates: Vec::new(),
            sets: Vec::new(),
            delete: DeleteSpec {
                endpoint: None,
                not_found_statuses: vec![404],
            },
            import: ImportSpec::Unsupported,
        }
    }

    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add an attribute.
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Set the create endpoint and reference strategy.
    pub fn create(mut self, endpoint: Endpoint, reference: RefStrategy) -> Self {
        self.create = Some(CreateSpec {
            endpoint: Some(endpoint),
            reference,
            captures: self.create.map(|c| c.captures).unwrap_or_default(),
        });
        self
    }

    /// Create by applying set additions only; the reference is generated or derived.
    pub fn create_by_sets(mut self, reference: RefStrategy) -> Self {
        self.create = Some(CreateSpec {
            endpoint: None,
            reference,
            captures: Vec::new(),
        });
        self
    }

    /// Capture a computed attribute from the create response.
    pub fn capture(mut self, attribute: impl Into<String>, pointer: impl Into<String>) -> Self {
        if let Some(create) = self.create.as_mut() {
            create.captures.push(FieldBinding::new(attribute, pointer));
        }
        self
    }

    /// Set the read endpoint and where its items live.
    pub fn read(mut self, endpoint: Endpoint, items: ItemsAt) -> Self {
        self.read = Some(ReadSpec {
            endpoint,
            items,
            keys: Vec::new(),
            fields: Vec::new(),
            reference_field: None,
            absent_statuses: vec![404],
        });
        self
    }

    /// Match items whose field equals the declared attribute.
    pub fn key_attribute(self, attribute: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.with_read(|read| {
            read.keys.push(KeyBinding {
                source: KeySource::Attribute(attribute.into()),
                pointer: pointer.into(),
            })
        })
    }

    /// Match items whose field equals the reference; the field also refreshes it.
    pub fn key_reference(self, pointer: impl Into<String>) -> Self {
        let pointer = pointer.into();
        self.with_read(|read| {
            read.keys.push(KeyBinding {
                source: KeySource::Reference,
                pointer: pointer.clone(),
            });
            read.reference_field = Some(pointer);
        })
    }

    /// Take the refreshed reference from an item field.
    pub fn reference_field(self, pointer: impl Into<String>) -> Self {
        self.with_read(|read| read.reference_field = Some(pointer.into()))
    }

    /// Copy an item field into the observed state.
    pub fn field(self, attribute: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.with_read(|read| read.fields.push(FieldBinding::new(attribute, pointer)))
    }

    fn with_read(mut self, f: impl FnOnce(&mut ReadSpec)) -> Self {
        if let Some(read) = self.read.as_mut() {
            f(read);
        }
        self
    }

    /// Add an update endpoint covering the given attributes.
    pub fn update(mut self, attributes: &[&str], endpoint: Endpoint) -> Self {
        self.updates.push(UpdateSpec {
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            endpoint,
        });
        self
    }

    /// Add add/remove endpoints for a set-valued attribute.
    pub fn set(mut self, attribute: impl Into<String>, add: Endpoint, remove: Endpoint) -> Self {
        self.sets.push(SetSpec {
            attribute: attribute.into(),
            add,
            remove,
        });
        self
    }

    /// Set the delete endpoint.
    pub fn delete(mut self, endpoint: Endpoint) -> Self {
        self.delete.endpoint = Some(endpoint);
        self
    }

    /// Set the import strategy.
    pub fn import(mut self, import: ImportSpec) -> Self {
        self.import = import;
        self
    }

    /// Import by splitting the identifier on `/` into the given attributes.
    pub fn import_attributes(self, attributes: &[&str]) -> Self {
        self.import(ImportSpec::Attributes {
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
            separator: "/".to_string(),
        })
    }

    /// Check the descriptor and finish building it.
    pub fn build(self) -> Result<ResourceDescriptor, ProviderError> {
        let invalid = |reason: String| ProviderError::InvalidDescriptor {
            resource_type: self.name.clone(),
            reason,
        };

        let create = self
            .create
            .clone()
            .ok_or_else(|| invalid("no create template".to_string()))?;
        let read = self
            .read
            .clone()
            .ok_or_else(|| invalid("no read template".to_string()))?;

        let mut names = BTreeSet::new();
        for attr in &self.attributes {
            if attr.name.is_empty() {
                return Err(invalid("attribute with empty name".to_string()));
            }
            if !names.insert(attr.name.as_str()) {
                return Err(invalid(format!("duplicate attribute '{}'", attr.name)));
            }
            let f = attr.flags;
            let kinds = [f.required, f.optional, f.computed];
            if kinds.iter().filter(|set| **set).count() != 1 {
                return Err(invalid(format!(
                    "attribute '{}' must be exactly one of required, optional or computed",
                    attr.name
                )));
            }
            if attr.min_items > 0 && !attr.is_set_valued() {
                return Err(invalid(format!(
                    "attribute '{}' sets a minimum item count but is not a set",
                    attr.name
                )));
            }
            if attr.force_new && !f.is_configurable() {
                return Err(invalid(format!(
                    "computed attribute '{}' cannot force replacement",
                    attr.name
                )));
            }
        }

        let declared = |name: &str| self.attributes.iter().find(|a| a.name == name);
        let check_declared = |name: &str, context: &str| {
            declared(name)
                .map(|_| ())
                .ok_or_else(|| invalid(format!("{} references unknown attribute '{}'", context, name)))
        };
        let check_endpoint = |endpoint: &Endpoint, context: &str| -> Result<(), ProviderError> {
            for param in &endpoint.params {
                if let Some(name) = param.attribute_name() {
                    check_declared(name, context)?;
                }
            }
            Ok(())
        };

        // create
        match &create.endpoint {
            Some(endpoint) => {
                check_endpoint(endpoint, "create endpoint")?;
                if endpoint.uses_reference() {
                    return Err(invalid("create endpoint cannot use the reference".to_string()));
                }
            }
            None => {
                if !self.attributes.iter().any(Attribute::is_set_valued) {
                    return Err(invalid(
                        "create without an endpoint requires a set-valued attribute".to_string(),
                    ));
                }
                if matches!(create.reference, RefStrategy::ResponseField(_)) {
                    return Err(invalid(
                        "a response-field reference requires a create endpoint".to_string(),
                    ));
                }
            }
        }
        if let RefStrategy::Derived { attributes, .. } = &create.reference {
            if attributes.is_empty() {
                return Err(invalid("derived reference needs attributes".to_string()));
            }
            for name in attributes {
                match declared(name) {
                    Some(attr) if attr.flags.required && attr.force_new => {}
                    Some(_) => {
                        return Err(invalid(format!(
                            "derived reference attribute '{}' must be required and force replacement",
                            name
                        )))
                    }
                    None => check_declared(name, "derived reference")?,
                }
            }
        }
        for capture in &create.captures {
            match declared(&capture.attribute) {
                Some(attr) if attr.flags.computed => {}
                Some(_) => {
                    return Err(invalid(format!(
                        "captured attribute '{}' must be computed",
                        capture.attribute
                    )))
                }
                None => check_declared(&capture.attribute, "create capture")?,
            }
        }

        // read
        check_endpoint(&read.endpoint, "read endpoint")?;
        if read.endpoint.method != Method::Get {
            return Err(invalid("read endpoint must use GET".to_string()));
        }
        if read.keys.is_empty() {
            return Err(invalid("read template has no key".to_string()));
        }
        for key in &read.keys {
            if let KeySource::Attribute(name) = &key.source {
                check_declared(name, "read key")?;
            }
        }
        for field in &read.fields {
            check_declared(&field.attribute, "read field")?;
        }

        // update
        let mut updatable = BTreeSet::new();
        for update in &self.updates {
            check_endpoint(&update.endpoint, "update endpoint")?;
            if update.attributes.is_empty() {
                return Err(invalid(format!(
                    "update endpoint {} covers no attribute",
                    update.endpoint.path
                )));
            }
            for name in &update.attributes {
                check_declared(name, "update")?;
                if let Some(attr) = declared(name) {
                    if attr.force_new {
                        return Err(invalid(format!(
                            "attribute '{}' forces replacement and cannot be updated in place",
                            name
                        )));
                    }
                    if attr.is_set_valued() {
                        return Err(invalid(format!(
                            "set-valued attribute '{}' is updated through its set template",
                            name
                        )));
                    }
                }
                updatable.insert(name.as_str());
            }
        }

        // sets
        for set in &self.sets {
            match declared(&set.attribute) {
                Some(attr) if attr.is_set_valued() => {}
                Some(_) => {
                    return Err(invalid(format!(
                        "set template for non-set attribute '{}'",
                        set.attribute
                    )))
                }
                None => check_declared(&set.attribute, "set template")?,
            }
            for endpoint in [&set.add, &set.remove] {
                check_endpoint(endpoint, "set endpoint")?;
                if !endpoint.uses_item() {
                    return Err(invalid(format!(
                        "set endpoint {} has no item parameter",
                        endpoint.path
                    )));
                }
            }
            updatable.insert(set.attribute.as_str());
        }

        for attr in &self.attributes {
            if attr.is_set_valued() && !self.sets.iter().any(|s| s.attribute == attr.name) {
                return Err(invalid(format!(
                    "set-valued attribute '{}' has no set template",
                    attr.name
                )));
            }
            let mutable = attr.flags.is_configurable() && !attr.force_new;
            if mutable && !updatable.contains(attr.name.as_str()) {
                return Err(invalid(format!(
                    "attribute '{}' can change but has no update path; mark it force_new",
                    attr.name
                )));
            }
        }

        // delete
        match &self.delete.endpoint {
            Some(endpoint) => check_endpoint(endpoint, "delete endpoint")?,
            None if self.sets.is_empty() => {
                return Err(invalid("no delete template".to_string()));
            }
            None => {}
        }

        // import
        if let ImportSpec::Attributes { attributes, .. } = &self.import {
            if attributes.is_empty() {
                return Err(invalid("import needs attributes".to_string()));
            }
            for name in attributes {
                check_declared(name, "import")?;
            }
        }

        Ok(ResourceDescriptor {
            name: self.name.clone(),
            description: self.description.clone(),
            attributes: self.attributes.clone(),
            create,
            read,
            updates: self.updates.clone(),
            sets: self.sets.clone(),
            delete: self.delete.clone(),
            import: self.import.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user_builder() -> ResourceDescriptorBuilder {
        ResourceDescriptor::builder("test_user")
            .attribute(Attribute::required_string("login").with_force_new())
            .attribute(Attribute::optional_string("email"))
            .create(
                Endpoint::post("api/users/create").with_param(Param::attribute("login", "login")),
                RefStrategy::ResponseField("/user/login".to_string()),
            )
            .read(
                Endpoint::get("api/users/search").with_param(Param::attribute("q", "login")),
                ItemsAt::Pointer("/users".to_string()),
            )
            .key_attribute("login", "/login")
            .field("email", "/email")
            .update(
                &["email"],
                Endpoint::post("api/users/update")
                    .with_param(Param::reference("login"))
                    .with_param(Param::attribute_or_empty("email", "email")),
            )
            .delete(Endpoint::post("api/users/deactivate").with_param(Param::reference("login")))
    }

    #[test]
    fn test_attribute_builders() {
        let attr = Attribute::required_string("name")
            .with_description("A test attribute")
            .with_force_new();

        assert_eq!(attr.attr_type, AttributeType::String);
        assert!(attr.flags.required);
        assert_eq!(attr.description, Some("A test attribute".to_string()));
        assert!(attr.force_new);

        let attr = Attribute::optional_string("password").sensitive();
        assert!(attr.flags.sensitive);
        assert!(attr.flags.is_configurable());

        let attr = Attribute::required_string_set("permissions");
        assert!(attr.is_set_valued());
        assert!(!Attribute::computed_string("token").flags.is_configurable());

        let attr = Attribute::optional_bool("is_local").with_default(json!(true));
        assert_eq!(attr.default, Some(json!(true)));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(AttributeType::String.coerce(&json!(12)), Some(json!("12")));
        assert_eq!(AttributeType::Int64.coerce(&json!("80")), Some(json!(80)));
        assert_eq!(AttributeType::Int64.coerce(&json!("eighty")), None);
        assert_eq!(AttributeType::Bool.coerce(&json!("true")), Some(json!(true)));
        assert_eq!(
            AttributeType::set(AttributeType::String).coerce(&json!(["scan", 1])),
            Some(json!(["scan", "1"]))
        );
        assert_eq!(AttributeType::String.coerce(&json!({"a": 1})), None);
    }

    #[test]
    fn test_build_valid_descriptor() {
        let descriptor = user_builder().import(ImportSpec::Reference).build().unwrap();

        assert_eq!(descriptor.name, "test_user");
        assert!(descriptor.attribute("login").is_some());
        assert_eq!(descriptor.force_new_attributes().collect::<Vec<_>>(), vec!["login"]);
        assert_eq!(descriptor.read.absent_statuses, vec![404]);
        assert_eq!(descriptor.delete.not_found_statuses, vec![404]);
        assert!(descriptor.is_importable());
    }

    #[test]
    fn test_build_rejects_updating_force_new_attribute() {
        let err = user_builder()
            .update(&["login"], Endpoint::post("api/users/rename"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("forces replacement"));
    }

    #[test]
    fn test_build_rejects_mutable_attribute_without_update_path() {
        let err = user_builder()
            .attribute(Attribute::optional_string("name"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no update path"));
    }

    #[test]
    fn test_build_rejects_unknown_param_attribute() {
        let err = user_builder()
            .delete(Endpoint::post("api/users/deactivate").with_param(Param::attribute("x", "nope")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unknown attribute 'nope'"));
    }

    #[test]
    fn test_build_rejects_duplicate_attribute() {
        let err = user_builder()
            .attribute(Attribute::optional_string("email"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate attribute 'email'"));
    }

    #[test]
    fn test_build_rejects_ambiguous_flags() {
        let flags = AttributeFlags {
            optional: true,
            computed: true,
            ..Default::default()
        };
        let err = user_builder()
            .attribute(Attribute::new("token", AttributeType::String, flags))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("exactly one of"));
    }

    #[test]
    fn test_build_rejects_min_items_on_scalars() {
        let err = user_builder()
            .attribute(Attribute::optional_string("nickname").with_min_items(1))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("not a set"));
    }

    #[test]
    fn test_build_requires_key() {
        let err = ResourceDescriptor::builder("keyless")
            .attribute(Attribute::required_string("name").with_force_new())
            .create(
                Endpoint::post("api/things/create"),
                RefStrategy::derived(&["name"]),
            )
            .read(Endpoint::get("api/things/search"), ItemsAt::Root)
            .delete(Endpoint::post("api/things/delete"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no key"));
    }

    #[test]
    fn test_build_set_descriptor() {
        let builder = ResourceDescriptor::builder("test_permissions")
            .attribute(Attribute::required_string("login").with_force_new())
            .attribute(Attribute::required_string_set("permissions"))
            .create_by_sets(RefStrategy::Generated)
            .read(
                Endpoint::get("api/permissions/users"),
                ItemsAt::Pointer("/users".to_string()),
            )
            .key_attribute("login", "/login")
            .field("permissions", "/permissions");

        let err = builder.clone().build().unwrap_err();
        assert!(err.to_string().contains("no set template"));

        let descriptor = builder
            .set(
                "permissions",
                Endpoint::post("api/permissions/add_user")
                    .with_param(Param::attribute("login", "login"))
                    .with_param(Param::item("permission"))
                    .expecting(204),
                Endpoint::post("api/permissions/remove_user")
                    .with_param(Param::attribute("login", "login"))
                    .with_param(Param::item("permission"))
                    .expecting(204),
            )
            .build()
            .unwrap();
        assert!(descriptor.set_spec("permissions").is_some());
        assert!(descriptor.create.endpoint.is_none());
        assert!(descriptor.delete.endpoint.is_none());
    }

    #[test]
    fn test_build_rejects_set_endpoint_without_item() {
        let err = ResourceDescriptor::builder("test_permissions")
            .attribute(Attribute::required_string_set("permissions"))
            .create_by_sets(RefStrategy::Generated)
            .read(Endpoint::get("api/permissions/users"), ItemsAt::Root)
            .key_reference("/id")
            .set(
                "permissions",
                Endpoint::post("api/permissions/add_user"),
                Endpoint::post("api/permissions/remove_user"),
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no item parameter"));
    }

    #[test]
    fn test_descriptor_serializes() {
        let descriptor = user_builder().build().unwrap();
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["name"], "test_user");
        assert_eq!(value["attributes"][0]["type"], "string");
        assert_eq!(value["attributes"][0]["force_new"], true);
        assert_eq!(value["create"]["endpoint"]["method"], "POST");
    }
}
