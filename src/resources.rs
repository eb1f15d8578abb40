//! The SonarCloud resource catalog.
//!
//! Every resource type the provider manages is declared here as a
//! [`ResourceDescriptor`]. Paths are relative to the session base address.

use std::collections::BTreeMap;

use serde_json::json;

use crate::descriptor::{
    Attribute, AttributeType, AttributeFlags, Endpoint, ImportSpec, ItemsAt, Param, RefStrategy,
    ResourceDescriptor,
};
use crate::error::ProviderError;

/// Resource descriptors keyed by type name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    descriptors: BTreeMap<String, ResourceDescriptor>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog of every SonarCloud resource type.
    pub fn sonarcloud() -> Result<Self, ProviderError> {
        let mut catalog = Self::new();
        for descriptor in [
            user()?,
            user_token()?,
            group()?,
            project()?,
            quality_gate()?,
            quality_gate_condition()?,
            quality_gate_project_association()?,
            quality_profile()?,
            plugin()?,
            permission_template()?,
            permissions(PermissionTarget::User)?,
            permissions(PermissionTarget::Group)?,
            permissions(PermissionTarget::UserTemplate)?,
            permissions(PermissionTarget::GroupTemplate)?,
        ] {
            catalog.register(descriptor)?;
        }
        Ok(catalog)
    }

    /// Add a descriptor. Type names must be unique.
    pub fn register(&mut self, descriptor: ResourceDescriptor) -> Result<(), ProviderError> {
        if self.descriptors.contains_key(&descriptor.name) {
            return Err(ProviderError::InvalidDescriptor {
                resource_type: descriptor.name,
                reason: "registered twice".to_string(),
            });
        }
        self.descriptors.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Look up a descriptor by type name.
    pub fn get(&self, resource_type: &str) -> Option<&ResourceDescriptor> {
        self.descriptors.get(resource_type)
    }

    /// Type names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }

    /// Descriptors, sorted by type name.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.descriptors.values()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether no type is registered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

fn user() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_user")
        .description("A local or external user account")
        .attribute(Attribute::required_string("login").with_force_new())
        .attribute(Attribute::required_string("name"))
        .attribute(Attribute::optional_string("email"))
        .attribute(Attribute::optional_string("password").sensitive())
        .attribute(
            Attribute::new("is_local", AttributeType::Bool, AttributeFlags::optional())
                .with_default(json!(true))
                .with_force_new(),
        )
        .create(
            Endpoint::post("api/users/create")
                .with_param(Param::attribute("login", "login"))
                .with_param(Param::attribute("name", "name"))
                .with_param(Param::attribute("email", "email"))
                .with_param(Param::attribute("password", "password"))
                .with_param(Param::attribute("local", "is_local")),
            RefStrategy::ResponseField("/user/login".to_string()),
        )
        .read(
            Endpoint::get("api/users/search").with_param(Param::reference("q")),
            ItemsAt::Pointer("/users".to_string()),
        )
        .key_reference("/login")
        .field("login", "/login")
        .field("name", "/name")
        .field("email", "/email")
        .field("is_local", "/local")
        .update(
            &["name", "email"],
            Endpoint::post("api/users/update")
                .with_param(Param::reference("login"))
                .with_param(Param::attribute("name", "name"))
                .with_param(Param::attribute_or_empty("email", "email")),
        )
        .update(
            &["password"],
            Endpoint::post("api/users/change_password")
                .with_param(Param::reference("login"))
                .with_param(Param::attribute("password", "password"))
                .expecting(204),
        )
        .delete(Endpoint::post("api/users/deactivate").with_param(Param::reference("login")))
        .import(ImportSpec::Reference)
        .build()
}

fn user_token() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_user_token")
        .description("An access token; its value is only returned at creation")
        .attribute(Attribute::required_string("login_name").with_force_new())
        .attribute(Attribute::required_string("name").with_force_new())
        .attribute(Attribute::computed_string("token").sensitive())
        .create(
            Endpoint::post("api/user_tokens/generate")
                .with_param(Param::attribute("login", "login_name"))
                .with_param(Param::attribute("name", "name")),
            RefStrategy::derived(&["login_name", "name"]),
        )
        .capture("token", "/token")
        .read(
            Endpoint::get("api/user_tokens/search").with_param(Param::attribute("login", "login_name")),
            ItemsAt::Pointer("/userTokens".to_string()),
        )
        .key_attribute("name", "/name")
        .field("name", "/name")
        .delete(
            Endpoint::post("api/user_tokens/revoke")
                .with_param(Param::attribute("login", "login_name"))
                .with_param(Param::attribute("name", "name"))
                .expecting(204),
        )
        .import_attributes(&["login_name", "name"])
        .build()
}

fn group() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_group")
        .description("A user group")
        .attribute(Attribute::required_string("name").with_force_new())
        .attribute(Attribute::optional_string("description"))
        .attribute(Attribute::optional_string("organization").with_force_new())
        .create(
            Endpoint::post("api/user_groups/create")
                .with_param(Param::attribute("name", "name"))
                .with_param(Param::attribute("description", "description"))
                .with_param(Param::attribute("organization", "organization")),
            RefStrategy::ResponseField("/group/id".to_string()),
        )
        .read(
            Endpoint::get("api/user_groups/search")
                .with_param(Param::attribute("q", "name"))
                .with_param(Param::attribute("organization", "organization")),
            ItemsAt::Pointer("/groups".to_string()),
        )
        .key_reference("/id")
        .field("name", "/name")
        .field("description", "/description")
        .update(
            &["description"],
            Endpoint::post("api/user_groups/update")
                .with_param(Param::reference("id"))
                .with_param(Param::attribute_or_empty("description", "description")),
        )
        .delete(
            Endpoint::post("api/user_groups/delete")
                .with_param(Param::reference("id"))
                .expecting(204),
        )
        .import(ImportSpec::Reference)
        .build()
}

fn project() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_project")
        .description("A project")
        .attribute(Attribute::required_string("name").with_force_new())
        .attribute(Attribute::required_string("project").with_force_new())
        .attribute(
            Attribute::optional_string("visibility")
                .with_default(json!("public"))
                .with_force_new(),
        )
        .attribute(Attribute::optional_string("organization").with_force_new())
        .create(
            Endpoint::post("api/projects/create")
                .with_param(Param::attribute("name", "name"))
                .with_param(Param::attribute("project", "project"))
                .with_param(Param::attribute("visibility", "visibility"))
                .with_param(Param::attribute("organization", "organization")),
            RefStrategy::ResponseField("/project/key".to_string()),
        )
        .read(
            Endpoint::get("api/projects/search")
                .with_param(Param::reference("projects"))
                .with_param(Param::attribute("organization", "organization")),
            ItemsAt::Pointer("/components".to_string()),
        )
        .key_reference("/key")
        .field("name", "/name")
        .field("project", "/key")
        .field("visibility", "/visibility")
        .delete(
            Endpoint::post("api/projects/delete")
                .with_param(Param::reference("project"))
                .expecting(204),
        )
        .import(ImportSpec::Reference)
        .build()
}

fn quality_gate() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_qualitygate")
        .description("A quality gate")
        .attribute(Attribute::required_string("name").with_force_new())
        .attribute(Attribute::optional_string("organization").with_force_new())
        .create(
            Endpoint::post("api/qualitygates/create")
                .with_param(Param::attribute("name", "name"))
                .with_param(Param::attribute("organization", "organization")),
            RefStrategy::ResponseField("/id".to_string()),
        )
        .read(
            Endpoint::get("api/qualitygates/show")
                .with_param(Param::reference("id"))
                .with_param(Param::attribute("organization", "organization")),
            ItemsAt::Root,
        )
        .key_reference("/id")
        .field("name", "/name")
        .delete(
            Endpoint::post("api/qualitygates/destroy")
                .with_param(Param::reference("id"))
                .with_param(Param::attribute("organization", "organization"))
                .expecting(204),
        )
        .import(ImportSpec::Reference)
        .build()
}

fn quality_gate_condition() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_qualitygate_condition")
        .description("A condition of a quality gate")
        .attribute(Attribute::required_int64("gateid").with_force_new())
        .attribute(Attribute::required_int64("error"))
        .attribute(Attribute::required_string("metric"))
        .attribute(Attribute::required_string("op"))
        .create(
            Endpoint::post("api/qualitygates/create_condition")
                .with_param(Param::attribute("gateId", "gateid"))
                .with_param(Param::attribute("error", "error"))
                .with_param(Param::attribute("metric", "metric"))
                .with_param(Param::attribute("op", "op")),
            RefStrategy::ResponseField("/id".to_string()),
        )
        .read(
            Endpoint::get("api/qualitygates/show").with_param(Param::attribute("id", "gateid")),
            ItemsAt::Pointer("/conditions".to_string()),
        )
        .key_reference("/id")
        .field("error", "/error")
        .field("metric", "/metric")
        .field("op", "/op")
        .update(
            &["error", "metric", "op"],
            Endpoint::post("api/qualitygates/update_condition")
                .with_param(Param::attribute("gateId", "gateid"))
                .with_param(Param::reference("id"))
                .with_param(Param::attribute("error", "error"))
                .with_param(Param::attribute("metric", "metric"))
                .with_param(Param::attribute("op", "op")),
        )
        .delete(
            Endpoint::post("api/qualitygates/delete_condition")
                .with_param(Param::reference("id"))
                .expecting(204),
        )
        .build()
}

fn quality_gate_project_association() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_qualitygate_project_association")
        .description("Associates a project with a quality gate")
        .attribute(Attribute::required_string("gateid").with_force_new())
        .attribute(Attribute::required_string("projectkey").with_force_new())
        .create(
            Endpoint::post("api/qualitygates/select")
                .with_param(Param::attribute("gateId", "gateid"))
                .with_param(Param::attribute("projectKey", "projectkey"))
                .expecting(204),
            RefStrategy::derived(&["gateid", "projectkey"]),
        )
        .read(
            Endpoint::get("api/qualitygates/search")
                .with_param(Param::attribute("gateId", "gateid"))
                .with_param(Param::literal("selected", "selected")),
            ItemsAt::Pointer("/results".to_string()),
        )
        .key_attribute("projectkey", "/key")
        .field("projectkey", "/key")
        .delete(
            Endpoint::post("api/qualitygates/deselect")
                .with_param(Param::attribute("gateId", "gateid"))
                .with_param(Param::attribute("projectKey", "projectkey"))
                .expecting(204),
        )
        .import_attributes(&["gateid", "projectkey"])
        .build()
}

fn quality_profile() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_qualityprofile")
        .description("A quality profile for one language")
        .attribute(Attribute::required_string("name").with_force_new())
        .attribute(Attribute::required_string("language").with_force_new())
        .create(
            Endpoint::post("api/qualityprofiles/create")
                .with_param(Param::attribute("name", "name"))
                .with_param(Param::attribute("language", "language")),
            RefStrategy::ResponseField("/profile/key".to_string()),
        )
        .read(
            Endpoint::get("api/qualityprofiles/search")
                .with_param(Param::attribute("qualityProfile", "name"))
                .with_param(Param::attribute("language", "language")),
            ItemsAt::Pointer("/profiles".to_string()),
        )
        .key_attribute("name", "/name")
        .key_attribute("language", "/language")
        .reference_field("/key")
        .field("name", "/name")
        .field("language", "/language")
        .delete(
            Endpoint::post("api/qualityprofiles/delete")
                .with_param(Param::attribute("qualityProfile", "name"))
                .with_param(Param::attribute("language", "language"))
                .expecting(204),
        )
        .build()
}

fn plugin() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_plugin")
        .description("An installed plugin")
        .attribute(Attribute::required_string("key").with_force_new())
        .create(
            Endpoint::post("api/plugins/install")
                .with_param(Param::attribute("key", "key"))
                .expecting(204),
            RefStrategy::derived(&["key"]),
        )
        .read(
            Endpoint::get("api/plugins/installed"),
            ItemsAt::Pointer("/plugins".to_string()),
        )
        .key_attribute("key", "/key")
        .field("key", "/key")
        .delete(
            Endpoint::post("api/plugins/uninstall")
                .with_param(Param::attribute("key", "key"))
                .expecting(204),
        )
        .import_attributes(&["key"])
        .build()
}

fn permission_template() -> Result<ResourceDescriptor, ProviderError> {
    ResourceDescriptor::builder("sonarcloud_permission_template")
        .description("A permission template applied to new projects")
        .attribute(Attribute::required_string("name").with_force_new())
        .attribute(Attribute::optional_string("description"))
        .attribute(Attribute::optional_string("project_key_pattern"))
        .create(
            Endpoint::post("api/permissions/create_template")
                .with_param(Param::attribute("name", "name"))
                .with_param(Param::attribute("description", "description"))
                .with_param(Param::attribute("projectKeyPattern", "project_key_pattern")),
            RefStrategy::ResponseField("/permissionTemplate/id".to_string()),
        )
        .read(
            Endpoint::get("api/permissions/search_templates").with_param(Param::attribute("q", "name")),
            ItemsAt::Pointer("/permissionTemplates".to_string()),
        )
        .key_reference("/id")
        .field("name", "/name")
        .field("description", "/description")
        .field("project_key_pattern", "/projectKeyPattern")
        .update(
            &["description", "project_key_pattern"],
            Endpoint::post("api/permissions/update_template")
                .with_param(Param::reference("id"))
                .with_param(Param::attribute_or_empty("description", "description"))
                .with_param(Param::attribute_or_empty(
                    "projectKeyPattern",
                    "project_key_pattern",
                )),
        )
        .delete(
            Endpoint::post("api/permissions/delete_template")
                .with_param(Param::reference("templateId"))
                .expecting(204),
        )
        .import(ImportSpec::Reference)
        .build()
}

/// Who holds a set of permissions, and where.
#[derive(Debug, Clone, Copy)]
enum PermissionTarget {
    User,
    Group,
    UserTemplate,
    GroupTemplate,
}

impl PermissionTarget {
    fn resource_type(self) -> &'static str {
        match self {
            Self::User => "sonarcloud_user_permissions",
            Self::Group => "sonarcloud_group_permissions",
            Self::UserTemplate => "sonarcloud_user_template_permissions",
            Self::GroupTemplate => "sonarcloud_group_template_permissions",
        }
    }

    /// Principal attribute, its request parameter and its field in the listing.
    fn principal(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::User | Self::UserTemplate => ("login_name", "login", "/login"),
            Self::Group | Self::GroupTemplate => ("group_name", "groupName", "/name"),
        }
    }

    /// Listing path, collection pointer, add path and remove path.
    fn endpoints(self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            Self::User => (
                "api/permissions/users",
                "/users",
                "api/permissions/add_user",
                "api/permissions/remove_user",
            ),
            Self::Group => (
                "api/permissions/groups",
                "/groups",
                "api/permissions/add_group",
                "api/permissions/remove_group",
            ),
            Self::UserTemplate => (
                "api/permissions/template_users",
                "/users",
                "api/permissions/add_user_to_template",
                "api/permissions/remove_user_from_template",
            ),
            Self::GroupTemplate => (
                "api/permissions/template_groups",
                "/groups",
                "api/permissions/add_group_to_template",
                "api/permissions/remove_group_from_template",
            ),
        }
    }

    fn on_template(self) -> bool {
        matches!(self, Self::UserTemplate | Self::GroupTemplate)
    }
}

fn permissions(target: PermissionTarget) -> Result<ResourceDescriptor, ProviderError> {
    let (principal, principal_param, principal_field) = target.principal();
    let (list_path, items, add_path, remove_path) = target.endpoints();
    let (scope, scope_param) = if target.on_template() {
        ("template_id", "templateId")
    } else {
        ("project_key", "projectKey")
    };
    let scope_attribute = if target.on_template() {
        Attribute::required_string(scope).with_force_new()
    } else {
        Attribute::optional_string(scope).with_force_new()
    };

    let item_call = |path: &str| {
        Endpoint::post(path)
            .with_param(Param::attribute(principal_param, principal))
            .with_param(Param::attribute(scope_param, scope))
            .with_param(Param::item("permission"))
            .expecting(204)
    };

    ResourceDescriptor::builder(target.resource_type())
        .description("The permissions held by one user or group")
        .attribute(Attribute::required_string(principal).with_force_new())
        .attribute(scope_attribute)
        .attribute(Attribute::required_string_set("permissions").with_min_items(1))
        .create_by_sets(RefStrategy::Generated)
        .read(
            Endpoint::get(list_path)
                .with_param(Param::attribute(scope_param, scope))
                .with_param(Param::attribute("q", principal))
                .with_param(Param::literal("ps", "100")),
            ItemsAt::Pointer(items.to_string()),
        )
        .key_attribute(principal, principal_field)
        .field("permissions", "/permissions")
        .set("permissions", item_call(add_path), item_call(remove_path))
        .build()
}
