//! Testing utilities.
//!
//! This module provides [`FakeRemote`], a scripted [`HttpClient`] that stands
//! in for a SonarCloud server, and [`ProviderTester`], which drives a
//! [`ProviderService`] through whole lifecycles without a real server.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_provider_sonarcloud::testing::{FakeRemote, ProviderTester};
//! use hemmer_provider_sonarcloud::transport::Method;
//! use serde_json::json;
//!
//! #[tokio::test]
//! async fn test_create_group() {
//!     let remote = FakeRemote::with_version("9.9");
//!     remote.reply(Method::Post, "api/user_groups/create", 200, r#"{"group":{"id":7}}"#);
//!     remote.reply(Method::Get, "api/user_groups/search", 200,
//!         r#"{"groups":[{"id":7,"name":"devs"}]}"#);
//!
//!     let tester = ProviderTester::connect(&remote).await.unwrap();
//!     let state = tester.create("sonarcloud_group", json!({"name": "devs"})).await.unwrap();
//!     assert_eq!(state["id"], "7");
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::config::ConnectionConfig;
use crate::error::ProviderError;
use crate::health::VERSION_PATH;
use crate::provider::{ProviderService, SonarCloudProvider};
use crate::reconcile::{PartialFailure, SetChange};
use crate::transport::{HttpCall, HttpClient, Method, NetworkFault, RawResponse, RetryPolicy};
use crate::types::{ImportedResource, PlanResult, ReadOutcome};
use crate::validation::{Diagnostic, DiagnosticSeverity};

#[derive(Debug, Default)]
struct Script {
    routes: HashMap<(Method, String), VecDeque<RawResponse>>,
    faults: VecDeque<NetworkFault>,
    calls: Vec<HttpCall>,
}

/// A scripted SonarCloud server.
///
/// Replies are queued per method and path. Each call consumes the head of
/// its route's queue, except that the last reply is repeated for every later
/// call. Unscripted routes answer 404. Clones share the same script, so a
/// test can keep one handle while the transport owns another.
#[derive(Debug, Clone, Default)]
pub struct FakeRemote {
    script: Arc<Mutex<Script>>,
}

impl FakeRemote {
    /// Create a remote with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a remote whose version endpoint reports `version`.
    pub fn with_version(version: &str) -> Self {
        let remote = Self::new();
        remote.reply(Method::Get, VERSION_PATH, 200, version);
        remote
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a reply for `method path`.
    pub fn reply(&self, method: Method, path: &str, status: u16, body: impl Into<String>) {
        let key = (method, path.trim_start_matches('/').to_string());
        self.script()
            .routes
            .entry(key)
            .or_default()
            .push_back(RawResponse::new(status, body));
    }

    /// Queue a JSON reply for `method path`.
    pub fn reply_json(&self, method: Method, path: &str, status: u16, body: Value) {
        self.reply(method, path, status, body.to_string());
    }

    /// Fail the next `count` calls, whatever their route, with `fault`.
    pub fn fail_next(&self, count: usize, fault: NetworkFault) {
        let mut script = self.script();
        for _ in 0..count {
            script.faults.push_back(fault.clone());
        }
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<HttpCall> {
        self.script().calls.clone()
    }

    /// Every call so far as `"METHOD path"`, in order.
    pub fn call_log(&self) -> Vec<String> {
        self.script()
            .calls
            .iter()
            .map(|c| format!("{} {}", c.request.method, c.request.path))
            .collect()
    }

    /// Calls received for one route, in order.
    pub fn calls_to(&self, method: Method, path: &str) -> Vec<HttpCall> {
        let path = path.trim_start_matches('/');
        self.script()
            .calls
            .iter()
            .filter(|c| c.request.method == method && c.request.path == path)
            .cloned()
            .collect()
    }

    /// Forget the calls received so far; the script is kept.
    pub fn clear_calls(&self) {
        self.script().calls.clear();
    }
}

#[async_trait::async_trait]
impl HttpClient for FakeRemote {
    async fn execute(&self, call: HttpCall) -> Result<RawResponse, NetworkFault> {
        let mut script = self.script();
        let key = (call.request.method, call.request.path.clone());
        script.calls.push(call);

        if let Some(fault) = script.faults.pop_front() {
            return Err(fault);
        }
        let response = match script.routes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| RawResponse::new(404, r#"{"errors":[{"msg":"Unknown url"}]}"#)))
    }
}

/// A test harness for provider implementations.
///
/// This wraps a `ProviderService` implementation and provides
/// simplified methods for testing whole lifecycles.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl ProviderTester<SonarCloudProvider> {
    /// Connect a [`SonarCloudProvider`] to `remote` without retry delays.
    ///
    /// `remote` must already answer the version endpoint.
    pub async fn connect(remote: &FakeRemote) -> Result<Self, ProviderError> {
        let config = ConnectionConfig::new("sonarcloud.test", "admin", "admin")
            .with_retry(RetryPolicy::no_retry());
        let provider = SonarCloudProvider::connect_with(&config, Arc::new(remote.clone())).await?;
        Ok(Self::new(provider))
    }
}

impl<P: ProviderService> ProviderTester<P> {
    /// Create a new tester for the given provider.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Get a reference to the underlying provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Get the list of resource type names.
    pub fn resource_types(&self) -> Vec<String> {
        self.provider.metadata().resources
    }

    /// Validate a resource configuration, returning its warnings.
    ///
    /// Error diagnostics become a [`ProviderError::Validation`] naming each
    /// offending attribute.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>, ProviderError> {
        let (errors, warnings): (Vec<_>, Vec<_>) = self
            .provider
            .validate_resource_config(resource_type, config)
            .await?
            .into_iter()
            .partition(Diagnostic::is_error);
        if errors.is_empty() {
            return Ok(warnings);
        }
        let summary: Vec<String> = errors
            .iter()
            .map(|d| match &d.attribute {
                Some(attribute) => format!("{}: {}", attribute, d.summary),
                None => d.summary.clone(),
            })
            .collect();
        Err(ProviderError::Validation(format!(
            "{}: {}",
            resource_type,
            summary.join("; ")
        )))
    }

    /// Plan a resource creation (no prior state).
    pub async fn plan_create(
        &self,
        resource_type: &str,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider.plan(resource_type, None, proposed_state).await
    }

    /// Plan a resource update.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior_state), proposed_state)
            .await
    }

    /// Plan a resource deletion.
    pub async fn plan_delete(
        &self,
        resource_type: &str,
        prior_state: Value,
    ) -> Result<PlanResult, ProviderError> {
        self.provider
            .plan(resource_type, Some(prior_state), Value::Null)
            .await
    }

    /// Create a new resource.
    pub async fn create(
        &self,
        resource_type: &str,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider.create(resource_type, planned_state).await
    }

    /// Read the current state of a resource.
    pub async fn read(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<Option<Value>, ProviderError> {
        self.provider.read(resource_type, current_state).await
    }

    /// Update an existing resource.
    pub async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value, ProviderError> {
        self.provider
            .update(resource_type, prior_state, planned_state)
            .await
    }

    /// Delete a resource.
    pub async fn delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.provider.delete(resource_type, current_state).await
    }

    /// Import an existing resource.
    pub async fn import_resource(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Vec<ImportedResource>, ProviderError> {
        self.provider.import_resource(resource_type, id).await
    }

    /// Run a full create lifecycle: plan → create → read.
    ///
    /// Returns the final state after read.
    pub async fn lifecycle_create(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Value, ProviderError> {
        let plan_result = self.plan_create(resource_type, config).await?;
        let created_state = self
            .create(resource_type, plan_result.planned_state)
            .await?;
        self.read_existing(resource_type, created_state).await
    }

    /// Run a full update lifecycle: plan → update or replace → read.
    ///
    /// Returns the final state after read.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        proposed_state: Value,
    ) -> Result<Value, ProviderError> {
        let plan_result = self
            .plan_update(resource_type, prior_state.clone(), proposed_state)
            .await?;

        let updated_state = if plan_result.requires_replace {
            self.provider
                .replace(resource_type, prior_state, plan_result.planned_state)
                .await?
        } else {
            self.update(resource_type, prior_state, plan_result.planned_state)
                .await?
        };

        self.read_existing(resource_type, updated_state).await
    }

    /// Run a full delete lifecycle: plan → delete.
    pub async fn lifecycle_delete(
        &self,
        resource_type: &str,
        current_state: Value,
    ) -> Result<(), ProviderError> {
        self.plan_delete(resource_type, current_state.clone())
            .await?;
        self.delete(resource_type, current_state).await
    }

    /// Run a full CRUD lifecycle: create → read → update → read → delete.
    ///
    /// Returns the state after the update (before delete).
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial_config: Value,
        updated_config: Value,
    ) -> Result<Value, ProviderError> {
        let created_state = self.lifecycle_create(resource_type, initial_config).await?;
        let updated_state = self
            .lifecycle_update(resource_type, created_state, updated_config)
            .await?;
        self.lifecycle_delete(resource_type, updated_state.clone())
            .await?;
        Ok(updated_state)
    }

    async fn read_existing(
        &self,
        resource_type: &str,
        state: Value,
    ) -> Result<Value, ProviderError> {
        self.read(resource_type, state).await?.ok_or_else(|| {
            ProviderError::NotFound(format!("{} vanished after being written", resource_type))
        })
    }
}

/// Assert that a read found nothing.
///
/// # Panics
///
/// Panics if the object was found.
pub fn assert_absent(outcome: &ReadOutcome) {
    if let ReadOutcome::Found { reference, observed } = outcome {
        panic!(
            "Expected the object to be absent, but found '{}' with {:?}",
            reference, observed
        );
    }
}

/// Assert that a set reconciliation stopped at `failed_at` after applying
/// exactly `applied`, and return the failure for further checks.
///
/// # Panics
///
/// Panics if `err` is not a [`ProviderError::PartialFailure`] or stopped
/// elsewhere.
pub fn assert_partial_failure<'e>(
    err: &'e ProviderError,
    applied: &[SetChange],
    failed_at: &SetChange,
) -> &'e PartialFailure {
    let ProviderError::PartialFailure(failure) = err else {
        panic!("Expected a partial set failure, got: {:?}", err);
    };
    assert_eq!(failure.applied, applied, "applied changes differ");
    assert_eq!(&failure.failed_at, failed_at, "failing change differs");
    failure
}

/// Assert that the service refused a call with `status`.
///
/// # Panics
///
/// Panics on any other error.
pub fn assert_rejected(err: &ProviderError, status: u16) {
    assert!(
        err.is_status(&[status]),
        "Expected a {} rejection, got: {:?}",
        status,
        err
    );
}

/// Assert that a plan changes nothing.
///
/// # Panics
///
/// Panics if the plan has any changes.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "Expected no changes, but got {:?}",
        changed_paths(plan)
    );
}

/// Assert that a plan updates exactly `attributes` without replacement.
///
/// # Panics
///
/// Panics if the plan replaces the object or changes other attributes.
pub fn assert_plan_updates_in_place(plan: &PlanResult, attributes: &[&str]) {
    assert!(
        !plan.requires_replace,
        "Expected an in-place update, but {:?} force replacement",
        forcing_paths(plan)
    );
    assert_eq!(changed_paths(plan), sorted(attributes));
}

/// Assert that a plan replaces the object because of exactly `attributes`.
///
/// # Panics
///
/// Panics if the plan updates in place or other attributes force it.
pub fn assert_plan_replaces(plan: &PlanResult, attributes: &[&str]) {
    assert!(
        plan.requires_replace,
        "Expected replacement, but the plan changes {:?} in place",
        changed_paths(plan)
    );
    assert_eq!(forcing_paths(plan), sorted(attributes));
}

/// Assert that some diagnostic of `severity` points at `attribute`.
///
/// # Panics
///
/// Panics if none does.
pub fn assert_diagnostic(diagnostics: &[Diagnostic], attribute: &str, severity: DiagnosticSeverity) {
    assert!(
        diagnostics
            .iter()
            .any(|d| d.severity == severity && d.attribute.as_deref() == Some(attribute)),
        "Expected a {:?} on '{}', got: {:?}",
        severity,
        attribute,
        diagnostics
    );
}

fn changed_paths(plan: &PlanResult) -> Vec<&str> {
    let mut paths: Vec<_> = plan.changes.iter().map(|c| c.path.as_str()).collect();
    paths.sort_unstable();
    paths
}

fn forcing_paths(plan: &PlanResult) -> Vec<&str> {
    let mut paths: Vec<_> = plan
        .changes
        .iter()
        .filter(|c| c.forces_replacement)
        .map(|c| c.path.as_str())
        .collect();
    paths.sort_unstable();
    paths
}

fn sorted<'a>(attributes: &[&'a str]) -> Vec<&'a str> {
    let mut attributes = attributes.to_vec();
    attributes.sort_unstable();
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttributeChange;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_fake_remote_replays_last_reply() {
        let remote = FakeRemote::new();
        remote.reply(Method::Get, "/api/a", 200, "first");
        remote.reply(Method::Get, "api/a", 201, "second");

        let call = |path: &str| HttpCall {
            url: format!("https://x/{}", path),
            request: crate::transport::RemoteRequest::new(Method::Get, path),
            authorization: String::new(),
        };

        assert_eq!(remote.execute(call("api/a")).await.unwrap().body, "first");
        assert_eq!(remote.execute(call("api/a")).await.unwrap().body, "second");
        assert_eq!(remote.execute(call("api/a")).await.unwrap().body, "second");
        assert_eq!(remote.execute(call("api/b")).await.unwrap().status, 404);
        assert_eq!(remote.calls().len(), 4);
        assert_eq!(remote.calls_to(Method::Get, "api/a").len(), 3);

        remote.clear_calls();
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fake_remote_faults_come_first() {
        let remote = FakeRemote::with_version("9.9");
        remote.fail_next(1, NetworkFault::transient("refused"));

        let call = HttpCall {
            url: String::new(),
            request: crate::transport::RemoteRequest::new(Method::Get, VERSION_PATH),
            authorization: String::new(),
        };
        assert!(remote.execute(call.clone()).await.is_err());
        assert_eq!(remote.execute(call).await.unwrap().body, "9.9");
    }

    #[tokio::test]
    async fn test_tester_connect_requires_version() {
        let err = ProviderTester::connect(&FakeRemote::new()).await.err().unwrap();
        assert!(matches!(err, ProviderError::Health(_)));

        let tester = ProviderTester::connect(&FakeRemote::with_version("8.2"))
            .await
            .unwrap();
        assert!(tester
            .resource_types()
            .contains(&"sonarcloud_group".to_string()));
    }

    #[tokio::test]
    async fn test_tester_validate_resource_config() {
        let tester = ProviderTester::connect(&FakeRemote::with_version("9.0"))
            .await
            .unwrap();

        let warnings = assert_ok!(
            tester
                .validate_resource_config("sonarcloud_group", json!({"name": "devs", "colour": "red"}))
                .await
        );
        assert_diagnostic(&warnings, "colour", DiagnosticSeverity::Warning);

        let err = assert_err!(
            tester
                .validate_resource_config("sonarcloud_group", json!({"description": "x"}))
                .await
        );
        assert!(err.to_string().contains("name: Missing required attribute 'name'"));
    }

    #[tokio::test]
    async fn test_tester_lifecycle_crud() {
        let remote = FakeRemote::with_version("9.9");
        remote.reply_json(
            Method::Post,
            "api/user_groups/create",
            200,
            json!({"group": {"id": 7, "name": "devs"}}),
        );
        remote.reply_json(
            Method::Get,
            "api/user_groups/search",
            200,
            json!({"groups": [{"id": 7, "name": "devs", "description": "old"}]}),
        );
        remote.reply_json(
            Method::Get,
            "api/user_groups/search",
            200,
            json!({"groups": [{"id": 7, "name": "devs", "description": "old"}]}),
        );
        remote.reply_json(
            Method::Get,
            "api/user_groups/search",
            200,
            json!({"groups": [{"id": 7, "name": "devs", "description": "new"}]}),
        );
        remote.reply(Method::Post, "api/user_groups/update", 200, "{}");
        remote.reply(Method::Post, "api/user_groups/delete", 204, "");
        let tester = ProviderTester::connect(&remote).await.unwrap();

        let state = tester
            .lifecycle_crud(
                "sonarcloud_group",
                json!({"name": "devs", "description": "old"}),
                json!({"name": "devs", "description": "new"}),
            )
            .await
            .unwrap();

        assert_eq!(state["id"], "7");
        assert_eq!(state["description"], "new");
        let updates = remote.calls_to(Method::Post, "api/user_groups/update");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].request.query_value("id"), Some("7"));
        assert_eq!(updates[0].request.query_value("description"), Some("new"));
        assert_eq!(remote.calls_to(Method::Post, "api/user_groups/delete").len(), 1);
    }

    #[test]
    fn test_plan_assertions() {
        let plan = PlanResult::from_changes(
            json!({}),
            vec![
                AttributeChange::modified("description", json!("a"), json!("b")),
                AttributeChange::modified("email", json!("a@x"), json!("b@x")),
            ],
        );
        assert_plan_updates_in_place(&plan, &["email", "description"]);

        let plan = PlanResult::from_changes(
            json!({}),
            vec![
                AttributeChange::modified("name", json!("a"), json!("b")).replacing(),
                AttributeChange::modified("description", json!("a"), json!("b")),
            ],
        );
        assert_plan_replaces(&plan, &["name"]);
        assert_plan_no_changes(&PlanResult::no_change(json!({})));
    }

    #[test]
    #[should_panic(expected = "Expected an in-place update")]
    fn test_assert_in_place_fails_on_replacement() {
        let plan = PlanResult::from_changes(
            json!({}),
            vec![AttributeChange::modified("name", json!("a"), json!("b")).replacing()],
        );
        assert_plan_updates_in_place(&plan, &["name"]);
    }

    #[test]
    fn test_outcome_assertions() {
        assert_absent(&ReadOutcome::Absent);

        let err = ProviderError::from(PartialFailure {
            applied: vec![SetChange::Remove("scan".to_string())],
            failed_at: SetChange::Add("admin".to_string()),
            source: Box::new(ProviderError::RemoteRejected {
                status: 403,
                body: "forbidden".to_string(),
            }),
        });
        let failure = assert_partial_failure(
            &err,
            &[SetChange::Remove("scan".to_string())],
            &SetChange::Add("admin".to_string()),
        );
        assert_rejected(&failure.source, 403);
    }

    #[test]
    #[should_panic(expected = "Expected a partial set failure")]
    fn test_assert_partial_failure_fails_on_other_errors() {
        let err = ProviderError::NotFound("gone".to_string());
        assert_partial_failure(&err, &[], &SetChange::Add("admin".to_string()));
    }
}
