//! Testing utilities.
//!
//! [`InMemoryBackend`] is a [`SecurityGroupBackend`] holding security groups
//! in memory, and [`ProviderTester`] drives a [`ProviderService`] through
//! whole plan/apply lifecycles.
//!
//! # Example
//!
//! ```
//! use secgroup_rules::testing::{InMemoryBackend, ProviderTester};
//! use secgroup_rules::{SecurityGroupRulesProvider, RESOURCE_TYPE};
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let tester = ProviderTester::new(SecurityGroupRulesProvider::new(InMemoryBackend::new()));
//! tester.provider().backend().add_security_group("web").await;
//!
//! let state = tester
//!     .lifecycle_create(RESOURCE_TYPE, json!({
//!         "security_group": "web",
//!         "ingress": [{"protocol": "TCP", "ports": ["22"], "cidr_list": ["10.0.0.0/8"]}]
//!     }))
//!     .await
//!     .unwrap();
//! assert_eq!(state["ingress"][0]["ids"].as_array().unwrap().len(), 1);
//! # });
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::backend::SecurityGroupBackend;
use crate::config::Endpoint;
use crate::error::{Result, RulesError};
use crate::provider::ProviderService;
use crate::schema::{Diagnostic, ProviderSchema};
use crate::types::{ConcreteRule, Direction, PlanResult, SecurityGroup};

#[derive(Debug, Default)]
struct Groups {
    groups: BTreeMap<String, (Endpoint, SecurityGroup)>,
    next_id: u64,
}

impl Groups {
    /// UUID-shaped IDs, so that stored identifiers look like real ones.
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:08x}-0000-4000-8000-{:012x}", self.next_id, self.next_id)
    }

    fn get(&self, endpoint: &Endpoint, group_id: &str) -> Option<&SecurityGroup> {
        self.groups
            .get(group_id)
            .filter(|(at, _)| at == endpoint)
            .map(|(_, group)| group)
    }

    fn get_mut(&mut self, endpoint: &Endpoint, group_id: &str) -> Result<&mut SecurityGroup> {
        self.groups
            .get_mut(group_id)
            .filter(|(at, _)| at == endpoint)
            .map(|(_, group)| group)
            .ok_or_else(|| {
                RulesError::NotFound(format!("security group {:?} in {}", group_id, endpoint))
            })
    }
}

/// A security group service kept in memory.
///
/// Groups live in one [`Endpoint`] and are invisible from the others. They
/// are found by ID or by case-insensitive name. Rules can be removed behind
/// the provider's back with [`InMemoryBackend::remove_rule`] to simulate
/// drift.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: RwLock<Groups>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a security group to the default endpoint and return its ID.
    pub async fn add_security_group(&self, name: impl Into<String>) -> String {
        self.add_security_group_at(&Endpoint::default(), name).await
    }

    /// Add a security group to `endpoint` and return its ID.
    pub async fn add_security_group_at(
        &self,
        endpoint: &Endpoint,
        name: impl Into<String>,
    ) -> String {
        let mut inner = self.inner.write().await;
        let id = inner.next_id();
        let group = SecurityGroup {
            id: id.clone(),
            name: name.into(),
            rules: Vec::new(),
        };
        inner.groups.insert(id.clone(), (endpoint.clone(), group));
        id
    }

    /// Remove a security group with all its rules.
    pub async fn remove_security_group(&self, group_id: &str) -> bool {
        self.inner.write().await.groups.remove(group_id).is_some()
    }

    /// Remove a single rule out of band.
    pub async fn remove_rule(&self, group_id: &str, rule_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some((_, group)) = inner.groups.get_mut(group_id) else {
            return false;
        };
        let before = group.rules.len();
        group.rules.retain(|r| r.id.as_deref() != Some(rule_id));
        group.rules.len() != before
    }

    /// The rules of a security group; empty if it does not exist.
    pub async fn rules(&self, group_id: &str) -> Vec<ConcreteRule> {
        self.inner
            .read()
            .await
            .groups
            .get(group_id)
            .map(|(_, g)| g.rules.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SecurityGroupBackend for InMemoryBackend {
    async fn find_security_group(
        &self,
        endpoint: &Endpoint,
        name_or_id: &str,
    ) -> Result<SecurityGroup> {
        let inner = self.inner.read().await;
        inner
            .get(endpoint, name_or_id)
            .or_else(|| {
                inner
                    .groups
                    .values()
                    .filter(|(at, _)| at == endpoint)
                    .map(|(_, group)| group)
                    .find(|g| g.name.eq_ignore_ascii_case(name_or_id))
            })
            .cloned()
            .ok_or_else(|| {
                RulesError::NotFound(format!("security group {:?} in {}", name_or_id, endpoint))
            })
    }

    async fn get_security_group(&self, endpoint: &Endpoint, id: &str) -> Result<SecurityGroup> {
        let inner = self.inner.read().await;
        inner
            .get(endpoint, id)
            .cloned()
            .ok_or_else(|| RulesError::NotFound(format!("security group {:?} in {}", id, endpoint)))
    }

    async fn create_rule(
        &self,
        endpoint: &Endpoint,
        group_id: &str,
        direction: Direction,
        rule: &ConcreteRule,
    ) -> Result<ConcreteRule> {
        let mut inner = self.inner.write().await;
        if rule.protocol.is_none() {
            return Err(RulesError::Backend("rule has no protocol".to_string()));
        }
        if let Some(peer) = &rule.security_group_id {
            if inner.get(endpoint, peer).is_none() {
                return Err(RulesError::Backend(format!(
                    "peer security group {:?} does not exist",
                    peer
                )));
            }
        }

        let created = ConcreteRule {
            id: Some(inner.next_id()),
            direction: Some(direction),
            ..rule.clone()
        };
        inner
            .get_mut(endpoint, group_id)?
            .rules
            .push(created.clone());
        Ok(created)
    }

    async fn delete_rule(&self, endpoint: &Endpoint, group_id: &str, rule_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let group = inner.get_mut(endpoint, group_id)?;
        let before = group.rules.len();
        group.rules.retain(|r| r.id.as_deref() != Some(rule_id));
        if group.rules.len() == before {
            return Err(RulesError::NotFound(format!("rule {:?}", rule_id)));
        }
        Ok(())
    }
}

/// Drives a [`ProviderService`] the way an infrastructure tool does.
///
/// The single-call methods forward to the provider. Calls that return
/// diagnostics fail with [`TestError::Diagnostics`] when any of them is an
/// error. The `lifecycle_*` methods chain plan, apply and refresh as `apply`
/// would.
pub struct ProviderTester<P: ProviderService> {
    provider: P,
}

impl<P: ProviderService> ProviderTester<P> {
    /// Wrap `provider`.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// The provider under test.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The provider's schema.
    pub fn schema(&self) -> ProviderSchema {
        self.provider.schema()
    }

    /// Resource types the provider serves.
    pub fn resource_types(&self) -> Vec<String> {
        self.provider.metadata().resources
    }

    /// Validate provider configuration.
    pub async fn validate_provider_config(
        &self,
        config: Value,
    ) -> std::result::Result<(), TestError> {
        errors_only(self.provider.validate_provider_config(config).await?)
    }

    /// Configure the provider.
    pub async fn configure(&self, config: Value) -> std::result::Result<(), TestError> {
        errors_only(self.provider.configure(config).await?)
    }

    /// Stop the provider.
    pub async fn stop(&self) -> Result<()> {
        self.provider.stop().await
    }

    /// Validate a resource configuration.
    pub async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> std::result::Result<(), TestError> {
        errors_only(
            self.provider
                .validate_resource_config(resource_type, config)
                .await?,
        )
    }

    /// Upgrade stored state written at `version`.
    pub async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value> {
        self.provider
            .upgrade_resource_state(resource_type, version, state)
            .await
    }

    /// Plan against no prior state.
    pub async fn plan_create(&self, resource_type: &str, config: Value) -> Result<PlanResult> {
        self.provider.plan(resource_type, None, config).await
    }

    /// Plan `config` against existing state.
    pub async fn plan_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        config: Value,
    ) -> Result<PlanResult> {
        self.provider
            .plan(resource_type, Some(prior_state), config)
            .await
    }

    /// Plan with a `null` configuration, i.e. the resource's removal.
    pub async fn plan_delete(&self, resource_type: &str, prior_state: Value) -> Result<PlanResult> {
        self.provider
            .plan(resource_type, Some(prior_state), Value::Null)
            .await
    }

    /// Create from a planned state.
    pub async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value> {
        self.provider.create(resource_type, planned_state).await
    }

    /// Refresh a state; `null` means the resource is gone.
    pub async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value> {
        self.provider.read(resource_type, current_state).await
    }

    /// Apply a planned state over `prior_state`.
    pub async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value> {
        self.provider
            .update(resource_type, prior_state, planned_state)
            .await
    }

    /// Delete the resource.
    pub async fn delete(&self, resource_type: &str, current_state: Value) -> Result<()> {
        self.provider.delete(resource_type, current_state).await
    }

    /// Plan, create, then refresh. Returns the refreshed state.
    pub async fn lifecycle_create(&self, resource_type: &str, config: Value) -> Result<Value> {
        let plan = self.plan_create(resource_type, config).await?;
        let created = self.create(resource_type, plan.planned_state).await?;
        self.read(resource_type, created).await
    }

    /// Plan, update, then refresh. Returns the refreshed state.
    pub async fn lifecycle_update(
        &self,
        resource_type: &str,
        prior_state: Value,
        config: Value,
    ) -> Result<Value> {
        let plan = self
            .plan_update(resource_type, prior_state.clone(), config)
            .await?;
        let updated = self
            .update(resource_type, prior_state, plan.planned_state)
            .await?;
        self.read(resource_type, updated).await
    }

    /// Plan the removal, then delete.
    pub async fn lifecycle_delete(&self, resource_type: &str, current_state: Value) -> Result<()> {
        self.plan_delete(resource_type, current_state.clone()).await?;
        self.delete(resource_type, current_state).await
    }

    /// Create, update, then delete; returns the state after the update.
    pub async fn lifecycle_crud(
        &self,
        resource_type: &str,
        initial_config: Value,
        updated_config: Value,
    ) -> Result<Value> {
        let created = self.lifecycle_create(resource_type, initial_config).await?;
        let updated = self
            .lifecycle_update(resource_type, created, updated_config)
            .await?;
        self.lifecycle_delete(resource_type, updated.clone()).await?;
        Ok(updated)
    }
}

/// Failure of a [`ProviderTester`] call.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// Error diagnostics were reported; warnings are dropped.
    #[error("{} error diagnostic(s):\n{}", .0.len(), render(.0))]
    Diagnostics(Vec<Diagnostic>),
    /// The provider call itself failed.
    #[error("provider call failed: {0}")]
    Provider(#[from] RulesError),
}

fn render(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| {
            let mut line = format!("  {}", d.summary);
            if let Some(detail) = &d.detail {
                line.push_str(&format!(": {}", detail));
            }
            if let Some(path) = &d.attribute {
                line.push_str(&format!(" [{}]", path));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn errors_only(diagnostics: Vec<Diagnostic>) -> std::result::Result<(), TestError> {
    let errors: Vec<_> = diagnostics.into_iter().filter(Diagnostic::is_error).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TestError::Diagnostics(errors))
    }
}

fn changed_paths(plan: &PlanResult) -> Vec<&str> {
    plan.changes.iter().map(|c| c.path.as_str()).collect()
}

fn error_summaries(diagnostics: &[Diagnostic]) -> Vec<&str> {
    diagnostics
        .iter()
        .filter(|d| d.is_error())
        .map(|d| d.summary.as_str())
        .collect()
}

/// Panics unless `plan` is empty.
pub fn assert_plan_no_changes(plan: &PlanResult) {
    assert!(
        plan.changes.is_empty(),
        "plan is not empty, it changes {:?}",
        changed_paths(plan)
    );
}

/// Panics unless `plan` replaces the resource.
pub fn assert_plan_replaces(plan: &PlanResult) {
    assert!(
        plan.requires_replace,
        "plan updates in place, it changes {:?}",
        changed_paths(plan)
    );
}

/// Panics unless `plan` changes the attribute at `path`.
pub fn assert_plan_changes_attribute(plan: &PlanResult, path: &str) {
    assert!(
        plan.changes.iter().any(|c| c.path == path),
        "plan leaves {:?} alone, it changes {:?}",
        path,
        changed_paths(plan)
    );
}

/// Panics if any diagnostic is an error. Warnings are fine.
pub fn assert_no_errors(diagnostics: &[Diagnostic]) {
    let errors = error_summaries(diagnostics);
    assert!(errors.is_empty(), "unexpected error diagnostics: {:?}", errors);
}

/// Panics unless some error diagnostic's summary contains `substring`.
pub fn assert_error_contains(diagnostics: &[Diagnostic], substring: &str) {
    let errors = error_summaries(diagnostics);
    assert!(
        errors.iter().any(|summary| summary.contains(substring)),
        "no error diagnostic mentions {:?}, errors: {:?}",
        substring,
        errors
    );
}
