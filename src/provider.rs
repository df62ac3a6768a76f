//! The provider service surface.
//!
//! [`ProviderService`] is the JSON-in, JSON-out API an infrastructure tool
//! drives: schema discovery, configuration, validation, state upgrades and
//! the plan/create/read/update/delete lifecycle.
//! [`SecurityGroupRulesProvider`] implements it for the
//! `exoscale_security_group_rules` resource.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};

use crate::backend::SecurityGroupBackend;
use crate::config::ProviderConfig;
use crate::error::{Result, RulesError};
use crate::migrate::upgrade_state;
use crate::resource::{SecurityGroupRulesResource, RESOURCE_TYPE};
use crate::schema::{provider_schema, Diagnostic, ProviderSchema};
use crate::state::{attr, ResourceState};
use crate::types::{AttributeChange, PlanResult, ProviderMetadata};
use crate::validation;

/// Operations a provider exposes to the tool driving it.
///
/// Values are JSON objects shaped by the schema returned from
/// [`ProviderService::schema`].
#[async_trait::async_trait]
pub trait ProviderService: Send + Sync + 'static {
    /// Return the provider's schema including all resources.
    fn schema(&self) -> ProviderSchema;

    /// Return provider metadata. By default, this is derived from the schema.
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            resources: self.schema().resources.keys().cloned().collect(),
        }
    }

    /// Validate the provider configuration before configuring.
    async fn validate_provider_config(&self, config: Value) -> Result<Vec<Diagnostic>> {
        Ok(validation::validate(&self.schema().provider, &config))
    }

    /// Configure the provider. Returns diagnostics (errors and warnings).
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>>;

    /// Stop the provider gracefully.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Validate a resource's configuration before planning.
    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>> {
        let schema = self.schema();
        let resource = schema
            .resources
            .get(resource_type)
            .ok_or_else(|| RulesError::UnknownResource(resource_type.to_string()))?;
        Ok(validation::validate(resource, &config))
    }

    /// Upgrade resource state from an older schema version.
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value> {
        let _ = (resource_type, version);
        Ok(state)
    }

    /// Plan changes for a resource. A `null` proposed state plans its deletion.
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
    ) -> Result<PlanResult>;

    /// Create a new resource.
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value>;

    /// Read the current state of a resource; `null` means it no longer exists.
    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value>;

    /// Update an existing resource.
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value>;

    /// Delete a resource.
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<()>;
}

/// Provider serving `exoscale_security_group_rules` over a backing service.
pub struct SecurityGroupRulesProvider<B> {
    backend: Arc<B>,
    config: RwLock<ProviderConfig>,
}

impl<B: SecurityGroupBackend + 'static> SecurityGroupRulesProvider<B> {
    /// Create a provider with the default configuration.
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            config: RwLock::new(ProviderConfig::default()),
        }
    }

    /// Replace the initial configuration.
    pub fn with_config(self, config: ProviderConfig) -> Self {
        Self {
            config: RwLock::new(config),
            ..self
        }
    }

    /// The backing service.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// A snapshot of the current configuration.
    pub async fn config(&self) -> ProviderConfig {
        self.config.read().await.clone()
    }

    async fn resource(&self, resource_type: &str) -> Result<SecurityGroupRulesResource<Arc<B>>> {
        if resource_type != RESOURCE_TYPE {
            return Err(RulesError::UnknownResource(resource_type.to_string()));
        }
        Ok(SecurityGroupRulesResource::new(
            Arc::clone(&self.backend),
            self.config().await,
        ))
    }
}

fn rendered(state: ResourceState) -> Result<Value> {
    if state.is_gone() {
        Ok(Value::Null)
    } else {
        state.to_value()
    }
}

#[async_trait::async_trait]
impl<B: SecurityGroupBackend + 'static> ProviderService for SecurityGroupRulesProvider<B> {
    fn schema(&self) -> ProviderSchema {
        provider_schema()
    }

    #[instrument(skip_all, name = "provider.configure")]
    async fn configure(&self, config: Value) -> Result<Vec<Diagnostic>> {
        let parsed = ProviderConfig::from_value(config).and_then(|c| c.with_env_overrides());
        match parsed {
            Ok(parsed) => {
                info!(endpoint = %parsed.endpoint(), "provider configured");
                *self.config.write().await = parsed;
                Ok(vec![])
            }
            Err(e) => {
                error!(error = %e, "invalid provider configuration");
                Ok(vec![Diagnostic::error(e.to_string())])
            }
        }
    }

    async fn validate_resource_config(
        &self,
        resource_type: &str,
        config: Value,
    ) -> Result<Vec<Diagnostic>> {
        let schema = self.schema();
        let resource = schema
            .resources
            .get(resource_type)
            .ok_or_else(|| RulesError::UnknownResource(resource_type.to_string()))?;

        let mut diagnostics = validation::validate(resource, &config);
        diagnostics.extend(validation::validate_rule_templates(&config));
        Ok(diagnostics)
    }

    #[instrument(skip(self, state), name = "provider.upgrade_resource_state")]
    async fn upgrade_resource_state(
        &self,
        resource_type: &str,
        version: i64,
        state: Value,
    ) -> Result<Value> {
        if resource_type != RESOURCE_TYPE {
            return Err(RulesError::UnknownResource(resource_type.to_string()));
        }
        upgrade_state(version, state)
    }

    #[instrument(skip(self, prior_state, proposed_state), name = "provider.plan")]
    async fn plan(
        &self,
        resource_type: &str,
        prior_state: Option<Value>,
        proposed_state: Value,
    ) -> Result<PlanResult> {
        let resource = self.resource(resource_type).await?;
        let prior = prior_state
            .filter(|v| !v.is_null())
            .map(ResourceState::from_value)
            .transpose()?;

        if proposed_state.is_null() {
            let id = prior.map(|p| p.id).unwrap_or_default();
            debug!(%id, "planning deletion");
            return Ok(PlanResult::with_changes(
                Value::Null,
                vec![AttributeChange::removed(attr::ID, Value::from(id))],
                false,
            ));
        }

        let result = resource.plan(prior, ResourceState::from_value(proposed_state)?)?;
        info!(
            changes = result.changes.len(),
            requires_replace = result.requires_replace,
            "plan completed"
        );
        Ok(result)
    }

    #[instrument(skip(self, planned_state), name = "provider.create")]
    async fn create(&self, resource_type: &str, planned_state: Value) -> Result<Value> {
        let resource = self.resource(resource_type).await?;
        let state = resource
            .create(ResourceState::from_value(planned_state)?)
            .await
            .inspect_err(|e| error!(error = %e, "create failed"))?;
        info!(id = %state.id, "create completed successfully");
        rendered(state)
    }

    #[instrument(skip(self, current_state), name = "provider.read")]
    async fn read(&self, resource_type: &str, current_state: Value) -> Result<Value> {
        let resource = self.resource(resource_type).await?;
        let state = resource
            .read(ResourceState::from_value(current_state)?)
            .await
            .inspect_err(|e| error!(error = %e, "read failed"))?;
        rendered(state)
    }

    #[instrument(skip(self, prior_state, planned_state), name = "provider.update")]
    async fn update(
        &self,
        resource_type: &str,
        prior_state: Value,
        planned_state: Value,
    ) -> Result<Value> {
        let resource = self.resource(resource_type).await?;
        let state = resource
            .update(
                ResourceState::from_value(prior_state)?,
                ResourceState::from_value(planned_state)?,
            )
            .await
            .inspect_err(|e| error!(error = %e, "update failed"))?;
        info!(id = %state.id, "update completed successfully");
        rendered(state)
    }

    #[instrument(skip(self, current_state), name = "provider.delete")]
    async fn delete(&self, resource_type: &str, current_state: Value) -> Result<()> {
        let resource = self.resource(resource_type).await?;
        resource
            .delete(ResourceState::from_value(current_state)?)
            .await
            .inspect_err(|e| error!(error = %e, "delete failed"))?;
        info!("delete completed successfully");
        Ok(())
    }
}
