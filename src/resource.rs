//! The `exoscale_security_group_rules` resource lifecycle.
//!
//! Each operation works on a typed [`ResourceState`] and is bounded by the
//! configured timeout. Rules are created and deleted one by one through the
//! [`SecurityGroupBackend`]; the set of composite identifiers recorded in each
//! template's `ids` is what ties the declarative state to the live rules.

use std::future::Future;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::backend::SecurityGroupBackend;
use crate::config::{Endpoint, ProviderConfig};
use crate::error::{Result, RulesError};
use crate::expand::expand;
use crate::identity::{identify, RuleIndex};
use crate::reconcile::{reconcile, rules_to_remove};
use crate::state::{attr, RawRuleTemplate, ResourceState};
use crate::types::{AttributeChange, Direction, PlanResult, RuleTemplate, SecurityGroup};

/// Resource type name.
pub const RESOURCE_TYPE: &str = "exoscale_security_group_rules";

/// Manages the rules of one security group from a set of rule templates.
#[derive(Debug, Clone)]
pub struct SecurityGroupRulesResource<B> {
    backend: B,
    config: ProviderConfig,
    endpoint: Endpoint,
}

impl<B: SecurityGroupBackend> SecurityGroupRulesResource<B> {
    /// Create a resource handler over a backend.
    pub fn new(backend: B, config: ProviderConfig) -> Self {
        let endpoint = config.endpoint();
        Self {
            backend,
            config,
            endpoint,
        }
    }

    /// The backing service.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The configuration operations run with.
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Where backend requests are sent, from the configured environment and zone.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RulesError::DeadlineExceeded(format!(
                "{} did not complete within {}s",
                operation,
                timeout.as_secs()
            ))),
        }
    }

    /// Create every rule declared by `planned` and return the refreshed state.
    #[instrument(skip_all, name = "security_group_rules.create")]
    pub async fn create(&self, planned: ResourceState) -> Result<ResourceState> {
        self.bounded("create", self.create_inner(planned)).await
    }

    async fn create_inner(&self, mut state: ResourceState) -> Result<ResourceState> {
        debug!(id = %state.id, "beginning create");

        let reference = state.security_group_ref()?.to_string();
        let group = self
            .backend
            .find_security_group(&self.endpoint, &reference)
            .await?;
        state.security_group_id = Some(group.id.clone());
        state.security_group = Some(group.name.clone());

        normalize_peers(&mut state);
        for direction in Direction::BOTH {
            for template in state.templates_mut(direction).iter_mut() {
                template.ids.clear();
                self.create_rules(&group.id, direction, template).await?;
            }
        }

        state.id = rand::random::<u64>().to_string();
        debug!(id = %state.id, "create finished successfully");

        self.read_inner(state).await
    }

    /// Refresh `state` from the backing service.
    ///
    /// When the security group no longer exists the returned state has an
    /// empty ID, meaning the resource is gone.
    #[instrument(skip_all, name = "security_group_rules.read", fields(id = %state.id))]
    pub async fn read(&self, state: ResourceState) -> Result<ResourceState> {
        self.bounded("read", self.read_inner(state)).await
    }

    async fn read_inner(&self, mut state: ResourceState) -> Result<ResourceState> {
        debug!(id = %state.id, "beginning read");

        let Some(group) = self.fetch_group(&state).await? else {
            warn!(id = %state.id, "security group not found, clearing resource from state");
            return Ok(gone(state));
        };
        state.security_group_id = Some(group.id.clone());
        state.security_group = Some(group.name.clone());

        let tracked = Direction::BOTH
            .into_iter()
            .flat_map(|direction| state.templates(direction))
            .flat_map(|template| &template.ids)
            .cloned()
            .collect::<Vec<_>>();
        let index =
            RuleIndex::build(&group.rules, &self.backend, &self.endpoint, &tracked).await?;
        for direction in Direction::BOTH {
            for template in state.templates_mut(direction).iter_mut() {
                *template = reconcile(template, index.rules(), |id| index.group_name(id))?;
            }
        }

        debug!(id = %state.id, "read finished successfully");
        Ok(state)
    }

    /// Apply the difference between `prior` and `planned`.
    ///
    /// Templates that disappeared are deleted, new or modified ones are
    /// created; unchanged templates keep their identifiers.
    #[instrument(skip_all, name = "security_group_rules.update", fields(id = %prior.id))]
    pub async fn update(
        &self,
        prior: ResourceState,
        planned: ResourceState,
    ) -> Result<ResourceState> {
        self.bounded("update", self.update_inner(prior, planned)).await
    }

    async fn update_inner(
        &self,
        prior: ResourceState,
        mut state: ResourceState,
    ) -> Result<ResourceState> {
        debug!(id = %prior.id, "beginning update");

        let Some(group) = self.fetch_group(&prior).await? else {
            warn!(id = %prior.id, "security group not found, clearing resource from state");
            return Ok(gone(state));
        };
        state.id = prior.id.clone();
        state.security_group_id = Some(group.id.clone());
        state.security_group = Some(group.name.clone());

        normalize_peers(&mut state);
        for direction in Direction::BOTH {
            let old = prior.templates(direction);

            let removed: Vec<&RuleTemplate> = old
                .iter()
                .filter(|o| !state.templates(direction).iter().any(|n| n.same_declaration(o)))
                .collect();
            for template in removed {
                self.delete_rules(&group.id, template).await?;
            }

            for template in state.templates_mut(direction).iter_mut() {
                match old.iter().find(|o| o.same_declaration(template)) {
                    Some(unchanged) => template.ids = unchanged.ids.clone(),
                    None => {
                        template.ids.clear();
                        self.create_rules(&group.id, direction, template).await?;
                    }
                }
            }
        }

        debug!(id = %state.id, "update finished successfully");
        self.read_inner(state).await
    }

    /// Delete every rule tracked by `state`.
    ///
    /// A security group that no longer exists is not an error.
    #[instrument(skip_all, name = "security_group_rules.delete", fields(id = %state.id))]
    pub async fn delete(&self, state: ResourceState) -> Result<()> {
        self.bounded("delete", self.delete_inner(state)).await
    }

    async fn delete_inner(&self, state: ResourceState) -> Result<()> {
        debug!(id = %state.id, "beginning delete");

        let Some(group) = self.fetch_group(&state).await? else {
            debug!(id = %state.id, "security group already gone");
            return Ok(());
        };

        for direction in Direction::BOTH {
            for template in state.templates(direction) {
                self.delete_rules(&group.id, template).await?;
            }
        }

        debug!(id = %state.id, "delete finished successfully");
        Ok(())
    }

    /// Compute the changes between `prior` state and the `proposed` configuration.
    ///
    /// Computed attributes and the `ids` of unchanged templates are carried
    /// forward. Changing the security group forces replacement.
    pub fn plan(
        &self,
        prior: Option<ResourceState>,
        proposed: ResourceState,
    ) -> Result<PlanResult> {
        let mut planned = proposed;
        normalize_peers(&mut planned);

        let Some(prior) = prior.filter(|p| !p.is_gone()) else {
            planned.id.clear();
            let mut changes = Vec::new();
            if let Some(id) = &planned.security_group_id {
                changes.push(AttributeChange::added(
                    attr::SECURITY_GROUP_ID,
                    Value::from(id.as_str()),
                ));
            }
            if let Some(name) = &planned.security_group {
                changes.push(AttributeChange::added(
                    attr::SECURITY_GROUP,
                    Value::from(name.as_str()),
                ));
            }
            for direction in Direction::BOTH {
                let templates = planned.templates_mut(direction);
                templates.iter_mut().for_each(|t| t.ids.clear());
                if !templates.is_empty() {
                    changes.push(AttributeChange::added(
                        direction.as_str(),
                        templates_value(templates)?,
                    ));
                }
            }
            return Ok(PlanResult::with_changes(planned.to_value()?, changes, false));
        };

        planned.id = prior.id.clone();
        let mut changes = Vec::new();
        let mut requires_replace = plan_force_new(
            attr::SECURITY_GROUP_ID,
            &prior.security_group_id,
            &mut planned.security_group_id,
            &mut changes,
        );
        requires_replace |= plan_force_new(
            attr::SECURITY_GROUP,
            &prior.security_group,
            &mut planned.security_group,
            &mut changes,
        );

        for direction in Direction::BOTH {
            let old = prior.templates(direction);
            let new = planned.templates_mut(direction);
            for template in new.iter_mut() {
                template.ids = old
                    .iter()
                    .find(|o| o.same_declaration(template))
                    .map(|o| o.ids.clone())
                    .unwrap_or_default();
            }
            if !same_templates(old, new) {
                changes.push(AttributeChange::modified(
                    direction.as_str(),
                    templates_value(old)?,
                    templates_value(new)?,
                ));
            }
        }

        let planned_state = planned.to_value()?;
        if changes.is_empty() {
            Ok(PlanResult::no_change(planned_state))
        } else {
            Ok(PlanResult::with_changes(planned_state, changes, requires_replace))
        }
    }

    /// The security group a state refers to, or `None` if it is gone.
    async fn fetch_group(&self, state: &ResourceState) -> Result<Option<SecurityGroup>> {
        let lookup = match &state.security_group_id {
            Some(id) => self.backend.get_security_group(&self.endpoint, id).await,
            None => {
                let reference = state.security_group_ref()?;
                self.backend
                    .find_security_group(&self.endpoint, reference)
                    .await
            }
        };
        match lookup {
            Ok(group) => Ok(Some(group)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_rules(
        &self,
        group_id: &str,
        direction: Direction,
        template: &mut RuleTemplate,
    ) -> Result<()> {
        for rule in expand(template, direction, &self.backend, &self.endpoint).await? {
            let created = self
                .backend
                .create_rule(&self.endpoint, group_id, direction, &rule)
                .await?;
            let id = identify(&created, &self.backend, &self.endpoint).await?;
            debug!(rule_id = %id, %direction, "created security group rule");
            template.ids.insert(id);
        }
        Ok(())
    }

    async fn delete_rules(&self, group_id: &str, template: &RuleTemplate) -> Result<()> {
        for (identifier, rule) in rules_to_remove(template) {
            let Some(rule_id) = rule.id else {
                continue;
            };
            self.backend
                .delete_rule(&self.endpoint, group_id, &rule_id)
                .await?;
            debug!(rule_id = %identifier, "deleted security group rule");
        }
        Ok(())
    }
}

fn gone(mut state: ResourceState) -> ResourceState {
    state.id.clear();
    state
}

/// Peer group names are tracked lower-cased, as the backing service reports them.
fn normalize_peers(state: &mut ResourceState) {
    for direction in Direction::BOTH {
        for template in state.templates_mut(direction).iter_mut() {
            template.user_security_group_list = template
                .user_security_group_list
                .iter()
                .map(|name| name.to_lowercase())
                .collect();
        }
    }
}

fn plan_force_new(
    path: &str,
    before: &Option<String>,
    after: &mut Option<String>,
    changes: &mut Vec<AttributeChange>,
) -> bool {
    // Unset in configuration: keep the computed value.
    if after.is_none() {
        *after = before.clone();
        return false;
    }
    if after == before {
        return false;
    }
    changes.push(AttributeChange::new(
        path,
        before.as_deref().map(Value::from),
        after.as_deref().map(Value::from),
    ));
    true
}

fn same_templates(a: &[RuleTemplate], b: &[RuleTemplate]) -> bool {
    a.len() == b.len()
        && a.iter().all(|x| b.iter().any(|y| x.same_declaration(y)))
        && b.iter().all(|y| a.iter().any(|x| x.same_declaration(y)))
}

fn templates_value(templates: &[RuleTemplate]) -> Result<Value> {
    let raw: Vec<RawRuleTemplate> = templates.iter().map(RawRuleTemplate::from).collect();
    Ok(serde_json::to_value(raw)?)
}
