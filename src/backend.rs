//! The backing security group service.
//!
//! Rule CRUD and peer group resolution are supplied by a cloud API client.
//! This crate only talks to it through [`SecurityGroupBackend`]. Every call
//! is addressed to an [`Endpoint`] built from the provider configuration.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Endpoint;
use crate::error::Result;
use crate::types::{ConcreteRule, Direction, SecurityGroup};

/// Operations the backing service must provide.
///
/// Implementations return [`RulesError::NotFound`](crate::RulesError::NotFound)
/// when a security group does not exist; callers rely on that variant to tell
/// a vanished group apart from other failures. Groups outside `endpoint`
/// must not be visible.
#[async_trait]
pub trait SecurityGroupBackend: Send + Sync {
    /// Find a security group by ID or by name.
    async fn find_security_group(
        &self,
        endpoint: &Endpoint,
        name_or_id: &str,
    ) -> Result<SecurityGroup>;

    /// Fetch a security group, including all of its rules, by ID.
    async fn get_security_group(&self, endpoint: &Endpoint, id: &str) -> Result<SecurityGroup>;

    /// Create a rule in a security group and return it as stored.
    async fn create_rule(
        &self,
        endpoint: &Endpoint,
        group_id: &str,
        direction: Direction,
        rule: &ConcreteRule,
    ) -> Result<ConcreteRule>;

    /// Delete a rule from a security group.
    async fn delete_rule(&self, endpoint: &Endpoint, group_id: &str, rule_id: &str) -> Result<()>;
}

#[async_trait]
impl<B: SecurityGroupBackend + ?Sized> SecurityGroupBackend for Arc<B> {
    async fn find_security_group(
        &self,
        endpoint: &Endpoint,
        name_or_id: &str,
    ) -> Result<SecurityGroup> {
        (**self).find_security_group(endpoint, name_or_id).await
    }

    async fn get_security_group(&self, endpoint: &Endpoint, id: &str) -> Result<SecurityGroup> {
        (**self).get_security_group(endpoint, id).await
    }

    async fn create_rule(
        &self,
        endpoint: &Endpoint,
        group_id: &str,
        direction: Direction,
        rule: &ConcreteRule,
    ) -> Result<ConcreteRule> {
        (**self).create_rule(endpoint, group_id, direction, rule).await
    }

    async fn delete_rule(&self, endpoint: &Endpoint, group_id: &str, rule_id: &str) -> Result<()> {
        (**self).delete_rule(endpoint, group_id, rule_id).await
    }
}
