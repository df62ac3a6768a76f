//! Security Group Rules
//!
//! This crate manages the `exoscale_security_group_rules` resource: a set of
//! declarative rule templates attached to one security group, expanded into
//! the individual rules a cloud security group service stores, and kept in
//! sync with them.
//!
//! # Overview
//!
//! - **Rule templates** ([`RuleTemplate`]): protocol, ports, CIDR and
//!   security group peers, as declared by the user
//! - **Expansion** ([`mod@expand`]): the cross product of peers and port ranges
//! - **Identity** ([`identity`]): stable composite identifiers tying each
//!   live rule to the template it came from
//! - **Reconciliation** ([`mod@reconcile`]): rebuilding templates from live rules
//!   so drift shows up in the next plan
//! - **State migrations** ([`migrate`]): upgrading identifiers stored by
//!   older schema versions
//! - **Provider surface** ([`ProviderService`]): schema, validation, plan and
//!   create/read/update/delete over JSON state
//!
//! The backing service is reached only through [`SecurityGroupBackend`].
//!
//! # Quick Start
//!
//! ```ignore
//! use secgroup_rules::{init_logging, ProviderService, SecurityGroupRulesProvider, RESOURCE_TYPE};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging();
//!
//!     let provider = SecurityGroupRulesProvider::new(MyCloudClient::new());
//!     provider.configure(json!({"zone": "ch-gva-2"})).await?;
//!
//!     let config = json!({
//!         "security_group": "web",
//!         "ingress": [{
//!             "protocol": "TCP",
//!             "ports": ["80", "443"],
//!             "cidr_list": ["0.0.0.0/0", "::/0"]
//!         }]
//!     });
//!     let plan = provider.plan(RESOURCE_TYPE, None, config).await?;
//!     let state = provider.create(RESOURCE_TYPE, plan.planned_state).await?;
//!     tracing::info!(%state, "rules created");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod error;
pub mod expand;
pub mod identity;
pub mod logging;
pub mod migrate;
pub mod provider;
pub mod reconcile;
pub mod resource;
pub mod schema;
pub mod state;
pub mod testing;
pub mod types;
pub mod validation;

// Re-export main types at crate root
pub use backend::SecurityGroupBackend;
pub use config::{Endpoint, ProviderConfig};
pub use error::{Result, RulesError};
pub use expand::{expand, expand_with};
pub use identity::{format_identifier, identify, RuleIndex};
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use migrate::{upgrade_state, SCHEMA_VERSION};
pub use provider::{ProviderService, SecurityGroupRulesProvider};
pub use reconcile::{reconcile, rules_to_remove};
pub use resource::{SecurityGroupRulesResource, RESOURCE_TYPE};
pub use schema::ProviderSchema;
pub use state::ResourceState;
pub use types::{
    AttributeChange, ConcreteRule, Direction, PlanResult, PortRange, Protocol, ProviderMetadata,
    RuleTemplate, SecurityGroup,
};
pub use validation::{is_valid, validate, validate_result};

// Re-export async_trait for backend implementations
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tracing;
