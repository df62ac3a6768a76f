//! Schema types describing the provider configuration and its resource.
//!
//! Schemas drive configuration validation (see [`crate::validation`]) and
//! document every attribute of `exoscale_security_group_rules`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::migrate::SCHEMA_VERSION;
use crate::resource::RESOURCE_TYPE;
use crate::state::attr;
use crate::types::Protocol;

/// Value type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// UTF-8 text.
    String,
    /// Whole number; JSON floats without a fractional part are accepted.
    Int64,
    /// Unordered collection of distinct elements.
    Set(Box<AttributeType>),
}

impl AttributeType {
    /// `Set` of `element_type`.
    pub fn set(element_type: AttributeType) -> Self {
        Self::Set(Box::new(element_type))
    }
}

/// A constraint on the value of an attribute (or on each element of a set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Validator {
    /// An IPv4 or IPv6 network in CIDR notation.
    CidrNetwork,
    /// An integer within `min..=max`.
    IntBetween {
        /// Lowest accepted value.
        min: i64,
        /// Highest accepted value.
        max: i64,
    },
    /// A port (`N`) or port range (`START-END`).
    PortRange,
    /// One of a fixed list of strings.
    OneOf {
        /// Accepted values.
        values: Vec<String>,
        /// Whether the comparison ignores case.
        ignore_case: bool,
    },
}

/// Who sets an attribute: the user, the provider, or either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// May be set in configuration.
    pub optional: bool,
    /// Filled in by the provider.
    pub computed: bool,
}

impl AttributeFlags {
    /// User-settable only.
    pub fn optional() -> Self {
        Self {
            optional: true,
            computed: false,
        }
    }

    /// Provider-set only; configuration values are ignored.
    pub fn computed() -> Self {
        Self {
            optional: false,
            computed: true,
        }
    }

    /// User-settable, filled in by the provider when left out.
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
        }
    }
}

/// One attribute of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Value type.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Who sets the attribute.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Documentation shown to users.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// A change of value replaces the resource instead of updating it.
    #[serde(default)]
    pub force_new: bool,
    /// Value assumed when the attribute is left out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Sibling attributes that may not be set together with this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<String>,
    /// Constraints on the value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Validator>,
}

impl Attribute {
    /// Bare attribute of `attr_type`.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
            force_new: false,
            default: None,
            conflicts_with: Vec::new(),
            validators: Vec::new(),
        }
    }

    /// Optional string.
    pub fn optional_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::optional())
    }

    /// Optional integer.
    pub fn optional_int64() -> Self {
        Self::new(AttributeType::Int64, AttributeFlags::optional())
    }

    /// Optional set of strings.
    pub fn optional_string_set() -> Self {
        Self::new(
            AttributeType::set(AttributeType::String),
            AttributeFlags::optional(),
        )
    }

    /// Set the user-facing documentation.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Replace the resource whenever this attribute changes.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Value used when the attribute is left out.
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Let the provider fill the attribute in as well.
    pub fn computed(mut self) -> Self {
        self.flags.computed = true;
        self
    }

    /// Reject configurations setting both this attribute and `other`.
    pub fn with_conflict(mut self, other: impl Into<String>) -> Self {
        self.conflicts_with.push(other.into());
        self
    }

    /// Add a value constraint.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }
}

/// Attributes plus repeatable nested blocks.
///
/// Each nested block holds any number of entries and is compared as an
/// unordered set, like the `ingress` and `egress` rule blocks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    /// Attributes keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Attribute>,
    /// Nested set blocks keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blocks: BTreeMap<String, Block>,
    /// Documentation shown to users.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Block {
    /// Empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    /// Nest a repeatable block under `name`.
    pub fn with_block(mut self, name: impl Into<String>, block: Block) -> Self {
        self.blocks.insert(name.into(), block);
        self
    }

    /// Set the user-facing documentation.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A versioned root block.
///
/// The version is what stored state is upgraded from, see
/// [`crate::migrate::upgrade_state`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Version of the stored state layout.
    #[serde(default)]
    pub version: i64,
    /// Root attributes and blocks.
    #[serde(flatten)]
    pub block: Block,
}

impl Schema {
    /// Empty schema at `version`.
    pub fn new(version: i64) -> Self {
        Self {
            version,
            block: Block::new(),
        }
    }

    /// Add a root attribute.
    pub fn with_attribute(self, name: impl Into<String>, attr: Attribute) -> Self {
        Self {
            block: self.block.with_attribute(name, attr),
            ..self
        }
    }

    /// Nest a repeatable block at the root.
    pub fn with_block(self, name: impl Into<String>, block: Block) -> Self {
        Self {
            block: self.block.with_block(name, block),
            ..self
        }
    }

    /// Document the whole schema.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        Self {
            block: self.block.with_description(description),
            ..self
        }
    }
}

/// Schemas of the provider configuration and of every resource it serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderSchema {
    /// Provider configuration.
    #[serde(default)]
    pub provider: Schema,
    /// Resource schemas keyed by resource type.
    #[serde(default)]
    pub resources: BTreeMap<String, Schema>,
}

impl ProviderSchema {
    /// Provider schema with no resources yet.
    pub fn new(provider: Schema) -> Self {
        Self {
            provider,
            resources: BTreeMap::new(),
        }
    }

    /// Register the schema of `resource_type`.
    pub fn with_resource(mut self, resource_type: impl Into<String>, schema: Schema) -> Self {
        self.resources.insert(resource_type.into(), schema);
        self
    }
}

/// How serious a [`Diagnostic`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// The configuration cannot be applied.
    Error,
    /// The configuration applies, but part of it has no effect.
    Warning,
}

/// A finding about a configuration, optionally tied to an attribute path
/// such as `ingress.0.ports`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Error or warning.
    pub severity: DiagnosticSeverity,
    /// One-line description.
    pub summary: String,
    /// Longer explanation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Dotted path of the offending attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    fn with_severity(severity: DiagnosticSeverity, summary: impl Into<String>) -> Self {
        Self {
            severity,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Error finding.
    pub fn error(summary: impl Into<String>) -> Self {
        Self::with_severity(DiagnosticSeverity::Error, summary)
    }

    /// Warning finding.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self::with_severity(DiagnosticSeverity::Warning, summary)
    }

    /// Add a longer explanation.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Tie the finding to an attribute path.
    pub fn with_attribute(mut self, path: impl Into<String>) -> Self {
        self.attribute = Some(path.into());
        self
    }

    /// Whether the finding blocks the operation.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

fn rule_block() -> Block {
    Block::new()
        .with_description("A security group rule definition (can be specified multiple times).")
        .with_attribute(
            attr::CIDR_LIST,
            Attribute::optional_string_set()
                .with_validator(Validator::CidrNetwork)
                .with_description(
                    "A list of (`INGRESS`) source / (`EGRESS`) destination IP subnet \
                     (in CIDR notation) to match.",
                ),
        )
        .with_attribute(
            attr::DESCRIPTION,
            Attribute::optional_string().with_description("A free-form text describing the block."),
        )
        .with_attribute(
            attr::ICMP_CODE,
            Attribute::optional_int64()
                .with_validator(Validator::IntBetween { min: 0, max: 255 })
                .with_description("An ICMP/ICMPv6 type/code to match."),
        )
        .with_attribute(
            attr::ICMP_TYPE,
            Attribute::optional_int64()
                .with_validator(Validator::IntBetween { min: 0, max: 255 })
                .with_description("An ICMP/ICMPv6 type/code to match."),
        )
        .with_attribute(
            attr::PORTS,
            Attribute::optional_string_set()
                .with_validator(Validator::PortRange)
                .with_description("A list of ports or port ranges (`<start_port>-<end_port>`)."),
        )
        .with_attribute(
            attr::PROTOCOL,
            Attribute::optional_string()
                .with_default(serde_json::json!(Protocol::Tcp.state_name()))
                .with_validator(Validator::OneOf {
                    values: Protocol::ALL_NAMES.iter().map(|p| p.to_string()).collect(),
                    ignore_case: true,
                })
                .with_description(
                    "The network protocol to match (`TCP`, `UDP`, `ICMP`, `ICMPv6`, \
                     `AH`, `ESP`, `GRE`, `IPIP` or `ALL`).",
                ),
        )
        .with_attribute(
            attr::USER_SECURITY_GROUP_LIST,
            Attribute::optional_string_set().with_description(
                "A list of source (for ingress)/destination (for egress) identified \
                 by a security group.",
            ),
        )
        .with_attribute(
            attr::IDS,
            Attribute::new(
                AttributeType::set(AttributeType::String),
                AttributeFlags::computed(),
            ),
        )
}

/// Schema of the `exoscale_security_group_rules` resource.
pub fn security_group_rules_schema() -> Schema {
    Schema::new(SCHEMA_VERSION)
        .with_description("Manage Exoscale Security Group Rules.")
        .with_attribute(
            attr::SECURITY_GROUP_ID,
            Attribute::new(AttributeType::String, AttributeFlags::optional_computed())
                .with_force_new()
                .with_conflict(attr::SECURITY_GROUP)
                .with_description(
                    "The security group (ID) the rules apply to (conflicts with `security_group`).",
                ),
        )
        .with_attribute(
            attr::SECURITY_GROUP,
            Attribute::new(AttributeType::String, AttributeFlags::optional_computed())
                .with_force_new()
                .with_conflict(attr::SECURITY_GROUP_ID)
                .with_description(
                    "The security group (name) the rules apply to \
                     (conflicts with `security_group_id`).",
                ),
        )
        .with_attribute(
            attr::ID,
            Attribute::new(AttributeType::String, AttributeFlags::computed()),
        )
        .with_block(attr::INGRESS, rule_block())
        .with_block(attr::EGRESS, rule_block())
}

/// Schema of the provider configuration.
pub fn provider_config_schema() -> Schema {
    Schema::new(0)
        .with_attribute(
            "environment",
            Attribute::optional_string().with_description("Exoscale API environment."),
        )
        .with_attribute(
            "zone",
            Attribute::optional_string().with_description("Zone security groups are managed in."),
        )
        .with_attribute(
            "timeout",
            Attribute::optional_int64()
                .with_validator(Validator::IntBetween {
                    min: 1,
                    max: i64::MAX,
                })
                .with_description("Timeout of each resource operation, in seconds."),
        )
}

/// The full provider schema.
pub fn provider_schema() -> ProviderSchema {
    ProviderSchema::new(provider_config_schema())
        .with_resource(RESOURCE_TYPE, security_group_rules_schema())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_schema_shape() {
        let schema = security_group_rules_schema();
        assert_eq!(schema.version, 2);

        let group_id = &schema.block.attributes[attr::SECURITY_GROUP_ID];
        assert!(group_id.force_new);
        assert!(group_id.flags.optional && group_id.flags.computed);
        assert_eq!(group_id.conflicts_with, vec![attr::SECURITY_GROUP.to_string()]);

        for direction in [attr::INGRESS, attr::EGRESS] {
            let rules = &schema.block.blocks[direction];
            assert!(rules.attributes.contains_key(attr::CIDR_LIST));
            assert!(rules.attributes[attr::IDS].flags.computed);
            assert_eq!(
                rules.attributes[attr::PROTOCOL].default,
                Some(serde_json::json!("TCP"))
            );
        }
    }

    #[test]
    fn test_provider_schema() {
        let schema = provider_schema();
        assert!(schema.resources.contains_key(RESOURCE_TYPE));
        assert!(schema.provider.block.attributes.contains_key("timeout"));
    }

    #[test]
    fn test_schema_serializes_validators() {
        let attr = Attribute::optional_int64()
            .with_validator(Validator::IntBetween { min: 0, max: 255 });
        let value = serde_json::to_value(&attr).unwrap();
        assert_eq!(value["type"], "int64");
        assert_eq!(value["validators"][0]["kind"], "int_between");
        assert_eq!(value["validators"][0]["max"], 255);
    }

    #[test]
    fn test_diagnostic() {
        let err = Diagnostic::error("Invalid port range")
            .with_detail("start port is greater than end port")
            .with_attribute("ingress.0.ports.0");

        assert!(err.is_error());
        assert_eq!(err.attribute, Some("ingress.0.ports.0".to_string()));
        assert!(!Diagnostic::warning("ignored").is_error());
    }
}
