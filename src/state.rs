//! The declarative state representation of the resource.
//!
//! State is exchanged as JSON objects whose attribute names are fixed by
//! existing stored configurations:
//!
//! ```json
//! {
//!   "id": "6170432942937341440",
//!   "security_group_id": "1c2e6f2a-...",
//!   "security_group": "web",
//!   "ingress": [{
//!     "protocol": "TCP",
//!     "ports": ["80", "443"],
//!     "cidr_list": ["0.0.0.0/0"],
//!     "user_security_group_list": [],
//!     "description": "",
//!     "icmp_type": null,
//!     "icmp_code": null,
//!     "ids": ["<rule-id>_tcp_0.0.0.0/0_80-80", "..."]
//!   }],
//!   "egress": []
//! }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Result, RulesError};
use crate::types::{Direction, PortRange, Protocol, RuleTemplate};

/// Attribute names of the resource and its rule blocks.
pub mod attr {
    /// Resource ID.
    pub const ID: &str = "id";
    /// Security group ID the rules apply to.
    pub const SECURITY_GROUP_ID: &str = "security_group_id";
    /// Security group name the rules apply to.
    pub const SECURITY_GROUP: &str = "security_group";
    /// Ingress rule templates.
    pub const INGRESS: &str = "ingress";
    /// Egress rule templates.
    pub const EGRESS: &str = "egress";
    /// CIDR peers of a rule template.
    pub const CIDR_LIST: &str = "cidr_list";
    /// Description of a rule template.
    pub const DESCRIPTION: &str = "description";
    /// ICMP code of a rule template.
    pub const ICMP_CODE: &str = "icmp_code";
    /// ICMP type of a rule template.
    pub const ICMP_TYPE: &str = "icmp_type";
    /// Port ranges of a rule template.
    pub const PORTS: &str = "ports";
    /// Protocol of a rule template.
    pub const PROTOCOL: &str = "protocol";
    /// Security group peers of a rule template.
    pub const USER_SECURITY_GROUP_LIST: &str = "user_security_group_list";
    /// Composite identifiers backing a rule template.
    pub const IDS: &str = "ids";
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_protocol() -> String {
    Protocol::Tcp.state_name().to_string()
}

/// A rule template exactly as stored in state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRuleTemplate {
    #[serde(default, deserialize_with = "null_as_default")]
    cidr_list: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    description: String,
    #[serde(default)]
    icmp_code: Option<i64>,
    #[serde(default)]
    icmp_type: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    ids: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    ports: Vec<String>,
    #[serde(default = "default_protocol", deserialize_with = "protocol_or_default")]
    protocol: String,
    #[serde(default, deserialize_with = "null_as_default")]
    user_security_group_list: Vec<String>,
}

fn protocol_or_default<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|p| !p.is_empty())
        .unwrap_or_else(default_protocol))
}

fn icmp_field(name: &str, value: Option<i64>) -> Result<Option<u8>> {
    value
        .map(|v| {
            u8::try_from(v).map_err(|_| {
                RulesError::Validation(format!("{} must be between 0 and 255, got {}", name, v))
            })
        })
        .transpose()
}

impl TryFrom<RawRuleTemplate> for RuleTemplate {
    type Error = RulesError;

    fn try_from(raw: RawRuleTemplate) -> Result<Self> {
        Ok(RuleTemplate {
            protocol: raw.protocol.parse()?,
            icmp_type: icmp_field(attr::ICMP_TYPE, raw.icmp_type)?,
            icmp_code: icmp_field(attr::ICMP_CODE, raw.icmp_code)?,
            ports: raw
                .ports
                .iter()
                .map(|p| p.parse::<PortRange>())
                .collect::<Result<_>>()?,
            cidr_list: raw.cidr_list.into_iter().collect(),
            user_security_group_list: raw.user_security_group_list.into_iter().collect(),
            description: raw.description,
            ids: raw.ids.into_iter().collect(),
        })
    }
}

impl From<&RuleTemplate> for RawRuleTemplate {
    fn from(template: &RuleTemplate) -> Self {
        RawRuleTemplate {
            cidr_list: template.cidr_list.iter().cloned().collect(),
            description: template.description.clone(),
            icmp_code: template.icmp_code.map(i64::from),
            icmp_type: template.icmp_type.map(i64::from),
            ids: template.ids.iter().cloned().collect(),
            ports: template.ports.iter().map(ToString::to_string).collect(),
            protocol: template.protocol.state_name().to_string(),
            user_security_group_list: template.user_security_group_list.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawResourceState {
    #[serde(default, deserialize_with = "null_as_default")]
    id: String,
    #[serde(default)]
    security_group_id: Option<String>,
    #[serde(default)]
    security_group: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    ingress: Vec<RawRuleTemplate>,
    #[serde(default, deserialize_with = "null_as_default")]
    egress: Vec<RawRuleTemplate>,
}

/// Typed state of an `exoscale_security_group_rules` resource.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceState {
    /// Resource ID; empty once the resource is gone.
    pub id: String,
    /// ID of the security group the rules belong to.
    pub security_group_id: Option<String>,
    /// Name of the security group the rules belong to.
    pub security_group: Option<String>,
    /// Ingress rule templates.
    pub ingress: Vec<RuleTemplate>,
    /// Egress rule templates.
    pub egress: Vec<RuleTemplate>,
}

impl ResourceState {
    /// Parse a state or configuration object.
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawResourceState = if value.is_null() {
            RawResourceState::default()
        } else {
            serde_json::from_value(value)?
        };

        let templates = |raws: Vec<RawRuleTemplate>| -> Result<Vec<RuleTemplate>> {
            raws.into_iter().map(RuleTemplate::try_from).collect()
        };

        Ok(ResourceState {
            id: raw.id,
            security_group_id: raw.security_group_id.filter(|s| !s.is_empty()),
            security_group: raw.security_group.filter(|s| !s.is_empty()),
            ingress: templates(raw.ingress)?,
            egress: templates(raw.egress)?,
        })
    }

    /// Render the state object.
    pub fn to_value(&self) -> Result<Value> {
        let raw = RawResourceState {
            id: self.id.clone(),
            security_group_id: self.security_group_id.clone(),
            security_group: self.security_group.clone(),
            ingress: self.ingress.iter().map(RawRuleTemplate::from).collect(),
            egress: self.egress.iter().map(RawRuleTemplate::from).collect(),
        };
        Ok(serde_json::to_value(raw)?)
    }

    /// The templates declared for a direction.
    pub fn templates(&self, direction: Direction) -> &[RuleTemplate] {
        match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        }
    }

    /// Mutable access to the templates declared for a direction.
    pub fn templates_mut(&mut self, direction: Direction) -> &mut Vec<RuleTemplate> {
        match direction {
            Direction::Ingress => &mut self.ingress,
            Direction::Egress => &mut self.egress,
        }
    }

    /// The security group reference to look up: the ID if known, else the name.
    ///
    /// Fails when neither is set.
    pub fn security_group_ref(&self) -> Result<&str> {
        self.security_group_id
            .as_deref()
            .or(self.security_group.as_deref())
            .ok_or_else(|| {
                RulesError::Validation(format!(
                    "either {} or {} must be specified",
                    attr::SECURITY_GROUP,
                    attr::SECURITY_GROUP_ID
                ))
            })
    }

    /// Whether the resource no longer exists.
    pub fn is_gone(&self) -> bool {
        self.id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_state() {
        let state = ResourceState::from_value(json!({
            "id": "42",
            "security_group_id": "sg-1",
            "ingress": [{
                "protocol": "tcp",
                "ports": ["22", "8000-8080"],
                "cidr_list": ["10.0.0.0/8"],
                "description": "ssh",
                "ids": ["abc_tcp_10.0.0.0/8_22-22"]
            }],
            "egress": null
        }))
        .unwrap();

        assert_eq!(state.id, "42");
        assert_eq!(state.security_group_ref().unwrap(), "sg-1");
        assert_eq!(state.ingress.len(), 1);
        assert!(state.egress.is_empty());

        let template = &state.ingress[0];
        assert_eq!(template.protocol, Protocol::Tcp);
        assert!(template.ports.contains(&PortRange::new(8000, 8080)));
        assert!(template.ids.contains("abc_tcp_10.0.0.0/8_22-22"));
    }

    #[test]
    fn test_null_attributes_use_defaults() {
        let state = ResourceState::from_value(json!({
            "security_group": "web",
            "egress": [{
                "protocol": null,
                "ports": null,
                "cidr_list": ["::/0"],
                "user_security_group_list": null,
                "description": null,
                "icmp_type": null,
                "icmp_code": null,
                "ids": null
            }]
        }))
        .unwrap();

        let template = &state.egress[0];
        assert_eq!(template.protocol, Protocol::Tcp);
        assert!(template.ports.is_empty());
        assert!(template.ids.is_empty());
        assert_eq!(state.security_group_ref().unwrap(), "web");
        assert!(state.is_gone());
    }

    #[test]
    fn test_protocol_normalized_on_output() {
        let state = ResourceState {
            id: "1".to_string(),
            security_group_id: Some("sg-1".to_string()),
            ingress: vec![
                RuleTemplate::new(Protocol::Icmpv6).with_icmp(128, 0),
                RuleTemplate::new(Protocol::Udp).with_ports(PortRange::new(1, 1024)),
            ],
            ..Default::default()
        };

        let value = state.to_value().unwrap();
        assert_eq!(value["ingress"][0]["protocol"], "ICMPv6");
        assert_eq!(value["ingress"][0]["icmp_type"], 128);
        assert_eq!(value["ingress"][1]["protocol"], "UDP");
        assert_eq!(value["ingress"][1]["ports"], json!(["1-1024"]));
        assert_eq!(value["security_group"], Value::Null);

        let back = ResourceState::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_port = json!({"ingress": [{"ports": ["http"]}]});
        assert!(matches!(
            ResourceState::from_value(bad_port),
            Err(RulesError::Validation(_))
        ));

        let bad_icmp = json!({"ingress": [{"protocol": "ICMP", "icmp_type": 300}]});
        assert!(matches!(
            ResourceState::from_value(bad_icmp),
            Err(RulesError::Validation(_))
        ));

        let bad_shape = json!({"ingress": "nope"});
        assert!(matches!(
            ResourceState::from_value(bad_shape),
            Err(RulesError::Serialization(_))
        ));
    }

    #[test]
    fn test_security_group_ref_requires_one_attribute() {
        let state = ResourceState::default();
        assert!(matches!(
            state.security_group_ref(),
            Err(RulesError::Validation(_))
        ));
    }
}
