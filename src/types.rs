//! Core types for security group rules.
//!
//! A [`RuleTemplate`] is what users declare in an `ingress` or `egress` block.
//! It expands into many [`ConcreteRule`]s, the entries the backing service
//! actually stores. [`PlanResult`] and [`AttributeChange`] describe planned
//! changes to the resource as a whole.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RulesError};

/// Network protocol matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Protocol {
    /// Transmission Control Protocol.
    #[default]
    Tcp,
    /// User Datagram Protocol.
    Udp,
    /// ICMP (IPv4).
    Icmp,
    /// ICMP for IPv6.
    Icmpv6,
    /// IPsec Authentication Header.
    Ah,
    /// IPsec Encapsulating Security Payload.
    Esp,
    /// Generic Routing Encapsulation.
    Gre,
    /// IP-in-IP.
    Ipip,
    /// Any protocol.
    All,
}

impl Protocol {
    /// Every protocol accepted in configuration, in state notation.
    pub const ALL_NAMES: [&'static str; 9] = [
        "TCP", "UDP", "ICMP", "ICMPv6", "AH", "ESP", "GRE", "IPIP", "ALL",
    ];

    /// The lower-case name used by the backing service and in identifiers.
    pub fn api_name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
            Self::Icmpv6 => "icmpv6",
            Self::Ah => "ah",
            Self::Esp => "esp",
            Self::Gre => "gre",
            Self::Ipip => "ipip",
            Self::All => "all",
        }
    }

    /// The name written back into state (`TCP`, `ICMPv6`, ...).
    pub fn state_name(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Icmp => "ICMP",
            Self::Icmpv6 => "ICMPv6",
            Self::Ah => "AH",
            Self::Esp => "ESP",
            Self::Gre => "GRE",
            Self::Ipip => "IPIP",
            Self::All => "ALL",
        }
    }

    /// Whether this is one of the ICMP family protocols.
    pub fn is_icmp(self) -> bool {
        self.api_name().starts_with("icmp")
    }

    /// Whether rules of this protocol match on port ranges.
    pub fn uses_ports(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state_name())
    }
}

impl FromStr for Protocol {
    type Err = RulesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            "icmpv6" => Ok(Self::Icmpv6),
            "ah" => Ok(Self::Ah),
            "esp" => Ok(Self::Esp),
            "gre" => Ok(Self::Gre),
            "ipip" => Ok(Self::Ipip),
            "all" => Ok(Self::All),
            _ => Err(RulesError::Validation(format!(
                "unsupported protocol {:?}, expected one of {}",
                s,
                Self::ALL_NAMES.join(", ")
            ))),
        }
    }
}

/// Traffic direction of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Incoming traffic; peers are sources.
    Ingress,
    /// Outgoing traffic; peers are destinations.
    Egress,
}

impl Direction {
    /// Both directions, in state order.
    pub const BOTH: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    /// The state attribute holding templates for this direction.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inclusive range of ports.
///
/// Renders as `N` when both ends are equal and `START-END` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRange {
    /// First port of the range.
    pub start: u16,
    /// Last port of the range.
    pub end: u16,
}

impl PortRange {
    /// Create a range covering `start..=end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Create a range covering a single port.
    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = RulesError;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.trim().parse::<u16>().map_err(|_| {
                RulesError::Validation(format!(
                    "invalid port range {:?}, expected <port> or <start_port>-<end_port>",
                    s
                ))
            })
        };

        let range = match s.split_once('-') {
            Some((start, end)) => Self::new(parse(start)?, parse(end)?),
            None => Self::single(parse(s)?),
        };

        if range.start > range.end {
            return Err(RulesError::Validation(format!(
                "invalid port range {:?}, start port is greater than end port",
                s
            )));
        }
        Ok(range)
    }
}

/// A user-declared rule specification.
///
/// A template expands into the cross product of its peers (CIDR networks
/// and named security groups) with its port ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleTemplate {
    /// The protocol to match.
    pub protocol: Protocol,
    /// ICMP type, meaningful for the ICMP family only.
    pub icmp_type: Option<u8>,
    /// ICMP code, meaningful for the ICMP family only.
    pub icmp_code: Option<u8>,
    /// Port ranges, meaningful for TCP and UDP only.
    pub ports: BTreeSet<PortRange>,
    /// CIDR peers.
    pub cidr_list: BTreeSet<String>,
    /// Security group peers, by name.
    pub user_security_group_list: BTreeSet<String>,
    /// Free-form description.
    pub description: String,
    /// Composite identifiers of the concrete rules backing this template.
    pub ids: BTreeSet<String>,
}

impl RuleTemplate {
    /// Create an empty template for the given protocol.
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            ..Default::default()
        }
    }

    /// Add a CIDR peer.
    pub fn with_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.cidr_list.insert(cidr.into());
        self
    }

    /// Add a security group peer.
    pub fn with_security_group(mut self, name: impl Into<String>) -> Self {
        self.user_security_group_list.insert(name.into());
        self
    }

    /// Add a port range.
    pub fn with_ports(mut self, ports: PortRange) -> Self {
        self.ports.insert(ports);
        self
    }

    /// Set the ICMP type and code.
    pub fn with_icmp(mut self, icmp_type: u8, icmp_code: u8) -> Self {
        self.icmp_type = Some(icmp_type);
        self.icmp_code = Some(icmp_code);
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Number of peers, CIDR and security group alike.
    pub fn peer_count(&self) -> usize {
        self.cidr_list.len() + self.user_security_group_list.len()
    }

    /// Compare the user-declared attributes, ignoring the computed `ids`.
    pub fn same_declaration(&self, other: &RuleTemplate) -> bool {
        self.protocol == other.protocol
            && self.icmp_type == other.icmp_type
            && self.icmp_code == other.icmp_code
            && self.ports == other.ports
            && self.cidr_list == other.cidr_list
            && self.user_security_group_list == other.user_security_group_list
            && self.description == other.description
    }
}

/// A single rule as held by the backing service.
///
/// Fields are optional because rules are built up incrementally: an
/// expanded rule has no `id` until it is created, and a removal request
/// only carries the `id`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConcreteRule {
    /// Backing-service identifier.
    pub id: Option<String>,
    /// The protocol matched.
    pub protocol: Option<Protocol>,
    /// CIDR peer.
    pub network: Option<IpNetwork>,
    /// Security group peer, by ID.
    pub security_group_id: Option<String>,
    /// Port range (TCP/UDP).
    pub ports: Option<PortRange>,
    /// ICMP type.
    pub icmp_type: Option<u8>,
    /// ICMP code.
    pub icmp_code: Option<u8>,
    /// Free-form description.
    pub description: Option<String>,
    /// Direction of the rule.
    pub direction: Option<Direction>,
}

impl ConcreteRule {
    /// A rule reference carrying only its backing-service ID.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }
}

/// A security group as returned by the backing service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityGroup {
    /// Security group ID.
    pub id: String,
    /// Security group name.
    pub name: String,
    /// Every rule of the group, both directions.
    pub rules: Vec<ConcreteRule>,
}

/// A change to a single attribute during a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The path to the attribute that changed.
    pub path: String,
    /// The value before the change (None if creating).
    pub before: Option<serde_json::Value>,
    /// The value after the change (None if deleting).
    pub after: Option<serde_json::Value>,
}

impl AttributeChange {
    /// Create a new attribute change.
    pub fn new(
        path: impl Into<String>,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
    ) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }

    /// Create a change for a new attribute.
    pub fn added(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// Create a change for a removed attribute.
    pub fn removed(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(path, Some(value), None)
    }

    /// Create a change for a modified attribute.
    pub fn modified(
        path: impl Into<String>,
        before: serde_json::Value,
        after: serde_json::Value,
    ) -> Self {
        Self::new(path, Some(before), Some(after))
    }
}

/// The result of a plan operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    /// The planned state after the operation.
    pub planned_state: serde_json::Value,
    /// The list of attribute changes.
    pub changes: Vec<AttributeChange>,
    /// Whether the resource requires replacement.
    pub requires_replace: bool,
}

impl PlanResult {
    /// Create a plan result with no changes.
    pub fn no_change(state: serde_json::Value) -> Self {
        Self {
            planned_state: state,
            changes: Vec::new(),
            requires_replace: false,
        }
    }

    /// Create a plan result with changes.
    pub fn with_changes(
        planned_state: serde_json::Value,
        changes: Vec<AttributeChange>,
        requires_replace: bool,
    ) -> Self {
        Self {
            planned_state,
            changes,
            requires_replace,
        }
    }
}

/// Provider metadata: the resource types it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    /// List of resource type names.
    pub resources: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parsing_is_case_insensitive() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("Udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert_eq!("icmpV6".parse::<Protocol>().unwrap(), Protocol::Icmpv6);
        assert_eq!("ALL".parse::<Protocol>().unwrap(), Protocol::All);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(Protocol::Icmpv6.state_name(), "ICMPv6");
        assert_eq!(Protocol::Icmpv6.api_name(), "icmpv6");
        assert_eq!(Protocol::Gre.state_name(), "GRE");
        assert!(Protocol::Icmp.is_icmp());
        assert!(Protocol::Icmpv6.is_icmp());
        assert!(!Protocol::Ipip.is_icmp());
        assert!(Protocol::Udp.uses_ports());
        assert!(!Protocol::All.uses_ports());
    }

    #[test]
    fn test_port_range_parsing() {
        assert_eq!("22".parse::<PortRange>().unwrap(), PortRange::single(22));
        assert_eq!(
            "8000-8080".parse::<PortRange>().unwrap(),
            PortRange::new(8000, 8080)
        );
        assert_eq!("80-80".parse::<PortRange>().unwrap(), PortRange::single(80));
        assert!("http".parse::<PortRange>().is_err());
        assert!("90-80".parse::<PortRange>().is_err());
        assert!("1-70000".parse::<PortRange>().is_err());
        assert!("".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_port_range_display() {
        assert_eq!(PortRange::single(443).to_string(), "443");
        assert_eq!(PortRange::new(1, 1024).to_string(), "1-1024");
    }

    #[test]
    fn test_same_declaration_ignores_ids() {
        let a = RuleTemplate::new(Protocol::Tcp)
            .with_cidr("10.0.0.0/8")
            .with_ports(PortRange::single(22));
        let mut b = a.clone();
        b.ids.insert("abc_tcp_10.0.0.0/8_22-22".to_string());
        assert!(a.same_declaration(&b));
        assert_ne!(a, b);

        let c = a.clone().with_ports(PortRange::single(80));
        assert!(!a.same_declaration(&c));
    }

    #[test]
    fn test_peer_count() {
        let t = RuleTemplate::new(Protocol::Udp)
            .with_cidr("10.0.0.0/8")
            .with_cidr("::/0")
            .with_security_group("web");
        assert_eq!(t.peer_count(), 3);
    }

    #[test]
    fn test_attribute_change_constructors() {
        let added = AttributeChange::added("ingress", serde_json::json!([]));
        assert!(added.before.is_none());

        let modified = AttributeChange::modified(
            "security_group",
            serde_json::json!("old"),
            serde_json::json!("new"),
        );
        assert_eq!(modified.before, Some(serde_json::json!("old")));
        assert_eq!(modified.after, Some(serde_json::json!("new")));
    }
}
