//! Composite identifiers for concrete rules.
//!
//! Every rule held by the backing service is tracked in state under a string
//! derived from its backing ID and defining attributes:
//!
//! | Protocol      | Identifier                                     |
//! |---------------|------------------------------------------------|
//! | ICMP family   | `{id}_{protocol}_{type}:{code}`                |
//! | TCP / UDP     | `{id}_{protocol}_{peer}_{start}-{end}`         |
//! | anything else | `{id}_{protocol}_{peer}`                       |
//!
//! The protocol is lower-case; the peer is the CIDR network or the lower-cased
//! name of the peer security group. Identifiers must stay byte-identical
//! across reads, otherwise unchanged rules show up as drift.

use std::collections::HashMap;

use tracing::debug;

use crate::backend::SecurityGroupBackend;
use crate::config::Endpoint;
use crate::error::{Result, RulesError};
use crate::types::ConcreteRule;

/// Format the identifier of a rule given its already resolved peer name.
///
/// `peer_name` is ignored for the ICMP family.
pub fn format_identifier(rule: &ConcreteRule, peer_name: Option<&str>) -> Result<String> {
    let id = rule
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RulesError::Validation("rule has no backing ID".to_string()))?;
    let protocol = rule
        .protocol
        .ok_or_else(|| RulesError::Validation(format!("rule {} has no protocol", id)))?;

    if protocol.is_icmp() {
        let (icmp_type, icmp_code) = rule.icmp_type.zip(rule.icmp_code).ok_or_else(|| {
            RulesError::Validation(format!("{} rule {} has no ICMP type/code", protocol, id))
        })?;
        return Ok(format!(
            "{}_{}_{}:{}",
            id,
            protocol.api_name(),
            icmp_type,
            icmp_code
        ));
    }

    let peer = peer_name
        .ok_or_else(|| RulesError::Validation(format!("rule {} has no network or peer", id)))?;

    if protocol.uses_ports() {
        let ports = rule
            .ports
            .ok_or_else(|| RulesError::Validation(format!("rule {} has no port range", id)))?;
        Ok(format!(
            "{}_{}_{}_{}-{}",
            id,
            protocol.api_name(),
            peer,
            ports.start,
            ports.end
        ))
    } else {
        Ok(format!("{}_{}_{}", id, protocol.api_name(), peer))
    }
}

/// Resolve a peer security group ID to its lower-cased name.
///
/// A group that does not exist is reported as [`RulesError::Lookup`].
pub async fn resolve_group_name<B: SecurityGroupBackend + ?Sized>(
    backend: &B,
    endpoint: &Endpoint,
    group_id: &str,
) -> Result<String> {
    match backend.get_security_group(endpoint, group_id).await {
        Ok(group) => Ok(group.name.to_lowercase()),
        Err(RulesError::NotFound(msg)) => Err(RulesError::Lookup(format!(
            "unable to retrieve Security Group {:?}: {}",
            group_id, msg
        ))),
        Err(e) => Err(e),
    }
}

/// Derive the composite identifier of a rule, resolving its peer group if needed.
pub async fn identify<B: SecurityGroupBackend + ?Sized>(
    rule: &ConcreteRule,
    backend: &B,
    endpoint: &Endpoint,
) -> Result<String> {
    if rule.protocol.is_some_and(|p| p.is_icmp()) {
        return format_identifier(rule, None);
    }

    let peer = match (&rule.network, &rule.security_group_id) {
        (Some(network), _) => Some(network.to_string()),
        (None, Some(group_id)) => Some(resolve_group_name(backend, endpoint, group_id).await?),
        (None, None) => None,
    };
    format_identifier(rule, peer.as_deref())
}

/// The rules of a security group, indexed by composite identifier.
///
/// Building the index resolves each needed peer group once; the resolved
/// names are kept so that reconciliation needs no further lookups.
#[derive(Debug, Clone, Default)]
pub struct RuleIndex {
    rules: HashMap<String, ConcreteRule>,
    group_names: HashMap<String, String>,
}

impl RuleIndex {
    /// Identify every rule of a security group.
    ///
    /// Fails on the first rule that cannot be identified; no partial index
    /// is returned. `tracked` are the identifiers held in state: the peer
    /// groups of tracked ICMP rules are resolved too, since reads report
    /// them, while untracked ICMP rules are left alone.
    pub async fn build<'a, B, I>(
        rules: &[ConcreteRule],
        backend: &B,
        endpoint: &Endpoint,
        tracked: I,
    ) -> Result<Self>
    where
        B: SecurityGroupBackend + ?Sized,
        I: IntoIterator<Item = &'a String>,
    {
        let mut index = Self::default();

        for rule in rules {
            let is_icmp = rule.protocol.is_some_and(|p| p.is_icmp());
            let peer = match (&rule.network, &rule.security_group_id) {
                _ if is_icmp => None,
                (Some(network), _) => Some(network.to_string()),
                (None, Some(group_id)) => Some(index.resolve(backend, endpoint, group_id).await?),
                (None, None) => None,
            };
            let id = format_identifier(rule, peer.as_deref())?;
            index.rules.insert(id, rule.clone());
        }

        for id in tracked {
            let Some(group_id) = index.rules.get(id).and_then(|r| r.security_group_id.clone())
            else {
                continue;
            };
            index.resolve(backend, endpoint, &group_id).await?;
        }

        debug!(
            rules = index.rules.len(),
            groups = index.group_names.len(),
            "indexed security group rules"
        );
        Ok(index)
    }

    async fn resolve<B: SecurityGroupBackend + ?Sized>(
        &mut self,
        backend: &B,
        endpoint: &Endpoint,
        group_id: &str,
    ) -> Result<String> {
        if let Some(name) = self.group_names.get(group_id) {
            return Ok(name.clone());
        }
        let name = resolve_group_name(backend, endpoint, group_id).await?;
        self.group_names.insert(group_id.to_string(), name.clone());
        Ok(name)
    }

    /// The rules keyed by composite identifier.
    pub fn rules(&self) -> &HashMap<String, ConcreteRule> {
        &self.rules
    }

    /// The lower-cased name of a peer group seen while indexing.
    pub fn group_name(&self, group_id: &str) -> Result<String> {
        self.group_names.get(group_id).cloned().ok_or_else(|| {
            RulesError::Lookup(format!("unable to retrieve Security Group {:?}", group_id))
        })
    }

    /// Number of indexed rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the index holds no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryBackend;
    use crate::types::{PortRange, Protocol};
    use std::collections::BTreeSet;

    fn tcp_rule(id: &str, cidr: &str, ports: PortRange) -> ConcreteRule {
        ConcreteRule {
            id: Some(id.to_string()),
            protocol: Some(Protocol::Tcp),
            network: Some(cidr.parse().unwrap()),
            ports: Some(ports),
            ..Default::default()
        }
    }

    #[test]
    fn test_icmpv6_identifier() {
        let rule = ConcreteRule {
            id: Some("abc".to_string()),
            protocol: Some(Protocol::Icmpv6),
            icmp_type: Some(3),
            icmp_code: Some(0),
            ..Default::default()
        };
        assert_eq!(format_identifier(&rule, None).unwrap(), "abc_icmpv6_3:0");
    }

    #[test]
    fn test_tcp_identifier() {
        let rule = tcp_rule("abc", "10.0.0.0/8", PortRange::single(80));
        assert_eq!(
            format_identifier(&rule, Some("10.0.0.0/8")).unwrap(),
            "abc_tcp_10.0.0.0/8_80-80"
        );
    }

    #[test]
    fn test_other_protocol_identifier() {
        let rule = ConcreteRule {
            id: Some("abc".to_string()),
            protocol: Some(Protocol::Gre),
            ..Default::default()
        };
        assert_eq!(
            format_identifier(&rule, Some("web")).unwrap(),
            "abc_gre_web"
        );
    }

    #[test]
    fn test_identifier_requires_id_and_peer() {
        let mut rule = tcp_rule("abc", "10.0.0.0/8", PortRange::single(80));
        assert!(matches!(
            format_identifier(&rule, None),
            Err(RulesError::Validation(_))
        ));

        rule.id = None;
        assert!(matches!(
            format_identifier(&rule, Some("10.0.0.0/8")),
            Err(RulesError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_identify_is_deterministic() {
        let backend = InMemoryBackend::new();
        let rule = tcp_rule("abc", "192.168.0.0/16", PortRange::new(8000, 8080));

        let first = identify(&rule, &backend, &Endpoint::default()).await.unwrap();
        let second = identify(&rule, &backend, &Endpoint::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "abc_tcp_192.168.0.0/16_8000-8080");
    }

    #[tokio::test]
    async fn test_identify_resolves_lower_cased_group_name() {
        let backend = InMemoryBackend::new();
        let group_id = backend.add_security_group("Web-Servers").await;

        let rule = ConcreteRule {
            id: Some("abc".to_string()),
            protocol: Some(Protocol::Udp),
            security_group_id: Some(group_id),
            ports: Some(PortRange::single(53)),
            ..Default::default()
        };
        assert_eq!(
            identify(&rule, &backend, &Endpoint::default()).await.unwrap(),
            "abc_udp_web-servers_53-53"
        );
    }

    #[tokio::test]
    async fn test_identify_fails_on_unknown_group() {
        let backend = InMemoryBackend::new();
        let rule = ConcreteRule {
            id: Some("abc".to_string()),
            protocol: Some(Protocol::Tcp),
            security_group_id: Some("missing".to_string()),
            ports: Some(PortRange::single(22)),
            ..Default::default()
        };
        assert!(matches!(
            identify(&rule, &backend, &Endpoint::default()).await,
            Err(RulesError::Lookup(_))
        ));
    }

    #[tokio::test]
    async fn test_rule_index() {
        let backend = InMemoryBackend::new();
        let peer = backend.add_security_group("db").await;

        let rules = vec![
            tcp_rule("r1", "10.0.0.0/8", PortRange::single(22)),
            ConcreteRule {
                id: Some("r2".to_string()),
                protocol: Some(Protocol::Tcp),
                security_group_id: Some(peer.clone()),
                ports: Some(PortRange::single(5432)),
                ..Default::default()
            },
        ];

        let index = RuleIndex::build(&rules, &backend, &Endpoint::default(), &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.rules().contains_key("r1_tcp_10.0.0.0/8_22-22"));
        assert!(index.rules().contains_key("r2_tcp_db_5432-5432"));
        assert_eq!(index.group_name(&peer).unwrap(), "db");
        assert!(index.group_name("unknown").is_err());
    }

    #[tokio::test]
    async fn test_rule_index_resolves_icmp_peers_of_tracked_rules_only() {
        let backend = InMemoryBackend::new();
        let admin = backend.add_security_group("Admin").await;
        let icmp_rule = |id: &str, peer: &str| ConcreteRule {
            id: Some(id.to_string()),
            protocol: Some(Protocol::Icmp),
            security_group_id: Some(peer.to_string()),
            icmp_type: Some(8),
            icmp_code: Some(0),
            ..Default::default()
        };
        // r2 belongs to someone else and points at a deleted group.
        let rules = vec![icmp_rule("r1", &admin), icmp_rule("r2", "deleted")];
        let tracked = BTreeSet::from(["r1_icmp_8:0".to_string()]);

        let index = RuleIndex::build(&rules, &backend, &Endpoint::default(), &tracked)
            .await
            .unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.group_name(&admin).unwrap(), "admin");

        let tracked = BTreeSet::from(["r2_icmp_8:0".to_string()]);
        assert!(matches!(
            RuleIndex::build(&rules, &backend, &Endpoint::default(), &tracked).await,
            Err(RulesError::Lookup(_))
        ));
    }
}
