//! Expansion of rule templates into concrete rules.
//!
//! A template yields one base rule per port range (TCP/UDP), a single base
//! rule carrying the ICMP type/code (ICMP family), or a single bare base rule
//! (any other protocol). Every base rule is then paired with every CIDR peer
//! and every security group peer.

use std::collections::BTreeMap;

use ipnetwork::IpNetwork;
use tracing::debug;

use crate::backend::SecurityGroupBackend;
use crate::config::Endpoint;
use crate::error::{Result, RulesError};
use crate::types::{ConcreteRule, Direction, RuleTemplate};

/// Parse a CIDR network written in canonical form.
///
/// The backing service stores networks by their network address and reads
/// report them that way, so `10.1.2.3/8` or `::0/0` would never match what
/// is read back. They are rejected instead of being rewritten.
pub fn parse_network(cidr: &str) -> Result<IpNetwork> {
    let parsed: IpNetwork = cidr
        .parse()
        .map_err(|e| RulesError::Validation(format!("invalid CIDR {:?}: {}", cidr, e)))?;
    let network = IpNetwork::new(parsed.network(), parsed.prefix())
        .map_err(|e| RulesError::Validation(format!("invalid CIDR {:?}: {}", cidr, e)))?;
    if network.to_string() != cidr {
        return Err(RulesError::Validation(format!(
            "invalid CIDR {:?}: not a network address, expected {:?}",
            cidr,
            network.to_string()
        )));
    }
    Ok(network)
}

fn base_rules(template: &RuleTemplate, direction: Direction) -> Vec<ConcreteRule> {
    let base = ConcreteRule {
        protocol: Some(template.protocol),
        description: Some(template.description.clone()).filter(|d| !d.is_empty()),
        direction: Some(direction),
        ..Default::default()
    };

    if template.protocol.is_icmp() {
        vec![ConcreteRule {
            icmp_type: template.icmp_type,
            icmp_code: template.icmp_code,
            ..base
        }]
    } else if template.protocol.uses_ports() {
        template
            .ports
            .iter()
            .map(|ports| ConcreteRule {
                ports: Some(*ports),
                ..base.clone()
            })
            .collect()
    } else {
        vec![base]
    }
}

/// Expand a template, resolving security group peers through `resolve_group`.
///
/// `resolve_group` maps a security group name to its ID. The first failure
/// aborts the expansion.
pub fn expand_with<F>(
    template: &RuleTemplate,
    direction: Direction,
    mut resolve_group: F,
) -> Result<Vec<ConcreteRule>>
where
    F: FnMut(&str) -> Result<String>,
{
    let icmp_incomplete = template.icmp_type.is_none() || template.icmp_code.is_none();
    if template.protocol.is_icmp() && icmp_incomplete {
        return Err(RulesError::Validation(format!(
            "{} rules require icmp_type and icmp_code",
            template.protocol
        )));
    }
    let bases = base_rules(template, direction);

    let networks = template
        .cidr_list
        .iter()
        .map(|cidr| parse_network(cidr))
        .collect::<Result<Vec<_>>>()?;
    let group_ids = template
        .user_security_group_list
        .iter()
        .map(|name| resolve_group(name))
        .collect::<Result<Vec<_>>>()?;

    let mut expanded = Vec::with_capacity(bases.len() * template.peer_count());
    for base in &bases {
        for network in &networks {
            expanded.push(ConcreteRule {
                network: Some(*network),
                ..base.clone()
            });
        }
    }
    for base in &bases {
        for group_id in &group_ids {
            expanded.push(ConcreteRule {
                security_group_id: Some(group_id.clone()),
                ..base.clone()
            });
        }
    }

    Ok(expanded)
}

/// Expand a template into the concrete rules to create.
///
/// Peer security groups are looked up by name; a group that does not exist
/// fails the whole expansion with [`RulesError::Lookup`].
pub async fn expand<B: SecurityGroupBackend + ?Sized>(
    template: &RuleTemplate,
    direction: Direction,
    backend: &B,
    endpoint: &Endpoint,
) -> Result<Vec<ConcreteRule>> {
    let mut group_ids = BTreeMap::new();
    for name in &template.user_security_group_list {
        let group = match backend.find_security_group(endpoint, name).await {
            Ok(group) => group,
            Err(RulesError::NotFound(msg)) => {
                return Err(RulesError::Lookup(format!(
                    "unable to retrieve Security Group {:?}: {}",
                    name, msg
                )))
            }
            Err(e) => return Err(e),
        };
        group_ids.insert(name.clone(), group.id);
    }

    let rules = expand_with(template, direction, |name| {
        group_ids.get(name).cloned().ok_or_else(|| {
            RulesError::Lookup(format!("unable to retrieve Security Group {:?}", name))
        })
    })?;

    debug!(
        protocol = %template.protocol,
        direction = %direction,
        rules = rules.len(),
        "expanded rule template"
    );
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::format_identifier;
    use crate::testing::InMemoryBackend;
    use crate::types::{PortRange, Protocol};
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn group_id(name: &str) -> Result<String> {
        Ok(format!("id-{}", name))
    }

    #[test]
    fn test_parse_network_requires_canonical_form() {
        assert_eq!(parse_network("10.0.0.0/8").unwrap().to_string(), "10.0.0.0/8");
        assert_eq!(parse_network("::/0").unwrap().to_string(), "::/0");

        for cidr in ["10.1.2.3/8", "::0/0", " 10.0.0.0/8", "not-a-cidr"] {
            assert!(
                matches!(parse_network(cidr), Err(RulesError::Validation(_))),
                "{} should be rejected",
                cidr
            );
        }
    }

    #[test]
    fn test_expand_rejects_host_address_cidr() {
        let template = RuleTemplate::new(Protocol::Tcp)
            .with_cidr("10.1.2.3/8")
            .with_ports(PortRange::single(22));
        assert!(matches!(
            expand_with(&template, Direction::Ingress, group_id),
            Err(RulesError::Validation(_))
        ));
    }

    #[test]
    fn test_expand_tcp_cross_product() {
        let template = RuleTemplate::new(Protocol::Tcp)
            .with_cidr("10.0.0.0/8")
            .with_cidr("192.168.0.0/16")
            .with_security_group("web")
            .with_ports(PortRange::single(80))
            .with_ports(PortRange::single(443))
            .with_description("http");

        let rules = expand_with(&template, Direction::Ingress, group_id).unwrap();
        assert_eq!(rules.len(), 6);
        assert!(rules
            .iter()
            .all(|r| r.direction == Some(Direction::Ingress)
                && r.description.as_deref() == Some("http")));
        assert_eq!(
            rules
                .iter()
                .filter(|r| r.security_group_id.as_deref() == Some("id-web"))
                .count(),
            2
        );
    }

    #[test]
    fn test_expand_icmp_single_base_rule() {
        let template = RuleTemplate::new(Protocol::Icmp)
            .with_cidr("0.0.0.0/0")
            .with_security_group("admin")
            .with_icmp(8, 0);

        let rules = expand_with(&template, Direction::Egress, group_id).unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules
            .iter()
            .all(|r| r.icmp_type == Some(8) && r.icmp_code == Some(0) && r.ports.is_none()));
    }

    #[test]
    fn test_expand_icmp_requires_type_and_code() {
        let template = RuleTemplate::new(Protocol::Icmpv6).with_cidr("::/0");
        assert!(matches!(
            expand_with(&template, Direction::Ingress, group_id),
            Err(RulesError::Validation(_))
        ));
    }

    #[test]
    fn test_expand_other_protocol_ignores_ports() {
        let template = RuleTemplate::new(Protocol::Esp)
            .with_cidr("10.0.0.0/8")
            .with_ports(PortRange::single(22));

        let rules = expand_with(&template, Direction::Ingress, group_id).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules[0].ports.is_none());
        assert!(rules[0].description.is_none());
    }

    #[test]
    fn test_expand_aborts_on_lookup_failure() {
        let template = RuleTemplate::new(Protocol::Tcp)
            .with_security_group("ghost")
            .with_ports(PortRange::single(22));

        let result = expand_with(&template, Direction::Ingress, |name| {
            Err(RulesError::Lookup(name.to_string()))
        });
        assert!(matches!(result, Err(RulesError::Lookup(_))));
    }

    #[tokio::test]
    async fn test_expand_resolves_groups_through_backend() {
        let backend = InMemoryBackend::new();
        let web = backend.add_security_group("web").await;

        let template = RuleTemplate::new(Protocol::Udp)
            .with_security_group("web")
            .with_ports(PortRange::single(53));
        let endpoint = Endpoint::default();
        let rules = expand(&template, Direction::Ingress, &backend, &endpoint)
            .await
            .unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].security_group_id, Some(web));

        let template = template.with_security_group("ghost");
        assert!(matches!(
            expand(&template, Direction::Ingress, &backend, &endpoint).await,
            Err(RulesError::Lookup(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_expansion_cardinality_and_unique_identifiers(
            cidrs in prop::collection::btree_set(0u8..=255, 0..4),
            groups in prop::collection::btree_set("[a-z]{1,8}", 0..4),
            ports in prop::collection::btree_set(1u16..=65535, 1..5),
            icmp in any::<bool>(),
        ) {
            let mut template = if icmp {
                RuleTemplate::new(Protocol::Icmp).with_icmp(8, 0)
            } else {
                RuleTemplate::new(Protocol::Tcp)
            };
            for octet in &cidrs {
                template = template.with_cidr(format!("10.{}.0.0/16", octet));
            }
            for group in &groups {
                template = template.with_security_group(group.clone());
            }
            for port in &ports {
                template = template.with_ports(PortRange::single(*port));
            }

            let rules = expand_with(&template, Direction::Ingress, group_id).unwrap();
            let per_peer = if icmp { 1 } else { ports.len() };
            prop_assert_eq!(rules.len(), (cidrs.len() + groups.len()) * per_peer);

            let mut seen = HashSet::new();
            for (i, rule) in rules.iter().enumerate() {
                let mut created = rule.clone();
                created.id = Some(format!("rule-{}", i));
                let peer = created
                    .network
                    .map(|n| n.to_string())
                    .or_else(|| created.security_group_id.clone());
                let id = format_identifier(&created, peer.as_deref()).unwrap();
                prop_assert!(seen.insert(id));
            }
        }
    }
}
