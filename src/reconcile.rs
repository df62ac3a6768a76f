//! Drift detection between rule templates and the live backing rules.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{ConcreteRule, RuleTemplate};

/// Rebuild a template from the backing rules its `ids` point to.
///
/// Identifiers that no longer resolve in `backing` are dropped. The observed
/// CIDRs, peer group names, ports, ICMP fields, protocol and description
/// replace the declared ones, so that the next plan shows any drift.
///
/// The backing service only lists individual rules, not the cross product
/// they came from. When every observed set has the declared size but some
/// `(peer, port)` pairs are missing, the missing pairs cannot be told apart;
/// the observed ports are then cleared to force the whole template to be
/// recreated.
///
/// `group_name` resolves a peer group ID to its lower-cased name.
pub fn reconcile<N>(
    template: &RuleTemplate,
    backing: &HashMap<String, ConcreteRule>,
    mut group_name: N,
) -> Result<RuleTemplate>
where
    N: FnMut(&str) -> Result<String>,
{
    let expected = template.peer_count() * template.ports.len();
    let mut actual = 0;

    let mut observed = RuleTemplate {
        protocol: template.protocol,
        icmp_type: template.icmp_type,
        icmp_code: template.icmp_code,
        description: template.description.clone(),
        ..Default::default()
    };

    for id in &template.ids {
        let Some(rule) = backing.get(id) else {
            debug!(rule_id = %id, "rule vanished from the backing service");
            continue;
        };
        observed.ids.insert(id.clone());
        actual += 1;

        if let Some(protocol) = rule.protocol {
            observed.protocol = protocol;
        }
        observed.description = rule.description.clone().unwrap_or_default();

        if let Some(network) = &rule.network {
            observed.cidr_list.insert(network.to_string());
        }
        if let Some(group_id) = &rule.security_group_id {
            observed.user_security_group_list.insert(group_name(group_id)?);
        }

        if observed.protocol.is_icmp() {
            observed.icmp_type = rule.icmp_type;
            observed.icmp_code = rule.icmp_code;
        } else if observed.protocol.uses_ports() {
            if let Some(ports) = rule.ports {
                observed.ports.insert(ports);
            }
        }
    }

    if observed.cidr_list.len() == template.cidr_list.len()
        && observed.ports.len() == template.ports.len()
        && observed.user_security_group_list.len() == template.user_security_group_list.len()
        && actual != expected
    {
        if !observed.ports.is_empty() {
            warn!(
                expected,
                actual, "rule template is partially missing, forcing recreation"
            );
        }
        observed.ports = BTreeSet::new();
    }

    Ok(observed)
}

/// The deletion requests for every rule backing a template.
///
/// Keys are the composite identifiers; each rule carries only the backing ID,
/// the part of the identifier before the first `_`.
pub fn rules_to_remove(template: &RuleTemplate) -> BTreeMap<String, ConcreteRule> {
    template
        .ids
        .iter()
        .map(|identifier| {
            let id = identifier
                .split_once('_')
                .map_or(identifier.as_str(), |(id, _)| id);
            (identifier.clone(), ConcreteRule::with_id(id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RulesError;
    use crate::identity::format_identifier;
    use crate::types::{PortRange, Protocol};

    fn no_groups(id: &str) -> Result<String> {
        Err(RulesError::Lookup(id.to_string()))
    }

    fn tcp_rule(id: &str, cidr: &str, port: u16) -> (String, ConcreteRule) {
        let rule = ConcreteRule {
            id: Some(id.to_string()),
            protocol: Some(Protocol::Tcp),
            network: Some(cidr.parse().unwrap()),
            ports: Some(PortRange::single(port)),
            ..Default::default()
        };
        (format_identifier(&rule, Some(cidr)).unwrap(), rule)
    }

    fn web_template() -> RuleTemplate {
        RuleTemplate::new(Protocol::Tcp)
            .with_cidr("10.0.0.0/8")
            .with_cidr("192.168.0.0/16")
            .with_ports(PortRange::single(80))
            .with_ports(PortRange::single(443))
    }

    fn backing_for(rules: &[(String, ConcreteRule)]) -> HashMap<String, ConcreteRule> {
        rules.iter().cloned().collect()
    }

    #[test]
    fn test_reconcile_unchanged() {
        let rules = vec![
            tcp_rule("a1", "10.0.0.0/8", 80),
            tcp_rule("a2", "10.0.0.0/8", 443),
            tcp_rule("b1", "192.168.0.0/16", 80),
            tcp_rule("b2", "192.168.0.0/16", 443),
        ];
        let mut template = web_template();
        template.ids = rules.iter().map(|(id, _)| id.clone()).collect();

        let observed = reconcile(&template, &backing_for(&rules), no_groups).unwrap();
        assert_eq!(observed, template);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let rules = vec![
            tcp_rule("a1", "10.0.0.0/8", 80),
            tcp_rule("a2", "10.0.0.0/8", 443),
            tcp_rule("b1", "192.168.0.0/16", 80),
        ];
        let mut template = web_template();
        template.ids = rules.iter().map(|(id, _)| id.clone()).collect();
        let backing = backing_for(&rules);

        let first = reconcile(&template, &backing, no_groups).unwrap();
        let second = reconcile(&template, &backing, no_groups).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reconcile_ambiguous_partial_drift_clears_ports() {
        let mut rules = vec![
            tcp_rule("a1", "10.0.0.0/8", 80),
            tcp_rule("a2", "10.0.0.0/8", 443),
            tcp_rule("b1", "192.168.0.0/16", 80),
            tcp_rule("b2", "192.168.0.0/16", 443),
        ];
        let mut template = web_template();
        template.ids = rules.iter().map(|(id, _)| id.clone()).collect();

        // b2 (192.168.0.0/16:443) is deleted out of band.
        rules.pop();
        let observed = reconcile(&template, &backing_for(&rules), no_groups).unwrap();

        assert_eq!(observed.cidr_list, template.cidr_list);
        assert!(observed.ports.is_empty());
        assert_eq!(observed.ids.len(), 3);
    }

    #[test]
    fn test_reconcile_detectable_drift_keeps_observed_ports() {
        let rules = vec![
            tcp_rule("a1", "10.0.0.0/8", 80),
            tcp_rule("a2", "10.0.0.0/8", 443),
        ];
        let mut template = web_template();
        template.ids = rules.iter().map(|(id, _)| id.clone()).collect();
        template.ids.insert("b1_tcp_192.168.0.0/16_80-80".to_string());
        template.ids.insert("b2_tcp_192.168.0.0/16_443-443".to_string());

        let observed = reconcile(&template, &backing_for(&rules), no_groups).unwrap();
        assert_eq!(observed.cidr_list.len(), 1);
        assert_eq!(observed.ports.len(), 2);
        assert_eq!(observed.ids.len(), 2);
    }

    #[test]
    fn test_reconcile_full_deletion() {
        let rules = vec![tcp_rule("a1", "10.0.0.0/8", 80)];
        let mut template = web_template();
        template.ids = rules.iter().map(|(id, _)| id.clone()).collect();

        let observed = reconcile(&template, &HashMap::new(), no_groups).unwrap();
        assert!(observed.ids.is_empty());
        assert!(observed.cidr_list.is_empty());
        assert!(observed.ports.is_empty());
        assert!(observed.user_security_group_list.is_empty());
    }

    #[test]
    fn test_reconcile_reads_icmp_and_groups() {
        let rule = ConcreteRule {
            id: Some("i1".to_string()),
            protocol: Some(Protocol::Icmpv6),
            security_group_id: Some("sg-1".to_string()),
            icmp_type: Some(128),
            icmp_code: Some(0),
            description: Some("ping".to_string()),
            ..Default::default()
        };
        let id = format_identifier(&rule, None).unwrap();
        let mut template = RuleTemplate::new(Protocol::Icmpv6)
            .with_security_group("monitoring")
            .with_icmp(1, 1);
        template.ids.insert(id.clone());

        let backing = HashMap::from([(id, rule)]);
        let observed = reconcile(&template, &backing, |_| Ok("monitoring".to_string())).unwrap();

        assert_eq!(observed.icmp_type, Some(128));
        assert_eq!(observed.icmp_code, Some(0));
        assert_eq!(observed.description, "ping");
        assert!(observed.user_security_group_list.contains("monitoring"));
    }

    #[test]
    fn test_reconcile_propagates_lookup_errors() {
        let rule = ConcreteRule {
            id: Some("g1".to_string()),
            protocol: Some(Protocol::Tcp),
            security_group_id: Some("sg-gone".to_string()),
            ports: Some(PortRange::single(22)),
            ..Default::default()
        };
        let id = format_identifier(&rule, Some("old")).unwrap();
        let mut template = RuleTemplate::new(Protocol::Tcp)
            .with_security_group("old")
            .with_ports(PortRange::single(22));
        template.ids.insert(id.clone());

        let backing = HashMap::from([(id, rule)]);
        assert!(matches!(
            reconcile(&template, &backing, no_groups),
            Err(RulesError::Lookup(_))
        ));
    }

    #[test]
    fn test_rules_to_remove_extracts_backing_id() {
        let mut template = web_template();
        template.ids.insert("abc_tcp_10.0.0.0/8_80-80".to_string());

        let removals = rules_to_remove(&template);
        assert_eq!(removals.len(), 1);
        let rule = &removals["abc_tcp_10.0.0.0/8_80-80"];
        assert_eq!(rule.id.as_deref(), Some("abc"));
        assert!(rule.protocol.is_none());
        assert!(rule.network.is_none());
    }
}
