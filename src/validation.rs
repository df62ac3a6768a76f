//! Configuration validation.
//!
//! [`validate`] checks a JSON value against a [`Schema`]: attribute types,
//! value constraints ([`Validator`]), conflicting attributes and the entries
//! of nested rule blocks. [`validate_rule_templates`] adds the checks that
//! depend on several attributes of a rule block at once.
//!
//! # Example
//!
//! ```
//! use secgroup_rules::schema::security_group_rules_schema;
//! use secgroup_rules::validation::validate;
//! use serde_json::json;
//!
//! let schema = security_group_rules_schema();
//! let diagnostics = validate(&schema, &json!({
//!     "security_group": "web",
//!     "ingress": [{"protocol": "TCP", "ports": ["80"], "cidr_list": ["0.0.0.0/0"]}]
//! }));
//! assert!(diagnostics.is_empty());
//!
//! let diagnostics = validate(&schema, &json!({
//!     "security_group": "web",
//!     "ingress": [{"ports": ["http"]}]
//! }));
//! assert_eq!(diagnostics[0].attribute, Some("ingress.0.ports.0".to_string()));
//! ```

use serde_json::Value;

use crate::expand::parse_network;
use crate::schema::{Attribute, AttributeType, Block, Diagnostic, Schema, Validator};
use crate::state::attr;
use crate::types::{Direction, PortRange, Protocol};

/// Every finding for `value` under `schema`; empty when the value passes.
///
/// Attributes only the provider sets are not checked. A value that has the
/// wrong type is reported once, and its validators are not run. Conflicts
/// are reported on both attributes.
pub fn validate(schema: &Schema, value: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    validate_block(&schema.block, value, "", &mut diagnostics);
    diagnostics
}

/// [`validate`], as a `Result`.
pub fn validate_result(schema: &Schema, value: &Value) -> Result<(), Vec<Diagnostic>> {
    let diagnostics = validate(schema, value);
    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

/// Whether [`validate`] finds nothing at all, warnings included.
pub fn is_valid(schema: &Schema, value: &Value) -> bool {
    validate(schema, value).is_empty()
}

/// Cross-attribute checks of a security group rules configuration.
///
/// - one of `security_group` / `security_group_id` must be set
/// - ICMP family rules need both `icmp_type` and `icmp_code`
/// - TCP/UDP rules need at least one port range
/// - ports and ICMP fields are ignored (with a warning) elsewhere
/// - a rule without any peer matches nothing (warning)
pub fn validate_rule_templates(config: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    let Some(obj) = config.as_object() else {
        return diagnostics;
    };

    let is_set = |name: &str| {
        obj.get(name)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
    };
    if !is_set(attr::SECURITY_GROUP) && !is_set(attr::SECURITY_GROUP_ID) {
        diagnostics.push(Diagnostic::error(format!(
            "either {} or {} must be specified",
            attr::SECURITY_GROUP,
            attr::SECURITY_GROUP_ID
        )));
    }

    for direction in Direction::BOTH {
        let Some(Value::Array(templates)) = obj.get(direction.as_str()) else {
            continue;
        };
        for (i, template) in templates.iter().enumerate() {
            let path = format!("{}.{}", direction, i);
            if let Some(template) = template.as_object() {
                validate_template(template, &path, &mut diagnostics);
            }
        }
    }
    diagnostics
}

fn validate_template(
    template: &serde_json::Map<String, Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    // Unparseable protocols are reported by the schema validators.
    let protocol = match template.get(attr::PROTOCOL).and_then(Value::as_str) {
        None => Protocol::default(),
        Some(name) => match name.parse::<Protocol>() {
            Ok(protocol) => protocol,
            Err(_) => return,
        },
    };
    let present = |name: &str| template.get(name).is_some_and(|v| !v.is_null());
    let non_empty = |name: &str| {
        template
            .get(name)
            .and_then(Value::as_array)
            .is_some_and(|a| !a.is_empty())
    };

    if protocol.is_icmp() {
        if !present(attr::ICMP_TYPE) || !present(attr::ICMP_CODE) {
            diagnostics.push(
                Diagnostic::error(format!("{} rules require icmp_type and icmp_code", protocol))
                    .with_attribute(path),
            );
        }
    } else if present(attr::ICMP_TYPE) || present(attr::ICMP_CODE) {
        let summary = format!("icmp_type and icmp_code are ignored for {} rules", protocol);
        diagnostics.push(Diagnostic::warning(summary).with_attribute(path));
    }

    if protocol.uses_ports() {
        if !non_empty(attr::PORTS) {
            diagnostics.push(
                Diagnostic::error(format!("{} rules require at least one port range", protocol))
                    .with_attribute(join_path(path, attr::PORTS)),
            );
        }
    } else if non_empty(attr::PORTS) {
        diagnostics.push(
            Diagnostic::warning(format!("ports are ignored for {} rules", protocol))
                .with_attribute(join_path(path, attr::PORTS)),
        );
    }

    if !non_empty(attr::CIDR_LIST) && !non_empty(attr::USER_SECURITY_GROUP_LIST) {
        diagnostics.push(
            Diagnostic::warning("rule has no peer and will not match any traffic")
                .with_detail(format!(
                    "set {} or {}",
                    attr::CIDR_LIST,
                    attr::USER_SECURITY_GROUP_LIST
                ))
                .with_attribute(path),
        );
    }
}

fn validate_block(block: &Block, value: &Value, path: &str, diagnostics: &mut Vec<Diagnostic>) {
    let obj = match value {
        Value::Object(map) => map,
        Value::Null => return,
        _ => {
            let diagnostic = Diagnostic::error("Expected object")
                .with_detail(format!("Got {}", value_type_name(value)));
            diagnostics.push(if path.is_empty() {
                diagnostic
            } else {
                diagnostic.with_attribute(path)
            });
            return;
        }
    };

    let is_present = |name: &str| obj.get(name).is_some_and(|v| !v.is_null());

    for (name, attr) in &block.attributes {
        let attr_path = join_path(path, name);
        validate_attribute(attr, obj.get(name), &attr_path, diagnostics);

        if is_present(name) {
            for other in attr.conflicts_with.iter().filter(|o| is_present(o)) {
                diagnostics.push(
                    Diagnostic::error(format!("'{}' conflicts with '{}'", name, other))
                        .with_attribute(&attr_path),
                );
            }
        }
    }

    for (name, nested) in &block.blocks {
        let block_path = join_path(path, name);
        validate_nested_block(nested, obj.get(name), &block_path, diagnostics);
    }
}

fn validate_attribute(
    attr: &Attribute,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if attr.flags.computed && !attr.flags.optional {
        return;
    }

    if let Some(v) = value.filter(|v| !v.is_null()) {
        let before = diagnostics.len();
        validate_attribute_type(&attr.attr_type, v, path, diagnostics);
        if diagnostics.len() == before {
            apply_validators(&attr.validators, v, path, diagnostics);
        }
    }
}

fn validate_attribute_type(
    attr_type: &AttributeType,
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match attr_type {
        AttributeType::String => {
            if !value.is_string() {
                diagnostics.push(type_error(path, "string", value));
            }
        }
        AttributeType::Int64 => {
            if !is_int64(value) {
                diagnostics.push(type_error(path, "int64", value));
            }
        }
        AttributeType::Set(element_type) => {
            // Sets are represented as arrays in JSON
            if let Some(arr) = value.as_array() {
                for (i, elem) in arr.iter().enumerate() {
                    let elem_path = format!("{}.{}", path, i);
                    validate_attribute_type(element_type, elem, &elem_path, diagnostics);
                }
            } else {
                diagnostics.push(type_error(path, "set", value));
            }
        }
    }
}

/// Validators apply to scalars directly and to each element of a set.
fn apply_validators(
    validators: &[Validator],
    value: &Value,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if let Value::Array(elements) = value {
        for (i, elem) in elements.iter().enumerate() {
            apply_validators(validators, elem, &format!("{}.{}", path, i), diagnostics);
        }
        return;
    }

    for validator in validators {
        if let Err(detail) = check(validator, value) {
            diagnostics.push(
                Diagnostic::error(format!("Invalid value for attribute '{}'", path))
                    .with_detail(detail)
                    .with_attribute(path),
            );
        }
    }
}

fn check(validator: &Validator, value: &Value) -> Result<(), String> {
    match validator {
        Validator::CidrNetwork => {
            let cidr = value.as_str().unwrap_or_default();
            parse_network(cidr).map(|_| ()).map_err(|e| e.message().to_string())
        }
        Validator::IntBetween { min, max } => match as_int64(value) {
            Some(n) if (*min..=*max).contains(&n) => Ok(()),
            _ => Err(format!("expected an integer between {} and {}, got {}", min, max, value)),
        },
        Validator::PortRange => {
            let ports = value.as_str().unwrap_or_default();
            ports
                .parse::<PortRange>()
                .map(|_| ())
                .map_err(|e| e.message().to_string())
        }
        Validator::OneOf {
            values,
            ignore_case,
        } => {
            let s = value.as_str().unwrap_or_default();
            let found = values.iter().any(|v| {
                if *ignore_case {
                    v.eq_ignore_ascii_case(s)
                } else {
                    v == s
                }
            });
            if found {
                Ok(())
            } else {
                Err(format!("expected one of [{}], got {:?}", values.join(", "), s))
            }
        }
    }
}

fn validate_nested_block(
    block: &Block,
    value: Option<&Value>,
    path: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Array(entries)) => {
            for (i, entry) in entries.iter().enumerate() {
                validate_block(block, entry, &format!("{}.{}", path, i), diagnostics);
            }
        }
        Some(v) => {
            diagnostics.push(
                Diagnostic::error(format!("Expected set for block '{}'", path))
                    .with_detail(format!("Got {}", value_type_name(v)))
                    .with_attribute(path),
            );
        }
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", base, name)
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Integers may arrive as whole floats (`60.0`).
fn as_int64(value: &Value) -> Option<i64> {
    let Value::Number(n) = value else {
        return None;
    };
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn is_int64(value: &Value) -> bool {
    as_int64(value).is_some()
}

fn type_error(path: &str, expected: &str, got: &Value) -> Diagnostic {
    Diagnostic::error(format!("Invalid type for attribute '{}'", path))
        .with_detail(format!("Expected {}, got {}", expected, value_type_name(got)))
        .with_attribute(path)
}
