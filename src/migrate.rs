//! Versioned state migrations.
//!
//! Older releases stored identifiers that no longer match what the backing
//! service reports. Each migration step rewrites the stored `ids` (and the
//! attributes they were derived from) so existing rules are recognized after
//! an upgrade instead of being recreated.
//!
//! - **v0 → v1**: a start port of `0` is reported back as `1`.
//! - **v1 → v2**: peer security group names are reported lower-cased.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, RulesError};
use crate::state::attr;
use crate::types::Direction;

/// Current schema version of the resource.
pub const SCHEMA_VERSION: i64 = 2;

/// Upgrade a raw state object stored at `version` to [`SCHEMA_VERSION`].
pub fn upgrade_state(version: i64, mut state: Value) -> Result<Value> {
    if !(0..=SCHEMA_VERSION).contains(&version) {
        return Err(RulesError::Migration(format!(
            "unsupported state version {} (current version is {})",
            version, SCHEMA_VERSION
        )));
    }

    for from in version..SCHEMA_VERSION {
        debug!(from, to = from + 1, "beginning state migration");
        state = match from {
            0 => upgrade_v0(state)?,
            _ => upgrade_v1(state)?,
        };
        debug!(from, to = from + 1, "done state migration");
    }
    Ok(state)
}

/// Apply `patch` to every rule template of both directions.
fn for_each_template<F>(state: &mut Value, mut patch: F) -> Result<()>
where
    F: FnMut(&mut serde_json::Map<String, Value>),
{
    let Some(object) = state.as_object_mut() else {
        return Err(RulesError::Migration(
            "unable to deserialize state during migration: expected an object".to_string(),
        ));
    };

    for direction in Direction::BOTH {
        let templates = match object.get_mut(direction.as_str()) {
            None | Some(Value::Null) => {
                debug!(%direction, "flow direction not defined, skipping");
                continue;
            }
            Some(Value::Array(templates)) => templates,
            Some(other) => {
                return Err(RulesError::Migration(format!(
                    "unable to deserialize schema during migration (direction = '{}'), state: {}",
                    direction, other
                )))
            }
        };

        for (idx, template) in templates.iter_mut().enumerate() {
            let Some(template) = template.as_object_mut() else {
                return Err(RulesError::Migration(format!(
                    "unable to deserialize rule #{} during migration (direction = '{}')",
                    idx, direction
                )));
            };
            patch(template);
        }
    }
    Ok(())
}

/// Rewrite every string of a list attribute, logging what changed.
fn rewrite_strings<F>(template: &mut serde_json::Map<String, Value>, key: &str, mut rewrite: F)
where
    F: FnMut(&str) -> String,
{
    let Some(Value::Array(values)) = template.get_mut(key) else {
        return;
    };
    for value in values.iter_mut() {
        if let Value::String(old) = value {
            let new = rewrite(old.as_str());
            if new != *old {
                debug!(attribute = key, from = %old, to = %new, "updated rule attribute");
                *old = new;
            }
        }
    }
}

/// Start ports defined as `0` are returned as `1` by the backing service.
fn upgrade_v0(mut state: Value) -> Result<Value> {
    let rule_id = Regex::new(r"^([0-9a-z-]{36}_(?:tcp|udp)_.*)_0(-[0-9]+)?$")?;
    let rule_ports = Regex::new(r"^0-([0-9]+)$")?;

    for_each_template(&mut state, |template| {
        rewrite_strings(template, attr::IDS, |id| {
            rule_id.replace_all(id, "${1}_1${2}").into_owned()
        });
        rewrite_strings(template, attr::PORTS, |ports| {
            rule_ports.replace_all(ports, "1-${1}").into_owned()
        });
    })?;
    Ok(state)
}

/// Mixed-case peer security group names are returned lower-cased.
fn upgrade_v1(mut state: Value) -> Result<Value> {
    let rule_id = Regex::new(r"^([0-9a-z-]{36}_(?:[a-z]+6?)_)(.*)(_[0-9]+-[0-9]+)?$")?;

    for_each_template(&mut state, |template| {
        rewrite_strings(template, attr::IDS, |id| match rule_id.captures(id) {
            Some(caps) => format!(
                "{}{}{}",
                &caps[1],
                caps[2].to_lowercase(),
                caps.get(3).map_or("", |m| m.as_str())
            ),
            None => id.to_string(),
        });
        rewrite_strings(template, attr::USER_SECURITY_GROUP_LIST, str::to_lowercase);
    })?;
    Ok(state)
}
