//! YAML policy parser for ACP.
//!
//! Parses `policy.yml` into the internal [`Policy`] struct. The format is
//! intentionally small: a default action, an opaque `wrap` list, and an
//! ordered list of match/action rules.
//!
//! # Example policy file:
//! ```yaml
//! default: ask
//! wrap: [git, npm]
//! rules:
//!   - match: { kind: http, host: "*.example.com", method: "GET", port: 443 }
//!     action: allow
//!     timeout: 120
//!   - match: { host: "*.evil.com" }
//!     action: deny
//! ```
//!
//! Unknown keys anywhere in the document are a parse-time error: a typoed
//! field in a security policy must not be silently ignored.

use crate::policy::types::*;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Raw YAML representation before conversion to internal types.
/// Kept separate so validation errors can say which rule is wrong.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPolicy {
    default: String,
    #[serde(default)]
    wrap: Vec<String>,
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(rename = "match", default)]
    matcher: Option<RawMatch>,
    action: String,
    #[serde(default)]
    timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMatch {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    method: Option<String>,
    // Parsed wide so that 0 and 65536 produce a range error, not a serde
    // integer-overflow message.
    #[serde(default)]
    port: Option<u32>,
}

/// Parse a YAML policy file from a file path.
pub fn parse_policy_file(path: impl AsRef<Path>) -> Result<Policy> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file: {}", path.display()))?;
    parse_policy_str(&content)
        .with_context(|| format!("Failed to parse policy file: {}", path.display()))
}

/// Parse a YAML policy string into a [`Policy`].
pub fn parse_policy_str(yaml: &str) -> Result<Policy> {
    let raw: RawPolicy = serde_yaml::from_str(yaml).context("Invalid YAML in policy file")?;

    let default = parse_rule_action(&raw.default)
        .with_context(|| format!("Invalid default action '{}'", raw.default))?;

    let mut rules = Vec::with_capacity(raw.rules.len());
    for (i, raw_rule) in raw.rules.into_iter().enumerate() {
        let rule =
            convert_rule(raw_rule).with_context(|| format!("Invalid rule at position {i}"))?;
        rules.push(rule);
    }

    Ok(Policy {
        default,
        wrap: raw.wrap,
        rules,
    })
}

fn parse_rule_action(s: &str) -> Result<RuleAction> {
    match s.to_lowercase().trim() {
        "allow" => Ok(RuleAction::Allow),
        "deny" => Ok(RuleAction::Deny),
        "ask" => Ok(RuleAction::Ask),
        other => bail!("Unknown action '{other}' (expected allow, deny, or ask)"),
    }
}

fn convert_rule(raw: RawRule) -> Result<Rule> {
    let action = parse_rule_action(&raw.action)?;

    let matcher = match raw.matcher {
        None => RuleMatch::default(),
        Some(m) => {
            let kind = match m.kind {
                None => None,
                Some(ref s) => Some(
                    ActionKind::from_str_loose(s)
                        .ok_or_else(|| anyhow::anyhow!("Unknown kind '{s}'"))?,
                ),
            };

            let port = match m.port {
                None => None,
                Some(p) => {
                    if !(1..=65535).contains(&p) {
                        bail!("Port {p} out of range (expected 1..=65535)");
                    }
                    Some(p as u16)
                }
            };

            let host = match m.host {
                None => None,
                Some(ref pattern) => {
                    let pattern = pattern.trim();
                    if pattern.is_empty() {
                        bail!("Host pattern must not be empty");
                    }
                    // Compile once here so a malformed glob fails at parse
                    // time, not on the first matching request.
                    crate::policy::engine::compile_host_glob(pattern)
                        .with_context(|| format!("Invalid host pattern '{pattern}'"))?;
                    Some(pattern.to_lowercase())
                }
            };

            RuleMatch {
                kind,
                host,
                method: m.method.map(|s| s.to_uppercase()),
                port,
            }
        }
    };

    if raw.timeout == Some(0) {
        bail!("Rule timeout must be greater than zero");
    }

    Ok(Rule {
        matcher,
        action,
        timeout: raw.timeout,
    })
}

/// Serialize a policy back to YAML (used by `acp check --print` and tests).
pub fn serialize_policy(policy: &Policy) -> Result<String> {
    serde_yaml::to_string(policy).context("Failed to serialize policy")
}
