//! Built-in policy material that ships with ACP.
//!
//! Two things live here: the default policy used when `policy.yml` is
//! absent, and the safe-host allowlist of well-known provider hosts that
//! gets prepended at startup so approved infrastructure traffic never
//! prompts.

use crate::policy::types::Rule;

/// Default policy when the runtime user has no `policy.yml` yet:
/// everything prompts.
pub const DEFAULT_POLICY_YAML: &str = r#"# ACP policy
# Every destination prompts unless a rule decides first.
# Put specific denies above broader asks — first match wins.

default: ask

rules:
  # Package registries are a constant source of prompts during installs;
  # uncomment to wave them through.
  # - match: { kind: http, host: "registry.npmjs.org" }
  #   action: allow
  # - match: { kind: http, host: "*.crates.io" }
  #   action: allow
"#;

/// Hosts the wrapped agent needs to reach to function at all: the model
/// provider APIs and their telemetry endpoints. Prompting for these would
/// train the operator to approve without reading.
pub const SAFE_HOSTS: &[&str] = &[
    "api.anthropic.com",
    "statsig.anthropic.com",
    "sentry.io",
    "api.openai.com",
    "generativelanguage.googleapis.com",
];

/// The consent channel's own API host, per channel name. Without this a
/// Telegram-channelled gate would need an approval to deliver the approval
/// request.
pub fn channel_host(channel: &str) -> Option<&'static str> {
    match channel {
        "telegram" => Some("api.telegram.org"),
        _ => None,
    }
}

/// Allowlist rules in prepend order: callers prepend one at a time, so the
/// list is reversed to keep the declared priority.
pub fn safe_host_rules(channel: &str) -> Vec<Rule> {
    let mut hosts: Vec<&str> = SAFE_HOSTS.to_vec();
    if let Some(extra) = channel_host(channel) {
        hosts.push(extra);
    }
    hosts.iter().rev().map(|h| Rule::allow_host(h)).collect()
}
