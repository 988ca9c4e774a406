//! Core types for the ACP policy engine.
//!
//! These types define the structure of policies, rules, actions, and verdicts
//! that form the heart of ACP's egress mediation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The category of thing an agent is attempting.
/// The egress core only ever constructs `Http`; `Shell` exists for the
/// adjacent command-wrapping pathway and for cross-kind rule safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// An outbound HTTP request or HTTPS CONNECT tunnel.
    Http,
    /// A wrapped shell command (opaque to this core).
    Shell,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Http => write!(f, "http"),
            ActionKind::Shell => write!(f, "shell"),
        }
    }
}

impl ActionKind {
    /// Parse a kind from a string (used during YAML parsing).
    pub fn from_str_loose(s: &str) -> Option<ActionKind> {
        match s.to_lowercase().trim() {
            "http" | "network" | "net" => Some(ActionKind::Http),
            "shell" | "cmd" | "command" => Some(ActionKind::Shell),
            _ => None,
        }
    }
}

/// What the agent wants to do on the wire. One per proxied request.
///
/// Invariant: `host` is always lower-cased, trimmed of any default port
/// suffix, and non-empty. Construct through [`Action::http`] to keep it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    /// DNS name or literal address as parsed from the request.
    pub host: String,
    /// HTTP method for plain requests; the literal `"CONNECT"` for tunnels.
    pub method: String,
    /// Destination port (80 for plain HTTP, 443 for CONNECT by default).
    pub port: u16,
    /// Full request URL for plain HTTP; absent for CONNECT tunnels.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Action {
    /// Build an HTTP action with a canonicalised host.
    pub fn http(host: &str, method: &str, port: u16, url: Option<String>) -> Self {
        Self {
            kind: ActionKind::Http,
            host: canonical_host(host),
            method: method.to_uppercase(),
            port,
            url,
        }
    }

    /// One-line summary for prompts and logs.
    pub fn describe(&self) -> String {
        match &self.url {
            Some(url) => format!("{} {}", self.method, url),
            None => format!("{} {}:{}", self.method, self.host, self.port),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Canonicalise a host for matching and caching: lower-case, trimmed,
/// stripped of a trailing dot.
pub fn canonical_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}

/// For a host `H`, either `www.H` (no `www.` prefix) or `H` with `www.`
/// stripped. Applied to the approval cache so that approving one form
/// covers the other.
pub fn host_twin(host: &str) -> String {
    match host.strip_prefix("www.") {
        Some(bare) => bare.to_string(),
        None => format!("www.{host}"),
    }
}

/// The outcome of the gate: allow or deny, with a human-readable reason.
/// A verdict is terminal — once produced, the proxy commits to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Verdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision == Decision::Allow
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decision {
            Decision::Allow => write!(f, "allow: {}", self.reason),
            Decision::Deny => write!(f, "deny: {}", self.reason),
        }
    }
}

/// What a matched rule (or the default) tells the gate to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Deny,
    Ask,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Deny => write!(f, "deny"),
            RuleAction::Ask => write!(f, "ask"),
        }
    }
}

/// The match half of a rule. Every specified field must match the action
/// (AND logic); unspecified fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Exact kind. A rule targeting `kind: http` never matches a non-http
    /// action, whatever the other fields say.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ActionKind>,

    /// Host glob: `*` matches any sequence (including empty), `?` any
    /// single character; case-insensitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Exact method, case-insensitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Exact port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl RuleMatch {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.host.is_none() && self.method.is_none() && self.port.is_none()
    }
}

/// A single rule. Rules are evaluated in order — first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "match", default, skip_serializing_if = "RuleMatch::is_empty")]
    pub matcher: RuleMatch,
    pub action: RuleAction,
    /// Per-rule bound (seconds) on how long the consent channel may wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Rule {
    /// A rule that allows a single exact host, any method, any port.
    /// Used for the built-in safe-host allowlist.
    pub fn allow_host(host: &str) -> Self {
        Self {
            matcher: RuleMatch {
                kind: Some(ActionKind::Http),
                host: Some(canonical_host(host)),
                method: None,
                port: None,
            },
            action: RuleAction::Allow,
            timeout: None,
        }
    }

    /// Human-readable description (used in verdicts and `acp check`).
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(kind) = self.matcher.kind {
            parts.push(format!("kind={kind}"));
        }
        if let Some(ref host) = self.matcher.host {
            parts.push(format!("host={host}"));
        }
        if let Some(ref method) = self.matcher.method {
            parts.push(format!("method={method}"));
        }
        if let Some(port) = self.matcher.port {
            parts.push(format!("port={port}"));
        }
        if parts.is_empty() {
            format!("{}:any", self.action)
        } else {
            format!("{}:{}", self.action, parts.join(","))
        }
    }
}

/// A complete policy: a default action and rules in priority order.
/// The `wrap` list belongs to the shell-wrapping pathway and is carried
/// through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub default: RuleAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wrap: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
}
