//! Policy decision engine.
//!
//! Evaluates actions against a policy's rules and returns what the gate
//! should do: allow, deny, or ask the human.
//!
//! Rules are evaluated **in order** — first match wins. This is the same
//! model as firewall rules and feels intuitive: put your most specific
//! rules first, general rules last. Host globs are pre-compiled at policy
//! load time, not per-request.

use crate::policy::types::*;
use anyhow::Result;
use globset::{GlobBuilder, GlobMatcher};
use std::time::Duration;

/// What the engine tells the gate to do with an action.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub action: RuleAction,
    /// Description of the rule that decided; `None` means the default applied.
    pub rule: Option<String>,
    /// Per-rule bound on the consent channel wait, if the rule set one.
    pub timeout: Option<Duration>,
}

/// Pre-compiled policy engine ready for fast evaluation.
/// Created once at startup, then used for every proxied request.
pub struct PolicyEngine {
    policy: Policy,
    compiled: Vec<CompiledRule>,
}

struct CompiledRule {
    rule: Rule,
    host_glob: Option<GlobMatcher>,
}

/// Compile a host pattern: `*` matches any sequence including empty, `?`
/// any single character, matching is case-insensitive. Hostnames have no
/// path separators, so the glob is compiled without one.
pub fn compile_host_glob(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(false)
        .build()?
        .compile_matcher())
}

impl PolicyEngine {
    /// Create a new engine from a parsed policy.
    /// Compiles all host globs upfront.
    pub fn new(policy: Policy) -> Result<Self> {
        let compiled = policy
            .rules
            .iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { policy, compiled })
    }

    /// Insert a rule at highest priority. Used once at startup to seed the
    /// built-in safe-host allowlist.
    pub fn prepend(&mut self, rule: Rule) -> Result<()> {
        let compiled = compile_rule(&rule)?;
        self.policy.rules.insert(0, rule);
        self.compiled.insert(0, compiled);
        Ok(())
    }

    /// Evaluate an action against the policy. First match wins; if no rule
    /// matches, the policy default applies.
    pub fn evaluate(&self, action: &Action) -> Evaluation {
        for compiled in &self.compiled {
            if rule_matches(compiled, action) {
                return Evaluation {
                    action: compiled.rule.action,
                    rule: Some(compiled.rule.describe()),
                    timeout: compiled.rule.timeout.map(Duration::from_secs),
                };
            }
        }

        Evaluation {
            action: self.policy.default,
            rule: None,
            timeout: None,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn rule_count(&self) -> usize {
        self.compiled.len()
    }
}

fn compile_rule(rule: &Rule) -> Result<CompiledRule> {
    let host_glob = match rule.matcher.host {
        Some(ref pattern) => Some(compile_host_glob(pattern)?),
        None => None,
    };
    Ok(CompiledRule {
        rule: rule.clone(),
        host_glob,
    })
}

/// A rule matches iff every specified field in its matcher matches the
/// action. A rule whose matcher targets `kind: http` never matches a
/// non-http action, even if the other fields coincide.
fn rule_matches(compiled: &CompiledRule, action: &Action) -> bool {
    let matcher = &compiled.rule.matcher;

    if let Some(kind) = matcher.kind {
        if kind != action.kind {
            return false;
        }
    }

    if let Some(ref glob) = compiled.host_glob {
        if !glob.is_match(&action.host) {
            return false;
        }
    }

    if let Some(ref method) = matcher.method {
        if !method.eq_ignore_ascii_case(&action.method) {
            return false;
        }
    }

    if let Some(port) = matcher.port {
        if port != action.port {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::parser::parse_policy_str;

    fn make_engine(yaml: &str) -> PolicyEngine {
        let policy = parse_policy_str(yaml).unwrap();
        PolicyEngine::new(policy).unwrap()
    }

    fn connect(host: &str) -> Action {
        Action::http(host, "CONNECT", 443, None)
    }

    #[test]
    fn test_first_match_wins() {
        let engine = make_engine(
            r#"
default: ask
rules:
  - match: { kind: http, host: "*.evil.com" }
    action: deny
  - match: { kind: http }
    action: ask
"#,
        );

        let eval = engine.evaluate(&connect("x.evil.com"));
        assert_eq!(eval.action, RuleAction::Deny);
        assert!(eval.rule.unwrap().contains("*.evil.com"));

        let eval = engine.evaluate(&connect("github.com"));
        assert_eq!(eval.action, RuleAction::Ask);
    }

    #[test]
    fn test_default_applies_when_no_rule_matches() {
        let engine = make_engine(
            r#"
default: deny
rules:
  - match: { host: "github.com" }
    action: allow
"#,
        );

        let eval = engine.evaluate(&connect("example.com"));
        assert_eq!(eval.action, RuleAction::Deny);
        assert!(eval.rule.is_none());
    }

    #[test]
    fn test_host_glob_semantics() {
        let engine = make_engine(
            r#"
default: ask
rules:
  - match: { host: "*.example.com" }
    action: allow
  - match: { host: "api?.backend.io" }
    action: allow
"#,
        );

        // `*` matches any sequence including empty
        assert_eq!(
            engine.evaluate(&connect("a.example.com")).action,
            RuleAction::Allow
        );
        assert_eq!(
            engine.evaluate(&connect("deep.sub.example.com")).action,
            RuleAction::Allow
        );
        // but the bare apex does not carry the dot
        assert_eq!(
            engine.evaluate(&connect("example.com")).action,
            RuleAction::Ask
        );

        // `?` matches exactly one character
        assert_eq!(
            engine.evaluate(&connect("api1.backend.io")).action,
            RuleAction::Allow
        );
        assert_eq!(
            engine.evaluate(&connect("api12.backend.io")).action,
            RuleAction::Ask
        );
    }

    #[test]
    fn test_host_match_case_insensitive() {
        let engine = make_engine(
            r#"
default: ask
rules:
  - match: { host: "GitHub.com" }
    action: allow
"#,
        );
        assert_eq!(
            engine.evaluate(&connect("github.com")).action,
            RuleAction::Allow
        );
    }

    #[test]
    fn test_method_and_port_match() {
        let engine = make_engine(
            r#"
default: ask
rules:
  - match: { method: "get", port: 443 }
    action: allow
"#,
        );

        let hit = Action::http("x.com", "GET", 443, None);
        assert_eq!(engine.evaluate(&hit).action, RuleAction::Allow);

        let wrong_port = Action::http("x.com", "GET", 8443, None);
        assert_eq!(engine.evaluate(&wrong_port).action, RuleAction::Ask);

        let wrong_method = Action::http("x.com", "POST", 443, None);
        assert_eq!(engine.evaluate(&wrong_method).action, RuleAction::Ask);
    }

    #[test]
    fn test_no_cross_kind_leakage() {
        let engine = make_engine(
            r#"
default: deny
rules:
  - match: { kind: http, host: "*" }
    action: allow
"#,
        );

        let shell = Action {
            kind: ActionKind::Shell,
            host: "github.com".to_string(),
            method: "EXEC".to_string(),
            port: 0,
            url: None,
        };
        assert_eq!(engine.evaluate(&shell).action, RuleAction::Deny);
    }

    #[test]
    fn test_prepend_takes_priority() {
        let mut engine = make_engine(
            r#"
default: ask
rules:
  - match: { host: "api.anthropic.com" }
    action: deny
"#,
        );
        engine.prepend(Rule::allow_host("api.anthropic.com")).unwrap();

        let eval = engine.evaluate(&connect("api.anthropic.com"));
        assert_eq!(eval.action, RuleAction::Allow);
        assert_eq!(engine.rule_count(), 2);
    }

    #[test]
    fn test_rule_timeout_surfaced() {
        let engine = make_engine(
            r#"
default: ask
rules:
  - match: { host: "slow.example.com" }
    action: ask
    timeout: 120
"#,
        );
        let eval = engine.evaluate(&connect("slow.example.com"));
        assert_eq!(eval.timeout, Some(Duration::from_secs(120)));
    }
}
