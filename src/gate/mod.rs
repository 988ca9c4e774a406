//! The consent gate — the single decision function for every action.
//!
//! Flow: host-approval cache → policy → consent channel. Everything the
//! gate decides is audited, and every uncertain path ends in deny: the
//! gate has no default allow branch and never returns an error upward.
//!
//! A short-TTL cache remembers hosts the human explicitly approved, so a
//! burst of requests to one site costs one prompt. Approving a host also
//! covers its `www.` twin. Concurrent asks for the same host coalesce:
//! the first caller issues the prompt, later callers wait on its verdict.

use crate::audit::{AuditEntry, AuditSink};
use crate::channel::ConsentChannel;
use crate::policy::types::{host_twin, Action, ActionKind, RuleAction, Verdict};
use crate::policy::PolicyEngine;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Default lifetime of a cached host approval.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(180);

/// Default bound on a consent channel wait when no rule sets one.
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ConsentGate {
    engine: PolicyEngine,
    channel: Arc<dyn ConsentChannel>,
    audit: Arc<AuditSink>,
    ttl: Duration,
    default_ask_timeout: Duration,
    /// host → expiry. Lazily evicted on read; cardinality is tens of hosts.
    approvals: Mutex<HashMap<String, Instant>>,
    /// hosts with an ask in flight. The critical section only registers or
    /// looks up a waiter — never held across an await.
    pending: Mutex<HashMap<String, watch::Receiver<Option<Verdict>>>>,
}

enum AskRole {
    Leader(watch::Sender<Option<Verdict>>),
    Follower(watch::Receiver<Option<Verdict>>),
}

impl ConsentGate {
    pub fn new(
        engine: PolicyEngine,
        channel: Arc<dyn ConsentChannel>,
        audit: Arc<AuditSink>,
    ) -> Self {
        Self {
            engine,
            channel,
            audit,
            ttl: DEFAULT_APPROVAL_TTL,
            default_ask_timeout: DEFAULT_ASK_TIMEOUT,
            approvals: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.default_ask_timeout = timeout;
        self
    }

    /// Decide an action. Infallible: every internal failure degrades to a
    /// deny verdict with a reason naming the failure mode.
    pub async fn decide(&self, action: &Action) -> Verdict {
        let verdict = self.decide_inner(action).await;
        self.write_audit(action, &verdict);
        verdict
    }

    async fn decide_inner(&self, action: &Action) -> Verdict {
        if action.kind == ActionKind::Http && self.is_cached(&action.host) {
            return Verdict::allow("cached host approval");
        }

        let eval = self.engine.evaluate(action);
        match eval.action {
            RuleAction::Allow => {
                let reason = match eval.rule {
                    Some(rule) => format!("policy rule {rule}"),
                    None => "policy default allow".to_string(),
                };
                Verdict::allow(reason)
            }
            RuleAction::Deny => {
                let reason = match eval.rule {
                    Some(rule) => format!("policy rule {rule}"),
                    None => "policy default deny".to_string(),
                };
                Verdict::deny(reason)
            }
            RuleAction::Ask => {
                let timeout = eval.timeout.unwrap_or(self.default_ask_timeout);
                self.ask_coalesced(action, timeout).await
            }
        }
    }

    /// Ask the channel, coalescing concurrent asks for the same host onto
    /// a single prompt. All waiters receive the leader's verdict.
    async fn ask_coalesced(&self, action: &Action, timeout: Duration) -> Verdict {
        let role = {
            let mut pending = match self.pending.lock() {
                Ok(guard) => guard,
                Err(_) => return Verdict::deny("consent gate internal error (lock poisoned)"),
            };
            match pending.get(&action.host) {
                Some(rx) => AskRole::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    pending.insert(action.host.clone(), rx);
                    AskRole::Leader(tx)
                }
            }
        };

        match role {
            AskRole::Leader(tx) => {
                let verdict = self.run_ask(action, timeout).await;
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&action.host);
                }
                let _ = tx.send(Some(verdict.clone()));
                verdict
            }
            AskRole::Follower(mut rx) => {
                debug!(host = %action.host, "coalescing onto pending consent request");
                loop {
                    if let Some(verdict) = rx.borrow_and_update().clone() {
                        return verdict;
                    }
                    if rx.changed().await.is_err() {
                        return Verdict::deny("pending consent request aborted");
                    }
                }
            }
        }
    }

    async fn run_ask(&self, action: &Action, timeout: Duration) -> Verdict {
        // Channels honour the deadline themselves; the outer timeout makes
        // the fail-closed invariant hold even against one that does not.
        let asked = tokio::time::timeout(timeout, self.channel.ask(action, timeout)).await;
        match asked {
            Ok(Ok(reply)) if reply.approved => {
                if action.kind == ActionKind::Http {
                    self.insert_approval(&action.host);
                }
                Verdict::allow(reply.reason)
            }
            Ok(Ok(reply)) => Verdict::deny(reply.reason),
            Ok(Err(e)) => Verdict::deny(e.to_string()),
            Err(_) => Verdict::deny("consent request timed out"),
        }
    }

    /// Cache hit iff the expiry is strictly in the future: an entry at
    /// exactly `expires_at` is expired.
    fn is_cached(&self, host: &str) -> bool {
        let now = Instant::now();
        match self.approvals.lock() {
            Ok(mut approvals) => match approvals.get(host) {
                Some(&expires_at) if expires_at > now => true,
                Some(_) => {
                    approvals.remove(host);
                    false
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Remember an approval for the host and its twin. A re-approval
    /// before expiry refreshes both to `now + ttl`.
    fn insert_approval(&self, host: &str) {
        let expires_at = Instant::now() + self.ttl;
        if let Ok(mut approvals) = self.approvals.lock() {
            approvals.retain(|_, &mut exp| exp > Instant::now());
            approvals.insert(host.to_string(), expires_at);
            approvals.insert(host_twin(host), expires_at);
        }
    }

    /// Audit failure never blocks or reverses the verdict.
    fn write_audit(&self, action: &Action, verdict: &Verdict) {
        let entry = AuditEntry::new(action, verdict);
        if let Err(e) = self.audit.append(&entry) {
            warn!(error = %e, host = %action.host, "failed to write audit entry");
        }
    }

    /// Number of live cached approvals (test hook).
    #[cfg(test)]
    fn cached_hosts(&self) -> usize {
        let now = Instant::now();
        self.approvals
            .lock()
            .map(|a| a.values().filter(|&&exp| exp > now).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AutoApprove, AutoDeny};
    use crate::policy::parser::parse_policy_str;
    use tempfile::TempDir;

    fn gate_with(channel: Arc<dyn ConsentChannel>, yaml: &str) -> (ConsentGate, TempDir) {
        let tmp = TempDir::new().unwrap();
        let audit = Arc::new(AuditSink::open(tmp.path().join("audit.jsonl")).unwrap());
        let engine = PolicyEngine::new(parse_policy_str(yaml).unwrap()).unwrap();
        (ConsentGate::new(engine, channel, audit), tmp)
    }

    fn connect(host: &str) -> Action {
        Action::http(host, "CONNECT", 443, None)
    }

    #[tokio::test]
    async fn test_allow_rule_skips_channel() {
        let (gate, _tmp) = gate_with(
            Arc::new(AutoDeny),
            r#"
default: ask
rules:
  - match: { kind: http, host: "api.anthropic.com" }
    action: allow
"#,
        );

        // AutoDeny would refuse if the channel were consulted.
        let verdict = gate.decide(&connect("api.anthropic.com")).await;
        assert!(verdict.is_allow());
        assert!(verdict.reason.contains("policy rule"));
    }

    #[tokio::test]
    async fn test_approval_caches_host_and_twin() {
        let (gate, _tmp) = gate_with(Arc::new(AutoApprove), "default: ask\n");

        let verdict = gate.decide(&connect("google.com")).await;
        assert!(verdict.is_allow());
        assert_eq!(gate.cached_hosts(), 2);

        let twin = gate.decide(&connect("www.google.com")).await;
        assert!(twin.is_allow());
        assert!(twin.reason.contains("cached host approval"));
    }

    #[tokio::test]
    async fn test_deny_not_cached() {
        let (gate, _tmp) = gate_with(Arc::new(AutoDeny), "default: ask\n");

        let verdict = gate.decide(&connect("example.com")).await;
        assert!(!verdict.is_allow());
        assert_eq!(gate.cached_hosts(), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_prompts_again() {
        let (gate, _tmp) = gate_with(Arc::new(AutoApprove), "default: ask\n");
        let gate = gate.with_ttl(Duration::from_millis(20));

        gate.decide(&connect("example.com")).await;
        assert!(gate.is_cached("example.com"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!gate.is_cached("example.com"));
        assert!(!gate.is_cached("www.example.com"));
    }

    #[tokio::test]
    async fn test_entry_at_exact_expiry_is_expired() {
        let (gate, _tmp) = gate_with(Arc::new(AutoApprove), "default: ask\n");
        let now = Instant::now();
        gate.approvals
            .lock()
            .unwrap()
            .insert("edge.com".to_string(), now);
        assert!(!gate.is_cached("edge.com"));
    }
}
