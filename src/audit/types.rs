//! Types for the ACP audit log.
//!
//! Every gated action produces exactly one entry — allowed, denied, cached,
//! or timed out. The log is the only durable record of what the human was
//! asked and what they said.

use crate::policy::types::{Action, Decision, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry in `audit.jsonl`. One JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the verdict was produced.
    pub timestamp: DateTime<Utc>,

    pub action: AuditAction,

    pub verdict: Verdict,
}

/// The action as recorded: a display name plus the full wire metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAction {
    /// Display name — the HTTP method ("GET", "CONNECT", ...).
    pub name: String,

    /// The canonical action record.
    pub meta: Action,

    /// Argv for wrapped shell actions. Absent (not null) when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
}

impl AuditEntry {
    pub fn new(action: &Action, verdict: &Verdict) -> Self {
        Self {
            timestamp: Utc::now(),
            action: AuditAction {
                name: action.method.clone(),
                meta: action.clone(),
                args: None,
            },
            verdict: verdict.clone(),
        }
    }

    pub fn is_allow(&self) -> bool {
        self.verdict.decision == Decision::Allow
    }
}

/// Aggregate counts for `acp log --summary`.
#[derive(Debug, Clone, Default)]
pub struct AuditSummary {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl AuditSummary {
    pub fn one_line(&self) -> String {
        format!(
            "{} decisions | {} allowed | {} denied",
            self.total, self.allowed, self.denied
        )
    }
}
