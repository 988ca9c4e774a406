//! Audit log reader — filter and summarise for the `acp log` command.

use crate::audit::types::{AuditEntry, AuditSummary};
use crate::policy::types::Decision;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub struct AuditReader {
    path: PathBuf,
}

/// Filter criteria for log queries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub decision: Option<Decision>,
    /// Keep only the last N entries (applied after the decision filter).
    pub limit: Option<usize>,
}

impl AuditReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Read all entries. A missing file is an empty log, not an error.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read audit file: {}", self.path.display()))?;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Failed to parse audit entry at line {}", i + 1))
            })
            .collect()
    }

    pub fn read_filtered(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let mut entries = self.read_all()?;

        if let Some(decision) = filter.decision {
            entries.retain(|e| e.verdict.decision == decision);
        }
        if let Some(limit) = filter.limit {
            if entries.len() > limit {
                entries.drain(..entries.len() - limit);
            }
        }
        Ok(entries)
    }

    pub fn summarize(entries: &[AuditEntry]) -> AuditSummary {
        let mut summary = AuditSummary {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            match entry.verdict.decision {
                Decision::Allow => summary.allowed += 1,
                Decision::Deny => summary.denied += 1,
            }
        }
        summary.first = entries.first().map(|e| e.timestamp);
        summary.last = entries.last().map(|e| e.timestamp);
        summary
    }
}
