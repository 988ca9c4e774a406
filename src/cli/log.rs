//! `acp log` — browse the audit trail.

use crate::audit::{AuditFilter, AuditReader};
use crate::policy::types::Decision;
use anyhow::{bail, Result};
use colored::Colorize;
use std::path::Path;

pub fn run_log(
    audit_path: &Path,
    decision: Option<&str>,
    limit: Option<usize>,
    summary_only: bool,
) -> Result<()> {
    let decision = match decision {
        None => None,
        Some("allow") | Some("allowed") => Some(Decision::Allow),
        Some("deny") | Some("denied") => Some(Decision::Deny),
        Some(other) => bail!("Unknown decision filter '{other}' (expected allow or deny)"),
    };

    let reader = AuditReader::new(audit_path);
    let entries = reader.read_filtered(&AuditFilter { decision, limit })?;

    if entries.is_empty() {
        println!();
        println!("  No audit entries at {}", audit_path.display().to_string().dimmed());
        println!();
        return Ok(());
    }

    let summary = AuditReader::summarize(&entries);

    if !summary_only {
        println!();
        for entry in &entries {
            let marker = if entry.is_allow() {
                "✓".green()
            } else {
                "✗".red()
            };
            println!(
                "  {} {}  {}  {}",
                marker,
                entry.timestamp.format("%H:%M:%S").to_string().dimmed(),
                entry.action.meta.describe(),
                entry.verdict.reason.as_str().dimmed(),
            );
        }
    }

    println!();
    println!("  {}", summary.one_line().bold());
    println!();
    Ok(())
}
