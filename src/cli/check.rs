//! `acp check` — validate a policy file and show its rule order.

use crate::policy::{parser, PolicyEngine};
use anyhow::Result;
use colored::Colorize;
use std::path::Path;

pub fn run_check(policy_path: &Path) -> Result<()> {
    let policy = parser::parse_policy_file(policy_path)?;
    let engine = PolicyEngine::new(policy.clone())?;

    println!();
    println!("  {} Policy is valid!", "✓".green().bold());
    println!("  Default: {}", policy.default.to_string().cyan());
    if !policy.wrap.is_empty() {
        println!("  Wrap:    {}", policy.wrap.join(", ").dimmed());
    }
    println!("  Rules:   {}", engine.rule_count());
    println!();
    for (i, rule) in policy.rules.iter().enumerate() {
        println!("  {}. {}", i + 1, rule.describe());
    }
    println!();
    Ok(())
}
