//! ACP — Agent Consent Proxy
//!
//! Puts a human between an autonomous coding agent and the network.
//! Every destination the agent tries to reach either matches an allow
//! rule or waits for your approval; everything else is refused at the
//! kernel before the first byte leaves the host.
//!
//! Quick start:
//!   sudo acp start claude      # run Claude Code behind the consent proxy
//!   acp log                    # see what it tried to reach
//!
//! For more info: acp --help

// Suppress warnings for items that are public API (used by the lib/tests)
#![allow(dead_code)]

mod agent;
mod audit;
mod channel;
mod cli;
mod config;
mod firewall;
mod gate;
mod policy;
mod proxy;
mod supervisor;

use clap::{Parser, Subcommand};
use cli::start::{StartOptions, DEFAULT_PROXY_PORT};
use colored::Colorize;
use std::path::PathBuf;

/// ACP — human-approved network egress for AI agents.
#[derive(Parser)]
#[command(
    name = "acp",
    version,
    about = "Human-approved network egress for AI agents",
    long_about = "ACP wraps an AI coding agent behind a loopback forward proxy\n\
                  and a fail-closed kernel egress filter. Each new destination\n\
                  prompts you — in the terminal, on Telegram, or via webhook —\n\
                  before the first byte crosses the boundary.\n\n\
                  Quick start:\n  \
                  sudo acp start claude     # run Claude Code behind the proxy\n  \
                  acp log                   # see what it tried to reach"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor and run an agent behind the consent proxy
    Start {
        /// Which agent to wrap: claude, codex, gemini, or a program name
        preset: String,

        /// Workspace directory the agent runs in (default: current dir)
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Config directory (default: ~/.acp of the runtime user)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Non-privileged user the agent runs as (default: $SUDO_USER)
        #[arg(long)]
        runtime_user: Option<String>,

        /// Loopback port for the forward proxy
        #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
        http_proxy_port: u16,

        /// Override the preset's agent command
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Validate a policy file
    Check {
        /// Path to the policy file
        #[arg(default_value = "policy.yml")]
        policy: PathBuf,
    },

    /// Show the audit trail
    Log {
        /// Path to the audit file (default: ~/.acp/audit.jsonl)
        #[arg(long)]
        audit: Option<PathBuf>,

        /// Filter by decision: allow or deny
        #[arg(short, long)]
        decision: Option<String>,

        /// Show only the last N entries
        #[arg(short, long)]
        limit: Option<usize>,

        /// Show only the summary line
        #[arg(long)]
        summary: bool,
    },
}

#[tokio::main]
async fn main() {
    // Only speak up at RUST_LOG=debug level; operator output goes through
    // the styled status lines.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("acp=warn".parse().unwrap()),
        )
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start {
            preset,
            workspace,
            config,
            runtime_user,
            http_proxy_port,
            command,
        } => {
            cli::start::run_start(StartOptions {
                preset,
                workspace,
                config_dir: config,
                runtime_user,
                proxy_port: http_proxy_port,
                command_override: command,
            })
            .await
        }

        Commands::Check { policy } => cli::check::run_check(&policy).map(|()| 0),

        Commands::Log {
            audit,
            decision,
            limit,
            summary,
        } => run_log(audit, decision.as_deref(), limit, summary).map(|()| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!();
            eprintln!("  {} {}", "✗".red().bold(), e);
            for cause in e.chain().skip(1) {
                eprintln!("  {} {}", "caused by:".dimmed(), cause);
            }
            eprintln!();
            std::process::exit(1);
        }
    }
}

fn run_log(
    audit: Option<PathBuf>,
    decision: Option<&str>,
    limit: Option<usize>,
    summary: bool,
) -> anyhow::Result<()> {
    let path = match audit {
        Some(path) => path,
        None => dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?
            .join(".acp")
            .join("audit.jsonl"),
    };
    cli::log::run_log(&path, decision, limit, summary)
}
