//! `acp start` — the lifecycle orchestrator.
//!
//! Wires every component together and owns the shutdown ordering:
//! stop accepting proxy connections, stop the agent, tear down the kernel
//! rules, stop the listener, release the lock, exit with the agent's code.
//!
//! The kernel filter and the supervisor lock are both held through guard
//! types so that every exit path — errors and panics included — attempts
//! their release exactly once.

use crate::agent::{self, AgentSpec};
use crate::audit::AuditSink;
use crate::channel::{ConsentChannel, TelegramChannel, TerminalChannel, WebhookChannel};
use crate::config::{approval_ttl, ChannelKind, Config, ConfigDir};
use crate::firewall::{self, EgressFilter};
use crate::gate::ConsentGate;
use crate::policy::{defaults, parser, PolicyEngine};
use crate::proxy::ProxyServer;
use crate::supervisor::{self, lock::SupervisorLock, RuntimeUser};
use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Default loopback port for the forward proxy.
pub const DEFAULT_PROXY_PORT: u16 = 18080;

#[derive(Debug)]
pub struct StartOptions {
    /// Which agent to wrap: `claude`, `codex`, `gemini`, or a program name.
    pub preset: String,
    pub workspace: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub runtime_user: Option<String>,
    pub proxy_port: u16,
    /// Trailing `-- command…` that overrides the preset's command line.
    pub command_override: Vec<String>,
}

/// Supervisor lifecycle, tracked for the shutdown invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Installing,
    Running,
    Stopping,
    Stopped,
}

/// Pairs the installed kernel table with a guaranteed removal attempt.
/// Removal is attempted exactly once; the Drop arm covers panic and
/// early-error paths where the async removal never ran.
struct FilterGuard {
    installed: bool,
    removal_attempted: bool,
}

impl FilterGuard {
    fn new() -> Self {
        Self {
            installed: false,
            removal_attempted: false,
        }
    }

    async fn remove(&mut self) {
        if !self.installed || self.removal_attempted {
            return;
        }
        self.removal_attempted = true;
        // Removal failure is tolerated: the supervisor still exits, and
        // the next run's idempotent install flushes the leftover table.
        if let Err(e) = firewall::remove().await {
            warn!(error = %e, "kernel filter removal failed");
            eprintln!(
                "  {} could not remove the egress filter table: {e}",
                "⚠".yellow()
            );
        }
    }
}

impl Drop for FilterGuard {
    fn drop(&mut self) {
        if self.installed && !self.removal_attempted {
            self.removal_attempted = true;
            firewall::remove_blocking();
        }
    }
}

/// Run the supervisor. Returns the process exit code.
pub async fn run_start(options: StartOptions) -> Result<i32> {
    let mut state = State::Starting;
    debug!(?state, "supervisor starting");

    // Host preconditions, runtime identity, single-instance lock.
    supervisor::preflight()?;
    let user = resolve_user(&options)?;
    let mut lock = SupervisorLock::acquire(
        std::path::Path::new(supervisor::lock::DEFAULT_LOCK_DIR),
        &user.name,
    )?;

    let config_dir = ConfigDir::resolve(options.config_dir.as_deref(), &user.home);
    std::fs::create_dir_all(config_dir.root())
        .with_context(|| format!("Failed to create {}", config_dir.root().display()))?;

    let config = Config::load(&config_dir.config_file())?;
    let engine = build_engine(&config_dir, &config)?;
    let channel = build_channel(&config);
    let audit = Arc::new(AuditSink::open(config_dir.audit_file())?);

    let workspace = match options.workspace {
        Some(ref dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    println!();
    println!("  {} acp v{}", "⛨".bold(), env!("CARGO_PKG_VERSION"));
    println!("  Agent user: {}", user.name.cyan());
    println!("  Workspace:  {}", workspace.display().to_string().dimmed());
    println!("  Channel:    {}", config.channel.name().cyan());
    println!("  Audit:      {}", audit.path().display().to_string().dimmed());

    let gate = Arc::new(
        ConsentGate::new(engine, channel, Arc::clone(&audit))
            .with_ttl(approval_ttl())
            .with_ask_timeout(Duration::from_secs(config.ask_timeout_secs)),
    );

    // Bind before installing kernel rules: a port conflict must fail fast
    // while the host is still untouched.
    let proxy = ProxyServer::bind(options.proxy_port, Arc::clone(&gate)).await?;
    let proxy_port = proxy.port();
    println!("  Proxy:      {}", format!("127.0.0.1:{proxy_port}").cyan());

    state = State::Installing;
    debug!(?state, "installing egress filter");

    let mut filter_guard = FilterGuard::new();
    if firewall::is_installed().await {
        debug!("leftover egress filter table found; the install will replace it");
    }
    let filter = EgressFilter::new(user.uid, proxy_port, config.dns_servers.clone());
    filter.install().await?;
    filter_guard.installed = true;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_task = tokio::spawn(proxy.run(shutdown_rx));

    state = State::Running;
    debug!(?state, "agent starting");

    let bootstrap = agent::write_bootstrap(config_dir.root());
    let spec = AgentSpec {
        command: agent_command(&options),
        user: user.clone(),
        workspace,
        proxy_port,
        bootstrap,
    };

    println!();
    println!("  {} {}", "▶".green(), spec.command.join(" ").bold());
    println!();

    let exit = agent::run_agent(&spec).await;

    // ── Shutdown ordering ──
    state = State::Stopping;
    debug!(?state, "shutting down");

    let _ = shutdown_tx.send(true);
    filter_guard.remove().await;

    if tokio::time::timeout(Duration::from_secs(5), proxy_task)
        .await
        .is_err()
    {
        warn!("proxy did not stop within the grace period");
    }

    lock.release();

    state = State::Stopped;
    debug!(?state, "supervisor stopped");

    let exit = exit?;
    println!();
    println!(
        "  {} agent exited ({})",
        "■".dimmed(),
        exit.code().to_string().bold()
    );
    Ok(exit.code())
}

fn resolve_user(options: &StartOptions) -> Result<RuntimeUser, supervisor::StartupError> {
    let name = options
        .runtime_user
        .clone()
        .or_else(|| std::env::var("SUDO_USER").ok())
        .unwrap_or_else(|| "agent".to_string());
    supervisor::resolve_runtime_user(&name)
}

fn build_engine(config_dir: &ConfigDir, config: &Config) -> Result<PolicyEngine> {
    let policy_path = config_dir.policy_file();
    let policy = if policy_path.exists() {
        parser::parse_policy_file(&policy_path)?
    } else {
        debug!(path = %policy_path.display(), "no policy.yml, using the built-in default");
        parser::parse_policy_str(defaults::DEFAULT_POLICY_YAML)?
    };

    let mut engine = PolicyEngine::new(policy)?;
    if config.builtin_allowlist {
        for rule in defaults::safe_host_rules(config.channel.name()) {
            engine.prepend(rule)?;
        }
    }
    Ok(engine)
}

fn build_channel(config: &Config) -> Arc<dyn ConsentChannel> {
    match config.channel {
        ChannelKind::Terminal => Arc::new(TerminalChannel::new()),
        ChannelKind::Telegram => {
            // validated at Config::load
            let token = config.telegram.bot_token.as_deref().unwrap_or_default();
            let chat = config.telegram.chat_id.as_deref().unwrap_or_default();
            Arc::new(TelegramChannel::new(token, chat))
        }
        ChannelKind::Webhook => {
            let url = config.webhook.url.as_deref().unwrap_or_default();
            Arc::new(WebhookChannel::new(url, config.webhook.secret.as_deref()))
        }
    }
}

/// Map a preset to the agent command line, or take the explicit override.
fn agent_command(options: &StartOptions) -> Vec<String> {
    if !options.command_override.is_empty() {
        return options.command_override.clone();
    }
    match options.preset.as_str() {
        "claude" => vec!["claude".to_string()],
        "codex" => vec!["codex".to_string()],
        "gemini" => vec!["gemini".to_string()],
        other => vec![other.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(preset: &str, command_override: Vec<String>) -> StartOptions {
        StartOptions {
            preset: preset.to_string(),
            workspace: None,
            config_dir: None,
            runtime_user: None,
            proxy_port: DEFAULT_PROXY_PORT,
            command_override,
        }
    }

    #[test]
    fn test_preset_maps_to_command() {
        assert_eq!(agent_command(&options("claude", vec![])), vec!["claude"]);
        assert_eq!(
            agent_command(&options("./my-agent", vec![])),
            vec!["./my-agent"]
        );
    }

    #[test]
    fn test_override_wins() {
        let opts = options(
            "claude",
            vec!["bash".to_string(), "-c".to_string(), "env".to_string()],
        );
        assert_eq!(agent_command(&opts), vec!["bash", "-c", "env"]);
    }
}
