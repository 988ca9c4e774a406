//! Subordinate process manager.
//!
//! Spawns the agent as the non-privileged runtime user with an environment
//! that makes the loopback proxy the path of least resistance: proxy env
//! vars for well-behaved HTTP clients, and a Node `--require` bootstrap
//! for the ones that ignore them. Enforcement is the kernel filter's job,
//! not this module's.
//!
//! Signals received by the supervisor are forwarded to the agent, and the
//! agent's exit status is propagated back out.

use crate::supervisor::RuntimeUser;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// Best-effort bootstrap loaded into a Node-based agent via
/// `NODE_OPTIONS=--require`. Coerces clients that bypass the proxy env
/// vars (undici-based fetch, notably) onto the proxy dispatcher.
const NODE_BOOTSTRAP: &str = r#"// Installed by acp: route Node HTTP clients through the egress proxy.
try {
  const undici = require('undici');
  const proxy = process.env.HTTPS_PROXY || process.env.HTTP_PROXY;
  if (proxy && undici.setGlobalDispatcher && undici.ProxyAgent) {
    undici.setGlobalDispatcher(new undici.ProxyAgent(proxy));
  }
} catch (_) {
  // no undici in this runtime; env vars will have to do
}
"#;

/// How the agent ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    Code(i32),
    /// Terminated by us after a signal; carries the conventional
    /// 128+signal exit code.
    Signalled(i32),
}

impl AgentExit {
    pub fn code(self) -> i32 {
        match self {
            AgentExit::Code(code) => code,
            AgentExit::Signalled(code) => code,
        }
    }
}

pub struct AgentSpec {
    pub command: Vec<String>,
    pub user: RuntimeUser,
    pub workspace: PathBuf,
    pub proxy_port: u16,
    /// Path of the written Node bootstrap, when available.
    pub bootstrap: Option<PathBuf>,
}

/// Write the Node bootstrap next to the other config artifacts. Failure is
/// tolerated: the env vars still cover conforming clients.
pub fn write_bootstrap(config_dir: &Path) -> Option<PathBuf> {
    let path = config_dir.join("proxy-bootstrap.cjs");
    match std::fs::write(&path, NODE_BOOTSTRAP) {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(error = %e, "could not write Node proxy bootstrap");
            None
        }
    }
}

/// Spawn the agent and wait for it, forwarding SIGINT/SIGTERM. Returns how
/// it ended; a grace period separates graceful termination from the kill.
pub async fn run_agent(spec: &AgentSpec) -> Result<AgentExit> {
    let mut child = spawn(spec)?;
    let pid = child.id();
    info!(pid, command = %spec.command.join(" "), "agent started");

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    let forwarded = tokio::select! {
        status = child.wait() => {
            let status = status.context("waiting for agent")?;
            return Ok(exit_from_status(status));
        }
        _ = sigint.recv() => SignalKind::interrupt(),
        _ = sigterm.recv() => SignalKind::terminate(),
    };

    terminate(&mut child, forwarded).await;

    // 128+signal, the shell convention: 130 for SIGINT, 143 for SIGTERM.
    Ok(AgentExit::Signalled(128 + forwarded.as_raw_value()))
}

fn spawn(spec: &AgentSpec) -> Result<Child> {
    let (program, args) = spec
        .command
        .split_first()
        .context("agent command is empty")?;

    let proxy_url = format!("http://127.0.0.1:{}", spec.proxy_port);

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&spec.workspace)
        .uid(spec.user.uid)
        .gid(spec.user.gid)
        .env("HOME", &spec.workspace)
        .env("USER", &spec.user.name)
        .env("LOGNAME", &spec.user.name)
        .env("HTTP_PROXY", &proxy_url)
        .env("HTTPS_PROXY", &proxy_url)
        .env("ALL_PROXY", &proxy_url)
        .env("http_proxy", &proxy_url)
        .env("https_proxy", &proxy_url)
        .env("all_proxy", &proxy_url)
        .env("NO_PROXY", "127.0.0.1,localhost")
        .env("no_proxy", "127.0.0.1,localhost")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if let Some(ref bootstrap) = spec.bootstrap {
        command.env("NODE_OPTIONS", format!("--require {}", bootstrap.display()));
    }

    command
        .spawn()
        .with_context(|| format!("Failed to start agent: {}", spec.command.join(" ")))
}

/// Graceful termination first, hard kill after the grace period.
async fn terminate(child: &mut Child, kind: SignalKind) {
    let Some(pid) = child.id() else {
        return;
    };
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    let sig = match kind.as_raw_value() {
        s if s == SignalKind::interrupt().as_raw_value() => nix::sys::signal::Signal::SIGINT,
        _ => nix::sys::signal::Signal::SIGTERM,
    };

    debug!(%pid, ?sig, "forwarding signal to agent");
    let _ = nix::sys::signal::kill(pid, sig);

    let grace = std::time::Duration::from_secs(5);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(%pid, "agent ignored the signal, killing");
        let _ = child.kill().await;
    }
}

fn exit_from_status(status: std::process::ExitStatus) -> AgentExit {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => AgentExit::Code(code),
        None => AgentExit::Signalled(128 + status.signal().unwrap_or(0)),
    }
}
