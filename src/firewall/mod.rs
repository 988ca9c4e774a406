//! Kernel egress filter — the enforcement half of the mediator.
//!
//! Installs a named nftables table that, for packets owned by the runtime
//! user's uid, permits TCP to the loopback proxy port and DNS to the
//! configured resolvers, and rejects everything else with an ICMP
//! "administratively prohibited". Traffic from every other uid passes
//! untouched.
//!
//! The whole script is applied as one `nft -f -` transaction: the agent
//! either sees the complete table or none of it. The table's presence is
//! the source of truth for "rules are installed".

use std::net::IpAddr;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// The table name, constant and unique to this system. Operators can
/// inspect it with `nft list table inet acp_egress`.
pub const FILTER_TABLE: &str = "acp_egress";

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("invalid uid {0}: the egress filter cannot scope to root")]
    InvalidUid(u32),

    #[error("invalid proxy port 0")]
    InvalidPort,

    #[error("failed to run nft: {0}")]
    ToolFailed(#[from] std::io::Error),

    #[error("kernel filter install failed: {stderr}")]
    InstallFailed { stderr: String },
}

/// Parameters of the uid-scoped egress policy.
#[derive(Debug, Clone)]
pub struct EgressFilter {
    pub uid: u32,
    pub proxy_port: u16,
    pub dns_servers: Vec<IpAddr>,
}

impl EgressFilter {
    pub fn new(uid: u32, proxy_port: u16, dns_servers: Vec<IpAddr>) -> Self {
        Self {
            uid,
            proxy_port,
            dns_servers,
        }
    }

    fn validate(&self) -> Result<(), FirewallError> {
        if self.uid == 0 {
            return Err(FirewallError::InvalidUid(self.uid));
        }
        if self.proxy_port == 0 {
            return Err(FirewallError::InvalidPort);
        }
        Ok(())
    }

    /// Render the nftables script. Deterministic text: the same inputs
    /// always produce the same ruleset, byte for byte.
    pub fn render(&self) -> String {
        let mut script = String::new();
        // add-then-delete makes the transaction idempotent whether or not
        // a previous run left the table behind.
        script.push_str(&format!("add table inet {FILTER_TABLE}\n"));
        script.push_str(&format!("delete table inet {FILTER_TABLE}\n"));
        script.push_str(&format!("table inet {FILTER_TABLE} {{\n"));
        script.push_str("    chain output {\n");
        script.push_str("        type filter hook output priority filter; policy accept;\n");
        script.push_str(&format!("        meta skuid != {} accept\n", self.uid));
        script.push_str(&format!(
            "        ip daddr 127.0.0.1 tcp dport {} accept\n",
            self.proxy_port
        ));
        script.push_str(&format!(
            "        ip6 daddr ::1 tcp dport {} accept\n",
            self.proxy_port
        ));
        for dns in &self.dns_servers {
            let family = match dns {
                IpAddr::V4(_) => "ip",
                IpAddr::V6(_) => "ip6",
            };
            script.push_str(&format!("        {family} daddr {dns} udp dport 53 accept\n"));
            script.push_str(&format!("        {family} daddr {dns} tcp dport 53 accept\n"));
        }
        script.push_str("        counter reject with icmpx type admin-prohibited\n");
        script.push_str("    }\n");
        script.push_str("}\n");
        script
    }

    /// Apply the table. Validates inputs before touching the kernel;
    /// installation failure is fatal to startup.
    pub async fn install(&self) -> Result<(), FirewallError> {
        self.validate()?;
        let script = self.render();
        debug!(table = FILTER_TABLE, "applying nftables script:\n{script}");

        let mut child = Command::new("nft")
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(FirewallError::InstallFailed {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(table = FILTER_TABLE, uid = self.uid, "egress filter installed");
        Ok(())
    }
}

/// Whether the filter table currently exists.
pub async fn is_installed() -> bool {
    Command::new("nft")
        .args(["list", "table", "inet", FILTER_TABLE])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Delete the filter table. Idempotent: a table that is already gone is a
/// success, not an error.
pub async fn remove() -> Result<(), FirewallError> {
    let output = Command::new("nft")
        .args(["delete", "table", "inet", FILTER_TABLE])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        info!(table = FILTER_TABLE, "egress filter removed");
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("No such file or directory") {
        debug!(table = FILTER_TABLE, "egress filter already absent");
        return Ok(());
    }

    Err(FirewallError::InstallFailed {
        stderr: stderr.trim().to_string(),
    })
}

/// Synchronous best-effort removal for drop guards and panic paths, where
/// an async runtime may no longer be available.
pub fn remove_blocking() {
    let result = std::process::Command::new("nft")
        .args(["delete", "table", "inet", FILTER_TABLE])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        warn!(error = %e, "best-effort egress filter removal failed");
    }
}
