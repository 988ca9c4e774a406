//! Identity & launch preconditions.
//!
//! Before anything touches the kernel: verify the host can enforce the
//! egress policy at all (Linux, nft present, privileged execution), and
//! resolve the non-privileged runtime user the agent will run as.

pub mod lock;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fatal startup failures. Each maps to a one-line operator message and
/// exit code 1.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("unsupported host: {0}")]
    UnsupportedHost(String),

    #[error("not privileged: installing the kernel egress filter requires root")]
    NotPrivileged,

    #[error("invalid runtime user: {0}")]
    InvalidUser(String),

    #[error("already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("supervisor lock error: {0}")]
    LockIo(#[from] std::io::Error),
}

/// The non-privileged identity the agent executes as — the principal the
/// kernel filter matches on.
#[derive(Debug, Clone)]
pub struct RuntimeUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Verify host preconditions: Linux, the nftables CLI on PATH, and enough
/// privilege to program the kernel.
pub fn preflight() -> Result<(), StartupError> {
    if std::env::consts::OS != "linux" {
        return Err(StartupError::UnsupportedHost(format!(
            "{} (the egress filter needs Linux nftables)",
            std::env::consts::OS
        )));
    }
    if find_in_path("nft").is_none() {
        return Err(StartupError::UnsupportedHost(
            "nft not found on PATH (install the nftables package)".to_string(),
        ));
    }
    if !nix::unistd::Uid::effective().is_root() {
        return Err(StartupError::NotPrivileged);
    }
    Ok(())
}

/// Resolve a username to uid/gid/home. Running the agent as root would
/// make the uid-scoped filter meaningless, so uid 0 is rejected.
pub fn resolve_runtime_user(name: &str) -> Result<RuntimeUser, StartupError> {
    let user = nix::unistd::User::from_name(name)
        .map_err(|e| StartupError::InvalidUser(format!("lookup for '{name}' failed: {e}")))?
        .ok_or_else(|| StartupError::InvalidUser(format!("no such user: {name}")))?;

    if user.uid.is_root() {
        return Err(StartupError::InvalidUser(format!(
            "'{name}' is uid 0 — the agent must run as a non-privileged user"
        )));
    }

    Ok(RuntimeUser {
        name: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir,
    })
}

/// Locate an executable on PATH.
pub fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
