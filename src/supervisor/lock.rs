//! Single-instance supervisor lock, keyed by runtime username.
//!
//! A pid file under a shared directory. The lock is live iff the recorded
//! pid is alive and — when /proc makes the command line readable — that
//! process looks like an ACP supervisor. An unreadable command line on a
//! live pid counts as live: when in doubt, refuse to start.

use crate::supervisor::StartupError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default shared directory for lock files.
pub const DEFAULT_LOCK_DIR: &str = "/run/acp";

/// Substring a live supervisor's command line is expected to carry.
const INVOCATION_PATTERN: &str = "acp";

pub struct SupervisorLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

/// Only `[A-Za-z0-9_-]` survive into the lock file name.
pub fn sanitize_username(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Deterministic lock path for a runtime user.
pub fn lock_path(dir: &Path, username: &str) -> PathBuf {
    dir.join(format!("supervisor-{}.pid", sanitize_username(username)))
}

impl SupervisorLock {
    /// Acquire the lock for `username` under `dir`.
    ///
    /// Protocol: read any existing pid; a live sibling refuses with
    /// `AlreadyRunning`; a stale or unparsable file is overwritten
    /// atomically with this process's pid.
    pub fn acquire(dir: &Path, username: &str) -> Result<Self, StartupError> {
        fs::create_dir_all(dir)?;
        let path = lock_path(dir, username);

        if let Some(existing) = read_pid(&path) {
            if is_live_supervisor(existing) {
                return Err(StartupError::AlreadyRunning(existing));
            }
            debug!(pid = existing, "replacing stale supervisor lock");
        }

        let pid = std::process::id();
        // Write-then-rename so a concurrent reader never sees a half
        // written pid.
        let tmp = path.with_extension("pid.tmp");
        fs::write(&tmp, pid.to_string())?;
        fs::rename(&tmp, &path)?;

        Ok(Self {
            path,
            pid,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock: re-read the file, delete only if it still holds
    /// our pid. A different pid means someone replaced us — leave theirs.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match read_pid(&self.path) {
            Some(pid) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(error = %e, "failed to remove supervisor lock");
                }
            }
            Some(other) => {
                debug!(pid = other, "lock now owned by another supervisor, leaving it");
            }
            None => {}
        }
    }
}

impl Drop for SupervisorLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Live sibling test: pid must be alive; if its command line is readable
/// it must also mention the supervisor invocation, otherwise any live pid
/// is treated as a sibling (conservative).
fn is_live_supervisor(pid: u32) -> bool {
    if !is_pid_alive(pid) {
        return false;
    }
    match fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) => {
            let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
            cmdline.contains(INVOCATION_PATTERN)
        }
        Err(_) => true,
    }
}

fn is_pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}
