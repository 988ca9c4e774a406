//! Audit log writer — an append-only JSONL file.
//!
//! One JSON object per line, newline-terminated, flushed after every write
//! for crash safety. The writer never rewrites or truncates. Concurrent
//! gate tasks serialise on the internal mutex so lines cannot interleave.

use crate::audit::types::AuditEntry;
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct AuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditSink {
    /// Open (or create) the audit file in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit file: {}", path.display()))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append one entry. Serialisation happens outside the lock; the write
    /// and flush inside it, so a line is always written whole.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let json = serde_json::to_string(entry).context("Failed to serialize audit entry")?;
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("audit writer poisoned"))?;
        writeln!(file, "{json}").context("Failed to write audit entry")?;
        file.flush().context("Failed to flush audit file")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
