//! Terminal-based consent prompt.
//!
//! Writes a styled prompt to the controlling terminal and reads a single
//! line. Empty input or anything that is not an explicit yes denies —
//! the prompt can never approve by accident.
//!
//! Terminal I/O is synchronous, so the read runs on a blocking thread;
//! the deadline is enforced from the async side. A prompt that outlives
//! its deadline is answered for nobody: the abandoned thread's input is
//! discarded.

use crate::channel::{ChannelError, ChannelReply, ConsentChannel};
use crate::policy::types::Action;
use async_trait::async_trait;
use crossterm::style::Stylize;
use std::io::{BufRead, Write};
use std::time::Duration;

pub struct TerminalChannel;

impl TerminalChannel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TerminalChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsentChannel for TerminalChannel {
    fn name(&self) -> &'static str {
        "terminal"
    }

    async fn ask(
        &self,
        action: &Action,
        timeout: Duration,
    ) -> Result<ChannelReply, ChannelError> {
        let action = action.clone();
        let prompt = tokio::task::spawn_blocking(move || prompt_line(&action));

        match tokio::time::timeout(timeout, prompt).await {
            Ok(Ok(reply)) => reply.map_err(|e| ChannelError::Unreachable(e.to_string())),
            Ok(Err(join_err)) => Err(ChannelError::Unreachable(join_err.to_string())),
            Err(_) => Err(ChannelError::Timeout),
        }
    }
}

/// Show the prompt and read one line from stdin.
fn prompt_line(action: &Action) -> std::io::Result<ChannelReply> {
    let mut stdout = std::io::stdout().lock();

    writeln!(stdout)?;
    writeln!(
        stdout,
        "  {}  the agent wants to reach the network",
        "⚠ consent required".yellow().bold()
    )?;
    writeln!(stdout, "     {}", action.describe().as_str().bold())?;
    writeln!(
        stdout,
        "     host {}  port {}",
        action.host.as_str().cyan(),
        action.port
    )?;
    write!(
        stdout,
        "  {} ",
        "allow this destination? [y/N]".green()
    )?;
    stdout.flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let answer = line.trim().to_lowercase();

    let reply = match answer.as_str() {
        "y" | "yes" | "approve" | "allow" => ChannelReply::approved("approved at terminal"),
        "" => ChannelReply::denied("no response (default deny)"),
        _ => ChannelReply::denied("denied at terminal"),
    };

    if reply.approved {
        writeln!(stdout, "  {}", "✓ approved".green())?;
    } else {
        writeln!(stdout, "  {}", "✗ denied".red())?;
    }
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(reply)
}
