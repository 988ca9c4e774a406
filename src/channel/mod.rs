pub mod terminal;
pub mod telegram;
pub mod webhook;

use crate::policy::types::Action;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use telegram::TelegramChannel;
pub use terminal::TerminalChannel;
pub use webhook::WebhookChannel;

/// What the human (or their stand-in) said.
#[derive(Debug, Clone)]
pub struct ChannelReply {
    pub approved: bool,
    pub reason: String,
}

impl ChannelReply {
    pub fn approved(reason: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: reason.into(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

/// Ways a channel can fail to produce an answer. The gate maps every one
/// of these to a deny verdict with a reason naming the failure mode.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("consent channel unreachable: {0}")]
    Unreachable(String),

    #[error("consent request timed out")]
    Timeout,

    #[error("consent channel returned a malformed response: {0}")]
    MalformedResponse(String),
}

/// The out-of-band consent medium. One method: given an action and a
/// deadline, come back with approved/denied and a reason.
///
/// Implementations must be safe to call concurrently, and must honour
/// `timeout` even when the peer is silent.
#[async_trait]
pub trait ConsentChannel: Send + Sync {
    /// Short name used in verdict reasons and the safe-host allowlist.
    fn name(&self) -> &'static str;

    async fn ask(&self, action: &Action, timeout: Duration)
        -> Result<ChannelReply, ChannelError>;
}

/// Approves everything without prompting (tests and trusted CI).
pub struct AutoApprove;

#[async_trait]
impl ConsentChannel for AutoApprove {
    fn name(&self) -> &'static str {
        "auto-approve"
    }

    async fn ask(
        &self,
        _action: &Action,
        _timeout: Duration,
    ) -> Result<ChannelReply, ChannelError> {
        Ok(ChannelReply::approved("auto-approved"))
    }
}

/// Denies everything (strict unattended mode).
pub struct AutoDeny;

#[async_trait]
impl ConsentChannel for AutoDeny {
    fn name(&self) -> &'static str {
        "auto-deny"
    }

    async fn ask(
        &self,
        _action: &Action,
        _timeout: Duration,
    ) -> Result<ChannelReply, ChannelError> {
        Ok(ChannelReply::denied("auto-denied"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_channels_answer_immediately() {
        let action = Action::http("example.com", "CONNECT", 443, None);

        let reply =
            tokio_test::block_on(AutoApprove.ask(&action, Duration::from_secs(1))).unwrap();
        assert!(reply.approved);

        let reply = tokio_test::block_on(AutoDeny.ask(&action, Duration::from_secs(1))).unwrap();
        assert!(!reply.approved);
        assert_eq!(reply.reason, "auto-denied");
    }

    #[test]
    fn channel_errors_name_their_failure_mode() {
        assert!(ChannelError::Unreachable("refused".into())
            .to_string()
            .contains("unreachable"));
        assert!(ChannelError::Timeout.to_string().contains("timed out"));
        assert!(ChannelError::MalformedResponse("not json".into())
            .to_string()
            .contains("malformed"));
    }
}
