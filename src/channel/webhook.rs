//! Webhook consent channel.
//!
//! POSTs the action to a configured URL and expects a JSON response with
//! `approved: bool` and an optional `reason`. Non-2xx, timeout, or
//! malformed JSON all deny.

use crate::channel::{ChannelError, ChannelReply, ConsentChannel};
use crate::policy::types::Action;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    approved: bool,
    #[serde(default)]
    reason: Option<String>,
}

impl WebhookChannel {
    pub fn new(url: &str, secret: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            secret: secret.map(str::to_string),
        }
    }
}

#[async_trait]
impl ConsentChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn ask(
        &self,
        action: &Action,
        timeout: Duration,
    ) -> Result<ChannelReply, ChannelError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(action);
        if let Some(ref secret) = self.secret {
            request = request.header("x-acp-secret", secret);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ChannelError::Timeout
            } else {
                ChannelError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Unreachable(format!(
                "webhook returned {status}"
            )));
        }

        let payload: WebhookResponse = response
            .json()
            .await
            .map_err(|e| ChannelError::MalformedResponse(e.to_string()))?;

        let reason = payload.reason.unwrap_or_else(|| {
            if payload.approved {
                "approved via webhook".to_string()
            } else {
                "denied via webhook".to_string()
            }
        });

        Ok(ChannelReply {
            approved: payload.approved,
            reason,
        })
    }
}
