//! Telegram bot consent channel.
//!
//! Posts one message with inline Approve/Deny buttons bound to a
//! request-local identifier, then long-polls `getUpdates` for the matching
//! callback until the deadline. Timeout or transport failure denies.
//!
//! Only one `getUpdates` long-poll may run per bot token, so concurrent
//! asks serialise on an internal mutex; the outer deadline still applies
//! to the whole wait, queueing included.

use crate::channel::{ChannelError, ChannelReply, ConsentChannel};
use crate::policy::types::Action;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const API_BASE: &str = "https://api.telegram.org";

/// How long each individual `getUpdates` poll holds open, in seconds.
const POLL_SECS: u64 = 25;

pub struct TelegramChannel {
    client: reqwest::Client,
    base_url: String,
    chat_id: String,
    /// Serialises polling: Telegram rejects parallel getUpdates calls.
    poll_lock: Mutex<PollState>,
}

#[derive(Default)]
struct PollState {
    offset: i64,
    /// Decisions polled off the wire for requests other than the one the
    /// current poller is waiting on. Parked here for their owners.
    unclaimed: HashMap<String, bool>,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("{API_BASE}/bot{bot_token}"),
            chat_id: chat_id.to_string(),
            poll_lock: Mutex::new(PollState::default()),
        }
    }

    async fn send_prompt(&self, action: &Action, request_id: &str) -> Result<i64, ChannelError> {
        let text = format!(
            "⚠ Consent required\n\nThe agent wants to reach:\n{}\n\nhost: {}\nport: {}",
            action.describe(),
            action.host,
            action.port
        );
        let body = SendMessageRequest {
            chat_id: &self.chat_id,
            text: &text,
            reply_markup: InlineKeyboard {
                inline_keyboard: vec![vec![
                    InlineButton {
                        text: "✅ Approve",
                        callback_data: format!("acp:{request_id}:approve"),
                    },
                    InlineButton {
                        text: "❌ Deny",
                        callback_data: format!("acp:{request_id}:deny"),
                    },
                ]],
            },
        };

        let response = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Unreachable(e.to_string()))?;

        let payload: TelegramResponse<Message> = response
            .json()
            .await
            .map_err(|e| ChannelError::MalformedResponse(e.to_string()))?;

        if !payload.ok {
            return Err(ChannelError::Unreachable(
                payload
                    .description
                    .unwrap_or_else(|| "sendMessage failed".to_string()),
            ));
        }
        payload
            .result
            .map(|m| m.message_id)
            .ok_or_else(|| ChannelError::MalformedResponse("sendMessage: empty result".into()))
    }

    /// Poll until a decision for `request_id` arrives. The poll lock is
    /// released between rounds so concurrent asks can pick up decisions
    /// the current poller parked for them.
    async fn await_callback(&self, request_id: &str) -> Result<ChannelReply, ChannelError> {
        loop {
            let mut state = self.poll_lock.lock().await;

            // Another poller may already have seen our button press.
            if let Some(approved) = state.unclaimed.remove(request_id) {
                return Ok(reply_for(approved));
            }

            let updates = self.fetch_updates(state.offset).await?;
            let mut mine = None;
            for update in updates {
                state.offset = update.update_id + 1;
                let Some(callback) = update.callback_query else {
                    continue;
                };
                let Some(data) = callback.data else {
                    continue;
                };

                let mut parts = data.splitn(3, ':');
                let (tag, id, choice) = (
                    parts.next().unwrap_or(""),
                    parts.next().unwrap_or(""),
                    parts.next().unwrap_or(""),
                );
                if tag != "acp" {
                    continue;
                }

                // Acknowledge every callback so the client stops spinning,
                // even ones for requests that already timed out.
                self.answer_callback(&callback.id).await;

                let approved = choice == "approve";
                if id == request_id {
                    mine = Some(approved);
                } else {
                    debug!(id, "parking decision for another consent request");
                    state.unclaimed.insert(id.to_string(), approved);
                }
            }
            drop(state);

            if let Some(approved) = mine {
                return Ok(reply_for(approved));
            }
            tokio::task::yield_now().await;
        }
    }

    async fn fetch_updates(&self, offset: i64) -> Result<Vec<Update>, ChannelError> {
        let response = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[
                ("timeout", POLL_SECS.to_string()),
                ("offset", offset.to_string()),
                ("allowed_updates", "[\"callback_query\"]".to_string()),
            ])
            .timeout(Duration::from_secs(POLL_SECS + 10))
            .send()
            .await
            .map_err(|e| ChannelError::Unreachable(e.to_string()))?;

        let payload: TelegramResponse<Vec<Update>> = response
            .json()
            .await
            .map_err(|e| ChannelError::MalformedResponse(e.to_string()))?;

        if !payload.ok {
            return Err(ChannelError::Unreachable(
                payload
                    .description
                    .unwrap_or_else(|| "getUpdates failed".to_string()),
            ));
        }
        Ok(payload.result.unwrap_or_default())
    }

    async fn answer_callback(&self, callback_id: &str) {
        let result = self
            .client
            .post(format!("{}/answerCallbackQuery", self.base_url))
            .json(&serde_json::json!({ "callback_query_id": callback_id }))
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "answerCallbackQuery failed");
        }
    }

    /// Record the outcome on the original message. Best effort.
    async fn edit_outcome(&self, message_id: i64, action: &Action, reply: &ChannelReply) {
        let outcome = if reply.approved {
            "✅ Approved"
        } else {
            "❌ Denied"
        };
        let text = format!("{}\n\n{}", action.describe(), outcome);
        let result = self
            .client
            .post(format!("{}/editMessageText", self.base_url))
            .json(&serde_json::json!({
                "chat_id": self.chat_id.as_str(),
                "message_id": message_id,
                "text": text,
            }))
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "editMessageText failed");
        }
    }
}

#[async_trait]
impl ConsentChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn ask(
        &self,
        action: &Action,
        timeout: Duration,
    ) -> Result<ChannelReply, ChannelError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let message_id = self.send_prompt(action, &request_id).await?;

        let reply = tokio::time::timeout(timeout, self.await_callback(&request_id))
            .await
            .map_err(|_| ChannelError::Timeout)??;

        self.edit_outcome(message_id, action, &reply).await;
        Ok(reply)
    }
}

fn reply_for(approved: bool) -> ChannelReply {
    if approved {
        ChannelReply::approved("approved via telegram")
    } else {
        ChannelReply::denied("denied via telegram")
    }
}

// ── Bot API wire types ──

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    reply_markup: InlineKeyboard,
}

#[derive(Debug, Serialize)]
struct InlineKeyboard {
    inline_keyboard: Vec<Vec<InlineButton>>,
}

#[derive(Debug, Serialize)]
struct InlineButton {
    text: &'static str,
    callback_data: String,
}
