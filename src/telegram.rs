use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::archive::Message;
use crate::config::TelegramConfig;

/// Failure to obtain a batch of updates. Any of these aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request to Telegram failed: {0}")]
    Transport(reqwest::Error),

    #[error("Telegram API error ({status}): {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("Telegram API returned ok=false: {0}")]
    Envelope(String),

    #[error("failed to decode Telegram response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Why an update did not produce an archived message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("no message payload")]
    NoPayload,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("chat {0} does not match the configured filter")]
    OtherChat(i64),
    #[error("no text content")]
    NoText,
    #[error("message {0} already archived")]
    Duplicate(i64),
}

#[derive(Debug, Deserialize)]
struct UpdatesEnvelope {
    ok: bool,
    #[serde(default)]
    result: Vec<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

/// One entry of the getUpdates stream, decoded loosely
#[derive(Debug, Clone, Deserialize)]
pub struct RawUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<RawMessage>,
    #[serde(default)]
    pub channel_post: Option<RawMessage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub chat: Option<RawChat>,
    #[serde(default)]
    pub from: Option<RawUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub date: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawChat {
    #[serde(default)]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawUser {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl RawUpdate {
    /// An update without any payload, kept only so its id still moves the cursor
    fn bare(update_id: i64) -> Self {
        Self {
            update_id,
            message: None,
            channel_post: None,
        }
    }

    /// The message carried by this update, whether a chat message or a channel post
    pub fn payload(&self) -> Option<&RawMessage> {
        self.message.as_ref().or(self.channel_post.as_ref())
    }
}

impl RawUser {
    fn display_name(&self) -> String {
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let name = name.trim();
        if name.is_empty() {
            "Unknown".to_string()
        } else {
            name.to_string()
        }
    }
}

impl RawMessage {
    /// Validate this payload into an archive record.
    /// `channel_filter` restricts ingestion to a single chat.
    pub fn normalize(
        &self,
        channel_filter: Option<i64>,
        processed_at: &str,
    ) -> Result<Message, SkipReason> {
        let chat_id = self
            .chat
            .as_ref()
            .and_then(|c| c.id)
            .ok_or(SkipReason::MissingField("chat.id"))?;

        if let Some(wanted) = channel_filter {
            if wanted != chat_id {
                return Err(SkipReason::OtherChat(chat_id));
            }
        }

        let text = match self.text.as_deref() {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => return Err(SkipReason::NoText),
        };

        let message_id = self
            .message_id
            .ok_or(SkipReason::MissingField("message_id"))?;
        let timestamp = self.date.ok_or(SkipReason::MissingField("date"))?;

        let (sender_id, sender_name) = match &self.from {
            Some(user) => (user.id, user.display_name()),
            None => (None, "Unknown".to_string()),
        };

        Ok(Message {
            message_id,
            chat_id,
            sender_id,
            sender_name,
            text,
            timestamp,
            processed_at: processed_at.to_string(),
        })
    }
}

/// Decode a getUpdates response body.
///
/// Entries are decoded one at a time: an entry whose payload has the wrong
/// shape is kept as a bare update so its id is still consumed, and an entry
/// without an update_id is dropped.
pub fn parse_updates(body: &str) -> Result<Vec<RawUpdate>, UpstreamError> {
    let envelope: UpdatesEnvelope = serde_json::from_str(body)?;
    if !envelope.ok {
        return Err(UpstreamError::Envelope(
            envelope
                .description
                .unwrap_or_else(|| "no description".to_string()),
        ));
    }

    let mut updates = Vec::with_capacity(envelope.result.len());
    for value in envelope.result {
        match serde_json::from_value::<RawUpdate>(value.clone()) {
            Ok(update) => updates.push(update),
            Err(e) => match value.get("update_id").and_then(|v| v.as_i64()) {
                Some(update_id) => {
                    warn!("Malformed update {}, skipping payload: {}", update_id, e);
                    updates.push(RawUpdate::bare(update_id));
                }
                None => warn!("Dropping update without update_id: {}", e),
            },
        }
    }

    Ok(updates)
}

/// Anything that can hand out batches of updates starting at an offset
#[async_trait]
pub trait UpdateSource {
    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<RawUpdate>, UpstreamError>;
}

pub struct TelegramClient {
    client: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramClient {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        // Leave headroom over the server-side long-poll wait
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, config })
    }

    fn updates_url(&self) -> String {
        format!(
            "{}/bot{}/getUpdates",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }
}

#[async_trait]
impl UpdateSource for TelegramClient {
    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<RawUpdate>, UpstreamError> {
        let mut query = vec![("timeout", self.config.poll_timeout_secs.to_string())];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        debug!(
            "Requesting updates (offset={:?}, timeout={}s)",
            offset, self.config.poll_timeout_secs
        );

        // Errors carry the request URL, which embeds the bot token
        let response = self
            .client
            .get(self.updates_url())
            .query(&query)
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.without_url()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Transport(e.without_url()))?;

        if !status.is_success() {
            return Err(UpstreamError::Status { status, body });
        }

        let updates = parse_updates(&body)?;
        debug!("Received {} updates", updates.len());
        Ok(updates)
    }
}
