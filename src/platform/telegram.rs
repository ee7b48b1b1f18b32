use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use teloxide::prelude::*;
use teloxide::types::Recipient;
use tracing::debug;

use crate::config::TelegramConfig;
use crate::platform::{InboundMessage, Platform, PlatformClient, DEFAULT_DISPLAY_NAME};
use crate::relay::WebhookError;

/// Telegram Bot API client, sending through teloxide.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig, timeout: Duration) -> Result<Self> {
        let client = teloxide::net::default_reqwest_settings()
            .timeout(timeout)
            .build()
            .context("Failed to build Telegram HTTP client")?;
        let api_url = reqwest::Url::parse(&config.api_url)
            .with_context(|| format!("Invalid Telegram API url: {}", config.api_url))?;
        let bot = Bot::with_client(&config.bot_token, client).set_api_url(api_url);
        Ok(Self { bot })
    }
}

/// Numeric ids are chats; anything else is treated as an `@channel` username.
fn recipient(destination: &str) -> Recipient {
    match destination.trim().parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) => Recipient::ChannelUsername(destination.to_string()),
    }
}

#[async_trait]
impl PlatformClient for TelegramClient {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<()> {
        debug!("Sending Telegram message to {}", destination);
        self.bot
            .send_message(recipient(destination), text)
            .await
            .with_context(|| format!("Telegram sendMessage to {} failed", destination))?;
        Ok(())
    }
}

// ── Inbound webhook payload ───────────────────────────────────────────────────

/// The subset of a Bot API `Update` the relay reads.
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub message: TelegramMessage,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: Value,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: Value,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
}

/// Telegram ids are integers on the wire, but tolerate strings too.
fn render_id(value: &Value, field: &str) -> Result<String, WebhookError> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(WebhookError::MalformedInput(format!(
            "telegram {} is not an id",
            field
        ))),
    }
}

impl TelegramUpdate {
    pub fn normalize(self) -> Result<InboundMessage, WebhookError> {
        let message = self.message;
        let from = message
            .from
            .ok_or_else(|| WebhookError::MalformedInput("telegram message has no sender".into()))?;
        let text = message
            .text
            .ok_or_else(|| WebhookError::MalformedInput("telegram message has no text".into()))?;

        let sender_display_name = from
            .username
            .filter(|u| !u.is_empty())
            .or(from.first_name.filter(|n| !n.is_empty()))
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());

        Ok(InboundMessage {
            platform: Platform::Telegram,
            sender_id: render_id(&from.id, "from.id")?,
            sender_display_name,
            destination: render_id(&message.chat.id, "chat.id")?,
            text,
            is_self_or_system: from.is_bot,
        })
    }
}
