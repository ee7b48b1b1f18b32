use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SlackConfig;
use crate::platform::{InboundMessage, Platform, PlatformClient, DEFAULT_DISPLAY_NAME};

/// Slack Web API client (`chat.postMessage`, `users.info`).
pub struct SlackClient {
    client: reqwest::Client,
    api_url: String,
    bot_token: String,
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    channel: &'a str,
    text: &'a str,
}

/// Every Web API response carries `ok`; failures add `error`.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsersInfoResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user: Option<SlackUser>,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    #[serde(default)]
    real_name: Option<String>,
}

impl SlackClient {
    pub fn new(config: &SlackConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Slack HTTP client")?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
        })
    }
}

#[async_trait]
impl PlatformClient for SlackClient {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<()> {
        let url = format!("{}/chat.postMessage", self.api_url);

        debug!("Sending message to Slack channel: {}", destination);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.bot_token)
            .json(&PostMessageRequest {
                channel: destination,
                text,
            })
            .send()
            .await
            .context("Failed to send request to Slack")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Slack API error ({}): {}", status, error_body);
        }

        let body: ApiResponse = response
            .json()
            .await
            .context("Failed to parse Slack response")?;
        if !body.ok {
            anyhow::bail!(
                "Slack chat.postMessage rejected: {}",
                body.error.unwrap_or_else(|| "unknown_error".to_string())
            );
        }
        Ok(())
    }

    async fn lookup_display_name(&self, user_id: &str) -> Result<String> {
        let url = format!("{}/users.info", self.api_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.bot_token)
            .query(&[("user", user_id)])
            .send()
            .await
            .context("Failed to send request to Slack")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("Slack API error ({}): {}", status, error_body);
        }

        let body: UsersInfoResponse = response
            .json()
            .await
            .context("Failed to parse Slack users.info response")?;
        if !body.ok {
            anyhow::bail!(
                "Slack users.info rejected: {}",
                body.error.unwrap_or_else(|| "unknown_error".to_string())
            );
        }

        Ok(body
            .user
            .and_then(|u| u.real_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string()))
    }
}

// ── Inbound webhook payload ───────────────────────────────────────────────────

/// Events API `event_callback` envelope; only `event` matters here.
#[derive(Debug, Deserialize)]
pub struct SlackEnvelope {
    #[serde(default)]
    pub event: SlackEvent,
}

#[derive(Debug, Default, Deserialize)]
pub struct SlackEvent {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub subtype: String,
    /// Set on anything posted by an app, including our own echoes
    #[serde(default)]
    pub bot_id: Option<String>,
}

impl SlackEvent {
    pub fn is_bot_message(&self) -> bool {
        self.subtype == "bot_message" || self.bot_id.is_some()
    }

    /// Build the canonical message once the sender's name is known.
    pub fn into_message(self, sender_display_name: String) -> InboundMessage {
        let is_self_or_system = self.is_bot_message();
        InboundMessage {
            platform: Platform::Slack,
            sender_id: self.user,
            sender_display_name,
            destination: self.channel,
            text: self.text,
            is_self_or_system,
        }
    }

    /// Bot messages skip the lookup entirely.
    pub fn into_system_message(self) -> InboundMessage {
        self.into_message(DEFAULT_DISPLAY_NAME.to_string())
    }
}
