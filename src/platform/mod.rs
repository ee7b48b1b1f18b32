pub mod slack;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info};

/// Display name used when a platform gives us nothing better
pub const DEFAULT_DISPLAY_NAME: &str = "User";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Telegram,
    Slack,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Telegram => "telegram",
            Platform::Slack => "slack",
        }
    }

    /// The platform a message gets cross-posted to
    pub fn other(&self) -> Platform {
        match self {
            Platform::Telegram => Platform::Slack,
            Platform::Slack => Platform::Telegram,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message received from any platform, normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub platform: Platform,
    /// Platform-specific user ID as string
    pub sender_id: String,
    pub sender_display_name: String,
    /// Chat/channel the message arrived in
    pub destination: String,
    pub text: String,
    /// Bot or system generated; never relayed
    pub is_self_or_system: bool,
}

/// Outbound side of a chat platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn platform(&self) -> Platform;

    async fn send_message(&self, destination: &str, text: &str) -> Result<()>;

    async fn lookup_display_name(&self, user_id: &str) -> Result<String> {
        anyhow::bail!(
            "display name lookup for {} is not supported on {}",
            user_id,
            self.platform()
        )
    }
}

/// Both platform clients plus the per-call timeout. Shared by the webhook
/// handler and the startup announcement so they deliver identically.
#[derive(Clone)]
pub struct Platforms {
    telegram: Arc<dyn PlatformClient>,
    slack: Arc<dyn PlatformClient>,
    timeout: Duration,
}

impl Platforms {
    pub fn new(
        telegram: Arc<dyn PlatformClient>,
        slack: Arc<dyn PlatformClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            telegram,
            slack,
            timeout,
        }
    }

    pub fn client(&self, platform: Platform) -> &Arc<dyn PlatformClient> {
        match platform {
            Platform::Telegram => &self.telegram,
            Platform::Slack => &self.slack,
        }
    }

    /// Send one message, logging instead of failing. Returns whether it
    /// was delivered.
    pub async fn send_best_effort(&self, platform: Platform, destination: &str, text: &str) -> bool {
        let client = self.client(platform);
        match tokio::time::timeout(self.timeout, client.send_message(destination, text)).await {
            Ok(Ok(())) => {
                info!("Message sent to {} ({}): {}", platform, destination, text);
                true
            }
            Ok(Err(e)) => {
                error!(
                    "Error sending {} message to {}: {:#}",
                    platform, destination, e
                );
                false
            }
            Err(_) => {
                error!(
                    "Timed out after {:?} sending {} message to {}",
                    self.timeout, platform, destination
                );
                false
            }
        }
    }

    /// Deliver the same text to every target concurrently. A failure on one
    /// target never affects the others.
    pub async fn broadcast(&self, targets: &[(Platform, String)], text: &str) -> usize {
        let sends = targets
            .iter()
            .map(|(platform, destination)| self.send_best_effort(*platform, destination, text));
        futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }

    /// Resolve a display name, degrading to [`DEFAULT_DISPLAY_NAME`].
    pub async fn display_name_or_default(&self, platform: Platform, user_id: &str) -> String {
        let client = self.client(platform);
        match tokio::time::timeout(self.timeout, client.lookup_display_name(user_id)).await {
            Ok(Ok(name)) if !name.is_empty() => name,
            Ok(Ok(_)) => DEFAULT_DISPLAY_NAME.to_string(),
            Ok(Err(e)) => {
                error!("Error fetching {} user info for {}: {:#}", platform, user_id, e);
                DEFAULT_DISPLAY_NAME.to_string()
            }
            Err(_) => {
                error!(
                    "Timed out fetching {} user info for {}",
                    platform, user_id
                );
                DEFAULT_DISPLAY_NAME.to_string()
            }
        }
    }
}
