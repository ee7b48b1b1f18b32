//! Inbound webhook pipeline: classify the payload, normalize it into an
//! [`InboundMessage`], run the relay policy and fan the result out to both
//! platforms.

pub mod error;
pub mod policy;
pub mod webhook;

pub use error::WebhookError;
pub use policy::RelayPolicy;

use serde_json::Value;
use tracing::{debug, info};

use crate::platform::slack::SlackEnvelope;
use crate::platform::telegram::TelegramUpdate;
use crate::platform::{InboundMessage, Platform, Platforms};

/// Shape of a webhook body, decided by its top-level marker key.
#[derive(Debug)]
pub enum InboundPayload {
    Telegram(TelegramUpdate),
    Slack(SlackEnvelope),
    /// Slack's one-time endpoint handshake
    SlackChallenge(String),
    Unrecognized,
}

impl InboundPayload {
    pub fn decode(body: &[u8]) -> Result<Self, WebhookError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| WebhookError::MalformedInput(format!("invalid JSON: {}", e)))?;
        Self::classify(value)
    }

    pub fn classify(value: Value) -> Result<Self, WebhookError> {
        let Value::Object(ref fields) = value else {
            return Ok(InboundPayload::Unrecognized);
        };

        if fields.contains_key("message") {
            let update = serde_json::from_value(value)
                .map_err(|e| WebhookError::MalformedInput(format!("telegram update: {}", e)))?;
            return Ok(InboundPayload::Telegram(update));
        }

        if fields.contains_key("event") {
            let envelope = serde_json::from_value(value)
                .map_err(|e| WebhookError::MalformedInput(format!("slack event: {}", e)))?;
            return Ok(InboundPayload::Slack(envelope));
        }

        if fields.get("type").and_then(Value::as_str) == Some("url_verification") {
            if let Some(challenge) = fields.get("challenge").and_then(Value::as_str) {
                return Ok(InboundPayload::SlackChallenge(challenge.to_string()));
            }
        }

        Ok(InboundPayload::Unrecognized)
    }

    /// Produce the canonical message. Slack senders are resolved through
    /// `users.info`; a failed lookup degrades to the default name.
    pub async fn normalize(self, platforms: &Platforms) -> Result<InboundMessage, WebhookError> {
        match self {
            InboundPayload::Telegram(update) => update.normalize(),
            InboundPayload::Slack(envelope) => {
                let event = envelope.event;
                if event.is_bot_message() {
                    return Ok(event.into_system_message());
                }
                let name = platforms
                    .display_name_or_default(Platform::Slack, &event.user)
                    .await;
                Ok(event.into_message(name))
            }
            InboundPayload::SlackChallenge(_) | InboundPayload::Unrecognized => {
                Err(WebhookError::UnsupportedPayload)
            }
        }
    }
}

/// Where cross-posts land on each platform
#[derive(Debug, Clone)]
pub struct OwnerDestinations {
    pub telegram: String,
    pub slack: String,
}

impl OwnerDestinations {
    pub fn for_platform(&self, platform: Platform) -> &str {
        match platform {
            Platform::Telegram => &self.telegram,
            Platform::Slack => &self.slack,
        }
    }

    pub fn targets(&self) -> Vec<(Platform, String)> {
        vec![
            (Platform::Telegram, self.telegram.clone()),
            (Platform::Slack, self.slack.clone()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Challenge(String),
    Suppressed,
    Relayed { delivered: usize },
}

/// Stateless across requests; one instance serves all of them.
#[derive(Clone)]
pub struct Relay {
    platforms: Platforms,
    policy: RelayPolicy,
    owners: OwnerDestinations,
}

impl Relay {
    pub fn new(platforms: Platforms, policy: RelayPolicy, owners: OwnerDestinations) -> Self {
        Self {
            platforms,
            policy,
            owners,
        }
    }

    pub async fn handle(&self, body: &[u8]) -> Result<WebhookOutcome, WebhookError> {
        let payload = InboundPayload::decode(body)?;
        if let InboundPayload::SlackChallenge(challenge) = payload {
            info!("Answering Slack url_verification challenge");
            return Ok(WebhookOutcome::Challenge(challenge));
        }

        let message = payload.normalize(&self.platforms).await?;
        let decision = self.policy.decide(&message);
        if decision.suppress {
            debug!(
                "Suppressed {} message from {} ({}): {:?}",
                message.platform, message.sender_display_name, message.sender_id, decision.reason
            );
            return Ok(WebhookOutcome::Suppressed);
        }

        info!(
            "Relaying {} message from {} in {}",
            message.platform, message.sender_display_name, message.destination
        );

        let cross = message.platform.other();
        let targets = [
            (message.platform, message.destination.clone()),
            (cross, self.owners.for_platform(cross).to_string()),
        ];
        let delivered = self
            .platforms
            .broadcast(&targets, &decision.outgoing_text)
            .await;

        Ok(WebhookOutcome::Relayed { delivered })
    }
}
