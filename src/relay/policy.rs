use crate::platform::{InboundMessage, Platform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    SelfOrSystem,
    Owner,
    Denylisted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayDecision {
    pub suppress: bool,
    pub outgoing_text: String,
    pub reason: Option<SuppressReason>,
}

impl RelayDecision {
    fn suppressed(reason: SuppressReason) -> Self {
        Self {
            suppress: true,
            outgoing_text: String::new(),
            reason: Some(reason),
        }
    }

    fn relay(outgoing_text: String) -> Self {
        Self {
            suppress: false,
            outgoing_text,
            reason: None,
        }
    }
}

/// Always suppressed, whatever the config adds
pub const BUILTIN_DENYLIST: &[&str] = &["lola"];

pub fn format_outgoing(sender_display_name: &str, text: &str) -> String {
    format!("You ({}) said: {}", sender_display_name, text)
}

/// Decides whether a canonical message is echoed and how it reads.
/// Pure: no I/O, no state between calls.
#[derive(Debug, Clone)]
pub struct RelayPolicy {
    owner_sender_id: String,
    denylisted_names: Vec<String>,
}

impl RelayPolicy {
    pub fn new(owner_sender_id: impl Into<String>, denylisted_names: Vec<String>) -> Self {
        Self {
            owner_sender_id: owner_sender_id.into(),
            denylisted_names: BUILTIN_DENYLIST
                .iter()
                .map(|n| n.to_string())
                .chain(denylisted_names)
                .map(|n| n.to_lowercase())
                .collect(),
        }
    }

    /// First matching rule wins.
    pub fn decide(&self, msg: &InboundMessage) -> RelayDecision {
        if msg.is_self_or_system {
            return RelayDecision::suppressed(SuppressReason::SelfOrSystem);
        }

        // Only the Telegram owner id is configured; Slack ids never collide with it.
        if msg.platform == Platform::Telegram && msg.sender_id == self.owner_sender_id {
            return RelayDecision::suppressed(SuppressReason::Owner);
        }

        let name = msg.sender_display_name.to_lowercase();
        if self.denylisted_names.iter().any(|denied| *denied == name) {
            return RelayDecision::suppressed(SuppressReason::Denylisted);
        }

        RelayDecision::relay(format_outgoing(&msg.sender_display_name, &msg.text))
    }
}
