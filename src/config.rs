use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationBackend {
    /// Per-process only; announcements are not deduplicated across processes
    Memory,
    #[default]
    Sqlite,
    Redis,
}

impl std::fmt::Display for CoordinationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinationBackend::Memory => write!(f, "memory"),
            CoordinationBackend::Sqlite => write!(f, "sqlite"),
            CoordinationBackend::Redis => write!(f, "redis"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_config")]
    pub server: ServerConfig,
    pub telegram: TelegramConfig,
    pub slack: SlackConfig,
    #[serde(default = "default_relay_config")]
    pub relay: RelayConfig,
    #[serde(default = "default_startup_config")]
    pub startup: StartupConfig,
    #[serde(default = "default_coordination_config")]
    pub coordination: CoordinationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Owner's user id. Their messages are never echoed and startup
    /// announcements go to their private chat (same id on Telegram).
    #[serde(default)]
    pub owner_id: String,
    #[serde(default = "default_telegram_api_url")]
    pub api_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Channel (or user DM id) receiving cross-posts and announcements
    #[serde(default)]
    pub owner_channel: String,
    #[serde(default = "default_slack_api_url")]
    pub api_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Names suppressed in addition to the built-in denylist
    #[serde(default)]
    pub denylisted_names: Vec<String>,
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StartupConfig {
    #[serde(default = "default_announce_delay_secs")]
    pub announce_delay_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_fingerprint_keys")]
    pub fingerprint_keys: Vec<String>,
    /// Overrides the VERSION file and the crate version
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub backend: CoordinationBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_bind() -> String {
    "0.0.0.0:5080".to_string()
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_slack_api_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_delivery_timeout_secs() -> u64 {
    10
}

fn default_announce_delay_secs() -> u64 {
    10
}

fn default_lock_ttl_secs() -> u64 {
    30
}

fn default_fingerprint_keys() -> Vec<String> {
    [
        "RAILWAY_PROJECT_ID",
        "RAILWAY_ENVIRONMENT_ID",
        "RAILWAY_ENVIRONMENT_NAME",
        "RAILWAY_SERVICE_ID",
        "RAILWAY_DEPLOYMENT_ID",
        "RAILWAY_SNAPSHOT_ID",
        "RAILWAY_GIT_COMMIT_SHA",
        "RAILWAY_GIT_BRANCH",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("aura-coordination.db")
}

fn default_key_prefix() -> String {
    "aura".to_string()
}

fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind: default_bind(),
    }
}

fn default_relay_config() -> RelayConfig {
    RelayConfig {
        denylisted_names: Vec::new(),
        delivery_timeout_secs: default_delivery_timeout_secs(),
    }
}

fn default_startup_config() -> StartupConfig {
    StartupConfig {
        announce_delay_secs: default_announce_delay_secs(),
        lock_ttl_secs: default_lock_ttl_secs(),
        fingerprint_keys: default_fingerprint_keys(),
        version: None,
    }
}

fn default_coordination_config() -> CoordinationConfig {
    CoordinationConfig {
        backend: CoordinationBackend::default(),
        redis_url: None,
        sqlite_path: default_sqlite_path(),
        key_prefix: default_key_prefix(),
    }
}

impl Config {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.delivery_timeout_secs)
    }

    pub fn announce_delay(&self) -> Duration {
        Duration::from_secs(self.startup.announce_delay_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.startup.lock_ttl_secs)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Deployment platforms inject secrets as environment variables; those
    /// win over whatever the file says.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(token) = non_empty("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(owner) = non_empty("TELEGRAM_BOT_OWNER_ID") {
            self.telegram.owner_id = owner;
        }
        if let Some(token) = non_empty("SLACK_BOT_TOKEN") {
            self.slack.bot_token = token;
        }
        if let Some(owner) = non_empty("SLACK_BOT_OWNER_ID") {
            self.slack.owner_channel = owner;
        }
        if let Some(url) = non_empty("REDIS_URL") {
            self.coordination.backend = CoordinationBackend::Redis;
            self.coordination.redis_url = Some(url);
        }
        if let Some(port) = non_empty("PORT") {
            self.server.bind = format!("0.0.0.0:{}", port);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.is_empty() {
            anyhow::bail!("telegram.bot_token is not set");
        }
        if self.telegram.owner_id.is_empty() {
            anyhow::bail!("telegram.owner_id is not set");
        }
        if self.slack.bot_token.is_empty() {
            anyhow::bail!("slack.bot_token is not set");
        }
        if self.slack.owner_channel.is_empty() {
            anyhow::bail!("slack.owner_channel is not set");
        }
        if self.coordination.backend == CoordinationBackend::Redis
            && self.coordination.redis_url.is_none()
        {
            anyhow::bail!("coordination.backend is redis but no redis_url was given");
        }
        Ok(())
    }

    /// Version string used in announcements and the startup lock name.
    pub fn resolve_version(&self, version_file: &Path) -> String {
        if let Some(version) = self.startup.version.as_deref() {
            return version.trim().to_string();
        }
        match std::fs::read_to_string(version_file) {
            Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
            _ => env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
