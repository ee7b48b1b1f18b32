mod config;
mod coordination;
mod notifier;
mod platform;
mod relay;
mod scheduler;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::notifier::{EnvironmentFingerprint, NotifierOutcome, SingletonNotifier};
use crate::platform::slack::SlackClient;
use crate::platform::telegram::TelegramClient;
use crate::platform::Platforms;
use crate::relay::webhook::{self, AppState};
use crate::relay::{OwnerDestinations, Relay, RelayPolicy};
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    let started_at = chrono::Utc::now();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,aura_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let version = config.resolve_version(Path::new("VERSION"));

    info!("Configuration loaded successfully");
    info!("  Version: {}", version);
    info!("  Bind: {}", config.server.bind);
    info!("  Coordination: {}", config.coordination.backend);
    info!("  Announce delay: {:?}", config.announce_delay());

    let platforms = Platforms::new(
        Arc::new(TelegramClient::new(&config.telegram, config.delivery_timeout())?),
        Arc::new(SlackClient::new(&config.slack, config.delivery_timeout())?),
        config.delivery_timeout(),
    );
    let owners = OwnerDestinations {
        telegram: config.telegram.owner_id.clone(),
        slack: config.slack.owner_channel.clone(),
    };
    let relay = Relay::new(
        platforms.clone(),
        RelayPolicy::new(
            config.telegram.owner_id.clone(),
            config.relay.denylisted_names.clone(),
        ),
        owners.clone(),
    );

    let scheduler = Arc::new(Scheduler::new());
    spawn_startup_announcement(
        &config,
        &version,
        started_at,
        platforms,
        owners,
        scheduler.clone(),
    );

    let state = Arc::new(AppState {
        relay,
        version: version.clone(),
    });
    let app = webhook::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;
    info!("Aura relay listening on {}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    scheduler.shutdown().await;
    info!("Aura relay stopped");
    Ok(())
}

/// Runs beside the HTTP server; never holds up request handling and never
/// takes the process down.
fn spawn_startup_announcement(
    config: &Config,
    version: &str,
    started_at: chrono::DateTime<chrono::Utc>,
    platforms: Platforms,
    owners: OwnerDestinations,
    scheduler: Arc<Scheduler>,
) {
    let config = config.clone();
    let version = version.to_string();

    tokio::spawn(async move {
        let connect = coordination::connect(&config.coordination);
        let store = match tokio::time::timeout(config.lock_ttl(), connect).await {
            Ok(Ok(store)) => store,
            Ok(Err(e)) => {
                warn!("Coordination store unavailable, skipping startup announcement: {:#}", e);
                return;
            }
            Err(_) => {
                warn!("Timed out connecting to coordination store, skipping startup announcement");
                return;
            }
        };

        let fingerprint =
            EnvironmentFingerprint::from_env(&config.startup.fingerprint_keys, &version);
        let unset: Vec<&str> = fingerprint
            .entries()
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(key, _)| key.as_str())
            .collect();
        if !unset.is_empty() {
            info!("Fingerprint variables not set: {}", unset.join(", "));
        }
        let notifier = SingletonNotifier::new(&config, &version, store, platforms, owners);

        match notifier.run(started_at, &fingerprint, &scheduler).await {
            NotifierOutcome::Scheduled { run_at, .. } => {
                info!("Startup announcement scheduled for {}", run_at.to_rfc3339());
            }
            NotifierOutcome::Unchanged => info!("Startup announcement not needed"),
            NotifierOutcome::Lost => info!("Startup announcement left to another instance"),
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
