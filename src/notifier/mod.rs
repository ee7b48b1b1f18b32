//! Startup announcement that fires once per deployment generation, no matter
//! how many replicas boot at the same time.
//!
//! Flow per process: compare the live [`EnvironmentFingerprint`] with the one
//! in the shared store. Unchanged means a plain restart and nothing is sent.
//! Otherwise race for a version-scoped lease; the single winner re-checks,
//! persists the new fingerprint, releases the lease and schedules the
//! announcement a few seconds after process start. Every store error is
//! treated as having lost the race.

pub mod fingerprint;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::coordination::CoordinationStore;
use crate::platform::Platforms;
use crate::relay::OwnerDestinations;
use crate::scheduler::Scheduler;

pub use fingerprint::EnvironmentFingerprint;

#[derive(Debug)]
pub enum NotifierOutcome {
    /// Same generation as the last announcement
    Unchanged,
    /// Another replica won, or the store was unusable
    Lost,
    Scheduled {
        run_at: DateTime<Utc>,
        job: JoinHandle<()>,
    },
}

pub fn announcement_text(version: &str) -> String {
    format!("Aura is now online and ready on version {}", version)
}

pub struct SingletonNotifier {
    store: Arc<dyn CoordinationStore>,
    platforms: Platforms,
    owners: OwnerDestinations,
    version: String,
    key_prefix: String,
    delay: Duration,
    lock_ttl: Duration,
}

impl SingletonNotifier {
    pub fn new(
        config: &Config,
        version: &str,
        store: Arc<dyn CoordinationStore>,
        platforms: Platforms,
        owners: OwnerDestinations,
    ) -> Self {
        Self {
            store,
            platforms,
            owners,
            version: version.to_string(),
            key_prefix: config.coordination.key_prefix.clone(),
            delay: config.announce_delay(),
            lock_ttl: config.lock_ttl(),
        }
    }

    pub fn lock_name(&self) -> String {
        format!("{}:startup-announce:{}", self.key_prefix, self.version)
    }

    pub async fn run(
        &self,
        started_at: DateTime<Utc>,
        current: &EnvironmentFingerprint,
        scheduler: &Scheduler,
    ) -> NotifierOutcome {
        let Some(run_at) = chrono::Duration::from_std(self.delay)
            .ok()
            .and_then(|delay| started_at.checked_add_signed(delay))
        else {
            warn!(
                "Announce delay {:?} is out of range, skipping startup announcement",
                self.delay
            );
            return NotifierOutcome::Lost;
        };

        match current.changed_keys(self.store.as_ref(), &self.key_prefix).await {
            Ok(changed) if changed.is_empty() => {
                info!("Deployment fingerprint unchanged, skipping startup announcement");
                return NotifierOutcome::Unchanged;
            }
            Ok(changed) => {
                info!("Deployment fingerprint changed: {}", changed.join(", "));
            }
            Err(e) => {
                warn!(
                    "Failed to read persisted fingerprint, skipping startup announcement: {:#}",
                    e
                );
                return NotifierOutcome::Lost;
            }
        }

        let lock_name = self.lock_name();
        let lease = match self.store.try_acquire(&lock_name, self.lock_ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                info!("Another instance has acquired {}, not announcing", lock_name);
                return NotifierOutcome::Lost;
            }
            Err(e) => {
                warn!("Failed to acquire {}, not announcing: {:#}", lock_name, e);
                return NotifierOutcome::Lost;
            }
        };
        info!("Lock {} acquired", lock_name);

        let claimed = self.claim(current).await;
        if let Err(e) = self.store.release(&lease).await {
            warn!("Failed to release {}, leaving it to expire: {:#}", lock_name, e);
        }

        match claimed {
            Ok(true) => {}
            Ok(false) => {
                info!("Fingerprint already recorded by another instance, not announcing");
                return NotifierOutcome::Unchanged;
            }
            Err(e) => {
                warn!("Failed to persist fingerprint, not announcing: {:#}", e);
                return NotifierOutcome::Lost;
            }
        }

        let job = scheduler
            .schedule_once("startup-announcement", run_at, self.announcement())
            .await;
        NotifierOutcome::Scheduled { run_at, job }
    }

    /// Holding the lease: re-check (an earlier holder may have persisted and
    /// released after our first read), then record our fingerprint.
    async fn claim(&self, current: &EnvironmentFingerprint) -> Result<bool> {
        let changed = current
            .changed_keys(self.store.as_ref(), &self.key_prefix)
            .await?;
        if changed.is_empty() {
            return Ok(false);
        }
        current.persist(self.store.as_ref(), &self.key_prefix).await?;
        Ok(true)
    }

    fn announcement(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let platforms = self.platforms.clone();
        let targets = self.owners.targets();
        let text = announcement_text(&self.version);
        async move {
            let delivered = platforms.broadcast(&targets, &text).await;
            info!(
                "Startup announcement delivered to {}/{} destinations",
                delivered,
                targets.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{Lease, MemoryStore};
    use crate::platform::testing::*;
    use crate::platform::Platform;
    use async_trait::async_trait;

    const MINIMAL: &str = r#"
[telegram]
bot_token = "t"
owner_id = "42"

[slack]
bot_token = "s"
owner_channel = "C0OWNER"

[startup]
announce_delay_secs = 0
"#;

    struct Fixture {
        telegram: Arc<RecordingClient>,
        slack: Arc<RecordingClient>,
        scheduler: Scheduler,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                telegram: Arc::new(RecordingClient::new(Platform::Telegram)),
                slack: Arc::new(RecordingClient::new(Platform::Slack)),
                scheduler: Scheduler::new(),
            }
        }

        fn notifier(&self, store: Arc<dyn CoordinationStore>, version: &str) -> SingletonNotifier {
            let config = Config::parse(MINIMAL).unwrap();
            SingletonNotifier::new(
                &config,
                version,
                store,
                platforms(self.telegram.clone(), self.slack.clone()),
                OwnerDestinations {
                    telegram: "42".to_string(),
                    slack: "C0OWNER".to_string(),
                },
            )
        }

        async fn sent_count(&self) -> usize {
            self.telegram.sent().await.len() + self.slack.sent().await.len()
        }
    }

    fn fingerprint(deployment: &str, version: &str) -> EnvironmentFingerprint {
        let deployment = deployment.to_string();
        EnvironmentFingerprint::capture(&["DEPLOYMENT_ID".to_string()], version, move |_| {
            Some(deployment.clone())
        })
    }

    async fn finish(outcome: NotifierOutcome) -> bool {
        match outcome {
            NotifierOutcome::Scheduled { job, .. } => {
                job.await.unwrap();
                true
            }
            _ => false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_changed_fingerprint_exactly_one_announcement() {
        let fixture = Arc::new(Fixture::new());
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let started_at = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let fixture = fixture.clone();
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let notifier = fixture.notifier(store, "1.0.0");
                let outcome = notifier
                    .run(started_at, &fingerprint("d2", "1.0.0"), &fixture.scheduler)
                    .await;
                finish(outcome).await
            }));
        }

        let mut announced = 0;
        for handle in handles {
            if handle.await.unwrap() {
                announced += 1;
            }
        }

        assert_eq!(announced, 1);
        let telegram = fixture.telegram.sent().await;
        let slack = fixture.slack.sent().await;
        assert_eq!(telegram.len(), 1);
        assert_eq!(slack.len(), 1);
        assert_eq!(telegram[0].destination, "42");
        assert_eq!(slack[0].destination, "C0OWNER");
        assert_eq!(
            slack[0].text,
            "Aura is now online and ready on version 1.0.0"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unchanged_fingerprint_no_announcement() {
        let fixture = Arc::new(Fixture::new());
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        fingerprint("d1", "1.0.0")
            .persist(store.as_ref(), "aura")
            .await
            .unwrap();

        let a = fixture.notifier(store.clone(), "1.0.0");
        let b = fixture.notifier(store.clone(), "1.0.0");
        let current = fingerprint("d1", "1.0.0");
        let (first, second) = tokio::join!(
            a.run(Utc::now(), &current, &fixture.scheduler),
            b.run(Utc::now(), &current, &fixture.scheduler),
        );

        assert!(matches!(first, NotifierOutcome::Unchanged));
        assert!(matches!(second, NotifierOutcome::Unchanged));
        assert_eq!(fixture.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_restart_after_announcement_is_quiet() {
        let fixture = Fixture::new();
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let notifier = fixture.notifier(store.clone(), "1.0.0");
        let current = fingerprint("d1", "1.0.0");

        assert!(finish(notifier.run(Utc::now(), &current, &fixture.scheduler).await).await);
        let again = notifier.run(Utc::now(), &current, &fixture.scheduler).await;
        assert!(matches!(again, NotifierOutcome::Unchanged));
        assert_eq!(fixture.sent_count().await, 2);
    }

    #[tokio::test]
    async fn test_version_bump_announces_again() {
        let fixture = Fixture::new();
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        fingerprint("d1", "1.0.0")
            .persist(store.as_ref(), "aura")
            .await
            .unwrap();

        let notifier = fixture.notifier(store, "1.1.0");
        assert_eq!(notifier.lock_name(), "aura:startup-announce:1.1.0");
        let outcome = notifier
            .run(Utc::now(), &fingerprint("d1", "1.1.0"), &fixture.scheduler)
            .await;
        assert!(finish(outcome).await);
        assert_eq!(
            fixture.telegram.sent().await[0].text,
            "Aura is now online and ready on version 1.1.0"
        );
    }

    #[tokio::test]
    async fn test_held_lease_means_lost() {
        let fixture = Fixture::new();
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let notifier = fixture.notifier(store.clone(), "1.0.0");
        store
            .try_acquire(&notifier.lock_name(), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let outcome = notifier
            .run(Utc::now(), &fingerprint("d1", "1.0.0"), &fixture.scheduler)
            .await;
        assert!(matches!(outcome, NotifierOutcome::Lost));
        assert_eq!(fixture.sent_count().await, 0);
        // loser leaves the stored fingerprint alone
        assert_eq!(store.get("aura:fingerprint:DEPLOYMENT_ID").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lease_released_after_win() {
        let fixture = Fixture::new();
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let notifier = fixture.notifier(store.clone(), "1.0.0");

        let outcome = notifier
            .run(Utc::now(), &fingerprint("d1", "1.0.0"), &fixture.scheduler)
            .await;
        assert!(matches!(outcome, NotifierOutcome::Scheduled { .. }));
        assert!(store
            .try_acquire(&notifier.lock_name(), Duration::from_secs(1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_run_at_is_start_plus_delay() {
        let fixture = Fixture::new();
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let mut notifier = fixture.notifier(store, "1.0.0");
        notifier.delay = Duration::from_secs(3600);
        let started_at = Utc::now();

        let outcome = notifier
            .run(started_at, &fingerprint("d1", "1.0.0"), &fixture.scheduler)
            .await;
        match outcome {
            NotifierOutcome::Scheduled { run_at, .. } => {
                assert_eq!(run_at, started_at + chrono::Duration::seconds(3600));
            }
            other => panic!("expected a scheduled announcement, got {:?}", other),
        }
        // not fired yet; shutdown drops it
        fixture.scheduler.shutdown().await;
        tokio::task::yield_now().await;
        assert_eq!(fixture.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_out_of_range_delay_is_lost_and_store_untouched() {
        let fixture = Fixture::new();
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let mut notifier = fixture.notifier(store.clone(), "1.0.0");
        notifier.delay = Duration::from_secs(u64::MAX);

        let outcome = notifier
            .run(Utc::now(), &fingerprint("d1", "1.0.0"), &fixture.scheduler)
            .await;
        assert!(matches!(outcome, NotifierOutcome::Lost));
        assert_eq!(store.get("aura:fingerprint:DEPLOYMENT_ID").await.unwrap(), None);
        assert_eq!(fixture.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_default_backend_quiet_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::parse(MINIMAL).unwrap();
        config.coordination.sqlite_path = dir.path().join("coord.db");
        let current = fingerprint("d1", "1.0.0");

        let mut outcomes = Vec::new();
        for _ in 0..2 {
            // each iteration is a fresh process: new store handle, new clients
            let fixture = Fixture::new();
            let store = crate::coordination::connect(&config.coordination)
                .await
                .unwrap();
            let notifier = fixture.notifier(store, "1.0.0");
            outcomes.push(notifier.run(Utc::now(), &current, &fixture.scheduler).await);
        }

        assert!(matches!(outcomes[0], NotifierOutcome::Scheduled { .. }));
        assert!(matches!(outcomes[1], NotifierOutcome::Unchanged));
    }

    /// Store whose every call fails, as when Redis is unreachable.
    struct BrokenStore;

    #[async_trait]
    impl CoordinationStore for BrokenStore {
        async fn try_acquire(&self, _name: &str, _ttl: Duration) -> Result<Option<Lease>> {
            anyhow::bail!("connection refused")
        }
        async fn release(&self, _lease: &Lease) -> Result<()> {
            anyhow::bail!("connection refused")
        }
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            anyhow::bail!("connection refused")
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    /// Reads and leases work, writes fail.
    struct ReadOnlyStore(MemoryStore);

    #[async_trait]
    impl CoordinationStore for ReadOnlyStore {
        async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
            self.0.try_acquire(name, ttl).await
        }
        async fn release(&self, lease: &Lease) -> Result<()> {
            self.0.release(lease).await
        }
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<()> {
            anyhow::bail!("READONLY You can't write against a read only replica")
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_fail_safe() {
        let fixture = Fixture::new();
        let current = fingerprint("d1", "1.0.0");

        let broken = fixture.notifier(Arc::new(BrokenStore), "1.0.0");
        let outcome = broken.run(Utc::now(), &current, &fixture.scheduler).await;
        assert!(matches!(outcome, NotifierOutcome::Lost));

        let read_only = fixture.notifier(Arc::new(ReadOnlyStore(MemoryStore::new())), "1.0.0");
        let outcome = read_only.run(Utc::now(), &current, &fixture.scheduler).await;
        assert!(matches!(outcome, NotifierOutcome::Lost));

        assert_eq!(fixture.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_claim_skips_when_already_recorded() {
        let fixture = Fixture::new();
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let notifier = fixture.notifier(store.clone(), "1.0.0");
        let current = fingerprint("d1", "1.0.0");

        assert!(notifier.claim(&current).await.unwrap());
        assert!(!notifier.claim(&current).await.unwrap());
    }

    #[tokio::test]
    async fn test_announcement_survives_one_platform_failing() {
        let telegram = Arc::new(RecordingClient::failing(Platform::Telegram));
        let slack = Arc::new(RecordingClient::new(Platform::Slack));
        let config = Config::parse(MINIMAL).unwrap();
        let notifier = SingletonNotifier::new(
            &config,
            "1.0.0",
            Arc::new(MemoryStore::new()),
            platforms(telegram, slack.clone()),
            OwnerDestinations {
                telegram: "42".to_string(),
                slack: "C0OWNER".to_string(),
            },
        );
        let scheduler = Scheduler::new();

        let outcome = notifier
            .run(Utc::now(), &fingerprint("d1", "1.0.0"), &scheduler)
            .await;
        assert!(finish(outcome).await);
        assert_eq!(slack.sent().await.len(), 1);
    }
}
