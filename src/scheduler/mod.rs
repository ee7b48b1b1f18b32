use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::info;

/// Runs one-shot background tasks at a wall-clock time. Nothing recurs and
/// nothing survives the process: pending tasks are dropped on shutdown.
#[derive(Default)]
pub struct Scheduler {
    pending: Mutex<Vec<AbortHandle>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` to run at `run_at` (immediately if that is in the past).
    pub async fn schedule_once<F>(&self, name: &str, run_at: DateTime<Utc>, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job_name = name.to_string();
        let delay = (run_at - Utc::now()).to_std().unwrap_or_default();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Running scheduled task: {}", job_name);
            task.await;
        });

        let mut pending = self.pending.lock().await;
        pending.retain(|h| !h.is_finished());
        pending.push(handle.abort_handle());

        info!("Scheduled task '{}' for {}", name, run_at.to_rfc3339());
        handle
    }

    /// Cancel everything that has not fired yet.
    pub async fn shutdown(&self) {
        let mut pending = self.pending.lock().await;
        let unfired = pending.iter().filter(|h| !h.is_finished()).count();
        for handle in pending.drain(..) {
            handle.abort();
        }
        info!("Scheduler stopped ({} pending task(s) dropped)", unfired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_once_at_time() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = scheduler
            .schedule_once(
                "ping",
                Utc::now() + chrono::Duration::milliseconds(20),
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_past_time_runs_immediately() {
        let scheduler = Scheduler::new();
        let handle = scheduler
            .schedule_once("late", Utc::now() - chrono::Duration::seconds(5), async {})
            .await;
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("task should not wait")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drops_unfired() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let handle = scheduler
            .schedule_once("later", Utc::now() + chrono::Duration::hours(1), async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        scheduler.shutdown().await;

        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
