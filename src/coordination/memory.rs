use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::coordination::{CoordinationStore, Lease};

#[derive(Default)]
struct State {
    leases: HashMap<String, (String, Instant)>,
    values: HashMap<String, String>,
}

/// Process-local store. Only coordinates tasks inside one process, which is
/// all a single-replica deployment needs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = state.leases.get(name) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let expires_at = now
            .checked_add(ttl)
            .with_context(|| format!("Lease ttl {:?} for {} is out of range", ttl, name))?;
        let lease = Lease::new(name);
        state
            .leases
            .insert(name.to_string(), (lease.token.clone(), expires_at));
        Ok(Some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .leases
            .get(&lease.name)
            .is_some_and(|(token, _)| *token == lease.token)
        {
            state.leases.remove(&lease.name);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}
