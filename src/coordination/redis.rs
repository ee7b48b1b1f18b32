use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::interfaces::LuaInterface;
use fred::prelude::*;
use fred::types::{Expiration, SetOptions};
use tracing::info;

use crate::coordination::{CoordinationStore, Lease};

/// Deletes the lease only if it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed store; the usual choice when replicas run on separate hosts.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let config = Config::from_url(redis_url).context("Invalid Redis URL")?;
        let client = Client::new(config, None, None, None);
        client.connect();
        client
            .wait_for_connect()
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis");
        Ok(Self { client })
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
        let lease = Lease::new(name);
        // SET NX answers OK when it wrote and nil when the key already existed
        let acquired: Option<String> = self
            .client
            .set(
                lease.name.as_str(),
                lease.token.as_str(),
                Some(Expiration::PX(ttl_millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await
            .with_context(|| format!("Failed to acquire lease {}", name))?;
        Ok(acquired.map(|_| lease))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let _: i64 = self
            .client
            .eval(
                RELEASE_SCRIPT,
                vec![lease.name.clone()],
                vec![lease.token.clone()],
            )
            .await
            .with_context(|| format!("Failed to release lease {}", lease.name))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.client
            .get(key)
            .await
            .with_context(|| format!("Failed to read {}", key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.client
            .set::<(), _, _>(key, value, None, None, false)
            .await
            .with_context(|| format!("Failed to write {}", key))
    }
}
