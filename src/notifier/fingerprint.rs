use anyhow::Result;
use tracing::warn;

use crate::coordination::CoordinationStore;

/// Pseudo-key carrying the software version, so a release is always a new
/// generation even when the platform variables repeat.
pub const VERSION_KEY: &str = "APP_VERSION";

/// Snapshot of the deployment-identity variables, in configured order.
///
/// An unset variable (`None`) and a variable set to the empty string
/// (`Some("")`) are different states. Persisted values are the JSON encoding
/// of the `Option<String>`, so `null` and `""` survive the round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentFingerprint {
    entries: Vec<(String, Option<String>)>,
}

impl EnvironmentFingerprint {
    pub fn capture<F>(keys: &[String], version: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut entries: Vec<(String, Option<String>)> = keys
            .iter()
            .filter(|k| k.as_str() != VERSION_KEY)
            .map(|k| (k.clone(), lookup(k)))
            .collect();
        entries.push((VERSION_KEY.to_string(), Some(version.to_string())));
        Self { entries }
    }

    pub fn from_env(keys: &[String], version: &str) -> Self {
        Self::capture(keys, version, |k| std::env::var(k).ok())
    }

    pub fn entries(&self) -> &[(String, Option<String>)] {
        &self.entries
    }

    fn storage_key(prefix: &str, key: &str) -> String {
        format!("{}:fingerprint:{}", prefix, key)
    }

    fn encode(value: &Option<String>) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    /// Keys whose persisted value differs from ours. A key that was never
    /// persisted, or whose stored value can't be decoded, counts as changed.
    pub async fn changed_keys(
        &self,
        store: &dyn CoordinationStore,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        for (key, current) in &self.entries {
            let stored = store.get(&Self::storage_key(prefix, key)).await?;
            let same = match stored {
                None => false,
                Some(raw) => match serde_json::from_str::<Option<String>>(&raw) {
                    Ok(persisted) => persisted == *current,
                    Err(e) => {
                        warn!("Undecodable fingerprint value for {}: {}", key, e);
                        false
                    }
                },
            };
            if !same {
                changed.push(key.clone());
            }
        }
        Ok(changed)
    }

    /// Overwrite every key. Only the lease holder calls this.
    pub async fn persist(&self, store: &dyn CoordinationStore, prefix: &str) -> Result<()> {
        for (key, value) in &self.entries {
            store
                .set(&Self::storage_key(prefix, key), &Self::encode(value)?)
                .await?;
        }
        Ok(())
    }
}
