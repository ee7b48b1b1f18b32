use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::coordination::{CoordinationStore, Lease};

/// How long a writer waits on another replica's transaction before giving up.
/// Short, so acquisition stays effectively non-blocking.
const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// SQLite-backed store for replicas sharing one database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // before anything that writes, so replicas creating the file together wait
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Coordination store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS leases (
                name TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fingerprint (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )
        .context("Failed to run coordination migrations")?;
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<Lease>> {
        let mut conn = self.conn.lock().await;
        let now = chrono::Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let lease = Lease::new(name);

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin lease transaction")?;
        tx.execute(
            "DELETE FROM leases WHERE name = ?1 AND expires_at <= ?2",
            rusqlite::params![name, now],
        )
        .context("Failed to clear expired lease")?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO leases (name, token, expires_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![lease.name, lease.token, expires_at],
            )
            .context("Failed to insert lease")?;
        tx.commit().context("Failed to commit lease transaction")?;

        Ok((inserted == 1).then_some(lease))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM leases WHERE name = ?1 AND token = ?2",
            rusqlite::params![lease.name, lease.token],
        )
        .context("Failed to release lease")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM fingerprint WHERE key = ?1",
            rusqlite::params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("Failed to read {}", key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO fingerprint (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            rusqlite::params![key, value],
        )
        .with_context(|| format!("Failed to write {}", key))?;
        Ok(())
    }
}
