//! SQLite-backed aggregation store
//!
//! Pending groups live in `aggregation_pending` keyed by the serialized
//! correlation key. Completed groups move to `aggregation_completed` until
//! confirmed, which is what makes recovery survive a process restart.

use super::error::StoreError;
use super::store::{AggregationStore, Recoverable, RecoverySettings};
use super::types::{CorrelationKey, ItemId, WorkItem};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub struct SqliteAggregationStore {
    conn: Arc<Mutex<Connection>>,
    recovery: RecoverySettings,
}

impl SqliteAggregationStore {
    /// Open (or create) the database and its schema
    pub fn open(db_path: impl AsRef<Path>, recovery: RecoverySettings) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Io(std::io::Error::new(
                        e.kind(),
                        format!("Failed to create database directory {}: {}", parent.display(), e),
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path.as_ref())?;
        Self::initialize(&conn)?;

        log::info!(
            "SQLite aggregation store initialized at {} (recovery: {})",
            db_path.as_ref().display(),
            if recovery.enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            recovery,
        })
    }

    fn initialize(conn: &Connection) -> Result<(), StoreError> {
        // journal_mode reports the resulting mode as a row
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS aggregation_pending (
                correlation_key TEXT PRIMARY KEY,
                item_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS aggregation_completed (
                item_id TEXT PRIMARY KEY,
                correlation_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                completed_at INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Poisoned("sqlite aggregation store"))
    }

    fn decode(payload: Option<String>) -> Result<Option<WorkItem>, StoreError> {
        payload
            .map(|raw| serde_json::from_str::<WorkItem>(&raw))
            .transpose()
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl AggregationStore for SqliteAggregationStore {
    async fn add(
        &self,
        key: &CorrelationKey,
        group: WorkItem,
    ) -> Result<Option<WorkItem>, StoreError> {
        let storage_key = key.to_storage_string()?;
        let payload = serde_json::to_string(&group)?;
        let now = chrono::Utc::now().timestamp_millis();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let previous: Option<String> = tx
            .query_row(
                "SELECT payload FROM aggregation_pending WHERE correlation_key = ?1",
                params![storage_key],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute(
            "INSERT INTO aggregation_pending (correlation_key, item_id, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(correlation_key) DO UPDATE SET
                item_id = excluded.item_id,
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![storage_key, group.id().to_string(), payload, now],
        )?;
        tx.commit()?;

        Self::decode(previous)
    }

    async fn get(&self, key: &CorrelationKey) -> Result<Option<WorkItem>, StoreError> {
        let storage_key = key.to_storage_string()?;
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM aggregation_pending WHERE correlation_key = ?1",
                params![storage_key],
                |row| row.get(0),
            )
            .optional()?;
        Self::decode(payload)
    }

    async fn remove(&self, key: &CorrelationKey, group: &WorkItem) -> Result<(), StoreError> {
        let storage_key = key.to_storage_string()?;
        let payload = serde_json::to_string(group)?;
        let now = chrono::Utc::now().timestamp_millis();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM aggregation_pending WHERE correlation_key = ?1",
            params![storage_key],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO aggregation_completed
             (item_id, correlation_key, payload, completed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![group.id().to_string(), storage_key, payload, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn confirm(&self, id: &ItemId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM aggregation_completed WHERE item_id = ?1",
            params![id.to_string()],
        )?;
        if removed > 0 {
            log::trace!("Confirmed group {}", id);
        }
        Ok(())
    }

    async fn list_keys(&self) -> Result<HashSet<CorrelationKey>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT correlation_key FROM aggregation_pending")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut keys = HashSet::new();
        for raw in rows {
            keys.insert(CorrelationKey::from_storage_str(&raw?)?);
        }
        Ok(keys)
    }

    async fn stop(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        // Fold the WAL back into the main file so a restart starts clean
        let _: (i64, i64, i64) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}

#[async_trait]
impl Recoverable for SqliteAggregationStore {
    async fn scan_unconfirmed(&self) -> Result<HashSet<ItemId>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT item_id FROM aggregation_completed")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = HashSet::new();
        for raw in rows {
            let raw = raw?;
            match raw.parse::<ItemId>() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => log::warn!("Skipping unparsable item id {}: {}", raw, e),
            }
        }
        Ok(ids)
    }

    async fn recover(&self, id: &ItemId) -> Result<Option<WorkItem>, StoreError> {
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM aggregation_completed WHERE item_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Self::decode(payload)
    }

    fn recovery_enabled(&self) -> bool {
        self.recovery.enabled
    }

    fn recovery_interval(&self) -> Duration {
        self.recovery.interval
    }

    fn max_redeliveries(&self) -> Option<u32> {
        self.recovery.max_redeliveries
    }
}
