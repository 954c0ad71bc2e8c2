//! Aggregation store contract and the in-memory implementation
//!
//! A store keeps one pending group per correlation key. When a group
//! completes it is removed by key; a recoverable store keeps the removed group
//! under its id until `confirm` is called, so a crash between completion and
//! delivery can be healed by rescanning.

use super::error::StoreError;
use super::types::{CorrelationKey, ItemId, WorkItem};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Key -> group persistence shared by the merge, timeout and recovery paths
///
/// Implementations must tolerate concurrent calls from different tasks.
#[async_trait]
pub trait AggregationStore: Send + Sync {
    /// Store `group` under `key`, returning the previous value
    async fn add(
        &self,
        key: &CorrelationKey,
        group: WorkItem,
    ) -> Result<Option<WorkItem>, StoreError>;

    async fn get(&self, key: &CorrelationKey) -> Result<Option<WorkItem>, StoreError>;

    /// Remove the pending group for `key`; idempotent when absent
    async fn remove(&self, key: &CorrelationKey, group: &WorkItem) -> Result<(), StoreError>;

    /// Mark a delivered group as done; idempotent
    async fn confirm(&self, id: &ItemId) -> Result<(), StoreError>;

    async fn list_keys(&self) -> Result<HashSet<CorrelationKey>, StoreError>;

    /// Release resources during shutdown
    async fn stop(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Crash-recovery capability of a store
#[async_trait]
pub trait Recoverable: Send + Sync {
    /// Ids of groups removed on completion but never confirmed
    async fn scan_unconfirmed(&self) -> Result<HashSet<ItemId>, StoreError>;

    async fn recover(&self, id: &ItemId) -> Result<Option<WorkItem>, StoreError>;

    fn recovery_enabled(&self) -> bool;

    /// Zero means scan once at startup
    fn recovery_interval(&self) -> Duration;

    /// Redeliveries allowed before a group is dead lettered
    fn max_redeliveries(&self) -> Option<u32> {
        None
    }
}

/// Recovery settings shared by the bundled stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySettings {
    pub enabled: bool,
    pub interval: Duration,
    pub max_redeliveries: Option<u32>,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            max_redeliveries: None,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    pending: HashMap<CorrelationKey, WorkItem>,
    completed: HashMap<ItemId, WorkItem>,
}

/// In-memory store
///
/// With recovery enabled, completed groups are kept until confirmed and can
/// be recovered within the process lifetime. Without it nothing could ever
/// recover them, so `remove` drops the group outright.
pub struct MemoryAggregationStore {
    state: Mutex<MemoryState>,
    recovery: RecoverySettings,
}

impl MemoryAggregationStore {
    /// Store without recovery; completed groups are not retained
    pub fn new() -> Self {
        Self::without_recovery()
    }

    pub fn without_recovery() -> Self {
        Self::with_recovery(RecoverySettings {
            enabled: false,
            ..RecoverySettings::default()
        })
    }

    pub fn with_recovery(recovery: RecoverySettings) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            recovery,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Poisoned("memory aggregation store"))
    }

    /// Number of completed groups awaiting confirmation
    pub fn unconfirmed_len(&self) -> usize {
        self.lock().map(|s| s.completed.len()).unwrap_or(0)
    }
}

impl Default for MemoryAggregationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregationStore for MemoryAggregationStore {
    async fn add(
        &self,
        key: &CorrelationKey,
        group: WorkItem,
    ) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.lock()?.pending.insert(key.clone(), group))
    }

    async fn get(&self, key: &CorrelationKey) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.lock()?.pending.get(key).cloned())
    }

    async fn remove(&self, key: &CorrelationKey, group: &WorkItem) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.pending.remove(key);
        if self.recovery.enabled {
            state.completed.insert(group.id(), group.clone());
        }
        Ok(())
    }

    async fn confirm(&self, id: &ItemId) -> Result<(), StoreError> {
        if self.lock()?.completed.remove(id).is_some() {
            log::trace!("Confirmed group {}", id);
        }
        Ok(())
    }

    async fn list_keys(&self) -> Result<HashSet<CorrelationKey>, StoreError> {
        Ok(self.lock()?.pending.keys().cloned().collect())
    }

    fn backend_type(&self) -> &'static str {
        "Memory"
    }
}

#[async_trait]
impl Recoverable for MemoryAggregationStore {
    async fn scan_unconfirmed(&self) -> Result<HashSet<ItemId>, StoreError> {
        Ok(self.lock()?.completed.keys().copied().collect())
    }

    async fn recover(&self, id: &ItemId) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.lock()?.completed.get(id).cloned())
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_get_replace() {
        let store = MemoryAggregationStore::new();
        let key = CorrelationKey::from("k");

        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.add(&key, WorkItem::new("a")).await.unwrap().is_none());

        let previous = store.add(&key, WorkItem::new("b")).await.unwrap();
        assert_eq!(previous.unwrap().body_text(), "a");
        assert_eq!(store.get(&key).await.unwrap().unwrap().body_text(), "b");
        assert_eq!(store.list_keys().await.unwrap(), HashSet::from([key]));
    }

    fn recoverable() -> MemoryAggregationStore {
        MemoryAggregationStore::with_recovery(RecoverySettings::default())
    }

    #[tokio::test]
    async fn test_remove_then_confirm() {
        let store = recoverable();
        let key = CorrelationKey::from("k");
        let group = WorkItem::new("a");
        store.add(&key, group.clone()).await.unwrap();

        store.remove(&key, &group).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.list_keys().await.unwrap().is_empty());
        assert_eq!(store.scan_unconfirmed().await.unwrap(), HashSet::from([group.id()]));
        assert_eq!(store.recover(&group.id()).await.unwrap(), Some(group.clone()));

        store.confirm(&group.id()).await.unwrap();
        assert!(store.scan_unconfirmed().await.unwrap().is_empty());

        // Second confirm is a no-op
        store.confirm(&group.id()).await.unwrap();
        assert_eq!(store.unconfirmed_len(), 0);
    }

    #[tokio::test]
    async fn test_remove_absent_key_is_idempotent() {
        let store = recoverable();
        let key = CorrelationKey::from("missing");
        let group = WorkItem::new("a");
        store.remove(&key, &group).await.unwrap();
        store.remove(&key, &group).await.unwrap();
        assert_eq!(store.unconfirmed_len(), 1);
    }

    #[tokio::test]
    async fn test_without_recovery_keeps_no_completed_groups() {
        let store = MemoryAggregationStore::without_recovery();
        assert!(!store.recovery_enabled());

        for n in 0..50 {
            let key = CorrelationKey::Integer(n);
            let group = WorkItem::new("a");
            store.add(&key, group.clone()).await.unwrap();
            store.remove(&key, &group).await.unwrap();
        }

        assert_eq!(store.unconfirmed_len(), 0);
        assert!(store.scan_unconfirmed().await.unwrap().is_empty());
        assert!(store.list_keys().await.unwrap().is_empty());
    }
}
