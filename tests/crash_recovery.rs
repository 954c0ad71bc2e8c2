//! At-least-once delivery: redelivery of unconfirmed groups, dead lettering
//! and recovery across a restart of the SQLite store

use async_trait::async_trait;
use groupflow::aggregation::{
    AggregationCore, AggregationCoreBuilder, AggregationStore, CompletedBy, Concatenation,
    CorrelationKey, DeliveryError, Downstream, HeaderExpression, ItemId, MemoryAggregationStore,
    Recoverable, RecoverySettings, SqliteAggregationStore, StoreError, WorkItem,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::{sleep, Instant};

/// Fails the first `failures` deliveries, then records groups
struct Flaky {
    failures: usize,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<WorkItem>>,
}

impl Flaky {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn delivered(&self) -> Vec<WorkItem> {
        self.delivered.lock().unwrap().clone()
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downstream for Flaky {
    async fn deliver(&self, group: &WorkItem) -> Result<(), DeliveryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(DeliveryError::Rejected(format!("attempt {} failed", attempt + 1)));
        }
        self.delivered.lock().unwrap().push(group.clone());
        Ok(())
    }
}

/// Takes a while to deliver
struct Slow {
    calls: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl Downstream for Slow {
    async fn deliver(&self, _group: &WorkItem) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        Ok(())
    }
}

/// Memory store whose `recover` yields before answering
struct SlowRecover {
    inner: MemoryAggregationStore,
    delay: Duration,
}

#[async_trait]
impl AggregationStore for SlowRecover {
    async fn add(
        &self,
        key: &CorrelationKey,
        group: WorkItem,
    ) -> Result<Option<WorkItem>, StoreError> {
        self.inner.add(key, group).await
    }

    async fn get(&self, key: &CorrelationKey) -> Result<Option<WorkItem>, StoreError> {
        self.inner.get(key).await
    }

    async fn remove(&self, key: &CorrelationKey, group: &WorkItem) -> Result<(), StoreError> {
        self.inner.remove(key, group).await
    }

    async fn confirm(&self, id: &ItemId) -> Result<(), StoreError> {
        self.inner.confirm(id).await
    }

    async fn list_keys(&self) -> Result<HashSet<CorrelationKey>, StoreError> {
        self.inner.list_keys().await
    }

    fn backend_type(&self) -> &'static str {
        "SlowRecover"
    }
}

#[async_trait]
impl Recoverable for SlowRecover {
    async fn scan_unconfirmed(&self) -> Result<HashSet<ItemId>, StoreError> {
        self.inner.scan_unconfirmed().await
    }

    async fn recover(&self, id: &ItemId) -> Result<Option<WorkItem>, StoreError> {
        sleep(self.delay).await;
        self.inner.recover(id).await
    }

    fn recovery_enabled(&self) -> bool {
        self.inner.recovery_enabled()
    }

    fn recovery_interval(&self) -> Duration {
        self.inner.recovery_interval()
    }
}

fn item(key: &str, body: &str) -> WorkItem {
    WorkItem::new(body).with_header("id", key)
}

fn builder(downstream: Arc<dyn Downstream>) -> AggregationCoreBuilder {
    AggregationCore::builder()
        .correlation(HeaderExpression::<CorrelationKey>::new("id"))
        .strategy(Concatenation::default())
        .downstream(downstream)
}

fn recovery(interval_ms: u64, max_redeliveries: Option<u32>) -> RecoverySettings {
    RecoverySettings {
        enabled: true,
        interval: Duration::from_millis(interval_ms),
        max_redeliveries,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_failed_delivery_is_recovered() {
    let store = Arc::new(MemoryAggregationStore::with_recovery(recovery(50, None)));
    let downstream = Arc::new(Flaky::new(1));
    let core = builder(downstream.clone())
        .recoverable_store(store.clone())
        .completion_size(2)
        .build()
        .unwrap();
    core.start().unwrap();

    core.process(item("k", "A")).await.unwrap();
    core.process(item("k", "B")).await.unwrap();

    assert!(wait_until(|| downstream.delivered().len() == 1).await);
    core.shutdown().await.unwrap();

    let delivered = downstream.delivered();
    assert_eq!(delivered[0].body_text(), "A+B");
    assert_eq!(delivered[0].properties.redelivery_count, Some(1));
    assert_eq!(downstream.attempts(), 2);
    assert_eq!(store.unconfirmed_len(), 0);
}

#[tokio::test]
async fn test_in_flight_group_is_not_recovered() {
    let store = Arc::new(MemoryAggregationStore::with_recovery(recovery(20, None)));
    let downstream = Arc::new(Slow {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(300),
    });
    let core = builder(downstream.clone())
        .recoverable_store(store.clone())
        .completion_size(1)
        .build()
        .unwrap();
    core.start().unwrap();

    core.process(item("k", "A")).await.unwrap();
    assert!(wait_until(|| store.unconfirmed_len() == 0).await);
    core.shutdown().await.unwrap();

    assert_eq!(downstream.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_recovery_scans_deliver_once() {
    let inner = MemoryAggregationStore::with_recovery(recovery(0, None));
    let key = CorrelationKey::from("k");
    let mut group = WorkItem::new("A+B");
    group.properties.correlation_key = Some(key.clone());
    inner.add(&key, group.clone()).await.unwrap();
    inner.remove(&key, &group).await.unwrap();

    let store = Arc::new(SlowRecover {
        inner,
        delay: Duration::from_millis(5),
    });
    let downstream = Arc::new(Slow {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(100),
    });
    let core = builder(downstream.clone())
        .recoverable_store(store.clone())
        .completion_size(1)
        .build()
        .unwrap();

    let (first, second) = tokio::join!(core.recover_now(), core.recover_now());
    assert_eq!(first.unwrap() + second.unwrap(), 1);
    core.drain().await;

    assert_eq!(downstream.calls.load(Ordering::SeqCst), 1);
    assert!(store.scan_unconfirmed().await.unwrap().is_empty());
    assert_eq!(core.in_flight_count(), 0);
}

#[tokio::test]
async fn test_exhausted_group_goes_to_dead_letter() {
    let store = Arc::new(MemoryAggregationStore::with_recovery(recovery(30, Some(1))));
    let downstream = Arc::new(Flaky::new(usize::MAX));
    let dead_letter = Arc::new(Flaky::new(0));
    let core = builder(downstream.clone())
        .recoverable_store(store.clone())
        .dead_letter(dead_letter.clone())
        .completion_size(1)
        .build()
        .unwrap();
    core.start().unwrap();

    core.process(item("k", "A")).await.unwrap();
    assert!(wait_until(|| dead_letter.delivered().len() == 1).await);
    core.shutdown().await.unwrap();

    // One initial delivery plus one redelivery
    assert_eq!(downstream.attempts(), 2);
    assert_eq!(dead_letter.delivered()[0].properties.redelivery_count, Some(2));
    assert_eq!(store.unconfirmed_len(), 0);
}

#[tokio::test]
async fn test_recover_now_without_recoverable_store() {
    let downstream = Arc::new(Flaky::new(0));
    let core = builder(downstream)
        .store(Arc::new(MemoryAggregationStore::new()))
        .completion_size(1)
        .build()
        .unwrap();

    assert_eq!(core.recover_now().await.unwrap(), 0);
}

#[tokio::test]
async fn test_sqlite_restart_recovers_unconfirmed_and_pending_groups() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("data").join("groupflow.db");

    // First run: delivery of the completed group always fails
    {
        let store = Arc::new(SqliteAggregationStore::open(&db_path, recovery(0, None)).unwrap());
        let core = builder(Arc::new(Flaky::new(usize::MAX)))
            .recoverable_store(store.clone())
            .completion_size(2)
            .build()
            .unwrap();

        core.process(item("done", "A")).await.unwrap();
        core.process(item("done", "B")).await.unwrap();
        core.process(item("open", "C")).await.unwrap();
        core.drain().await;
        core.shutdown().await.unwrap();

        assert_eq!(store.scan_unconfirmed().await.unwrap().len(), 1);
    }

    // Second run: recovery redelivers, pending group keeps merging
    let store = Arc::new(SqliteAggregationStore::open(&db_path, recovery(0, None)).unwrap());
    let downstream = Arc::new(Flaky::new(0));
    let core = builder(downstream.clone())
        .recoverable_store(store.clone())
        .completion_size(2)
        .build()
        .unwrap();

    assert_eq!(core.recover_now().await.unwrap(), 1);
    core.drain().await;
    assert_eq!(downstream.delivered()[0].body_text(), "A+B");
    assert!(store.scan_unconfirmed().await.unwrap().is_empty());

    core.process(item("open", "D")).await.unwrap();
    core.drain().await;

    let delivered = downstream.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1].body_text(), "C+D");
    assert!(store.list_keys().await.unwrap().is_empty());

    // Confirming an already confirmed group is a no-op
    store.confirm(&delivered[0].id()).await.unwrap();
    core.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_one_shot_recovery_on_start() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("groupflow.db");

    {
        let store = Arc::new(SqliteAggregationStore::open(&db_path, recovery(0, None)).unwrap());
        let core = builder(Arc::new(Flaky::new(usize::MAX)))
            .recoverable_store(store)
            .completion_size(1)
            .build()
            .unwrap();
        core.process(item("k", "A")).await.unwrap();
        core.drain().await;
    }

    let store = Arc::new(SqliteAggregationStore::open(&db_path, recovery(0, None)).unwrap());
    let downstream = Arc::new(Flaky::new(0));
    let core = builder(downstream.clone())
        .recoverable_store(store.clone())
        .completion_size(1)
        .build()
        .unwrap();
    core.start().unwrap();

    assert!(wait_until(|| downstream.delivered().len() == 1).await);
    core.shutdown().await.unwrap();
    assert!(store.scan_unconfirmed().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sqlite_restart_rearms_completion_timeout() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("groupflow.db");

    {
        let store = Arc::new(SqliteAggregationStore::open(&db_path, recovery(0, None)).unwrap());
        let core = builder(Arc::new(Flaky::new(0)))
            .recoverable_store(store)
            .completion_timeout(Duration::from_millis(100))
            .timeout_poll_interval(Duration::from_millis(20))
            .build()
            .unwrap();
        core.process(item("k", "A")).await.unwrap();
        core.shutdown().await.unwrap();
    }

    let store = Arc::new(SqliteAggregationStore::open(&db_path, recovery(0, None)).unwrap());
    let downstream = Arc::new(Flaky::new(0));
    let core = builder(downstream.clone())
        .recoverable_store(store.clone())
        .completion_timeout(Duration::from_millis(100))
        .timeout_poll_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    core.start().unwrap();

    assert!(wait_until(|| downstream.delivered().len() == 1).await);
    core.shutdown().await.unwrap();

    let delivered = downstream.delivered();
    assert_eq!(delivered[0].body_text(), "A");
    assert_eq!(delivered[0].completed_by(), Some(CompletedBy::Timeout));
    assert!(store.list_keys().await.unwrap().is_empty());
}
