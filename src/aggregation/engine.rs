//! Aggregation core - orchestration of correlation, merge, completion and
//! dispatch
//!
//! ## Flow
//!
//! ```text
//! WorkItem
//!     ↓
//! AggregationCore::process()  (correlation key, closed-key check)
//!     ↓
//! merge step                  (single merge lock per core)
//!     ↓
//! CompletionPolicy::evaluate()
//!     ├─ pending  → store.add()            (+ timeout armed)
//!     └─ complete → store.remove() → WorkerPool → Downstream → store.confirm()
//! ```
//!
//! The timeout sweep, the recovery scheduler and the interval task run on
//! their own tasks and re-enter the completion and dispatch paths.

use super::closed_keys::ClosedKeys;
use super::completion::{CompletionDecision, CompletionPolicy};
use super::config::AggregatorConfig;
use super::dispatch::{
    Downstream, FailureHandler, InFlight, InFlightGuard, LoggingFailureHandler, WorkerPool,
};
use super::error::{AggregationError, DeliveryError, StoreError};
use super::expression::{Expression, Predicate};
use super::recovery::{RecoveredGroup, RecoveryScheduler};
use super::store::{AggregationStore, MemoryAggregationStore, Recoverable};
use super::strategy::MergeStrategy;
use super::timeout::TimeoutScheduler;
use super::types::{CompletedBy, CorrelationKey, WorkItem};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Successful outcome of `process()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Correlation key was invalid and invalid keys are ignored
    Dropped,
    /// Merged and persisted; waiting for more items
    Pending { key: CorrelationKey, size: usize },
    /// Merged and handed to dispatch
    Completed {
        key: CorrelationKey,
        completed_by: CompletedBy,
    },
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Builder wiring the collaborators of an `AggregationCore`
pub struct AggregationCoreBuilder {
    config: AggregatorConfig,
    correlation: Option<Arc<dyn Expression<CorrelationKey>>>,
    strategy: Option<Arc<dyn MergeStrategy>>,
    store: Option<Arc<dyn AggregationStore>>,
    recoverable: Option<Arc<dyn Recoverable>>,
    downstream: Option<Arc<dyn Downstream>>,
    dead_letter: Option<Arc<dyn Downstream>>,
    failure_handler: Arc<dyn FailureHandler>,
    predicate: Option<Arc<dyn Predicate>>,
    size_expression: Option<Arc<dyn Expression<usize>>>,
    timeout_expression: Option<Arc<dyn Expression<Duration>>>,
}

impl Default for AggregationCoreBuilder {
    fn default() -> Self {
        Self {
            config: AggregatorConfig::default(),
            correlation: None,
            strategy: None,
            store: None,
            recoverable: None,
            downstream: None,
            dead_letter: None,
            failure_handler: Arc::new(LoggingFailureHandler),
            predicate: None,
            size_expression: None,
            timeout_expression: None,
        }
    }
}

impl AggregationCoreBuilder {
    /// Replace all scalar knobs at once
    pub fn config(mut self, config: AggregatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn correlation(mut self, expression: impl Expression<CorrelationKey> + 'static) -> Self {
        self.correlation = Some(Arc::new(expression));
        self
    }

    pub fn strategy(mut self, strategy: impl MergeStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    /// Store without crash recovery
    pub fn store(mut self, store: Arc<dyn AggregationStore>) -> Self {
        self.store = Some(store);
        self.recoverable = None;
        self
    }

    /// Store that also offers the recovery capability
    pub fn recoverable_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: AggregationStore + Recoverable + 'static,
    {
        self.recoverable = Some(store.clone() as Arc<dyn Recoverable>);
        self.store = Some(store as Arc<dyn AggregationStore>);
        self
    }

    pub fn downstream(mut self, downstream: Arc<dyn Downstream>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    /// Receives recovered groups that exceeded the redelivery limit
    pub fn dead_letter(mut self, dead_letter: Arc<dyn Downstream>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn failure_handler(mut self, handler: Arc<dyn FailureHandler>) -> Self {
        self.failure_handler = handler;
        self
    }

    pub fn completion_predicate(mut self, predicate: impl Predicate + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn completion_size(mut self, size: usize) -> Self {
        self.config.completion_size = size;
        self
    }

    pub fn completion_size_expression(mut self, expression: impl Expression<usize> + 'static) -> Self {
        self.size_expression = Some(Arc::new(expression));
        self
    }

    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.completion_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn completion_timeout_expression(
        mut self,
        expression: impl Expression<Duration> + 'static,
    ) -> Self {
        self.timeout_expression = Some(Arc::new(expression));
        self
    }

    pub fn completion_interval(mut self, period: Duration) -> Self {
        self.config.completion_interval_ms = saturating_millis(period);
        self
    }

    pub fn timeout_poll_interval(mut self, period: Duration) -> Self {
        self.config.timeout_poll_interval_ms = saturating_millis(period);
        self
    }

    pub fn eager_check_completion(mut self, enabled: bool) -> Self {
        self.config.eager_check_completion = enabled;
        self
    }

    pub fn ignore_invalid_correlation_keys(mut self, enabled: bool) -> Self {
        self.config.ignore_invalid_correlation_keys = enabled;
        self
    }

    /// Close keys on completion; `capacity == 0` keeps every closed key
    pub fn close_correlation_key_on_completion(mut self, capacity: usize) -> Self {
        self.config.close_correlation_key_on_completion = true;
        self.config.closed_key_capacity = capacity;
        self
    }

    pub fn completion_from_batch_consumer(mut self, enabled: bool) -> Self {
        self.config.completion_from_batch_consumer = enabled;
        self
    }

    pub fn force_completion_on_stop(mut self, enabled: bool) -> Self {
        self.config.force_completion_on_stop = enabled;
        self
    }

    pub fn discard_on_completion_timeout(mut self, enabled: bool) -> Self {
        self.config.discard_on_completion_timeout = enabled;
        self
    }

    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.config.worker_pool_size = size;
        self
    }

    /// Validate the wiring and create the core
    ///
    /// Background tasks are started separately by `AggregationCore::start`.
    pub fn build(self) -> Result<AggregationCore, AggregationError> {
        let correlation = self.correlation.ok_or_else(|| {
            AggregationError::Configuration("correlation expression must be set".to_string())
        })?;
        let strategy = self.strategy.ok_or_else(|| {
            AggregationError::Configuration("merge strategy must be set".to_string())
        })?;
        let downstream = self.downstream.ok_or_else(|| {
            AggregationError::Configuration("downstream consumer must be set".to_string())
        })?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryAggregationStore::without_recovery()));

        let config = self.config;
        let mut policy = CompletionPolicy::new()
            .with_size(config.completion_size)
            .with_timeout(config.completion_timeout())
            .with_interval(config.completion_interval())
            .with_batch_consumer(config.completion_from_batch_consumer);
        if let Some(predicate) = self.predicate {
            policy = policy.with_predicate(predicate);
        }
        if let Some(expression) = self.size_expression {
            policy = policy.with_size_expression(expression);
        }
        if let Some(expression) = self.timeout_expression {
            policy = policy.with_timeout_expression(expression);
        }
        policy.validate()?;

        let in_flight = Arc::new(InFlight::new());
        let recovery = self
            .recoverable
            .map(|store| Arc::new(RecoveryScheduler::new(store, Arc::clone(&in_flight))));
        let closed_keys = config
            .close_correlation_key_on_completion
            .then(|| Mutex::new(ClosedKeys::with_capacity(config.closed_key_capacity)));
        let (shutdown_tx, _) = watch::channel(false);

        let inner = CoreInner {
            correlation,
            strategy,
            policy,
            store,
            downstream,
            dead_letter: self.dead_letter,
            failure_handler: self.failure_handler,
            merge_lock: tokio::sync::Mutex::new(()),
            closed_keys,
            in_flight,
            timeouts: Arc::new(TimeoutScheduler::new(config.timeout_poll_interval())),
            recovery,
            pool: WorkerPool::new(config.worker_pool_size),
            shutdown_tx,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        };

        Ok(AggregationCore {
            inner: Arc::new(inner),
        })
    }
}

struct CoreInner {
    correlation: Arc<dyn Expression<CorrelationKey>>,
    strategy: Arc<dyn MergeStrategy>,
    policy: CompletionPolicy,
    store: Arc<dyn AggregationStore>,
    downstream: Arc<dyn Downstream>,
    dead_letter: Option<Arc<dyn Downstream>>,
    failure_handler: Arc<dyn FailureHandler>,
    config: AggregatorConfig,

    /// Serializes the merge step across all keys
    merge_lock: tokio::sync::Mutex<()>,
    closed_keys: Option<Mutex<ClosedKeys>>,
    in_flight: Arc<InFlight>,
    timeouts: Arc<TimeoutScheduler>,
    recovery: Option<Arc<RecoveryScheduler>>,
    pool: WorkerPool,

    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Correlation-based aggregator
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct AggregationCore {
    inner: Arc<CoreInner>,
}

impl AggregationCore {
    pub fn builder() -> AggregationCoreBuilder {
        AggregationCoreBuilder::default()
    }

    /// Start the timeout sweep plus the recovery and interval tasks when
    /// configured. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), AggregationError> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.shutdown_tx.send_replace(false);

        let mut tasks = Vec::new();

        let weak = Arc::downgrade(inner);
        tasks.push(
            inner
                .timeouts
                .spawn(inner.shutdown_tx.subscribe(), move |key| {
                    let weak = Weak::clone(&weak);
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_timeout(key).await;
                        }
                    }
                }),
        );

        match &inner.recovery {
            Some(recovery) if recovery.enabled() => {
                let weak = Arc::downgrade(inner);
                tasks.push(recovery.spawn(inner.shutdown_tx.subscribe(), move |group| {
                    let weak = Weak::clone(&weak);
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.on_recovered(group).await;
                        }
                    }
                }));
            }
            Some(_) => log::info!("Recovery disabled by store"),
            None => log::debug!("Store composed without recovery"),
        }

        if let Some(period) = inner.policy.interval() {
            tasks.push(Self::spawn_interval_task(inner, period));
        }

        if inner.policy.has_timeout() {
            let weak = Arc::downgrade(inner);
            tasks.push(tokio::spawn(async move {
                let Some(inner) = weak.upgrade() else { return };
                match inner.restore_timeouts().await {
                    Ok(0) => {}
                    Ok(n) => log::info!("Restored timeout(s) for {} pending group(s)", n),
                    Err(e) => log::error!("Failed to restore pending timeouts: {}", e),
                }
            }));
        }

        inner.lock_tasks().extend(tasks);

        log::info!(
            "Aggregator started (store: {}, eager: {}, pool: {})",
            inner.store.backend_type(),
            inner.config.eager_check_completion,
            inner.config.worker_pool_size
        );
        Ok(())
    }

    fn spawn_interval_task(inner: &Arc<CoreInner>, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        let mut shutdown = inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            log::info!("Starting completion interval task (interval: {}ms)", period.as_millis());
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        match inner.complete_all(CompletedBy::Interval).await {
                            Ok(0) => {}
                            Ok(n) => log::debug!("Completion interval completed {} group(s)", n),
                            Err(e) => log::error!("Completion interval failed: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Offer an item to the aggregator
    ///
    /// Returns once the merged group is persisted or handed to dispatch; never
    /// waits for downstream delivery.
    pub async fn process(&self, item: WorkItem) -> Result<Accepted, AggregationError> {
        let inner = &self.inner;

        let key = match inner
            .correlation
            .evaluate(&item)
            .filter(CorrelationKey::is_valid)
        {
            Some(key) => key,
            None if inner.config.ignore_invalid_correlation_keys => {
                log::debug!("Dropping item {} with invalid correlation key", item.id());
                return Ok(Accepted::Dropped);
            }
            None => {
                return Err(AggregationError::CorrelationKey {
                    item: Box::new(item),
                })
            }
        };

        let _merge = inner.merge_lock.lock().await;
        if inner.is_closed(&key) {
            return Err(AggregationError::ClosedKey {
                key,
                item: Box::new(item),
            });
        }
        inner.merge(key, item).await
    }

    /// Complete the pending group for `key` now
    ///
    /// Returns false when no group is pending for the key.
    pub async fn force_completion_of_group(
        &self,
        key: &CorrelationKey,
    ) -> Result<bool, AggregationError> {
        let inner = &self.inner;
        let _merge = inner.merge_lock.lock().await;
        Ok(inner.complete_pending(key, CompletedBy::Force).await?)
    }

    /// Complete every pending group now; returns how many were completed
    pub async fn force_completion_of_all_groups(&self) -> Result<usize, AggregationError> {
        Ok(self.inner.complete_all(CompletedBy::Force).await?)
    }

    /// Run one recovery scan immediately; returns how many groups were
    /// resubmitted or dead lettered
    pub async fn recover_now(&self) -> Result<usize, AggregationError> {
        let inner = &self.inner;
        let Some(recovery) = &inner.recovery else {
            return Ok(0);
        };
        let groups = recovery.scan(&inner.shutdown_tx.subscribe()).await?;
        let count = groups.len();
        for group in groups {
            inner.on_recovered(group).await;
        }
        Ok(count)
    }

    /// Stop background tasks, wait for in-flight deliveries and stop the store
    ///
    /// Also valid on a core that was never started: pending groups are still
    /// force completed when configured and the store is still stopped.
    pub async fn shutdown(&self) -> Result<(), AggregationError> {
        let inner = &self.inner;
        let was_running = inner.running.swap(false, Ordering::SeqCst);
        log::info!("Stopping aggregator");

        if inner.config.force_completion_on_stop {
            let completed = inner.complete_all(CompletedBy::Force).await?;
            if completed > 0 {
                log::info!("Forced completion of {} pending group(s) on stop", completed);
            }
        }

        if was_running {
            inner.shutdown_tx.send_replace(true);
            let tasks: Vec<JoinHandle<()>> = inner.lock_tasks().drain(..).collect();
            for task in tasks {
                if let Err(e) = task.await {
                    log::warn!("Background task ended abnormally: {}", e);
                }
            }
        }
        // Rebuilt from the store by the next start()
        inner.timeouts.clear();

        inner.pool.drain().await;
        inner.store.stop().await?;

        if let Some(closed) = &inner.closed_keys {
            lock_closed(closed).clear();
        }
        log::info!("Aggregator stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self, key: &CorrelationKey) -> bool {
        self.inner.is_closed(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn pending_timeouts(&self) -> usize {
        self.inner.timeouts.len()
    }

    pub fn store(&self) -> &Arc<dyn AggregationStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    /// Wait until every submitted delivery has finished
    pub async fn drain(&self) {
        self.inner.pool.drain().await;
    }
}

fn lock_closed(closed: &Mutex<ClosedKeys>) -> MutexGuard<'_, ClosedKeys> {
    closed.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CoreInner {
    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self, key: &CorrelationKey) -> bool {
        self.closed_keys
            .as_ref()
            .is_some_and(|closed| lock_closed(closed).contains(key))
    }

    /// Merge step; caller holds the merge lock
    async fn merge(
        self: &Arc<Self>,
        key: CorrelationKey,
        mut item: WorkItem,
    ) -> Result<Accepted, AggregationError> {
        let previous = self.store.get(&key).await?;
        let size = previous.as_ref().map(WorkItem::aggregated_size).unwrap_or(0) + 1;
        let batch_hint = item.properties.batch_size;

        let mut decision = None;
        if self.config.eager_check_completion {
            item.properties.aggregated_size = Some(size);
            decision = Some(self.policy.evaluate(&item, batch_hint));
            item.properties.aggregated_size = None;
        }

        let mut merged = self.strategy.combine(previous, item);
        merged.properties.aggregated_size = Some(size);

        let decision = match decision {
            Some(decision) => decision,
            None => self.policy.evaluate(&merged, batch_hint),
        };

        match decision {
            CompletionDecision::Pending { timeout } => {
                self.store.add(&key, merged).await?;
                if let Some(delay) = timeout {
                    self.timeouts.register(key.clone(), delay);
                }
                log::trace!("Group {} pending with {} item(s)", key, size);
                Ok(Accepted::Pending { key, size })
            }
            CompletionDecision::Complete(completed_by) => {
                merged.properties.completed_by = Some(completed_by);
                self.complete(key.clone(), merged, false).await?;
                Ok(Accepted::Completed { key, completed_by })
            }
        }
    }

    /// Completion step; caller holds the merge lock
    async fn complete(
        self: &Arc<Self>,
        key: CorrelationKey,
        mut group: WorkItem,
        from_timeout: bool,
    ) -> Result<(), StoreError> {
        group.properties.correlation_key = Some(key.clone());
        // Tracked before the move so a concurrent recovery scan skips it
        let in_flight = self.in_flight.track(group.id());
        self.store.remove(&key, &group).await?;

        if !from_timeout {
            self.timeouts.cancel(&key);
        }
        if let Some(closed) = &self.closed_keys {
            lock_closed(closed).insert(key.clone());
        }

        log::debug!(
            "Completed group {} for {} ({} item(s), by {})",
            group.id(),
            key,
            group.aggregated_size(),
            group
                .completed_by()
                .map(|by| by.as_str())
                .unwrap_or("unknown")
        );

        if from_timeout && self.config.discard_on_completion_timeout {
            log::debug!("Discarding group {} completed by timeout", group.id());
            self.store.confirm(&group.id()).await?;
            return Ok(());
        }

        self.dispatch(group, in_flight);
        Ok(())
    }

    /// Complete the pending group for `key`, if any; caller holds the merge lock
    async fn complete_pending(
        self: &Arc<Self>,
        key: &CorrelationKey,
        completed_by: CompletedBy,
    ) -> Result<bool, StoreError> {
        match self.store.get(key).await? {
            Some(mut group) => {
                group.properties.completed_by = Some(completed_by);
                self.complete(key.clone(), group, false).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete_all(self: &Arc<Self>, completed_by: CompletedBy) -> Result<usize, StoreError> {
        let _merge = self.merge_lock.lock().await;
        let keys = self.store.list_keys().await?;

        let mut completed = 0;
        for key in keys {
            if self.complete_pending(&key, completed_by).await? {
                completed += 1;
            }
        }
        Ok(completed)
    }

    /// Re-arm deadlines for groups left pending by an earlier run or before a
    /// stop/start cycle
    async fn restore_timeouts(self: &Arc<Self>) -> Result<usize, StoreError> {
        let _merge = self.merge_lock.lock().await;

        let mut restored = 0;
        for key in self.store.list_keys().await? {
            if self.timeouts.contains(&key) {
                continue;
            }
            let Some(group) = self.store.get(&key).await? else {
                continue;
            };
            if let Some(delay) = self.policy.timeout_for(&group) {
                self.timeouts.register(key, delay);
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Called by the timeout sweep after it removed the entry for `key`
    async fn on_timeout(self: &Arc<Self>, key: CorrelationKey) {
        let _merge = self.merge_lock.lock().await;

        // A merge re-armed the deadline while we waited for the lock
        if self.timeouts.contains(&key) {
            log::trace!("Timeout for {} was refreshed, skipping", key);
            return;
        }

        let result = match self.store.get(&key).await {
            Ok(Some(mut group)) => {
                group.properties.completed_by = Some(CompletedBy::Timeout);
                self.complete(key.clone(), group, true).await
            }
            Ok(None) => {
                log::trace!("No pending group for {} at timeout", key);
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            log::error!("Failed to complete {} on timeout: {}", key, e);
        }
    }

    async fn on_recovered(self: &Arc<Self>, recovered: RecoveredGroup) {
        match recovered {
            RecoveredGroup::Redeliver { group, in_flight } => self.dispatch(group, in_flight),
            RecoveredGroup::Exhausted { group, in_flight } => {
                self.dead_letter(group).await;
                drop(in_flight);
            }
        }
    }

    async fn dead_letter(&self, group: WorkItem) {
        let id = group.id();
        if let Some(dead_letter) = &self.dead_letter {
            if let Err(e) = dead_letter.deliver(&group).await {
                self.failure_handler
                    .handle("Error delivering group to dead letter", &group, &e);
                return;
            }
        } else {
            log::warn!("No dead letter consumer configured, dropping group {}", id);
        }

        if let Err(e) = self.store.confirm(&id).await {
            log::error!("Failed to confirm dead lettered group {}: {}", id, e);
            return;
        }
        if let Some(recovery) = &self.recovery {
            recovery.forget(&id);
        }
    }

    /// Dispatch step: hand to the worker pool; `guard` is released once the
    /// delivery attempt finishes
    fn dispatch(self: &Arc<Self>, group: WorkItem, guard: InFlightGuard) {
        let inner = Arc::clone(self);

        self.pool.submit(async move {
            let _in_flight = guard;
            inner.deliver(group).await;
        });
    }

    async fn deliver(&self, mut group: WorkItem) {
        let id = group.id();
        let downstream = Arc::clone(&self.downstream);
        let outgoing = group.clone();

        // Separate task so a panicking consumer is reported, not propagated
        let delivered = match tokio::spawn(async move { downstream.deliver(&outgoing).await }).await
        {
            Ok(result) => result,
            Err(e) => Err(DeliveryError::Panicked(e.to_string())),
        };

        let result = match delivered {
            Ok(()) => self
                .store
                .confirm(&id)
                .await
                .map_err(DeliveryError::Confirmation),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                if let Some(recovery) = &self.recovery {
                    recovery.forget(&id);
                }
                log::debug!("Delivered and confirmed group {}", id);
            }
            Err(e) => {
                group.properties.failure = Some(e.to_string());
                self.failure_handler
                    .handle("Error processing aggregated group", &group, &e);
            }
        }
    }
}
