//! Downstream delivery: consumer contract, failure handling, worker pool
//! and in-flight tracking

use super::error::DeliveryError;
use super::types::{ItemId, WorkItem};
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, Semaphore};

/// Receives completed groups
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn deliver(&self, group: &WorkItem) -> Result<(), DeliveryError>;
}

/// Sink for failures detected during asynchronous dispatch
pub trait FailureHandler: Send + Sync {
    fn handle(&self, context: &str, group: &WorkItem, error: &DeliveryError);
}

/// Default failure handler: logs and moves on
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingFailureHandler;

impl FailureHandler for LoggingFailureHandler {
    fn handle(&self, context: &str, group: &WorkItem, error: &DeliveryError) {
        log::error!(
            "{}: group {} (key: {}): {}",
            context,
            group.id(),
            group
                .correlation_key()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string()),
            error
        );
    }
}

/// Ids of groups currently being delivered
#[derive(Debug, Default)]
pub struct InFlight {
    ids: Mutex<HashSet<ItemId>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self) -> MutexGuard<'_, HashSet<ItemId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `id` in flight until the returned guard is dropped
    pub fn track(self: &Arc<Self>, id: ItemId) -> InFlightGuard {
        self.set().insert(id);
        InFlightGuard {
            in_flight: Arc::clone(self),
            id,
        }
    }

    /// Like `track`, but only when `id` is not already in flight
    ///
    /// Check and insert happen under one lock, so two callers racing on the
    /// same id cannot both get a guard.
    pub fn try_track(self: &Arc<Self>, id: ItemId) -> Option<InFlightGuard> {
        if !self.set().insert(id) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: Arc::clone(self),
            id,
        })
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.set().contains(id)
    }

    pub fn len(&self) -> usize {
        self.set().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes its id from the in-flight set on drop, whatever the outcome
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
    id: ItemId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.set().remove(&self.id);
    }
}

/// Bounded pool running dispatch tasks on the tokio runtime
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Queue a task; at most `size` tasks run at once
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let outstanding = Arc::clone(&self.outstanding);
        let idle = Arc::clone(&self.idle);
        outstanding.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            if let Ok(_permit) = permits.acquire_owned().await {
                task.await;
            }
            if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }

    /// Tasks submitted and not yet finished
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every submitted task has finished
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_guard_removes_on_drop() {
        let in_flight = Arc::new(InFlight::new());
        let id = ItemId::new();
        {
            let _guard = in_flight.track(id);
            assert!(in_flight.contains(&id));
        }
        assert!(!in_flight.contains(&id));
        assert!(in_flight.is_empty());
    }

    #[test]
    fn test_try_track_is_exclusive() {
        let in_flight = Arc::new(InFlight::new());
        let id = ItemId::new();

        let guard = in_flight.try_track(id).expect("first caller gets the guard");
        assert!(in_flight.try_track(id).is_none());
        assert_eq!(in_flight.len(), 1);

        drop(guard);
        assert!(in_flight.try_track(id).is_some());
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency_and_drains() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        tokio::time::timeout(Duration::from_secs(5), pool.drain())
            .await
            .expect("pool should drain");
        assert_eq!(pool.outstanding(), 0);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_drain_on_idle_pool_returns() {
        let pool = WorkerPool::new(1);
        pool.drain().await;
    }
}
