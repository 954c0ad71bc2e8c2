//! Per-key completion timeouts swept by a background task

use super::types::CorrelationKey;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

/// Default sweep period, independent of the per-entry delays
pub const DEFAULT_TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Deadline used when `now + delay` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline table keyed by correlation key
pub struct TimeoutScheduler {
    deadlines: Mutex<HashMap<CorrelationKey, Instant>>,
    poll_interval: Duration,
}

impl TimeoutScheduler {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            deadlines: Mutex::new(HashMap::new()),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<CorrelationKey, Instant>> {
        self.deadlines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm or refresh the deadline for `key`
    pub fn register(&self, key: CorrelationKey, delay: Duration) {
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
        if self.table().insert(key.clone(), deadline).is_some() {
            log::trace!("Refreshed timeout for {} ({:?})", key, delay);
        } else {
            log::trace!("Armed timeout for {} ({:?})", key, delay);
        }
    }

    /// Returns true when an entry was removed
    pub fn cancel(&self, key: &CorrelationKey) -> bool {
        self.table().remove(key).is_some()
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.table().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.table().clear();
    }

    /// Remove and return every key whose deadline is at or before `now`
    pub fn drain_expired(&self, now: Instant) -> Vec<CorrelationKey> {
        let mut table = self.table();
        let expired: Vec<CorrelationKey> = table
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            table.remove(key);
        }
        expired
    }

    /// Start the sweep task
    ///
    /// Each expired key is removed from the table before `on_expiry` runs.
    /// The task exits when `shutdown` flips to true or its sender is dropped.
    pub fn spawn<F, Fut>(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        on_expiry: F,
    ) -> JoinHandle<()>
    where
        F: Fn(CorrelationKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            log::debug!(
                "Starting timeout sweep (poll interval: {}ms)",
                scheduler.poll_interval.as_millis()
            );
            let mut timer = interval(scheduler.poll_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        for key in scheduler.drain_expired(Instant::now()) {
                            log::debug!("Completion timeout reached for {}", key);
                            on_expiry(key).await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Timeout sweep stopped");
        })
    }
}
