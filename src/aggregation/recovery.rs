//! Background resubmission of completed but unconfirmed groups
//!
//! Delivery is at-least-once: a crash between completion and confirmation
//! leaves the group in the store's completed area, and the next scan hands it
//! back to dispatch. Groups that are still in flight are skipped.

use super::dispatch::{InFlight, InFlightGuard};
use super::error::StoreError;
use super::store::Recoverable;
use super::types::{ItemId, WorkItem};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// What to do with a group found by a recovery scan
///
/// Both variants hold the group's in-flight guard, so no other scan can pick
/// it up until the caller is done with it.
#[derive(Debug)]
pub enum RecoveredGroup {
    /// Resubmit through dispatch
    Redeliver {
        group: WorkItem,
        in_flight: InFlightGuard,
    },
    /// Redelivery limit exceeded; route to the dead letter consumer
    Exhausted {
        group: WorkItem,
        in_flight: InFlightGuard,
    },
}

impl RecoveredGroup {
    pub fn group(&self) -> &WorkItem {
        match self {
            Self::Redeliver { group, .. } | Self::Exhausted { group, .. } => group,
        }
    }
}

pub struct RecoveryScheduler {
    store: Arc<dyn Recoverable>,
    in_flight: Arc<InFlight>,
    redeliveries: Mutex<HashMap<ItemId, u32>>,
}

impl RecoveryScheduler {
    pub fn new(store: Arc<dyn Recoverable>, in_flight: Arc<InFlight>) -> Self {
        Self {
            store,
            in_flight,
            redeliveries: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.store.recovery_enabled()
    }

    fn counters(&self) -> MutexGuard<'_, HashMap<ItemId, u32>> {
        self.redeliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the redelivery counter once a group is confirmed or dead lettered
    pub fn forget(&self, id: &ItemId) {
        self.counters().remove(id);
    }

    /// Run one scan
    ///
    /// Stops early when `shutdown` reads true.
    pub async fn scan(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Vec<RecoveredGroup>, StoreError> {
        let ids = self.store.scan_unconfirmed().await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        log::debug!("Recovery scan found {} unconfirmed group(s)", ids.len());

        let max_redeliveries = self.store.max_redeliveries();
        let mut recovered = Vec::new();

        for id in ids {
            if *shutdown.borrow() {
                log::debug!("Recovery scan aborted by shutdown");
                break;
            }
            // Claimed before the store read so concurrent scans skip it
            let Some(in_flight) = self.in_flight.try_track(id) else {
                log::trace!("Group {} still in flight, skipping recovery", id);
                continue;
            };

            let Some(mut group) = self.store.recover(&id).await? else {
                // Confirmed between scan and recover
                continue;
            };

            let attempt = {
                let mut counters = self.counters();
                let counter = counters.entry(id).or_insert(0);
                *counter += 1;
                *counter
            };
            group.properties.redelivery_count = Some(attempt);

            match max_redeliveries {
                Some(max) if attempt > max => {
                    log::warn!(
                        "Group {} exceeded {} redelivery attempt(s), moving to dead letter",
                        id,
                        max
                    );
                    recovered.push(RecoveredGroup::Exhausted { group, in_flight });
                }
                _ => {
                    log::info!(
                        "Recovering group {} (key: {}, attempt {})",
                        id,
                        group
                            .correlation_key()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "-".to_string()),
                        attempt
                    );
                    recovered.push(RecoveredGroup::Redeliver { group, in_flight });
                }
            }
        }

        Ok(recovered)
    }

    /// Start the recovery task
    ///
    /// A zero recovery interval scans once; otherwise scans repeat on that
    /// period until shutdown.
    pub fn spawn<F, Fut>(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        on_recovered: F,
    ) -> JoinHandle<()>
    where
        F: Fn(RecoveredGroup) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        let period = self.store.recovery_interval();

        tokio::spawn(async move {
            if period.is_zero() {
                log::info!("Running one-shot recovery scan");
                scheduler.run_once(&shutdown, &on_recovered).await;
                return;
            }

            log::info!("Starting recovery scheduler (interval: {}ms)", period.as_millis());
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        scheduler.run_once(&shutdown, &on_recovered).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Recovery scheduler stopped");
        })
    }

    async fn run_once<F, Fut>(&self, shutdown: &watch::Receiver<bool>, on_recovered: &F)
    where
        F: Fn(RecoveredGroup) -> Fut,
        Fut: Future<Output = ()>,
    {
        match self.scan(shutdown).await {
            Ok(groups) => {
                for group in groups {
                    on_recovered(group).await;
                }
            }
            Err(e) => log::error!("Recovery scan failed: {}", e),
        }
    }
}
