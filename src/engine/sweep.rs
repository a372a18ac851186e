//! Background sweep: periodically fires every due recurrence.
//!
//! The sweep owns no cross-cycle state; everything it needs is read from the
//! store each cycle, so a restart loses nothing. Firings run on a bounded
//! worker pool and each one is isolated: a failure is logged and skipped,
//! never aborts the cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::trigger::{TriggerEngine, TriggerSource};
use crate::error::FireOutcome;
use crate::store::RecurrenceStore;

/// Tally of one sweep cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub due: usize,
    pub fired: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct SweepScheduler {
    store: Arc<dyn RecurrenceStore>,
    engine: Arc<TriggerEngine>,
    interval: Duration,
    concurrency: usize,
    firing_timeout: Duration,
}

impl SweepScheduler {
    pub fn new(
        store: Arc<dyn RecurrenceStore>,
        engine: Arc<TriggerEngine>,
        interval: Duration,
        concurrency: usize,
        firing_timeout: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            interval,
            concurrency: concurrency.max(1),
            firing_timeout,
        }
    }

    /// Run sweep cycles forever on the configured cadence.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "sweep scheduler started");
        loop {
            ticker.tick().await;
            let stats = self.sweep_once().await;
            if stats.due > 0 {
                info!(
                    due = stats.due,
                    fired = stats.fired,
                    skipped = stats.skipped,
                    failed = stats.failed,
                    "sweep cycle complete"
                );
            } else {
                debug!("sweep cycle complete; nothing due");
            }
        }
    }

    /// Execute one sweep cycle against the current wall clock.
    pub async fn sweep_once(&self) -> SweepStats {
        let now = Utc::now();
        let due = match self.store.find_due(now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "sweep could not query due recurrences");
                return SweepStats::default();
            }
        };

        let mut stats = SweepStats {
            due: due.len(),
            ..SweepStats::default()
        };
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut firings = JoinSet::new();

        for definition_id in due {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let engine = self.engine.clone();
            let timeout = self.firing_timeout;
            firings.spawn(async move {
                let _permit = permit;
                let result =
                    tokio::time::timeout(timeout, engine.fire(definition_id, now, TriggerSource::Sweep))
                        .await;
                match result {
                    Ok(Ok(FireOutcome::Fired { instance_id })) => {
                        debug!(recurrence = %definition_id, instance = %instance_id, "swept firing");
                        FiringResult::Fired
                    }
                    Ok(Ok(FireOutcome::Skipped(reason))) => {
                        debug!(recurrence = %definition_id, %reason, "swept firing skipped");
                        FiringResult::Skipped
                    }
                    Ok(Err(e)) => {
                        // Isolated: logged and left for the next cycle (or
                        // auto-paused, for a missing parent).
                        warn!(recurrence = %definition_id, error = %e, "swept firing failed");
                        FiringResult::Failed
                    }
                    Err(_) => {
                        warn!(recurrence = %definition_id, "swept firing timed out; claim lease will expire");
                        FiringResult::Failed
                    }
                }
            });
        }

        while let Some(joined) = firings.join_next().await {
            match joined {
                Ok(FiringResult::Fired) => stats.fired += 1,
                Ok(FiringResult::Skipped) => stats.skipped += 1,
                Ok(FiringResult::Failed) => stats.failed += 1,
                Err(e) => {
                    error!(error = %e, "firing task panicked");
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

enum FiringResult {
    Fired,
    Skipped,
    Failed,
}
