//! Side-effect dispatch: notifications and activity-log entries.
//!
//! Two-phase contract: a firing persists its state first, then enqueues its
//! side effects here. Enqueue is guaranteed (unbounded channel); delivery is
//! retried with capped backoff by a background worker. Delivery failures
//! never touch recurrence state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::collab::{ActivityEntry, ActivityLog, EventBus, SideEffectFailure};

/// One deferred side effect.
#[derive(Debug, Clone)]
pub enum SideEffect {
    Publish {
        topic: String,
        payload: serde_json::Value,
    },
    Activity(ActivityEntry),
}

/// Handle used by the trigger engine to enqueue effects.
#[derive(Clone)]
pub struct SideEffectHandle {
    tx: mpsc::UnboundedSender<SideEffect>,
}

impl SideEffectHandle {
    pub fn enqueue(&self, effect: SideEffect) {
        if self.tx.send(effect).is_err() {
            // Only happens during shutdown when the worker is gone.
            warn!("side-effect worker stopped; effect dropped");
        }
    }
}

/// Background worker delivering effects to the bus and activity log.
pub struct SideEffectDispatcher {
    bus: Arc<dyn EventBus>,
    activity: Arc<dyn ActivityLog>,
    max_attempts: u32,
    base_delay: Duration,
}

impl SideEffectDispatcher {
    pub fn new(bus: Arc<dyn EventBus>, activity: Arc<dyn ActivityLog>) -> Self {
        Self {
            bus,
            activity,
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
        }
    }

    /// Override retry policy (tests use tight delays).
    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    /// Spawn the delivery worker and return the enqueue handle.
    pub fn spawn(self) -> SideEffectHandle {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(effect) = rx.recv().await {
                self.deliver_with_retry(effect).await;
            }
        });
        SideEffectHandle { tx }
    }

    async fn deliver(&self, effect: &SideEffect) -> Result<(), SideEffectFailure> {
        match effect {
            SideEffect::Publish { topic, payload } => {
                self.bus.publish(topic, payload.clone()).await
            }
            SideEffect::Activity(entry) => self.activity.append(entry.clone()).await,
        }
    }

    async fn deliver_with_retry(&self, effect: SideEffect) {
        let mut delay = self.base_delay;
        for attempt in 1..=self.max_attempts {
            match self.deliver(&effect).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(attempt, error = %e, "side-effect delivery failed");
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(10));
                    }
                }
            }
        }
        error!(
            attempts = self.max_attempts,
            "giving up on side effect; recurrence state is unaffected"
        );
    }
}
