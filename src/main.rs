//! cadenced - Recurring-task engine daemon.
//!
//! Wires the store, trigger engine, side-effect worker, completion-event
//! pump and background sweep together, then runs until interrupted.

use std::sync::Arc;

use cadence::collab::{InMemoryActivityLog, InMemoryEventBus, InMemoryWorkItemStore, WorkItemStore};
use cadence::config::Config;
use cadence::engine::{SideEffectDispatcher, SweepScheduler, TriggerEngine};
use cadence::store::create_recurrence_store;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        store = ?config.store,
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "loaded configuration"
    );

    let store: Arc<dyn cadence::store::RecurrenceStore> =
        Arc::from(create_recurrence_store(config.store, config.data_dir.clone()).await?);
    if !store.is_persistent() {
        warn!("running with the in-memory store; definitions are lost on restart");
    }

    // Standalone wiring uses the in-memory collaborators. An embedding
    // deployment provides its real board store, bus and activity log here.
    let work_items = Arc::new(InMemoryWorkItemStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let activity = Arc::new(InMemoryActivityLog::new());

    let side_effects = SideEffectDispatcher::new(bus, activity).spawn();
    let engine = Arc::new(TriggerEngine::new(
        store.clone(),
        work_items.clone(),
        side_effects,
        config.claim_lease,
    ));
    // Completion events feed after-completion schedules.
    let mut completions = work_items.completion_events();
    let completion_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            match completions.recv().await {
                Ok(event) => {
                    if let Err(e) = completion_engine
                        .handle_completion(event.instance_id, event.completed_at)
                        .await
                    {
                        error!(instance = %event.instance_id, error = %e,
                               "failed to handle completion event");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "completion event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let sweeper = SweepScheduler::new(
        store,
        engine,
        config.sweep_interval,
        config.sweep_concurrency,
        config.firing_timeout,
    );
    tokio::spawn(async move { sweeper.run().await });

    info!("cadenced started; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
