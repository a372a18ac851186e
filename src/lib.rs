//! # Cadence
//!
//! Recurring-task engine for collaborative work management: attach a
//! recurrence to a work item and the engine stamps out task instances on the
//! schedule, forever or until an end condition is met.
//!
//! ## Architecture
//!
//! ```text
//!   ┌────────────────┐      ┌───────────────────┐
//!   │ SweepScheduler │─────▶│   TriggerEngine   │◀───── manual trigger
//!   │ (interval loop)│      │ claim → generate  │       (RecurrenceService)
//!   └────────────────┘      │ → advance → save  │
//!                           └───┬───────────┬───┘
//!                               │           │
//!                 ┌─────────────▼──┐   ┌────▼──────────────┐
//!                 │ RecurrenceStore│   │ SideEffect worker │
//!                 │ (sqlite/memory)│   │ (bus + activity)  │
//!                 └────────────────┘   └───────────────────┘
//! ```
//!
//! ## Firing Flow
//! 1. The sweep (or a manual trigger) asks the engine to fire a definition
//! 2. The engine claims `(definition, occurrence)`; losers of the race no-op
//! 3. An instance is created from the template on the parent work item
//! 4. The schedule advances and the end condition is evaluated
//! 5. State and the claim commit persist atomically; notifications follow
//!
//! ## Modules
//! - `schedule`: pure occurrence calculator and end-condition evaluation
//! - `recurrence`: the persisted definition and its lifecycle fields
//! - `store`: pluggable persistence (sqlite, in-memory)
//! - `engine`: trigger engine, instance generator, side effects, sweep
//! - `collab`: traits for the surrounding work-management system
//! - `service`: administrative operations (create / update / stop / ...)

pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod recurrence;
pub mod schedule;
pub mod service;
pub mod store;

pub use config::Config;
pub use error::{EngineError, FireOutcome, SkipReason};
pub use recurrence::RecurrenceDefinition;
pub use service::{CreateRecurrence, RecurrenceService, StopMode};
