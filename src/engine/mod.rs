//! Firing orchestration: trigger engine, instance generation, side-effect
//! dispatch and the background sweep.

pub mod generator;
pub mod side_effects;
pub mod sweep;
pub mod trigger;

pub use generator::InstanceGenerator;
pub use side_effects::{SideEffect, SideEffectDispatcher, SideEffectHandle};
pub use sweep::{SweepScheduler, SweepStats};
pub use trigger::{ScheduleUpdate, TriggerEngine, TriggerSource};
