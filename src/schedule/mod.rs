//! Schedule shapes and the pure calendar arithmetic over them.

pub mod calculator;
pub mod end_condition;
pub mod shape;

pub use calculator::{at_due_time, initial_occurrence, next_occurrence};
pub use end_condition::{should_end, NextCandidate};
pub use shape::{
    validate, EndCondition, FiringBehavior, MonthlyTarget, ScheduleShape, Weekday,
};
