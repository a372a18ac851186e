//! End-condition evaluation.
//!
//! Evaluated *after* a firing increments the occurrence counter, so the
//! occurrence that satisfies the bound is still generated: the bound is on
//! occurrences produced, not occurrences skipped.

use chrono::{DateTime, Utc};

use super::shape::EndCondition;

/// The next candidate occurrence, as seen by the end-condition evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextCandidate {
    /// A concrete scheduled moment.
    Scheduled(DateTime<Utc>),
    /// After-completion schedule waiting on the previous instance.
    AwaitingCompletion,
    /// The schedule has no further occurrences (custom list exhausted).
    Exhausted,
}

/// Whether the recurrence has completed its lifecycle.
pub fn should_end(
    condition: &EndCondition,
    completed_occurrences: u32,
    next: &NextCandidate,
) -> bool {
    // An exhausted schedule ends regardless of the configured condition.
    if matches!(next, NextCandidate::Exhausted) {
        return true;
    }
    match condition {
        EndCondition::Never => false,
        EndCondition::AfterOccurrenceCount { count } => completed_occurrences >= *count,
        EndCondition::OnOrAfterDate { date } => match next {
            NextCandidate::Scheduled(candidate) => candidate >= date,
            _ => false,
        },
    }
}
