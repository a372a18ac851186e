//! Engine-wide error taxonomy and firing outcomes.
//!
//! Claim contention is deliberately *not* an error: two firings racing for
//! the same occurrence is normal operation and the loser reports a skip.

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Errors surfaced by the scheduling engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed schedule shape or options. Rejected at create/update time,
    /// never at fire time.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The parent work item was deleted out-of-band. The firing is skipped
    /// and the recurrence auto-paused.
    #[error("parent work item {0} not found")]
    ParentNotFound(Uuid),

    /// A work item can carry at most one active recurrence.
    #[error("an active recurrence already exists for work item {0}")]
    RecurrenceExists(Uuid),

    #[error("recurrence {0} not found")]
    RecurrenceNotFound(Uuid),

    /// Operation not valid for the definition's current lifecycle state
    /// (e.g. resuming a hard-stopped recurrence).
    #[error("invalid lifecycle operation: {0}")]
    Lifecycle(String),

    /// Store write/read failed. A firing hitting this is retried on the next
    /// sweep cycle since no claim was durably committed.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Instance creation failed in the work-item store for a reason other
    /// than a missing parent. Retried on the next sweep cycle.
    #[error("work-item store error: {0}")]
    WorkItem(String),
}

/// Result of one firing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// An instance was generated and the schedule advanced.
    Fired { instance_id: Uuid },
    /// Nothing happened; the reason says why.
    Skipped(SkipReason),
}

/// Why a firing attempt produced no instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Definition is paused, stopped, or completed.
    Inactive,
    /// `next_occurrence` is still in the future (sweep-path check).
    NotDue,
    /// After-completion schedule waiting for the previous instance to be
    /// marked complete.
    AwaitingCompletion,
    /// Another firing holds (or committed) the claim for this occurrence.
    AlreadyClaimed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::NotDue => write!(f, "not_due"),
            Self::AwaitingCompletion => write!(f, "awaiting_completion"),
            Self::AlreadyClaimed => write!(f, "already_claimed"),
        }
    }
}
