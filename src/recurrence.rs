//! Recurrence definition: the schedule attached to one parent work item.
//!
//! # Invariants
//! - at most one active definition per parent work item (enforced by the
//!   service's create path and the engine's resume; the sqlite backend
//!   additionally rejects a violating row via a partial unique index)
//! - `completed_occurrences == generated_instance_ids.len()`
//! - `next_occurrence` is `None` whenever `is_active` is false; an *active*
//!   after-completion definition also carries `None` while it waits for the
//!   previous instance to be marked complete

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::{EndCondition, FiringBehavior, ScheduleShape};

/// Priority copied onto generated instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Fields copied onto every generated instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceTemplate {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Days from firing time to the instance's due date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_offset_days: Option<u32>,
    /// Days from firing time to the instance's start date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset_days: Option<u32>,
}

/// Why an inactive definition stopped firing. Distinguishes "completed"
/// (end condition reached) from "stopped" (explicit hard stop) and
/// "paused — parent not found" in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    Paused,
    Stopped,
    Completed,
    ParentNotFound,
}

/// A recurrence definition with its generated-instance ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceDefinition {
    pub id: Uuid,
    /// Parent work item this recurrence is attached to.
    pub parent_id: Uuid,
    /// Owning workspace/board.
    pub workspace_id: Uuid,
    pub shape: ScheduleShape,
    pub firing_behavior: FiringBehavior,
    pub end_condition: EndCondition,
    /// IANA timezone the schedule is evaluated in.
    pub timezone: Tz,
    /// Time of day occurrences land at, in the recurrence's timezone.
    pub due_time: NaiveTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
    pub template: InstanceTemplate,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_reason: Option<InactiveReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_occurrence: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_occurrence: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_occurrences: u32,
    /// Ordered ledger of generated instances, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_instance_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurrenceDefinition {
    /// Whether the definition is due for a firing at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self
                .next_occurrence
                .map(|occurrence| occurrence <= now)
                .unwrap_or(false)
    }

    /// Deactivate, recording why. Clears `next_occurrence` per the
    /// lifecycle invariant.
    pub fn deactivate(&mut self, reason: InactiveReason) {
        self.is_active = false;
        self.inactive_reason = Some(reason);
        self.next_occurrence = None;
    }

    /// Human-readable status for listings.
    pub fn status_label(&self) -> &'static str {
        if self.is_active {
            return "active";
        }
        match self.inactive_reason {
            Some(InactiveReason::Paused) => "paused",
            Some(InactiveReason::Stopped) => "stopped",
            Some(InactiveReason::Completed) => "completed",
            Some(InactiveReason::ParentNotFound) => "paused — parent not found",
            None => "inactive",
        }
    }
}
