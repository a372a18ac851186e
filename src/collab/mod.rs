//! External collaborator contracts.
//!
//! The engine consumes the parent work-item store, the notification bus and
//! the activity log through these narrow interfaces; everything behind them
//! (boards, comments, transports) belongs to other subsystems.

mod memory;

pub use memory::{InMemoryActivityLog, InMemoryEventBus, InMemoryWorkItemStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A concrete task instance handed to the work-item store for creation.
/// Ownership of the instance passes to the store; the engine never mutates
/// it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInstance {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<crate::recurrence::Priority>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignees: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_at: Option<DateTime<Utc>>,
}

/// Emitted by the work-item store when an instance is marked complete.
/// Drives `afterCompletion` schedules.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub instance_id: Uuid,
    pub completed_at: DateTime<Utc>,
}

/// Work-item store failures, as seen by the engine.
#[derive(Debug, Clone, Error)]
pub enum WorkItemError {
    #[error("parent work item {0} not found")]
    ParentNotFound(Uuid),
    #[error("work-item store error: {0}")]
    Backend(String),
}

/// The parent work-item store (boards/lists/cards subsystem).
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Whether the parent work item still exists.
    async fn parent_exists(&self, parent_id: Uuid) -> Result<bool, WorkItemError>;

    /// Create a task instance under the parent; returns the new instance id.
    async fn create_instance(
        &self,
        parent_id: Uuid,
        instance: NewInstance,
    ) -> Result<Uuid, WorkItemError>;

    /// Subscribe to instance-completion events.
    fn completion_events(&self) -> broadcast::Receiver<CompletionEvent>;
}

/// Failure of a notification or activity-log delivery. Logged and retried,
/// never surfaced to the caller of `fire`.
#[derive(Debug, Clone, Error)]
#[error("side effect failed: {0}")]
pub struct SideEffectFailure(pub String);

/// Notification/real-time event bus. Fire-and-forget, at-least-once.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value)
        -> Result<(), SideEffectFailure>;
}

/// One audit-trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub recurrence_id: Uuid,
    pub parent_id: Uuid,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// Activity/audit log. Append-only, fire-and-forget.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn append(&self, entry: ActivityEntry) -> Result<(), SideEffectFailure>;
}
