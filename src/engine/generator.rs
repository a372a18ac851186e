//! Instance generation: template -> concrete task instance.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::collab::{NewInstance, WorkItemError, WorkItemStore};
use crate::error::EngineError;
use crate::recurrence::InstanceTemplate;

/// Builds concrete instances from a recurrence's template and hands them to
/// the parent work-item store. Ownership of each instance passes to the
/// store on creation.
pub struct InstanceGenerator {
    work_items: Arc<dyn WorkItemStore>,
}

impl InstanceGenerator {
    pub fn new(work_items: Arc<dyn WorkItemStore>) -> Self {
        Self { work_items }
    }

    /// Copy template fields and resolve due/start offsets against the firing
    /// time. Pure; no I/O.
    pub fn build(template: &InstanceTemplate, fired_at: DateTime<Utc>) -> NewInstance {
        NewInstance {
            title: template.title.clone(),
            description: template.description.clone(),
            priority: template.priority,
            assignees: template.assignees.clone(),
            tags: template.tags.clone(),
            due_at: template
                .due_offset_days
                .map(|days| fired_at + Duration::days(i64::from(days))),
            start_at: template
                .start_offset_days
                .map(|days| fired_at + Duration::days(i64::from(days))),
        }
    }

    /// Create one instance under the parent; returns its id.
    pub async fn generate(
        &self,
        parent_id: Uuid,
        template: &InstanceTemplate,
        fired_at: DateTime<Utc>,
    ) -> Result<Uuid, EngineError> {
        let instance = Self::build(template, fired_at);
        self.work_items
            .create_instance(parent_id, instance)
            .await
            .map_err(|e| match e {
                WorkItemError::ParentNotFound(parent) => EngineError::ParentNotFound(parent),
                WorkItemError::Backend(msg) => EngineError::WorkItem(msg),
            })
    }
}
