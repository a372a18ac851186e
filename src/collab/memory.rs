//! In-memory collaborator implementations (non-persistent).
//!
//! Used by the daemon's default wiring and by tests; a deployment embeds the
//! engine against its real board store and bus instead.

use super::{
    ActivityEntry, ActivityLog, CompletionEvent, EventBus, NewInstance, SideEffectFailure,
    WorkItemError, WorkItemStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

#[derive(Clone)]
pub struct InMemoryWorkItemStore {
    parents: Arc<RwLock<HashSet<Uuid>>>,
    instances: Arc<RwLock<HashMap<Uuid, NewInstance>>>,
    completions: broadcast::Sender<CompletionEvent>,
}

impl InMemoryWorkItemStore {
    pub fn new() -> Self {
        let (completions, _) = broadcast::channel(64);
        Self {
            parents: Arc::new(RwLock::new(HashSet::new())),
            instances: Arc::new(RwLock::new(HashMap::new())),
            completions,
        }
    }

    /// Register a parent work item.
    pub async fn add_parent(&self, parent_id: Uuid) {
        self.parents.write().await.insert(parent_id);
    }

    /// Delete a parent work item out-of-band.
    pub async fn remove_parent(&self, parent_id: Uuid) {
        self.parents.write().await.remove(&parent_id);
    }

    /// Mark an instance complete, emitting a completion event.
    pub async fn mark_complete(&self, instance_id: Uuid, completed_at: DateTime<Utc>) {
        // Receivers may not exist yet; that is fine for fire-and-forget.
        let _ = self.completions.send(CompletionEvent {
            instance_id,
            completed_at,
        });
    }

    /// Instances created so far (test inspection).
    pub async fn created_instances(&self) -> Vec<(Uuid, NewInstance)> {
        self.instances
            .read()
            .await
            .iter()
            .map(|(id, instance)| (*id, instance.clone()))
            .collect()
    }
}

impl Default for InMemoryWorkItemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkItemStore for InMemoryWorkItemStore {
    async fn parent_exists(&self, parent_id: Uuid) -> Result<bool, WorkItemError> {
        Ok(self.parents.read().await.contains(&parent_id))
    }

    async fn create_instance(
        &self,
        parent_id: Uuid,
        instance: NewInstance,
    ) -> Result<Uuid, WorkItemError> {
        if !self.parents.read().await.contains(&parent_id) {
            return Err(WorkItemError::ParentNotFound(parent_id));
        }
        let id = Uuid::new_v4();
        self.instances.write().await.insert(id, instance);
        Ok(id)
    }

    fn completion_events(&self) -> broadcast::Receiver<CompletionEvent> {
        self.completions.subscribe()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryEventBus {
    published: Arc<RwLock<Vec<(String, serde_json::Value)>>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<(), SideEffectFailure> {
        self.published
            .write()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryActivityLog {
    entries: Arc<RwLock<Vec<ActivityEntry>>>,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl ActivityLog for InMemoryActivityLog {
    async fn append(&self, entry: ActivityEntry) -> Result<(), SideEffectFailure> {
        self.entries.write().await.push(entry);
        Ok(())
    }
}
