//! In-memory recurrence store (non-persistent).

use super::{ClaimKey, RecurrenceStore, StoreError};
use crate::recurrence::RecurrenceDefinition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct ClaimTable {
    /// Pending claims with their lease expiry.
    pending: HashMap<(Uuid, DateTime<Utc>), DateTime<Utc>>,
    /// Occurrences whose firing was persisted. Kept so a late concurrent
    /// firing for the same moment stays a no-op.
    committed: HashSet<(Uuid, DateTime<Utc>)>,
}

#[derive(Clone)]
pub struct InMemoryRecurrenceStore {
    definitions: Arc<RwLock<HashMap<Uuid, RecurrenceDefinition>>>,
    claims: Arc<RwLock<ClaimTable>>,
}

impl InMemoryRecurrenceStore {
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
            claims: Arc::new(RwLock::new(ClaimTable::default())),
        }
    }
}

impl Default for InMemoryRecurrenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecurrenceStore for InMemoryRecurrenceStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn insert(&self, definition: &RecurrenceDefinition) -> Result<(), StoreError> {
        self.definitions
            .write()
            .await
            .insert(definition.id, definition.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<RecurrenceDefinition>, StoreError> {
        Ok(self.definitions.read().await.get(&id).cloned())
    }

    async fn find_active_by_parent(
        &self,
        parent_id: Uuid,
    ) -> Result<Option<RecurrenceDefinition>, StoreError> {
        Ok(self
            .definitions
            .read()
            .await
            .values()
            .find(|d| d.parent_id == parent_id && d.is_active)
            .cloned())
    }

    async fn find_by_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<RecurrenceDefinition>, StoreError> {
        Ok(self
            .definitions
            .read()
            .await
            .values()
            .find(|d| d.generated_instance_ids.contains(&instance_id))
            .cloned())
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .definitions
            .read()
            .await
            .values()
            .filter(|d| d.is_due(now))
            .map(|d| (d.next_occurrence.unwrap_or(now), d.id))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn list_for_workspace(
        &self,
        workspace_id: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<RecurrenceDefinition>, StoreError> {
        let mut defs: Vec<RecurrenceDefinition> = self
            .definitions
            .read()
            .await
            .values()
            .filter(|d| d.workspace_id == workspace_id)
            .filter(|d| include_inactive || d.is_active)
            .cloned()
            .collect();
        defs.sort_by_key(|d| d.created_at);
        Ok(defs)
    }

    async fn save(&self, definition: &RecurrenceDefinition) -> Result<(), StoreError> {
        let mut defs = self.definitions.write().await;
        if !defs.contains_key(&definition.id) {
            return Err(StoreError::NotFound(definition.id));
        }
        defs.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn save_and_commit_claim(
        &self,
        definition: &RecurrenceDefinition,
        claim: &ClaimKey,
    ) -> Result<(), StoreError> {
        // Both locks held across the write so the definition update and the
        // claim commit are observed together.
        let mut defs = self.definitions.write().await;
        let mut claims = self.claims.write().await;
        if !defs.contains_key(&definition.id) {
            return Err(StoreError::NotFound(definition.id));
        }
        defs.insert(definition.id, definition.clone());
        let key = (claim.definition_id, claim.occurrence);
        claims.pending.remove(&key);
        claims.committed.insert(key);
        Ok(())
    }

    async fn try_claim(
        &self,
        claim: &ClaimKey,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut claims = self.claims.write().await;
        let key = (claim.definition_id, claim.occurrence);
        if claims.committed.contains(&key) {
            return Ok(false);
        }
        let now = Utc::now();
        if let Some(expiry) = claims.pending.get(&key) {
            if *expiry > now {
                return Ok(false);
            }
            // Expired lease from a crashed worker: take it over.
        }
        claims.pending.insert(key, lease_until);
        Ok(true)
    }

    async fn release_claim(&self, claim: &ClaimKey) -> Result<(), StoreError> {
        self.claims
            .write()
            .await
            .pending
            .remove(&(claim.definition_id, claim.occurrence));
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let removed = self.definitions.write().await.remove(&id).is_some();
        let mut claims = self.claims.write().await;
        claims.pending.retain(|(def, _), _| *def != id);
        claims.committed.retain(|(def, _)| *def != id);
        Ok(removed)
    }
}
