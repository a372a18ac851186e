//! Recurrence storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database with a durable firing-claims ledger
//!
//! The store is also the serialization point for concurrent firings: the
//! idempotency claim on `(definition_id, occurrence)` is an atomic store
//! operation, and committing a firing persists the updated definition and
//! the claim in the same transaction.

mod memory;
mod sqlite;

pub use memory::InMemoryRecurrenceStore;
pub use sqlite::SqliteRecurrenceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::recurrence::RecurrenceDefinition;

/// Storage-layer errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("recurrence {0} not found")]
    NotFound(Uuid),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Identifies one scheduled moment of one definition: the unit of
/// idempotency for firings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    pub definition_id: Uuid,
    pub occurrence: DateTime<Utc>,
}

/// Recurrence store trait - implemented by all storage backends.
#[async_trait]
pub trait RecurrenceStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Insert a newly created definition.
    async fn insert(&self, definition: &RecurrenceDefinition) -> Result<(), StoreError>;

    /// Load a definition by id.
    async fn load(&self, id: Uuid) -> Result<Option<RecurrenceDefinition>, StoreError>;

    /// The active definition for a parent work item, if any.
    async fn find_active_by_parent(
        &self,
        parent_id: Uuid,
    ) -> Result<Option<RecurrenceDefinition>, StoreError>;

    /// The definition whose ledger contains the given generated instance.
    async fn find_by_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<RecurrenceDefinition>, StoreError>;

    /// Ids of all active definitions with `next_occurrence <= now`.
    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    /// Definitions in a workspace, optionally including inactive ones.
    /// Ordered by creation time ascending.
    async fn list_for_workspace(
        &self,
        workspace_id: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<RecurrenceDefinition>, StoreError>;

    /// Persist an updated definition (non-firing mutations: pause, resume,
    /// schedule edits).
    async fn save(&self, definition: &RecurrenceDefinition) -> Result<(), StoreError>;

    /// Atomically persist the post-firing definition and mark the claim
    /// committed. A committed claim never admits another firing for the
    /// same occurrence.
    async fn save_and_commit_claim(
        &self,
        definition: &RecurrenceDefinition,
        claim: &ClaimKey,
    ) -> Result<(), StoreError>;

    /// Try to acquire the firing claim. Returns `false` when the occurrence
    /// is already committed or another firing holds an unexpired lease.
    async fn try_claim(&self, claim: &ClaimKey, lease_until: DateTime<Utc>)
        -> Result<bool, StoreError>;

    /// Release a pending (uncommitted) claim after a failed firing so the
    /// next sweep can retry the occurrence.
    async fn release_claim(&self, claim: &ClaimKey) -> Result<(), StoreError>;

    /// Hard-delete a definition and its ledger. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Recurrence store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    Memory,
    #[default]
    Sqlite,
}

impl StoreKind {
    /// Parse from environment variable value.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }
}

/// Create a recurrence store based on type and configuration.
pub async fn create_recurrence_store(
    kind: StoreKind,
    data_dir: PathBuf,
) -> Result<Box<dyn RecurrenceStore>, StoreError> {
    match kind {
        StoreKind::Memory => Ok(Box::new(InMemoryRecurrenceStore::new())),
        StoreKind::Sqlite => {
            let store = SqliteRecurrenceStore::open(data_dir).await?;
            Ok(Box::new(store))
        }
    }
}
