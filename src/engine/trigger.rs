//! Trigger engine: orchestrates one firing of a recurrence.
//!
//! `fire` is the only mutator of a definition's lifecycle fields. Manual
//! triggers and the background sweep converge on it; the idempotency claim
//! on `(definition_id, next_occurrence)` is the sole serialization point, so
//! two concurrent firings for the same scheduled moment cannot both generate
//! an instance.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::generator::InstanceGenerator;
use super::side_effects::{SideEffect, SideEffectHandle};
use crate::collab::{ActivityEntry, WorkItemStore};
use crate::error::{EngineError, FireOutcome, SkipReason};
use crate::recurrence::{InactiveReason, RecurrenceDefinition};
use crate::schedule::{
    self, calculator, end_condition, EndCondition, FiringBehavior, NextCandidate, ScheduleShape,
};
use crate::store::{ClaimKey, RecurrenceStore};

/// Where a firing request came from. Sweep triggers always honor the
/// due-time check; manual triggers may bypass it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Sweep,
    Manual { bypass_due_check: bool },
}

/// Replacement schedule for `update_schedule`.
#[derive(Debug, Clone)]
pub struct ScheduleUpdate {
    pub shape: ScheduleShape,
    pub firing_behavior: FiringBehavior,
    pub end_condition: EndCondition,
    pub timezone: Tz,
    pub due_time: NaiveTime,
    pub start_at: Option<DateTime<Utc>>,
}

pub struct TriggerEngine {
    store: Arc<dyn RecurrenceStore>,
    work_items: Arc<dyn WorkItemStore>,
    generator: InstanceGenerator,
    side_effects: SideEffectHandle,
    claim_lease: Duration,
}

impl TriggerEngine {
    pub fn new(
        store: Arc<dyn RecurrenceStore>,
        work_items: Arc<dyn WorkItemStore>,
        side_effects: SideEffectHandle,
        claim_lease: Duration,
    ) -> Self {
        Self {
            store,
            generator: InstanceGenerator::new(work_items.clone()),
            work_items,
            side_effects,
            claim_lease,
        }
    }

    /// Execute one firing.
    ///
    /// Steps: lifecycle check, idempotency claim, instance generation,
    /// schedule advance + end-condition evaluation, atomic persist with the
    /// claim commit, then side-effect enqueue. Failures before persistence
    /// release the claim so the next sweep retries the occurrence.
    pub async fn fire(
        &self,
        definition_id: Uuid,
        now: DateTime<Utc>,
        source: TriggerSource,
    ) -> Result<FireOutcome, EngineError> {
        let definition = self
            .store
            .load(definition_id)
            .await?
            .ok_or(EngineError::RecurrenceNotFound(definition_id))?;

        if !definition.is_active {
            return Ok(FireOutcome::Skipped(SkipReason::Inactive));
        }
        let Some(occurrence) = definition.next_occurrence else {
            return Ok(FireOutcome::Skipped(SkipReason::AwaitingCompletion));
        };
        let bypass = matches!(
            source,
            TriggerSource::Manual {
                bypass_due_check: true
            }
        );
        if occurrence > now && !bypass {
            return Ok(FireOutcome::Skipped(SkipReason::NotDue));
        }

        let claim = ClaimKey {
            definition_id,
            occurrence,
        };
        if !self.store.try_claim(&claim, now + self.claim_lease).await? {
            debug!(recurrence = %definition_id, %occurrence, "occurrence already claimed");
            return Ok(FireOutcome::Skipped(SkipReason::AlreadyClaimed));
        }

        match self.fire_claimed(definition, claim, now).await {
            Ok(outcome) => Ok(outcome),
            Err(EngineError::ParentNotFound(parent)) => Err(EngineError::ParentNotFound(parent)),
            Err(err) => {
                // Nothing was durably committed; free the occurrence.
                if let Err(release_err) = self.store.release_claim(&claim).await {
                    warn!(recurrence = %definition_id, error = %release_err,
                          "failed to release claim; lease expiry will recover it");
                }
                Err(err)
            }
        }
    }

    /// The post-claim portion of a firing. The claim is either committed
    /// with the persisted state or released by the caller on error.
    async fn fire_claimed(
        &self,
        mut definition: RecurrenceDefinition,
        claim: ClaimKey,
        now: DateTime<Utc>,
    ) -> Result<FireOutcome, EngineError> {
        let instance_id = match self
            .generator
            .generate(definition.parent_id, &definition.template, now)
            .await
        {
            Ok(id) => id,
            Err(EngineError::ParentNotFound(parent)) => {
                // Parent deleted out-of-band: auto-pause instead of retrying
                // forever. The claim is released so a recreated parent and a
                // resume can pick the occurrence back up.
                warn!(recurrence = %definition.id, %parent,
                      "parent work item missing; auto-pausing recurrence");
                definition.deactivate(InactiveReason::ParentNotFound);
                definition.updated_at = now;
                self.store.save(&definition).await?;
                self.store.release_claim(&claim).await?;
                self.record(
                    &definition,
                    "auto_paused",
                    Some(json!({ "reason": "parent not found" })),
                    now,
                );
                return Err(EngineError::ParentNotFound(parent));
            }
            Err(err) => return Err(err),
        };

        // Advance the schedule. A manual early fire uses the claimed
        // occurrence as reference so the new occurrence lands after it.
        definition.generated_instance_ids.push(instance_id);
        definition.completed_occurrences += 1;
        definition.last_occurrence = Some(now);
        let reference = now.max(claim.occurrence);
        let candidate = match definition.firing_behavior {
            FiringBehavior::AfterCompletion => NextCandidate::AwaitingCompletion,
            FiringBehavior::OnSchedule => match calculator::next_occurrence(
                &definition.shape,
                definition.due_time,
                definition.timezone,
                reference,
            )? {
                Some(next) => NextCandidate::Scheduled(next),
                None => NextCandidate::Exhausted,
            },
        };

        let ended = end_condition::should_end(
            &definition.end_condition,
            definition.completed_occurrences,
            &candidate,
        );
        if ended {
            definition.deactivate(InactiveReason::Completed);
        } else {
            definition.next_occurrence = match candidate {
                NextCandidate::Scheduled(next) => Some(next),
                _ => None,
            };
        }
        definition.updated_at = now;

        self.store
            .save_and_commit_claim(&definition, &claim)
            .await?;

        info!(recurrence = %definition.id, instance = %instance_id,
              occurrence = %claim.occurrence,
              next = ?definition.next_occurrence, "recurrence fired");

        self.side_effects.enqueue(SideEffect::Publish {
            topic: "recurrence.instance_created".into(),
            payload: json!({
                "recurrence_id": definition.id,
                "parent_id": definition.parent_id,
                "workspace_id": definition.workspace_id,
                "instance_id": instance_id,
                "occurrence": claim.occurrence,
                "next_occurrence": definition.next_occurrence,
            }),
        });
        self.record(
            &definition,
            "instance_generated",
            Some(json!({ "instance_id": instance_id })),
            now,
        );
        if ended {
            self.side_effects.enqueue(SideEffect::Publish {
                topic: "recurrence.completed".into(),
                payload: json!({
                    "recurrence_id": definition.id,
                    "parent_id": definition.parent_id,
                    "completed_occurrences": definition.completed_occurrences,
                }),
            });
            self.record(&definition, "recurrence_completed", None, now);
        }

        Ok(FireOutcome::Fired { instance_id })
    }

    /// React to a generated instance being marked complete. Only meaningful
    /// for after-completion schedules, and only for the most recent
    /// instance in the ledger.
    pub async fn handle_completion(
        &self,
        instance_id: Uuid,
        completed_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(mut definition) = self.store.find_by_instance(instance_id).await? else {
            return Ok(());
        };
        if !definition.is_active
            || definition.firing_behavior != FiringBehavior::AfterCompletion
            || definition.generated_instance_ids.last() != Some(&instance_id)
            || definition.next_occurrence.is_some()
        {
            return Ok(());
        }

        let candidate = match calculator::next_occurrence(
            &definition.shape,
            definition.due_time,
            definition.timezone,
            completed_at,
        )? {
            Some(next) => NextCandidate::Scheduled(next),
            None => NextCandidate::Exhausted,
        };
        let now = Utc::now();
        if end_condition::should_end(
            &definition.end_condition,
            definition.completed_occurrences,
            &candidate,
        ) {
            definition.deactivate(InactiveReason::Completed);
            self.record(&definition, "recurrence_completed", None, now);
        } else if let NextCandidate::Scheduled(next) = candidate {
            definition.next_occurrence = Some(next);
            debug!(recurrence = %definition.id, %next,
                   "scheduled next occurrence after completion");
        }
        definition.updated_at = now;
        self.store.save(&definition).await?;
        Ok(())
    }

    /// Soft-stop: the definition keeps its history and can be resumed.
    pub async fn pause(
        &self,
        definition_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RecurrenceDefinition, EngineError> {
        let mut definition = self.load_existing(definition_id).await?;
        if !definition.is_active {
            return Err(EngineError::Lifecycle(format!(
                "cannot pause a {} recurrence",
                definition.status_label()
            )));
        }
        definition.deactivate(InactiveReason::Paused);
        definition.updated_at = now;
        self.store.save(&definition).await?;
        self.record(&definition, "paused", None, now);
        Ok(definition)
    }

    /// Resume a paused definition, recomputing `next_occurrence` from `now`.
    pub async fn resume(
        &self,
        definition_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RecurrenceDefinition, EngineError> {
        let mut definition = self.load_existing(definition_id).await?;
        match definition.inactive_reason {
            Some(InactiveReason::Paused) | Some(InactiveReason::ParentNotFound)
                if !definition.is_active => {}
            _ => {
                return Err(EngineError::Lifecycle(format!(
                    "cannot resume a {} recurrence",
                    definition.status_label()
                )));
            }
        }
        if !self
            .work_items
            .parent_exists(definition.parent_id)
            .await
            .map_err(|e| EngineError::WorkItem(e.to_string()))?
        {
            return Err(EngineError::ParentNotFound(definition.parent_id));
        }
        // The parent may have gained a new recurrence while this one was
        // paused; at most one may be active.
        if self
            .store
            .find_active_by_parent(definition.parent_id)
            .await?
            .is_some()
        {
            return Err(EngineError::RecurrenceExists(definition.parent_id));
        }

        definition.is_active = true;
        definition.inactive_reason = None;
        definition.next_occurrence = self.recompute_next(&definition, now)?;
        if definition.firing_behavior == FiringBehavior::OnSchedule
            && definition.next_occurrence.is_none()
        {
            // Custom list exhausted while paused.
            definition.deactivate(InactiveReason::Completed);
        }
        definition.updated_at = now;
        self.store.save(&definition).await?;
        self.record(&definition, "resumed", None, now);
        Ok(definition)
    }

    /// Hard stop: permanent, distinct from reaching the end condition only
    /// in the audit trail.
    pub async fn hard_stop(
        &self,
        definition_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RecurrenceDefinition, EngineError> {
        let mut definition = self.load_existing(definition_id).await?;
        if matches!(
            definition.inactive_reason,
            Some(InactiveReason::Stopped) | Some(InactiveReason::Completed)
        ) && !definition.is_active
        {
            return Err(EngineError::Lifecycle(format!(
                "recurrence is already {}",
                definition.status_label()
            )));
        }
        definition.deactivate(InactiveReason::Stopped);
        definition.updated_at = now;
        self.store.save(&definition).await?;
        self.record(&definition, "hard_stopped", None, now);
        self.side_effects.enqueue(SideEffect::Publish {
            topic: "recurrence.stopped".into(),
            payload: json!({
                "recurrence_id": definition.id,
                "parent_id": definition.parent_id,
            }),
        });
        Ok(definition)
    }

    /// Replace the schedule and recompute `next_occurrence`. Rejected if the
    /// new schedule cannot produce an occurrence at or after `now`.
    pub async fn update_schedule(
        &self,
        definition_id: Uuid,
        update: ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<RecurrenceDefinition, EngineError> {
        schedule::validate(&update.shape, update.firing_behavior)?;
        let mut definition = self.load_existing(definition_id).await?;
        if matches!(
            definition.inactive_reason,
            Some(InactiveReason::Stopped) | Some(InactiveReason::Completed)
        ) && !definition.is_active
        {
            return Err(EngineError::Lifecycle(format!(
                "cannot update a {} recurrence",
                definition.status_label()
            )));
        }

        definition.shape = update.shape;
        definition.firing_behavior = update.firing_behavior;
        definition.end_condition = update.end_condition;
        definition.timezone = update.timezone;
        definition.due_time = update.due_time;
        definition.start_at = update.start_at;

        if definition.is_active {
            let next = self.recompute_next(&definition, now)?;
            match next {
                Some(next) if next >= now => definition.next_occurrence = Some(next),
                Some(next) => {
                    return Err(EngineError::InvalidSchedule(format!(
                        "updated schedule would place the next occurrence in the past ({next})"
                    )));
                }
                None if definition.firing_behavior == FiringBehavior::AfterCompletion => {
                    definition.next_occurrence = None;
                }
                None => {
                    return Err(EngineError::InvalidSchedule(
                        "updated schedule has no future occurrences".into(),
                    ));
                }
            }
        }
        definition.updated_at = now;
        self.store.save(&definition).await?;
        self.record(&definition, "schedule_updated", None, now);
        Ok(definition)
    }

    /// Next occurrence for a definition whose schedule just changed or that
    /// is being resumed. After-completion definitions with generated history
    /// keep waiting on their last instance.
    fn recompute_next(
        &self,
        definition: &RecurrenceDefinition,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        if definition.firing_behavior == FiringBehavior::AfterCompletion
            && !definition.generated_instance_ids.is_empty()
        {
            return Ok(None);
        }
        calculator::initial_occurrence(
            &definition.shape,
            definition.firing_behavior,
            definition.due_time,
            definition.timezone,
            definition.start_at,
            now,
        )
    }

    async fn load_existing(
        &self,
        definition_id: Uuid,
    ) -> Result<RecurrenceDefinition, EngineError> {
        self.store
            .load(definition_id)
            .await?
            .ok_or(EngineError::RecurrenceNotFound(definition_id))
    }

    pub(crate) fn record(
        &self,
        definition: &RecurrenceDefinition,
        action: &str,
        detail: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) {
        self.side_effects.enqueue(SideEffect::Activity(ActivityEntry {
            recurrence_id: definition.id,
            parent_id: definition.parent_id,
            action: action.to_string(),
            detail,
            at,
        }));
    }
}
