//! Administrative surface over the recurrence store and trigger engine:
//! create / get / list / update / stop / trigger-now. Transport (HTTP, CLI)
//! lives outside the engine; these are the operation contracts.

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use tracing::info;
use uuid::Uuid;

use crate::collab::WorkItemStore;
use crate::engine::{ScheduleUpdate, TriggerEngine, TriggerSource};
use crate::error::{EngineError, FireOutcome};
use crate::recurrence::{InstanceTemplate, RecurrenceDefinition};
use crate::schedule::{self, calculator, EndCondition, FiringBehavior, ScheduleShape};
use crate::store::RecurrenceStore;

/// Request to attach a recurrence to a work item.
#[derive(Debug, Clone)]
pub struct CreateRecurrence {
    pub parent_id: Uuid,
    pub workspace_id: Uuid,
    pub shape: ScheduleShape,
    pub firing_behavior: FiringBehavior,
    pub end_condition: EndCondition,
    pub timezone: Tz,
    pub due_time: NaiveTime,
    pub start_at: Option<DateTime<Utc>>,
    pub template: InstanceTemplate,
}

/// How to stop a recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Pause: resumable, history preserved.
    Soft,
    /// Hard stop: permanent.
    Hard,
}

pub struct RecurrenceService {
    store: Arc<dyn RecurrenceStore>,
    work_items: Arc<dyn WorkItemStore>,
    engine: Arc<TriggerEngine>,
}

impl RecurrenceService {
    pub fn new(
        store: Arc<dyn RecurrenceStore>,
        work_items: Arc<dyn WorkItemStore>,
        engine: Arc<TriggerEngine>,
    ) -> Self {
        Self {
            store,
            work_items,
            engine,
        }
    }

    /// Attach a recurrence to a work item. Rejected when the shape is
    /// invalid, the parent is missing, or the parent already carries an
    /// active recurrence.
    pub async fn create(
        &self,
        request: CreateRecurrence,
    ) -> Result<RecurrenceDefinition, EngineError> {
        schedule::validate(&request.shape, request.firing_behavior)?;
        if !self
            .work_items
            .parent_exists(request.parent_id)
            .await
            .map_err(|e| EngineError::WorkItem(e.to_string()))?
        {
            return Err(EngineError::ParentNotFound(request.parent_id));
        }
        if self
            .store
            .find_active_by_parent(request.parent_id)
            .await?
            .is_some()
        {
            return Err(EngineError::RecurrenceExists(request.parent_id));
        }

        let now = Utc::now();
        let next_occurrence = calculator::initial_occurrence(
            &request.shape,
            request.firing_behavior,
            request.due_time,
            request.timezone,
            request.start_at,
            now,
        )?;
        let Some(next_occurrence) = next_occurrence else {
            return Err(EngineError::InvalidSchedule(
                "schedule has no future occurrences".into(),
            ));
        };

        let definition = RecurrenceDefinition {
            id: Uuid::new_v4(),
            parent_id: request.parent_id,
            workspace_id: request.workspace_id,
            shape: request.shape,
            firing_behavior: request.firing_behavior,
            end_condition: request.end_condition,
            timezone: request.timezone,
            due_time: request.due_time,
            start_at: request.start_at,
            template: request.template,
            is_active: true,
            inactive_reason: None,
            next_occurrence: Some(next_occurrence),
            last_occurrence: None,
            completed_occurrences: 0,
            generated_instance_ids: vec![],
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&definition).await?;
        info!(recurrence = %definition.id, parent = %definition.parent_id,
              shape = definition.shape.label(), %next_occurrence, "recurrence created");
        self.engine.record(&definition, "created", None, now);
        Ok(definition)
    }

    pub async fn get(&self, id: Uuid) -> Result<RecurrenceDefinition, EngineError> {
        self.store
            .load(id)
            .await?
            .ok_or(EngineError::RecurrenceNotFound(id))
    }

    /// The active recurrence attached to a work item, if any.
    pub async fn get_by_parent(
        &self,
        parent_id: Uuid,
    ) -> Result<Option<RecurrenceDefinition>, EngineError> {
        Ok(self.store.find_active_by_parent(parent_id).await?)
    }

    /// Recurrences in a workspace, optionally including paused/stopped/
    /// completed ones.
    pub async fn list(
        &self,
        workspace_id: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<RecurrenceDefinition>, EngineError> {
        Ok(self
            .store
            .list_for_workspace(workspace_id, include_inactive)
            .await?)
    }

    pub async fn update(
        &self,
        id: Uuid,
        update: ScheduleUpdate,
    ) -> Result<RecurrenceDefinition, EngineError> {
        self.engine.update_schedule(id, update, Utc::now()).await
    }

    pub async fn stop(
        &self,
        id: Uuid,
        mode: StopMode,
    ) -> Result<RecurrenceDefinition, EngineError> {
        match mode {
            StopMode::Soft => self.engine.pause(id, Utc::now()).await,
            StopMode::Hard => self.engine.hard_stop(id, Utc::now()).await,
        }
    }

    pub async fn resume(&self, id: Uuid) -> Result<RecurrenceDefinition, EngineError> {
        self.engine.resume(id, Utc::now()).await
    }

    /// Fire immediately, bypassing the due-time check.
    pub async fn trigger_now(&self, id: Uuid) -> Result<FireOutcome, EngineError> {
        self.engine
            .fire(
                id,
                Utc::now(),
                TriggerSource::Manual {
                    bypass_due_check: true,
                },
            )
            .await
    }

    /// Hard-delete a definition and its history.
    pub async fn delete(&self, id: Uuid) -> Result<bool, EngineError> {
        Ok(self.store.delete(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryActivityLog, InMemoryEventBus, InMemoryWorkItemStore};
    use crate::engine::{SideEffectDispatcher, SweepScheduler};
    use crate::error::SkipReason;
    use crate::recurrence::InactiveReason;
    use crate::schedule::{MonthlyTarget, Weekday};
    use crate::store::InMemoryRecurrenceStore;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    struct Harness {
        service: RecurrenceService,
        engine: Arc<TriggerEngine>,
        store: Arc<InMemoryRecurrenceStore>,
        work_items: Arc<InMemoryWorkItemStore>,
        bus: InMemoryEventBus,
        activity: InMemoryActivityLog,
        parent_id: Uuid,
        workspace_id: Uuid,
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryRecurrenceStore::new());
        let work_items = Arc::new(InMemoryWorkItemStore::new());
        let bus = InMemoryEventBus::new();
        let activity = InMemoryActivityLog::new();
        let side_effects = SideEffectDispatcher::new(
            Arc::new(bus.clone()),
            Arc::new(activity.clone()),
        )
        .with_retry(3, std::time::Duration::from_millis(1))
        .spawn();
        let engine = Arc::new(TriggerEngine::new(
            store.clone(),
            work_items.clone(),
            side_effects,
            Duration::minutes(2),
        ));
        let service = RecurrenceService::new(store.clone(), work_items.clone(), engine.clone());

        let parent_id = Uuid::new_v4();
        work_items.add_parent(parent_id).await;

        Harness {
            service,
            engine,
            store,
            work_items,
            bus,
            activity,
            parent_id,
            workspace_id: Uuid::new_v4(),
        }
    }

    fn template() -> InstanceTemplate {
        InstanceTemplate {
            title: "Standup notes".into(),
            description: None,
            priority: None,
            assignees: vec![],
            tags: vec![],
            due_offset_days: Some(1),
            start_offset_days: None,
        }
    }

    fn nine() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    fn daily_request(h: &Harness) -> CreateRecurrence {
        CreateRecurrence {
            parent_id: h.parent_id,
            workspace_id: h.workspace_id,
            shape: ScheduleShape::Daily { interval_days: 1 },
            firing_behavior: FiringBehavior::OnSchedule,
            end_condition: EndCondition::Never,
            timezone: Tz::UTC,
            due_time: nine(),
            start_at: None,
            template: template(),
        }
    }

    /// Insert a definition with a fixed next occurrence, skipping the
    /// wall-clock path of `create`.
    async fn seed(
        h: &Harness,
        shape: ScheduleShape,
        behavior: FiringBehavior,
        end_condition: EndCondition,
        next: DateTime<Utc>,
    ) -> RecurrenceDefinition {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let def = RecurrenceDefinition {
            id: Uuid::new_v4(),
            parent_id: h.parent_id,
            workspace_id: h.workspace_id,
            shape,
            firing_behavior: behavior,
            end_condition,
            timezone: Tz::UTC,
            due_time: nine(),
            start_at: None,
            template: template(),
            is_active: true,
            inactive_reason: None,
            next_occurrence: Some(next),
            last_occurrence: None,
            completed_occurrences: 0,
            generated_instance_ids: vec![],
            created_at: created,
            updated_at: created,
        };
        h.store.insert(&def).await.unwrap();
        def
    }

    fn utc(y: i32, m: u32, d: u32, hr: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, hr, min, 0).unwrap()
    }

    #[tokio::test]
    async fn create_rejects_second_active_recurrence() {
        let h = harness().await;
        h.service.create(daily_request(&h)).await.unwrap();
        let err = h.service.create(daily_request(&h)).await.unwrap_err();
        assert!(matches!(err, EngineError::RecurrenceExists(p) if p == h.parent_id));

        // Only one *active* recurrence per parent; pausing frees the slot.
        let existing = h.service.get_by_parent(h.parent_id).await.unwrap().unwrap();
        h.service.stop(existing.id, StopMode::Soft).await.unwrap();
        h.service.create(daily_request(&h)).await.unwrap();
    }

    #[tokio::test]
    async fn create_rejects_missing_parent_and_bad_shape() {
        let h = harness().await;

        let mut missing = daily_request(&h);
        missing.parent_id = Uuid::new_v4();
        assert!(matches!(
            h.service.create(missing).await.unwrap_err(),
            EngineError::ParentNotFound(_)
        ));

        let mut bad = daily_request(&h);
        bad.shape = ScheduleShape::Weekly {
            interval_weeks: 1,
            weekdays: BTreeSet::new(),
        };
        assert!(matches!(
            h.service.create(bad).await.unwrap_err(),
            EngineError::InvalidSchedule(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_firings_generate_exactly_one_instance() {
        let h = harness().await;
        let now = utc(2024, 1, 10, 9, 0);
        let def = seed(
            &h,
            ScheduleShape::Daily { interval_days: 1 },
            FiringBehavior::OnSchedule,
            EndCondition::Never,
            now,
        )
        .await;

        // Manual trigger racing the sweep for the same occurrence.
        let (a, b) = tokio::join!(
            h.engine.fire(def.id, now, TriggerSource::Sweep),
            h.engine.fire(
                def.id,
                now,
                TriggerSource::Manual {
                    bypass_due_check: false
                }
            ),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let fired = outcomes
            .iter()
            .filter(|o| matches!(o, FireOutcome::Fired { .. }))
            .count();
        assert_eq!(fired, 1, "exactly one of the racers may generate");

        let after = h.service.get(def.id).await.unwrap();
        assert_eq!(after.completed_occurrences, 1);
        assert_eq!(after.generated_instance_ids.len(), 1);
        assert_eq!(h.work_items.created_instances().await.len(), 1);
        assert_eq!(after.next_occurrence, Some(utc(2024, 1, 11, 9, 0)));
    }

    #[tokio::test]
    async fn weekly_scenario_advances_wednesday_then_monday() {
        let h = harness().await;
        // Tuesday 2024-01-02 reference.
        let created_at = utc(2024, 1, 2, 8, 0);
        let shape = ScheduleShape::Weekly {
            interval_weeks: 1,
            weekdays: BTreeSet::from([Weekday::Mon, Weekday::Wed]),
        };
        let first = calculator::initial_occurrence(
            &shape,
            FiringBehavior::OnSchedule,
            nine(),
            Tz::UTC,
            None,
            created_at,
        )
        .unwrap()
        .unwrap();
        assert_eq!(first, utc(2024, 1, 3, 9, 0)); // Wednesday

        let def = seed(&h, shape, FiringBehavior::OnSchedule, EndCondition::Never, first).await;
        let outcome = h
            .engine
            .fire(def.id, first, TriggerSource::Sweep)
            .await
            .unwrap();
        assert!(matches!(outcome, FireOutcome::Fired { .. }));

        let after = h.service.get(def.id).await.unwrap();
        assert_eq!(after.next_occurrence, Some(utc(2024, 1, 8, 9, 0))); // Monday
    }

    #[tokio::test]
    async fn occurrence_count_bound_fires_then_completes() {
        let h = harness().await;
        let mut now = utc(2024, 1, 10, 9, 0);
        let def = seed(
            &h,
            ScheduleShape::Daily { interval_days: 1 },
            FiringBehavior::OnSchedule,
            EndCondition::AfterOccurrenceCount { count: 3 },
            now,
        )
        .await;

        for expected in 1..=3u32 {
            let outcome = h
                .engine
                .fire(def.id, now, TriggerSource::Sweep)
                .await
                .unwrap();
            assert!(matches!(outcome, FireOutcome::Fired { .. }));
            let current = h.service.get(def.id).await.unwrap();
            assert_eq!(current.completed_occurrences, expected);
            if let Some(next) = current.next_occurrence {
                now = next;
            }
        }

        let finished = h.service.get(def.id).await.unwrap();
        assert!(!finished.is_active);
        assert_eq!(finished.status_label(), "completed");
        assert_eq!(finished.next_occurrence, None);

        // A fourth pass is a no-op.
        let outcome = h
            .engine
            .fire(def.id, now, TriggerSource::Sweep)
            .await
            .unwrap();
        assert_eq!(outcome, FireOutcome::Skipped(SkipReason::Inactive));
        assert_eq!(h.work_items.created_instances().await.len(), 3);
    }

    #[tokio::test]
    async fn date_bound_generates_the_satisfying_occurrence() {
        let h = harness().await;
        // Monthly on the 1st; the January firing computes Feb 1 as next,
        // which is on the bound, so the recurrence completes after firing.
        let first = utc(2024, 1, 1, 9, 0);
        let def = seed(
            &h,
            ScheduleShape::Monthly {
                interval_months: 1,
                target: MonthlyTarget::DayOfMonth { day: 1 },
            },
            FiringBehavior::OnSchedule,
            EndCondition::OnOrAfterDate {
                date: utc(2024, 2, 1, 0, 0),
            },
            first,
        )
        .await;

        let outcome = h
            .engine
            .fire(def.id, first, TriggerSource::Sweep)
            .await
            .unwrap();
        assert!(matches!(outcome, FireOutcome::Fired { .. }));

        let after = h.service.get(def.id).await.unwrap();
        assert!(!after.is_active);
        assert_eq!(after.status_label(), "completed");
        assert_eq!(after.completed_occurrences, 1);
        assert_eq!(h.work_items.created_instances().await.len(), 1);
    }

    #[tokio::test]
    async fn deleted_parent_auto_pauses_without_an_instance() {
        let h = harness().await;
        let now = utc(2024, 1, 10, 9, 0);
        let def = seed(
            &h,
            ScheduleShape::Daily { interval_days: 1 },
            FiringBehavior::OnSchedule,
            EndCondition::Never,
            now,
        )
        .await;

        h.work_items.remove_parent(h.parent_id).await;
        let err = h
            .engine
            .fire(def.id, now, TriggerSource::Sweep)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ParentNotFound(_)));

        let after = h.service.get(def.id).await.unwrap();
        assert!(!after.is_active);
        assert_eq!(after.inactive_reason, Some(InactiveReason::ParentNotFound));
        assert_eq!(after.status_label(), "paused — parent not found");
        assert!(h.work_items.created_instances().await.is_empty());

        // Parent restored: resume recomputes and the schedule continues.
        h.work_items.add_parent(h.parent_id).await;
        let resumed = h.service.resume(def.id).await.unwrap();
        assert!(resumed.is_active);
        assert!(resumed.next_occurrence.is_some());
    }

    #[tokio::test]
    async fn after_completion_waits_for_mark_complete() {
        let h = harness().await;
        let now = utc(2024, 1, 10, 9, 0);
        let def = seed(
            &h,
            ScheduleShape::DaysAfterCompletion { days: 2 },
            FiringBehavior::AfterCompletion,
            EndCondition::Never,
            now,
        )
        .await;

        let outcome = h
            .engine
            .fire(def.id, now, TriggerSource::Sweep)
            .await
            .unwrap();
        let FireOutcome::Fired { instance_id } = outcome else {
            panic!("expected a firing, got {outcome:?}");
        };

        // No next occurrence until the instance is completed.
        let waiting = h.service.get(def.id).await.unwrap();
        assert!(waiting.is_active);
        assert_eq!(waiting.next_occurrence, None);
        assert_eq!(
            h.engine
                .fire(def.id, now + Duration::days(30), TriggerSource::Sweep)
                .await
                .unwrap(),
            FireOutcome::Skipped(SkipReason::AwaitingCompletion)
        );

        let completed_at = utc(2024, 1, 14, 16, 30);
        h.engine
            .handle_completion(instance_id, completed_at)
            .await
            .unwrap();
        let scheduled = h.service.get(def.id).await.unwrap();
        // Completion + 2 days, at the configured due time.
        assert_eq!(scheduled.next_occurrence, Some(utc(2024, 1, 16, 9, 0)));
    }

    #[tokio::test]
    async fn completion_of_a_stale_instance_is_ignored() {
        let h = harness().await;
        let now = utc(2024, 1, 10, 9, 0);
        let def = seed(
            &h,
            ScheduleShape::DaysAfterCompletion { days: 2 },
            FiringBehavior::AfterCompletion,
            EndCondition::Never,
            now,
        )
        .await;

        let FireOutcome::Fired { instance_id: first } =
            h.engine.fire(def.id, now, TriggerSource::Sweep).await.unwrap()
        else {
            panic!("expected firing");
        };
        h.engine
            .handle_completion(first, utc(2024, 1, 11, 12, 0))
            .await
            .unwrap();
        let next = h.service.get(def.id).await.unwrap().next_occurrence.unwrap();

        let FireOutcome::Fired { .. } = h
            .engine
            .fire(def.id, next, TriggerSource::Sweep)
            .await
            .unwrap()
        else {
            panic!("expected second firing");
        };

        // Completing the *first* instance again must not reschedule.
        h.engine
            .handle_completion(first, utc(2024, 2, 1, 12, 0))
            .await
            .unwrap();
        let after = h.service.get(def.id).await.unwrap();
        assert_eq!(after.next_occurrence, None);
    }

    #[tokio::test]
    async fn pause_resume_and_hard_stop_lifecycle() {
        let h = harness().await;
        let def = h.service.create(daily_request(&h)).await.unwrap();

        let paused = h.service.stop(def.id, StopMode::Soft).await.unwrap();
        assert_eq!(paused.status_label(), "paused");
        assert_eq!(paused.next_occurrence, None);
        assert_eq!(
            h.engine
                .fire(def.id, Utc::now(), TriggerSource::Sweep)
                .await
                .unwrap(),
            FireOutcome::Skipped(SkipReason::Inactive)
        );

        let resumed = h.service.resume(def.id).await.unwrap();
        assert!(resumed.is_active);
        assert!(resumed.next_occurrence.unwrap() > Utc::now());

        let stopped = h.service.stop(def.id, StopMode::Hard).await.unwrap();
        assert_eq!(stopped.status_label(), "stopped");
        assert!(matches!(
            h.service.resume(def.id).await.unwrap_err(),
            EngineError::Lifecycle(_)
        ));
    }

    #[tokio::test]
    async fn resume_rejected_while_another_recurrence_is_active() {
        let h = harness().await;
        let first = h.service.create(daily_request(&h)).await.unwrap();
        h.service.stop(first.id, StopMode::Soft).await.unwrap();
        let second = h.service.create(daily_request(&h)).await.unwrap();

        // The parent slot is taken; resuming the paused one must not yield
        // two active recurrences.
        let err = h.service.resume(first.id).await.unwrap_err();
        assert!(matches!(err, EngineError::RecurrenceExists(p) if p == h.parent_id));
        let all = h.service.list(h.workspace_id, true).await.unwrap();
        assert_eq!(all.iter().filter(|d| d.is_active).count(), 1);

        // Once the slot is free again the resume goes through.
        h.service.stop(second.id, StopMode::Soft).await.unwrap();
        assert!(h.service.resume(first.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn update_schedule_recomputes_and_validates() {
        let h = harness().await;
        let def = h.service.create(daily_request(&h)).await.unwrap();

        let updated = h
            .service
            .update(
                def.id,
                ScheduleUpdate {
                    shape: ScheduleShape::Weekly {
                        interval_weeks: 1,
                        weekdays: BTreeSet::from([Weekday::Fri]),
                    },
                    firing_behavior: FiringBehavior::OnSchedule,
                    end_condition: EndCondition::Never,
                    timezone: Tz::UTC,
                    due_time: nine(),
                    start_at: None,
                },
            )
            .await
            .unwrap();
        assert!(updated.next_occurrence.unwrap() > Utc::now());
        assert_eq!(updated.shape.label(), "weekly");

        // A custom list with only past dates cannot be scheduled.
        let err = h
            .service
            .update(
                def.id,
                ScheduleUpdate {
                    shape: ScheduleShape::Custom {
                        dates: vec![chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()],
                        rule: None,
                    },
                    firing_behavior: FiringBehavior::OnSchedule,
                    end_condition: EndCondition::Never,
                    timezone: Tz::UTC,
                    due_time: nine(),
                    start_at: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn trigger_now_bypasses_the_due_check() {
        let h = harness().await;
        let future = Utc::now() + Duration::days(5);
        let def = seed(
            &h,
            ScheduleShape::Daily { interval_days: 1 },
            FiringBehavior::OnSchedule,
            EndCondition::Never,
            future,
        )
        .await;

        // The sweep path refuses a future occurrence.
        assert_eq!(
            h.engine
                .fire(def.id, Utc::now(), TriggerSource::Sweep)
                .await
                .unwrap(),
            FireOutcome::Skipped(SkipReason::NotDue)
        );
        // Manual trigger-now fires it, and the next occurrence still lands
        // strictly after the claimed one.
        let outcome = h.service.trigger_now(def.id).await.unwrap();
        assert!(matches!(outcome, FireOutcome::Fired { .. }));
        let after = h.service.get(def.id).await.unwrap();
        assert!(after.next_occurrence.unwrap() > future);
    }

    #[tokio::test]
    async fn listing_includes_inactive_only_on_request() {
        let h = harness().await;
        let def = h.service.create(daily_request(&h)).await.unwrap();
        h.service.stop(def.id, StopMode::Soft).await.unwrap();

        let active_only = h.service.list(h.workspace_id, false).await.unwrap();
        assert!(active_only.is_empty());
        let all = h.service.list(h.workspace_id, true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status_label(), "paused");
    }

    #[tokio::test]
    async fn sweep_fires_due_definitions_and_isolates_failures() {
        let h = harness().await;
        let past = Utc::now() - Duration::hours(1);

        let healthy = seed(
            &h,
            ScheduleShape::Daily { interval_days: 1 },
            FiringBehavior::OnSchedule,
            EndCondition::Never,
            past,
        )
        .await;

        // Second definition whose parent disappears before the sweep.
        let orphan_parent = Uuid::new_v4();
        h.work_items.add_parent(orphan_parent).await;
        let mut orphan = seed(
            &h,
            ScheduleShape::Daily { interval_days: 1 },
            FiringBehavior::OnSchedule,
            EndCondition::Never,
            past,
        )
        .await;
        orphan.parent_id = orphan_parent;
        h.store.save(&orphan).await.unwrap();
        h.work_items.remove_parent(orphan_parent).await;

        let sweeper = SweepScheduler::new(
            h.store.clone(),
            h.engine.clone(),
            std::time::Duration::from_secs(60),
            4,
            std::time::Duration::from_secs(5),
        );
        let stats = sweeper.sweep_once().await;
        assert_eq!(stats.due, 2);
        assert_eq!(stats.fired, 1);
        assert_eq!(stats.failed, 1);

        assert_eq!(
            h.service.get(healthy.id).await.unwrap().completed_occurrences,
            1
        );
        assert_eq!(
            h.service.get(orphan.id).await.unwrap().status_label(),
            "paused — parent not found"
        );
    }

    #[tokio::test]
    async fn firing_emits_notification_and_activity_after_persistence() {
        let h = harness().await;
        let now = utc(2024, 1, 10, 9, 0);
        let def = seed(
            &h,
            ScheduleShape::Daily { interval_days: 1 },
            FiringBehavior::OnSchedule,
            EndCondition::Never,
            now,
        )
        .await;
        h.engine
            .fire(def.id, now, TriggerSource::Sweep)
            .await
            .unwrap();

        // Side effects are delivered asynchronously after the state write.
        for _ in 0..100 {
            if !h.bus.published().await.is_empty() && !h.activity.entries().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let published = h.bus.published().await;
        assert_eq!(published[0].0, "recurrence.instance_created");
        assert_eq!(published[0].1["recurrence_id"], serde_json::json!(def.id));
        assert!(h
            .activity
            .entries()
            .await
            .iter()
            .any(|e| e.action == "instance_generated"));
    }
}
