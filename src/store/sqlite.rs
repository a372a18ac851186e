//! SQLite-based recurrence store with a durable firing-claims ledger.

use super::{ClaimKey, RecurrenceStore, StoreError};
use crate::recurrence::{InactiveReason, InstanceTemplate, RecurrenceDefinition};
use crate::schedule::{EndCondition, FiringBehavior, ScheduleShape};
use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS recurrences (
    id TEXT PRIMARY KEY NOT NULL,
    parent_id TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    shape TEXT NOT NULL,
    firing_behavior TEXT NOT NULL,
    end_condition TEXT NOT NULL,
    timezone TEXT NOT NULL,
    due_time TEXT NOT NULL,
    start_at TEXT,
    template TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    inactive_reason TEXT,
    next_occurrence TEXT,
    last_occurrence TEXT,
    completed_occurrences INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recurrences_due ON recurrences(is_active, next_occurrence);
CREATE INDEX IF NOT EXISTS idx_recurrences_workspace ON recurrences(workspace_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_recurrences_active_parent
    ON recurrences(parent_id) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS generated_instances (
    recurrence_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    instance_id TEXT NOT NULL,
    PRIMARY KEY (recurrence_id, position),
    FOREIGN KEY (recurrence_id) REFERENCES recurrences(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_instances_instance ON generated_instances(instance_id);

CREATE TABLE IF NOT EXISTS firing_claims (
    recurrence_id TEXT NOT NULL,
    occurrence TEXT NOT NULL,
    lease_until TEXT NOT NULL,
    committed INTEGER NOT NULL DEFAULT 0,
    claimed_at TEXT NOT NULL,
    PRIMARY KEY (recurrence_id, occurrence)
);
"#;

pub struct SqliteRecurrenceStore {
    conn: Arc<Mutex<Connection>>,
}

fn backend<E: std::fmt::Display>(context: &str) -> impl Fn(E) -> StoreError + '_ {
    move |e| StoreError::Backend(format!("{context}: {e}"))
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {s:?}: {e}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Backend(format!("bad uuid {s:?}: {e}")))
}

impl SqliteRecurrenceStore {
    pub async fn open(data_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(backend("create data dir"))?;
        let db_path = data_dir.join("recurrences.db");

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path).map_err(backend("open database"))?;
            conn.execute_batch(SCHEMA).map_err(backend("run schema"))?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(backend("join blocking task"))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(backend("join blocking task"))?
    }
}

fn inactive_reason_to_str(reason: InactiveReason) -> &'static str {
    match reason {
        InactiveReason::Paused => "paused",
        InactiveReason::Stopped => "stopped",
        InactiveReason::Completed => "completed",
        InactiveReason::ParentNotFound => "parent_not_found",
    }
}

fn parse_inactive_reason(s: &str) -> Option<InactiveReason> {
    match s {
        "paused" => Some(InactiveReason::Paused),
        "stopped" => Some(InactiveReason::Stopped),
        "completed" => Some(InactiveReason::Completed),
        "parent_not_found" => Some(InactiveReason::ParentNotFound),
        _ => None,
    }
}

fn firing_behavior_to_str(behavior: FiringBehavior) -> &'static str {
    match behavior {
        FiringBehavior::OnSchedule => "onSchedule",
        FiringBehavior::AfterCompletion => "afterCompletion",
    }
}

fn parse_firing_behavior(s: &str) -> FiringBehavior {
    match s {
        "afterCompletion" => FiringBehavior::AfterCompletion,
        _ => FiringBehavior::OnSchedule,
    }
}

/// Insert a new definition row and its ledger. A plain INSERT: a duplicate
/// id or a second active definition for the parent surfaces as a constraint
/// error instead of replacing the existing row.
fn insert_definition(
    tx: &rusqlite::Transaction<'_>,
    def: &RecurrenceDefinition,
) -> Result<(), StoreError> {
    let shape = serde_json::to_string(&def.shape).map_err(backend("encode shape"))?;
    let end_condition =
        serde_json::to_string(&def.end_condition).map_err(backend("encode end condition"))?;
    let template = serde_json::to_string(&def.template).map_err(backend("encode template"))?;

    tx.execute(
        "INSERT INTO recurrences
             (id, parent_id, workspace_id, shape, firing_behavior, end_condition,
              timezone, due_time, start_at, template, is_active, inactive_reason,
              next_occurrence, last_occurrence, completed_occurrences, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            def.id.to_string(),
            def.parent_id.to_string(),
            def.workspace_id.to_string(),
            shape,
            firing_behavior_to_str(def.firing_behavior),
            end_condition,
            def.timezone.name(),
            def.due_time.to_string(),
            def.start_at.map(ts),
            template,
            def.is_active as i64,
            def.inactive_reason.map(inactive_reason_to_str),
            def.next_occurrence.map(ts),
            def.last_occurrence.map(ts),
            def.completed_occurrences as i64,
            ts(def.created_at),
            ts(def.updated_at),
        ],
    )
    .map_err(backend("insert recurrence"))?;
    write_ledger(tx, def)
}

/// Update an existing definition row and rewrite its ledger. UPDATE, never
/// REPLACE: making a second definition active for a parent trips the partial
/// unique index rather than deleting the sibling row.
fn update_definition(
    tx: &rusqlite::Transaction<'_>,
    def: &RecurrenceDefinition,
) -> Result<(), StoreError> {
    let shape = serde_json::to_string(&def.shape).map_err(backend("encode shape"))?;
    let end_condition =
        serde_json::to_string(&def.end_condition).map_err(backend("encode end condition"))?;
    let template = serde_json::to_string(&def.template).map_err(backend("encode template"))?;

    let changed = tx
        .execute(
            "UPDATE recurrences SET
                 parent_id = ?2, workspace_id = ?3, shape = ?4, firing_behavior = ?5,
                 end_condition = ?6, timezone = ?7, due_time = ?8, start_at = ?9,
                 template = ?10, is_active = ?11, inactive_reason = ?12,
                 next_occurrence = ?13, last_occurrence = ?14,
                 completed_occurrences = ?15, updated_at = ?16
             WHERE id = ?1",
            params![
                def.id.to_string(),
                def.parent_id.to_string(),
                def.workspace_id.to_string(),
                shape,
                firing_behavior_to_str(def.firing_behavior),
                end_condition,
                def.timezone.name(),
                def.due_time.to_string(),
                def.start_at.map(ts),
                template,
                def.is_active as i64,
                def.inactive_reason.map(inactive_reason_to_str),
                def.next_occurrence.map(ts),
                def.last_occurrence.map(ts),
                def.completed_occurrences as i64,
                ts(def.updated_at),
            ],
        )
        .map_err(backend("update recurrence"))?;
    if changed == 0 {
        return Err(StoreError::NotFound(def.id));
    }
    write_ledger(tx, def)
}

fn write_ledger(
    tx: &rusqlite::Transaction<'_>,
    def: &RecurrenceDefinition,
) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM generated_instances WHERE recurrence_id = ?1",
        params![def.id.to_string()],
    )
    .map_err(backend("clear ledger"))?;
    for (position, instance_id) in def.generated_instance_ids.iter().enumerate() {
        tx.execute(
            "INSERT INTO generated_instances (recurrence_id, position, instance_id)
             VALUES (?1, ?2, ?3)",
            params![def.id.to_string(), position as i64, instance_id.to_string()],
        )
        .map_err(backend("append ledger"))?;
    }
    Ok(())
}

fn read_definition(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<RecurrenceDefinition>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, parent_id, workspace_id, shape, firing_behavior, end_condition,
                    timezone, due_time, start_at, template, is_active, inactive_reason,
                    next_occurrence, last_occurrence, completed_occurrences, created_at, updated_at
             FROM recurrences WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, Option<String>>(13)?,
                    row.get::<_, i64>(14)?,
                    row.get::<_, String>(15)?,
                    row.get::<_, String>(16)?,
                ))
            },
        )
        .optional()
        .map_err(backend("read recurrence"))?;

    let Some((
        id_s,
        parent_s,
        workspace_s,
        shape_s,
        behavior_s,
        end_s,
        tz_s,
        due_s,
        start_s,
        template_s,
        is_active,
        reason_s,
        next_s,
        last_s,
        completed,
        created_s,
        updated_s,
    )) = row
    else {
        return Ok(None);
    };

    let shape: ScheduleShape =
        serde_json::from_str(&shape_s).map_err(backend("decode shape"))?;
    let end_condition: EndCondition =
        serde_json::from_str(&end_s).map_err(backend("decode end condition"))?;
    let template: InstanceTemplate =
        serde_json::from_str(&template_s).map_err(backend("decode template"))?;
    let timezone: Tz = tz_s
        .parse()
        .map_err(|e| StoreError::Backend(format!("bad timezone {tz_s:?}: {e}")))?;
    let due_time: NaiveTime = due_s
        .parse()
        .map_err(|e| StoreError::Backend(format!("bad due time {due_s:?}: {e}")))?;

    let mut stmt = conn
        .prepare(
            "SELECT instance_id FROM generated_instances
             WHERE recurrence_id = ?1 ORDER BY position",
        )
        .map_err(backend("prepare ledger query"))?;
    let generated_instance_ids = stmt
        .query_map(params![id_s], |row| row.get::<_, String>(0))
        .map_err(backend("read ledger"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(backend("read ledger rows"))?
        .iter()
        .map(|s| parse_uuid(s))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(RecurrenceDefinition {
        id: parse_uuid(&id_s)?,
        parent_id: parse_uuid(&parent_s)?,
        workspace_id: parse_uuid(&workspace_s)?,
        shape,
        firing_behavior: parse_firing_behavior(&behavior_s),
        end_condition,
        timezone,
        due_time,
        start_at: start_s.as_deref().map(parse_ts).transpose()?,
        template,
        is_active: is_active != 0,
        inactive_reason: reason_s.as_deref().and_then(parse_inactive_reason),
        next_occurrence: next_s.as_deref().map(parse_ts).transpose()?,
        last_occurrence: last_s.as_deref().map(parse_ts).transpose()?,
        completed_occurrences: completed as u32,
        generated_instance_ids,
        created_at: parse_ts(&created_s)?,
        updated_at: parse_ts(&updated_s)?,
    }))
}

#[async_trait]
impl RecurrenceStore for SqliteRecurrenceStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn insert(&self, definition: &RecurrenceDefinition) -> Result<(), StoreError> {
        let def = definition.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend("begin"))?;
            insert_definition(&tx, &def)?;
            tx.commit().map_err(backend("commit"))
        })
        .await
    }

    async fn load(&self, id: Uuid) -> Result<Option<RecurrenceDefinition>, StoreError> {
        self.with_conn(move |conn| read_definition(conn, id)).await
    }

    async fn find_active_by_parent(
        &self,
        parent_id: Uuid,
    ) -> Result<Option<RecurrenceDefinition>, StoreError> {
        self.with_conn(move |conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM recurrences WHERE parent_id = ?1 AND is_active = 1",
                    params![parent_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend("query active by parent"))?;
            match id {
                Some(id) => read_definition(conn, parse_uuid(&id)?),
                None => Ok(None),
            }
        })
        .await
    }

    async fn find_by_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<RecurrenceDefinition>, StoreError> {
        self.with_conn(move |conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT recurrence_id FROM generated_instances WHERE instance_id = ?1",
                    params![instance_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(backend("query by instance"))?;
            match id {
                Some(id) => read_definition(conn, parse_uuid(&id)?),
                None => Ok(None),
            }
        })
        .await
    }

    async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM recurrences
                     WHERE is_active = 1
                       AND next_occurrence IS NOT NULL
                       AND next_occurrence <= ?1
                     ORDER BY next_occurrence",
                )
                .map_err(backend("prepare due query"))?;
            let ids = stmt
                .query_map(params![ts(now)], |row| row.get::<_, String>(0))
                .map_err(backend("query due"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend("read due rows"))?;
            ids.iter().map(|s| parse_uuid(s)).collect()
        })
        .await
    }

    async fn list_for_workspace(
        &self,
        workspace_id: Uuid,
        include_inactive: bool,
    ) -> Result<Vec<RecurrenceDefinition>, StoreError> {
        self.with_conn(move |conn| {
            let sql = if include_inactive {
                "SELECT id FROM recurrences WHERE workspace_id = ?1 ORDER BY created_at"
            } else {
                "SELECT id FROM recurrences
                 WHERE workspace_id = ?1 AND is_active = 1 ORDER BY created_at"
            };
            let mut stmt = conn.prepare(sql).map_err(backend("prepare list query"))?;
            let ids = stmt
                .query_map(params![workspace_id.to_string()], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(backend("query list"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend("read list rows"))?;
            drop(stmt);

            let mut defs = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(def) = read_definition(conn, parse_uuid(&id)?)? {
                    defs.push(def);
                }
            }
            Ok(defs)
        })
        .await
    }

    async fn save(&self, definition: &RecurrenceDefinition) -> Result<(), StoreError> {
        let def = definition.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend("begin"))?;
            update_definition(&tx, &def)?;
            tx.commit().map_err(backend("commit"))
        })
        .await
    }

    async fn save_and_commit_claim(
        &self,
        definition: &RecurrenceDefinition,
        claim: &ClaimKey,
    ) -> Result<(), StoreError> {
        let def = definition.clone();
        let claim = *claim;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend("begin"))?;
            update_definition(&tx, &def)?;
            tx.execute(
                "UPDATE firing_claims SET committed = 1
                 WHERE recurrence_id = ?1 AND occurrence = ?2",
                params![claim.definition_id.to_string(), ts(claim.occurrence)],
            )
            .map_err(backend("commit claim"))?;
            tx.commit().map_err(backend("commit"))
        })
        .await
    }

    async fn try_claim(
        &self,
        claim: &ClaimKey,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let claim = *claim;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend("begin"))?;
            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT committed, lease_until FROM firing_claims
                     WHERE recurrence_id = ?1 AND occurrence = ?2",
                    params![claim.definition_id.to_string(), ts(claim.occurrence)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(backend("query claim"))?;

            let acquired = match existing {
                None => {
                    tx.execute(
                        "INSERT INTO firing_claims
                             (recurrence_id, occurrence, lease_until, committed, claimed_at)
                         VALUES (?1, ?2, ?3, 0, ?4)",
                        params![
                            claim.definition_id.to_string(),
                            ts(claim.occurrence),
                            ts(lease_until),
                            ts(Utc::now()),
                        ],
                    )
                    .map_err(backend("insert claim"))?;
                    true
                }
                Some((committed, _)) if committed != 0 => false,
                Some((_, lease)) => {
                    if parse_ts(&lease)? > Utc::now() {
                        false
                    } else {
                        // Expired lease from a crashed worker: take it over.
                        tx.execute(
                            "UPDATE firing_claims SET lease_until = ?3, claimed_at = ?4
                             WHERE recurrence_id = ?1 AND occurrence = ?2",
                            params![
                                claim.definition_id.to_string(),
                                ts(claim.occurrence),
                                ts(lease_until),
                                ts(Utc::now()),
                            ],
                        )
                        .map_err(backend("refresh claim"))?;
                        true
                    }
                }
            };
            tx.commit().map_err(backend("commit"))?;
            Ok(acquired)
        })
        .await
    }

    async fn release_claim(&self, claim: &ClaimKey) -> Result<(), StoreError> {
        let claim = *claim;
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM firing_claims
                 WHERE recurrence_id = ?1 AND occurrence = ?2 AND committed = 0",
                params![claim.definition_id.to_string(), ts(claim.occurrence)],
            )
            .map_err(backend("release claim"))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend("begin"))?;
            tx.execute(
                "DELETE FROM generated_instances WHERE recurrence_id = ?1",
                params![id.to_string()],
            )
            .map_err(backend("delete ledger"))?;
            tx.execute(
                "DELETE FROM firing_claims WHERE recurrence_id = ?1",
                params![id.to_string()],
            )
            .map_err(backend("delete claims"))?;
            let removed = tx
                .execute(
                    "DELETE FROM recurrences WHERE id = ?1",
                    params![id.to_string()],
                )
                .map_err(backend("delete recurrence"))?;
            tx.commit().map_err(backend("commit"))?;
            Ok(removed > 0)
        })
        .await
    }
}
