//! PostgreSQL store implementation.

use std::any::Any;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use time::OffsetDateTime;

use super::{
    ActivityRecord, ActivityStatus, ActivityStore, DelayScheduleRecord, EventRecord, EventStore,
    NewEvent, OffsetRow, OffsetStore, ScalingStore, ScheduleStore, SnapshotRecord,
    SubscriptionRow, UnitOfWork,
};
use crate::activity::RetryPolicy;
use crate::error::{Error, Result};
use crate::event::EventMetadata;
use crate::state::Sub;
use crate::workflow::WorkflowId;

/// Schema DDL for the `fleuve` namespace. Idempotent; apply with
/// [`PgStore::ensure_schema`] or your own migration tooling.
///
/// The `tx_id` column on `events` pins visibility: readers only see rows
/// whose inserting transaction is older than every in-flight one, so a
/// reader never observes `global_id = g` while a smaller id is still
/// uncommitted (no gaps that could later be filled).
pub const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS fleuve;

CREATE TABLE IF NOT EXISTS fleuve.workflow_instances (
    workflow_id varchar(256) PRIMARY KEY,
    workflow_type text NOT NULL,
    version bigint NOT NULL DEFAULT 0,
    tags text[] NOT NULL DEFAULT '{}',
    created_at timestamptz NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS fleuve.events (
    global_id bigserial PRIMARY KEY,
    workflow_id varchar(256) NOT NULL,
    workflow_version bigint NOT NULL,
    workflow_type text NOT NULL,
    event_type text NOT NULL,
    schema_version integer NOT NULL DEFAULT 1,
    body jsonb NOT NULL,
    metadata jsonb NOT NULL DEFAULT '{}',
    tx_id xid8 NOT NULL DEFAULT pg_current_xact_id(),
    created_at timestamptz NOT NULL DEFAULT now(),
    UNIQUE (workflow_id, workflow_version)
);
CREATE INDEX IF NOT EXISTS idx_events_type_global_id
    ON fleuve.events (workflow_type, global_id);

CREATE TABLE IF NOT EXISTS fleuve.snapshots (
    workflow_id varchar(256) PRIMARY KEY,
    workflow_type text NOT NULL,
    version bigint NOT NULL,
    state jsonb NOT NULL,
    created_at timestamptz NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_snapshots_workflow_type
    ON fleuve.snapshots (workflow_type);

CREATE TABLE IF NOT EXISTS fleuve.subscriptions (
    workflow_id varchar(256) NOT NULL,
    workflow_type text NOT NULL,
    subscribed_to_workflow text NOT NULL,
    subscribed_to_event_type text NOT NULL,
    tags text[] NOT NULL DEFAULT '{}',
    tags_all text[] NOT NULL DEFAULT '{}',
    PRIMARY KEY (workflow_id, subscribed_to_workflow, subscribed_to_event_type)
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_workflow_type
    ON fleuve.subscriptions (workflow_type);

CREATE TABLE IF NOT EXISTS fleuve.offsets (
    reader text PRIMARY KEY,
    last_read_event_no bigint NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS fleuve.activities (
    workflow_id varchar(256) NOT NULL,
    event_number bigint NOT NULL,
    status varchar(20) NOT NULL DEFAULT 'pending',
    retry_count integer NOT NULL DEFAULT 0,
    checkpoint jsonb NOT NULL DEFAULT '{}',
    retry_policy jsonb NOT NULL,
    started_at timestamptz NOT NULL DEFAULT now(),
    finished_at timestamptz,
    last_attempt_at timestamptz,
    runner_id varchar(256),
    error_type text,
    error_message text,
    PRIMARY KEY (workflow_id, event_number)
);
CREATE INDEX IF NOT EXISTS idx_activities_status ON fleuve.activities (status);

CREATE TABLE IF NOT EXISTS fleuve.delay_schedules (
    workflow_id varchar(256) NOT NULL,
    delay_id varchar(256) NOT NULL,
    workflow_type text NOT NULL,
    delay_until timestamptz NOT NULL,
    event_version bigint NOT NULL,
    next_command jsonb NOT NULL,
    cron_expression text,
    timezone text,
    created_at timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (workflow_id, delay_id)
);
CREATE INDEX IF NOT EXISTS idx_delay_schedules_due
    ON fleuve.delay_schedules (workflow_type, delay_until);

CREATE TABLE IF NOT EXISTS fleuve.scaling_operations (
    workflow_type text PRIMARY KEY,
    target_offset bigint NOT NULL DEFAULT 0,
    status varchar(20) NOT NULL DEFAULT 'pending',
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);
"#;

/// PostgreSQL-backed store for production.
///
/// Per-workflow serialization uses `SELECT ... FOR UPDATE` on the
/// `workflow_instances` row; the lock is held for the duration of the unit
/// of work's transaction. The instance row also carries the version
/// counter, fenced on every append, with the unique
/// `(workflow_id, workflow_version)` constraint as a second line.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply [`SCHEMA_SQL`].
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA_SQL.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn event_from_row(row: &PgRow) -> Result<EventRecord> {
    let metadata: Value = row.try_get("metadata")?;
    Ok(EventRecord {
        global_id: row.try_get("global_id")?,
        workflow_type: row.try_get("workflow_type")?,
        workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
        workflow_version: row.try_get("workflow_version")?,
        event_type: row.try_get("event_type")?,
        schema_version: row.try_get("schema_version")?,
        body: row.try_get("body")?,
        metadata: serde_json::from_value::<EventMetadata>(metadata).unwrap_or_default(),
        created_at: row.try_get("created_at")?,
    })
}

fn activity_from_row(row: &PgRow) -> Result<ActivityRecord> {
    let status: String = row.try_get("status")?;
    let status = ActivityStatus::parse(&status)
        .ok_or_else(|| Error::Configuration(format!("unknown activity status {status}")))?;
    let checkpoint: Value = row.try_get("checkpoint")?;
    let checkpoint = match checkpoint {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let retry_policy: Value = row.try_get("retry_policy")?;
    let retry_policy: RetryPolicy = serde_json::from_value(retry_policy)?;
    Ok(ActivityRecord {
        workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
        event_number: row.try_get("event_number")?,
        status,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        checkpoint,
        retry_policy,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        runner_id: row.try_get("runner_id")?,
        error_type: row.try_get("error_type")?,
        error_message: row.try_get("error_message")?,
    })
}

fn schedule_from_row(row: &PgRow) -> Result<DelayScheduleRecord> {
    Ok(DelayScheduleRecord {
        workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
        delay_id: row.try_get("delay_id")?,
        workflow_type: row.try_get("workflow_type")?,
        delay_until: row.try_get("delay_until")?,
        event_version: row.try_get("event_version")?,
        next_command: row.try_get("next_command")?,
        cron_expression: row.try_get("cron_expression")?,
        timezone: row.try_get("timezone")?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

/// PostgreSQL unit of work: a transaction holding the instance row lock.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
    workflow_type: String,
    workflow_id: String,
    base_version: i64,
    appended: i64,
}

impl PgUnitOfWork {
    /// The underlying transaction, for [`SyncDbHook`](crate::repository::SyncDbHook)
    /// implementations that downcast via `as_any_mut`.
    pub fn transaction(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.tx
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn current_version(&mut self) -> Result<i64> {
        Ok(self.base_version + self.appended)
    }

    async fn load_snapshot(&mut self) -> Result<Option<SnapshotRecord>> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, workflow_type, version, state, created_at
            FROM fleuve.snapshots
            WHERE workflow_id = $1
            "#,
        )
        .bind(&self.workflow_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(|row| {
            Ok(SnapshotRecord {
                workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
                workflow_type: row.try_get("workflow_type")?,
                version: row.try_get("version")?,
                state: row.try_get("state")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn events_after(&mut self, version: i64) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT global_id, workflow_id, workflow_version, workflow_type,
                   event_type, schema_version, body, metadata, created_at
            FROM fleuve.events
            WHERE workflow_id = $1 AND workflow_version > $2
            ORDER BY workflow_version
            "#,
        )
        .bind(&self.workflow_id)
        .bind(version)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn workflow_tags(&mut self) -> Result<Vec<String>> {
        let row = sqlx::query(
            "SELECT tags FROM fleuve.workflow_instances WHERE workflow_id = $1",
        )
        .bind(&self.workflow_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row
            .map(|row| row.try_get::<Vec<String>, _>("tags"))
            .transpose()?
            .unwrap_or_default())
    }

    async fn set_workflow_tags(&mut self, tags: &[String]) -> Result<()> {
        sqlx::query("UPDATE fleuve.workflow_instances SET tags = $2 WHERE workflow_id = $1")
            .bind(&self.workflow_id)
            .bind(tags)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn append_events(&mut self, expected_version: i64, events: Vec<NewEvent>) -> Result<()> {
        let staged_next = self.base_version + self.appended;
        if expected_version != staged_next {
            return Err(Error::VersionConflict {
                workflow_id: self.workflow_id.clone(),
                version: staged_next,
            });
        }
        for event in events {
            let version = self.base_version + self.appended + 1;
            let metadata = serde_json::to_value(&event.metadata)?;
            let result = sqlx::query(
                r#"
                INSERT INTO fleuve.events
                    (workflow_id, workflow_version, workflow_type, event_type,
                     schema_version, body, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&self.workflow_id)
            .bind(version)
            .bind(&self.workflow_type)
            .bind(&event.event_type)
            .bind(event.schema_version)
            .bind(&event.body)
            .bind(&metadata)
            .execute(&mut *self.tx)
            .await;
            match result {
                Ok(_) => self.appended += 1,
                Err(err) if is_unique_violation(&err) => {
                    return Err(Error::VersionConflict {
                        workflow_id: self.workflow_id.clone(),
                        version,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn save_snapshot(&mut self, version: i64, state: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fleuve.snapshots (workflow_id, workflow_type, version, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_id)
            DO UPDATE SET version = EXCLUDED.version,
                          state = EXCLUDED.state,
                          created_at = now()
            "#,
        )
        .bind(&self.workflow_id)
        .bind(&self.workflow_type)
        .bind(version)
        .bind(&state)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn sync_subscriptions(&mut self, workflow_type: &str, current: &[Sub]) -> Result<()> {
        let rows = sqlx::query(
            r#"
            SELECT subscribed_to_workflow, subscribed_to_event_type, tags, tags_all
            FROM fleuve.subscriptions
            WHERE workflow_id = $1
            "#,
        )
        .bind(&self.workflow_id)
        .fetch_all(&mut *self.tx)
        .await?;

        type Key = (String, String, Vec<String>, Vec<String>);
        let existing: Vec<Key> = rows
            .iter()
            .map(|row| {
                Ok((
                    row.try_get("subscribed_to_workflow")?,
                    row.try_get("subscribed_to_event_type")?,
                    row.try_get("tags")?,
                    row.try_get("tags_all")?,
                ))
            })
            .collect::<Result<_>>()?;
        let wanted: Vec<Key> = current
            .iter()
            .map(|sub| {
                (
                    sub.workflow_id.clone(),
                    sub.event_type.clone(),
                    sub.tags.clone(),
                    sub.tags_all.clone(),
                )
            })
            .collect();

        for key in &existing {
            if !wanted.contains(key) {
                sqlx::query(
                    r#"
                    DELETE FROM fleuve.subscriptions
                    WHERE workflow_id = $1
                      AND subscribed_to_workflow = $2
                      AND subscribed_to_event_type = $3
                    "#,
                )
                .bind(&self.workflow_id)
                .bind(&key.0)
                .bind(&key.1)
                .execute(&mut *self.tx)
                .await?;
            }
        }
        for key in &wanted {
            if !existing.contains(key) {
                sqlx::query(
                    r#"
                    INSERT INTO fleuve.subscriptions
                        (workflow_id, workflow_type, subscribed_to_workflow,
                         subscribed_to_event_type, tags, tags_all)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (workflow_id, subscribed_to_workflow, subscribed_to_event_type)
                    DO UPDATE SET tags = EXCLUDED.tags, tags_all = EXCLUDED.tags_all
                    "#,
                )
                .bind(&self.workflow_id)
                .bind(workflow_type)
                .bind(&key.0)
                .bind(&key.1)
                .bind(&key.2)
                .bind(&key.3)
                .execute(&mut *self.tx)
                .await?;
            }
        }
        Ok(())
    }

    async fn remove_delay(&mut self, delay_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM fleuve.delay_schedules WHERE workflow_id = $1 AND delay_id = $2",
        )
        .bind(&self.workflow_id)
        .bind(delay_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn remove_all_delays(&mut self) -> Result<()> {
        sqlx::query("DELETE FROM fleuve.delay_schedules WHERE workflow_id = $1")
            .bind(&self.workflow_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn reschedule_delay(
        &mut self,
        delay_id: &str,
        delay_until: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleuve.delay_schedules
            SET delay_until = $3
            WHERE workflow_id = $1 AND delay_id = $2
            "#,
        )
        .bind(&self.workflow_id)
        .bind(delay_id)
        .bind(delay_until)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        if this.appended > 0 {
            let new_version = this.base_version + this.appended;
            let result = sqlx::query(
                r#"
                UPDATE fleuve.workflow_instances
                SET version = $3
                WHERE workflow_id = $1 AND version = $2
                "#,
            )
            .bind(&this.workflow_id)
            .bind(this.base_version)
            .bind(new_version)
            .execute(&mut *this.tx)
            .await?;
            if result.rows_affected() != 1 {
                return Err(Error::VersionConflict {
                    workflow_id: this.workflow_id.clone(),
                    version: this.base_version,
                });
            }
        }
        this.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn begin(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<Box<dyn UnitOfWork>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO fleuve.workflow_instances (workflow_id, workflow_type)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(workflow_type)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT version FROM fleuve.workflow_instances
            WHERE workflow_id = $1
            FOR UPDATE
            "#,
        )
        .bind(workflow_id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let base_version: i64 = row.try_get("version")?;

        Ok(Box::new(PgUnitOfWork {
            tx,
            workflow_type: workflow_type.to_owned(),
            workflow_id: workflow_id.as_str().to_owned(),
            base_version,
            appended: 0,
        }))
    }

    async fn fetch_events_since(
        &self,
        after: i64,
        limit: u32,
        event_types: Option<&[String]>,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT global_id, workflow_id, workflow_version, workflow_type,
                   event_type, schema_version, body, metadata, created_at
            FROM fleuve.events
            WHERE global_id > $1
              AND tx_id < pg_snapshot_xmin(pg_current_snapshot())
              AND ($3::text[] IS NULL OR event_type = ANY($3))
            ORDER BY global_id
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(i64::from(limit))
        .bind(event_types)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn max_global_id(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(global_id), 0) AS max_id FROM fleuve.events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("max_id")?)
    }

    async fn events_for_workflow(
        &self,
        workflow_id: &WorkflowId,
        up_to_version: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT global_id, workflow_id, workflow_version, workflow_type,
                   event_type, schema_version, body, metadata, created_at
            FROM fleuve.events
            WHERE workflow_id = $1
              AND ($2::bigint IS NULL OR workflow_version <= $2)
            ORDER BY workflow_version
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(up_to_version)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn event_by_version(
        &self,
        workflow_id: &WorkflowId,
        workflow_version: i64,
    ) -> Result<Option<EventRecord>> {
        let row = sqlx::query(
            r#"
            SELECT global_id, workflow_id, workflow_version, workflow_type,
                   event_type, schema_version, body, metadata, created_at
            FROM fleuve.events
            WHERE workflow_id = $1 AND workflow_version = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(workflow_version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn latest_version(&self, workflow_id: &WorkflowId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT version FROM fleuve.workflow_instances WHERE workflow_id = $1",
        )
        .bind(workflow_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|row| row.try_get::<i64, _>("version"))
            .transpose()?
            .unwrap_or(0))
    }

    async fn latest_snapshot(
        &self,
        workflow_id: &WorkflowId,
        at_most_version: Option<i64>,
    ) -> Result<Option<SnapshotRecord>> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, workflow_type, version, state, created_at
            FROM fleuve.snapshots
            WHERE workflow_id = $1
              AND ($2::bigint IS NULL OR version <= $2)
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(at_most_version)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(SnapshotRecord {
                workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
                workflow_type: row.try_get("workflow_type")?,
                version: row.try_get("version")?,
                state: row.try_get("state")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn workflow_tags(&self, workflow_id: &WorkflowId) -> Result<Vec<String>> {
        let row = sqlx::query(
            "SELECT tags FROM fleuve.workflow_instances WHERE workflow_id = $1",
        )
        .bind(workflow_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|row| row.try_get::<Vec<String>, _>("tags"))
            .transpose()?
            .unwrap_or_default())
    }

    async fn subscriptions_for_type(&self, workflow_type: &str) -> Result<Vec<SubscriptionRow>> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, workflow_type, subscribed_to_workflow,
                   subscribed_to_event_type, tags, tags_all
            FROM fleuve.subscriptions
            WHERE workflow_type = $1
            "#,
        )
        .bind(workflow_type)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(SubscriptionRow {
                    workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
                    workflow_type: row.try_get("workflow_type")?,
                    subscribed_to_workflow: row.try_get("subscribed_to_workflow")?,
                    subscribed_to_event_type: row.try_get("subscribed_to_event_type")?,
                    tags: row.try_get("tags")?,
                    tags_all: row.try_get("tags_all")?,
                })
            })
            .collect()
    }

    async fn snapshots_for_type(&self, workflow_type: &str) -> Result<Vec<(WorkflowId, i64)>> {
        let rows = sqlx::query(
            "SELECT workflow_id, version FROM fleuve.snapshots WHERE workflow_type = $1",
        )
        .bind(workflow_type)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
                    row.try_get("version")?,
                ))
            })
            .collect()
    }

    async fn truncate_events(
        &self,
        workflow_id: &WorkflowId,
        up_to_version: i64,
        max_global_id: i64,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM fleuve.events
            WHERE global_id IN (
                SELECT global_id FROM fleuve.events
                WHERE workflow_id = $1
                  AND workflow_version <= $2
                  AND global_id <= $3
                  AND created_at < $4
                ORDER BY global_id
                LIMIT $5
            )
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(up_to_version)
        .bind(max_global_id)
        .bind(older_than)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl OffsetStore for PgStore {
    async fn load_offset(&self, reader: &str) -> Result<i64> {
        let row = sqlx::query("SELECT last_read_event_no FROM fleuve.offsets WHERE reader = $1")
            .bind(reader)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|row| row.try_get::<i64, _>("last_read_event_no"))
            .transpose()?
            .unwrap_or(0))
    }

    async fn commit_offset(&self, reader: &str, last_global_id: i64) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE fleuve.offsets
            SET last_read_event_no = $2
            WHERE reader = $1 AND last_read_event_no <= $2
            "#,
        )
        .bind(reader)
        .bind(last_global_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 1 {
            return Ok(());
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO fleuve.offsets (reader, last_read_event_no)
            VALUES ($1, $2)
            ON CONFLICT (reader) DO NOTHING
            "#,
        )
        .bind(reader)
        .bind(last_global_id)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(());
        }
        Err(Error::Configuration(format!(
            "offset for reader {reader} is ahead of {last_global_id}; \
             another process owns this reader"
        )))
    }

    async fn init_offset(&self, reader: &str, last_global_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO fleuve.offsets (reader, last_read_event_no)
            VALUES ($1, $2)
            ON CONFLICT (reader) DO NOTHING
            "#,
        )
        .bind(reader)
        .bind(last_global_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn offsets(&self, readers: &[String]) -> Result<Vec<OffsetRow>> {
        let rows = sqlx::query(
            "SELECT reader, last_read_event_no FROM fleuve.offsets WHERE reader = ANY($1)",
        )
        .bind(readers)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(OffsetRow {
                    reader: row.try_get("reader")?,
                    last_read_event_no: row.try_get("last_read_event_no")?,
                })
            })
            .collect()
    }

    async fn min_offset(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MIN(last_read_event_no) AS min_offset FROM fleuve.offsets")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("min_offset")?)
    }

    async fn set_offset(&self, reader: &str, last_global_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fleuve.offsets (reader, last_read_event_no)
            VALUES ($1, $2)
            ON CONFLICT (reader) DO UPDATE SET last_read_event_no = EXCLUDED.last_read_event_no
            "#,
        )
        .bind(reader)
        .bind(last_global_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_offsets(&self, readers: &[String]) -> Result<()> {
        sqlx::query("DELETE FROM fleuve.offsets WHERE reader = ANY($1)")
            .bind(readers)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for PgStore {
    async fn activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<Option<ActivityRecord>> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, event_number, status, retry_count, checkpoint,
                   retry_policy, started_at, finished_at, last_attempt_at,
                   runner_id, error_type, error_message
            FROM fleuve.activities
            WHERE workflow_id = $1 AND event_number = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(activity_from_row).transpose()
    }

    async fn create_activity_if_absent(&self, record: ActivityRecord) -> Result<ActivityRecord> {
        let retry_policy = serde_json::to_value(&record.retry_policy)?;
        sqlx::query(
            r#"
            INSERT INTO fleuve.activities
                (workflow_id, event_number, status, retry_count, checkpoint,
                 retry_policy, started_at, runner_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (workflow_id, event_number) DO NOTHING
            "#,
        )
        .bind(record.workflow_id.as_str())
        .bind(record.event_number)
        .bind(record.status.as_str())
        .bind(record.retry_count as i32)
        .bind(Value::Object(record.checkpoint.clone()))
        .bind(&retry_policy)
        .bind(record.started_at)
        .bind(&record.runner_id)
        .execute(&self.pool)
        .await?;

        self.activity(&record.workflow_id, record.event_number)
            .await?
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "activity record for {}:{} vanished after upsert",
                    record.workflow_id, record.event_number
                ))
            })
    }

    async fn update_activity_status(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        status: ActivityStatus,
        retry_count: u32,
        runner_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleuve.activities
            SET status = $3,
                retry_count = $4,
                last_attempt_at = now(),
                runner_id = COALESCE($5, runner_id)
            WHERE workflow_id = $1 AND event_number = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .bind(status.as_str())
        .bind(retry_count as i32)
        .bind(runner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_activity_error(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        error_type: &str,
        error_message: &str,
        retry_count: u32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleuve.activities
            SET error_type = $3,
                error_message = $4,
                retry_count = $5,
                last_attempt_at = now()
            WHERE workflow_id = $1 AND event_number = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .bind(error_type)
        .bind(error_message)
        .bind(retry_count as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        checkpoint: &Map<String, Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleuve.activities
            SET checkpoint = $3
            WHERE workflow_id = $1 AND event_number = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .bind(Value::Object(checkpoint.clone()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_activity_completed(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleuve.activities
            SET status = 'completed', finished_at = now()
            WHERE workflow_id = $1 AND event_number = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_activity_failed(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        error_type: &str,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleuve.activities
            SET status = 'failed',
                finished_at = now(),
                error_type = $3,
                error_message = $4
            WHERE workflow_id = $1 AND event_number = $2
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .bind(error_type)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_activities(
        &self,
        workflow_id: &WorkflowId,
        event_numbers: Option<&[i64]>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleuve.activities
            SET status = 'cancelled'
            WHERE workflow_id = $1
              AND status IN ('pending', 'running', 'retrying')
              AND ($2::bigint[] IS NULL OR event_number = ANY($2))
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_numbers)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_failed_activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE fleuve.activities
            SET status = 'pending',
                retry_count = 0,
                finished_at = NULL,
                error_type = NULL,
                error_message = NULL
            WHERE workflow_id = $1 AND event_number = $2 AND status = 'failed'
            "#,
        )
        .bind(workflow_id.as_str())
        .bind(event_number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn stale_running_activities(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<ActivityRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, event_number, status, retry_count, checkpoint,
                   retry_policy, started_at, finished_at, last_attempt_at,
                   runner_id, error_type, error_message
            FROM fleuve.activities
            WHERE status IN ('running', 'retrying')
              AND (last_attempt_at IS NULL OR last_attempt_at < $1)
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn register_delay(&self, record: DelayScheduleRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fleuve.delay_schedules
                (workflow_id, delay_id, workflow_type, delay_until, event_version,
                 next_command, cron_expression, timezone)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (workflow_id, delay_id)
            DO UPDATE SET delay_until = EXCLUDED.delay_until,
                          event_version = EXCLUDED.event_version,
                          next_command = EXCLUDED.next_command,
                          cron_expression = EXCLUDED.cron_expression,
                          timezone = EXCLUDED.timezone,
                          created_at = now()
            "#,
        )
        .bind(record.workflow_id.as_str())
        .bind(&record.delay_id)
        .bind(&record.workflow_type)
        .bind(record.delay_until)
        .bind(record.event_version)
        .bind(&record.next_command)
        .bind(&record.cron_expression)
        .bind(&record.timezone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_delay(&self, workflow_id: &WorkflowId, delay_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM fleuve.delay_schedules WHERE workflow_id = $1 AND delay_id = $2",
        )
        .bind(workflow_id.as_str())
        .bind(delay_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_schedules(
        &self,
        workflow_type: &str,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<DelayScheduleRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT workflow_id, delay_id, workflow_type, delay_until, event_version,
                   next_command, cron_expression, timezone, created_at
            FROM fleuve.delay_schedules
            WHERE workflow_type = $1 AND delay_until <= $2
            ORDER BY delay_until
            LIMIT $3
            "#,
        )
        .bind(workflow_type)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn next_fire_at(&self, workflow_type: &str) -> Result<Option<OffsetDateTime>> {
        let row = sqlx::query(
            r#"
            SELECT MIN(delay_until) AS next_fire
            FROM fleuve.delay_schedules
            WHERE workflow_type = $1
            "#,
        )
        .bind(workflow_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("next_fire")?)
    }
}

#[async_trait]
impl ScalingStore for PgStore {
    async fn create_scaling_operation(
        &self,
        workflow_type: &str,
        target_offset: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO fleuve.scaling_operations AS op (workflow_type, target_offset, status)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (workflow_type)
            DO UPDATE SET target_offset = EXCLUDED.target_offset,
                          status = 'pending',
                          updated_at = now()
            WHERE op.status NOT IN ('pending', 'synchronizing')
            "#,
        )
        .bind(workflow_type)
        .bind(target_offset)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::Configuration(format!(
                "scaling operation already in progress for {workflow_type}"
            )));
        }
        Ok(())
    }

    async fn active_scaling_target(&self, workflow_type: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT target_offset FROM fleuve.scaling_operations
            WHERE workflow_type = $1 AND status IN ('pending', 'synchronizing')
            "#,
        )
        .bind(workflow_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .map(|row| row.try_get::<i64, _>("target_offset"))
            .transpose()?)
    }

    async fn complete_scaling_operation(&self, workflow_type: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE fleuve.scaling_operations
            SET status = 'completed', updated_at = now()
            WHERE workflow_type = $1
            "#,
        )
        .bind(workflow_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
