//! Storage abstraction for the event log, offsets, activities, and schedules.
//!
//! Two implementations ship with the crate:
//!
//! - [`PgStore`] — PostgreSQL for production (requires the `postgres` feature)
//! - [`MemoryStore`] — in-process store for tests and local development
//!
//! The [`EventStore::begin`] / [`UnitOfWork`] pair is the transactional
//! append path: `begin` acquires the per-workflow exclusive lock and the
//! returned unit of work batches events, snapshot, subscription diff, and
//! schedule row changes into a single atomic commit. The remaining traits
//! ([`OffsetStore`], [`ActivityStore`], [`ScheduleStore`], [`ScalingStore`])
//! cover the non-transactional bookkeeping their subsystems own exclusively.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::any::Any;

use async_trait::async_trait;
use serde_json::{Map, Value};
use time::OffsetDateTime;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PgStore;

use crate::activity::RetryPolicy;
use crate::error::Result;
use crate::event::EventMetadata;
use crate::state::Sub;
use crate::workflow::WorkflowId;

/// An event ready to be appended; the store assigns `global_id` and
/// `workflow_version`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub schema_version: i32,
    pub body: Value,
    pub metadata: EventMetadata,
}

/// A stored event with its global and per-workflow ordering.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub global_id: i64,
    pub workflow_type: String,
    pub workflow_id: WorkflowId,
    pub workflow_version: i64,
    pub event_type: String,
    pub schema_version: i32,
    pub body: Value,
    pub metadata: EventMetadata,
    pub created_at: OffsetDateTime,
}

/// A materialized state at a specific version, for faster loads and safe
/// truncation. One row per workflow, upserted.
#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub version: i64,
    pub state: Value,
    pub created_at: OffsetDateTime,
}

/// A persisted subscription row, denormalized from workflow state for fast
/// reader predicate evaluation.
#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    /// The subscribing workflow.
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub subscribed_to_workflow: String,
    pub subscribed_to_event_type: String,
    pub tags: Vec<String>,
    pub tags_all: Vec<String>,
}

/// Durable reader position. One row per reader, advancing monotonically.
#[derive(Debug, Clone)]
pub struct OffsetRow {
    pub reader: String,
    pub last_read_event_no: i64,
}

/// Execution lifecycle of an activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Pending => "pending",
            ActivityStatus::Running => "running",
            ActivityStatus::Retrying => "retrying",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Failed => "failed",
            ActivityStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActivityStatus::Pending),
            "running" => Some(ActivityStatus::Running),
            "retrying" => Some(ActivityStatus::Retrying),
            "completed" => Some(ActivityStatus::Completed),
            "failed" => Some(ActivityStatus::Failed),
            "cancelled" => Some(ActivityStatus::Cancelled),
            _ => None,
        }
    }
}

/// One activity per `(workflow_id, event_number)` that triggered an adapter.
///
/// `status = completed` means the adapter body ran to success exactly once;
/// `failed` records are the dead-letter queue.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    pub workflow_id: WorkflowId,
    pub event_number: i64,
    pub status: ActivityStatus,
    pub retry_count: u32,
    pub checkpoint: Map<String, Value>,
    pub retry_policy: RetryPolicy,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub runner_id: Option<String>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl ActivityRecord {
    /// A fresh `pending` record for an event, created before the first attempt.
    pub fn pending(
        workflow_id: WorkflowId,
        event_number: i64,
        retry_policy: RetryPolicy,
        runner_id: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            workflow_id,
            event_number,
            status: ActivityStatus::Pending,
            retry_count: 0,
            checkpoint: Map::new(),
            retry_policy,
            started_at: now,
            finished_at: None,
            last_attempt_at: None,
            runner_id,
            error_type: None,
            error_message: None,
        }
    }
}

/// A timer row that will cause a command to be dispatched at a future
/// instant. One-shot rows are deleted on fire; cron rows are rescheduled.
#[derive(Debug, Clone)]
pub struct DelayScheduleRecord {
    pub workflow_id: WorkflowId,
    pub delay_id: String,
    pub workflow_type: String,
    pub delay_until: OffsetDateTime,
    /// Version of the `delay` event that created this row.
    pub event_version: i64,
    pub next_command: Value,
    pub cron_expression: Option<String>,
    pub timezone: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Transactional append path for one workflow instance.
///
/// Holds the per-workflow exclusive lock from [`EventStore::begin`] until
/// [`commit`](Self::commit) or drop (drop rolls back). All mutations are
/// atomic with the appended events.
#[async_trait]
pub trait UnitOfWork: Send {
    /// The last committed `workflow_version`, 0 when no events exist.
    async fn current_version(&mut self) -> Result<i64>;

    /// The latest snapshot for this workflow, if any.
    async fn load_snapshot(&mut self) -> Result<Option<SnapshotRecord>>;

    /// Committed events with `workflow_version > version`, ascending.
    async fn events_after(&mut self, version: i64) -> Result<Vec<EventRecord>>;

    /// Tags stored on the workflow instance at creation.
    async fn workflow_tags(&mut self) -> Result<Vec<String>>;

    /// Record creation-time tags on the instance row.
    async fn set_workflow_tags(&mut self, tags: &[String]) -> Result<()>;

    /// Append a batch of events fenced on `expected_version` (the committed
    /// version the caller observed). Fails with `VersionConflict` when
    /// another writer got there first.
    async fn append_events(&mut self, expected_version: i64, events: Vec<NewEvent>) -> Result<()>;

    /// Upsert the workflow snapshot at `version`.
    async fn save_snapshot(&mut self, version: i64, state: Value) -> Result<()>;

    /// Diff the persisted subscription rows against `current` and apply
    /// inserts/deletes so the table mirrors the workflow state.
    async fn sync_subscriptions(&mut self, workflow_type: &str, current: &[Sub]) -> Result<()>;

    /// Delete one delay schedule row for this workflow.
    async fn remove_delay(&mut self, delay_id: &str) -> Result<()>;

    /// Delete every delay schedule row for this workflow (cancellation).
    async fn remove_all_delays(&mut self) -> Result<()>;

    /// Move a cron schedule row to its next fire time.
    async fn reschedule_delay(&mut self, delay_id: &str, delay_until: OffsetDateTime)
        -> Result<()>;

    /// Access the concrete unit of work, for store-specific
    /// [`SyncDbHook`](crate::repository::SyncDbHook) work that must join the
    /// transaction.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Commit everything and release the lock. Dropping without committing
    /// rolls back.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Append-only log with per-workflow version fencing and global ordering.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Open a unit of work, acquiring the exclusive per-workflow lock.
    ///
    /// Concurrent callers for the same workflow serialize here; different
    /// workflows proceed in parallel.
    async fn begin(&self, workflow_type: &str, workflow_id: &WorkflowId)
        -> Result<Box<dyn UnitOfWork>>;

    /// Events with `global_id > after`, ascending, up to `limit`, optionally
    /// restricted to `event_types`.
    ///
    /// Implementations must present a consistent prefix: if an event is
    /// visible, every event with a smaller `global_id` is too.
    async fn fetch_events_since(
        &self,
        after: i64,
        limit: u32,
        event_types: Option<&[String]>,
    ) -> Result<Vec<EventRecord>>;

    /// Highest committed `global_id`, 0 when the log is empty. Used for lag
    /// reporting.
    async fn max_global_id(&self) -> Result<i64>;

    /// All events of one workflow ascending by version, optionally bounded.
    async fn events_for_workflow(
        &self,
        workflow_id: &WorkflowId,
        up_to_version: Option<i64>,
    ) -> Result<Vec<EventRecord>>;

    /// A single event of one workflow by version.
    async fn event_by_version(
        &self,
        workflow_id: &WorkflowId,
        workflow_version: i64,
    ) -> Result<Option<EventRecord>>;

    /// Last committed version for a workflow without taking the lock.
    async fn latest_version(&self, workflow_id: &WorkflowId) -> Result<i64>;

    /// Latest snapshot at or below `at_most_version` (unbounded when `None`).
    async fn latest_snapshot(
        &self,
        workflow_id: &WorkflowId,
        at_most_version: Option<i64>,
    ) -> Result<Option<SnapshotRecord>>;

    /// Tags stored on the instance row at creation.
    async fn workflow_tags(&self, workflow_id: &WorkflowId) -> Result<Vec<String>>;

    /// Subscription rows owned by workflows of `workflow_type`.
    async fn subscriptions_for_type(&self, workflow_type: &str) -> Result<Vec<SubscriptionRow>>;

    /// `(workflow_id, version)` of every snapshot for `workflow_type`.
    async fn snapshots_for_type(&self, workflow_type: &str) -> Result<Vec<(WorkflowId, i64)>>;

    /// Delete up to `limit` events of `workflow_id` that are covered by a
    /// snapshot (`workflow_version <= up_to_version`), consumed by every
    /// reader (`global_id <= max_global_id`), and older than `older_than`.
    /// Returns the number of rows removed.
    async fn truncate_events(
        &self,
        workflow_id: &WorkflowId,
        up_to_version: i64,
        max_global_id: i64,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> Result<u64>;
}

/// Durable reader offsets with single-owner semantics.
#[async_trait]
pub trait OffsetStore: Send + Sync + 'static {
    /// Committed offset for `reader`, 0 when the row does not exist.
    async fn load_offset(&self, reader: &str) -> Result<i64>;

    /// Advance `reader`'s offset to `last_global_id`.
    ///
    /// Offsets only move forward. Committing below the stored value means a
    /// second process owns the same reader name; that is surfaced as a
    /// `Configuration` error so the younger claimant aborts.
    async fn commit_offset(&self, reader: &str, last_global_id: i64) -> Result<()>;

    /// Create the offset row if absent. Returns false when it already
    /// existed (left untouched).
    async fn init_offset(&self, reader: &str, last_global_id: i64) -> Result<bool>;

    /// Offset rows for the given reader names (missing names are skipped).
    async fn offsets(&self, readers: &[String]) -> Result<Vec<OffsetRow>>;

    /// Minimum committed offset across all readers; `None` when no readers
    /// exist. The truncation floor.
    async fn min_offset(&self) -> Result<Option<i64>>;

    /// Unconditionally set `reader`'s offset (scaling migrations only).
    async fn set_offset(&self, reader: &str, last_global_id: i64) -> Result<()>;

    /// Remove offset rows for retired readers.
    async fn delete_offsets(&self, readers: &[String]) -> Result<()>;
}

/// Activity records, owned exclusively by the activity executor.
#[async_trait]
pub trait ActivityStore: Send + Sync + 'static {
    async fn activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<Option<ActivityRecord>>;

    /// Insert `record` unless a record for its key exists; returns the
    /// stored record either way.
    async fn create_activity_if_absent(&self, record: ActivityRecord) -> Result<ActivityRecord>;

    /// Transition status, stamping `last_attempt_at` and taking ownership
    /// via `runner_id`.
    async fn update_activity_status(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        status: ActivityStatus,
        retry_count: u32,
        runner_id: Option<&str>,
    ) -> Result<()>;

    /// Record a failed attempt's error without changing status.
    async fn record_activity_error(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        error_type: &str,
        error_message: &str,
        retry_count: u32,
    ) -> Result<()>;

    /// Persist the merged checkpoint map.
    async fn save_checkpoint(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        checkpoint: &Map<String, Value>,
    ) -> Result<()>;

    async fn mark_activity_completed(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<()>;

    /// Dead-letter the record after retries are exhausted.
    async fn mark_activity_failed(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        error_type: &str,
        error_message: &str,
    ) -> Result<()>;

    /// Cancel pending/running records for a workflow; `None` cancels all.
    async fn cancel_activities(
        &self,
        workflow_id: &WorkflowId,
        event_numbers: Option<&[i64]>,
    ) -> Result<()>;

    /// Reset a `failed` record to `pending` with a zeroed retry count.
    /// Returns false when no failed record exists for the key.
    async fn reset_failed_activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<bool>;

    /// Records stuck in `running`/`retrying` whose `last_attempt_at` is
    /// missing or older than `older_than`; candidates for takeover.
    async fn stale_running_activities(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<ActivityRecord>>;
}

/// Delay schedule rows, owned exclusively by the delay scheduler.
#[async_trait]
pub trait ScheduleStore: Send + Sync + 'static {
    /// Insert a delay row, replacing any pending row with the same
    /// `(workflow_id, delay_id)`.
    async fn register_delay(&self, record: DelayScheduleRecord) -> Result<()>;

    /// Remove one delay row.
    async fn remove_delay(&self, workflow_id: &WorkflowId, delay_id: &str) -> Result<()>;

    /// Due rows (`delay_until <= now`) for `workflow_type`, ordered by
    /// `delay_until`, up to `limit`.
    async fn due_schedules(
        &self,
        workflow_type: &str,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<DelayScheduleRecord>>;

    /// The soonest `delay_until` for `workflow_type`, for adaptive sleeping.
    async fn next_fire_at(&self, workflow_type: &str) -> Result<Option<OffsetDateTime>>;
}

/// Scaling coordination rows: a pending operation tells every runner of a
/// workflow type to stop at `target_offset`.
#[async_trait]
pub trait ScalingStore: Send + Sync + 'static {
    /// Create a pending operation. Fails with `Configuration` when one is
    /// already in progress for the type.
    async fn create_scaling_operation(&self, workflow_type: &str, target_offset: i64)
        -> Result<()>;

    /// Target offset of the pending operation, if any.
    async fn active_scaling_target(&self, workflow_type: &str) -> Result<Option<i64>>;

    /// Mark the pending operation completed.
    async fn complete_scaling_operation(&self, workflow_type: &str) -> Result<()>;
}

/// The full persistence contract the engine runs on.
pub trait Store:
    EventStore + OffsetStore + ActivityStore + ScheduleStore + ScalingStore + Clone
{
}

impl<T> Store for T where
    T: EventStore + OffsetStore + ActivityStore + ScheduleStore + ScalingStore + Clone
{
}
