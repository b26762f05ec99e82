//! In-process store for tests and local development.
//!
//! Implements the full persistence contract over plain maps guarded by an
//! async mutex. A per-workflow lock table provides the same exclusive
//! append serialization as the PostgreSQL row lock, and commits apply the
//! staged writes in one critical section, so append atomicity and ordering
//! behave exactly like the production store.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    ActivityRecord, ActivityStatus, ActivityStore, DelayScheduleRecord, EventRecord, EventStore,
    NewEvent, OffsetRow, OffsetStore, ScalingStore, ScheduleStore, SnapshotRecord,
    SubscriptionRow, UnitOfWork,
};
use crate::error::{Error, Result};
use crate::state::Sub;
use crate::workflow::WorkflowId;

#[derive(Default)]
struct Inner {
    events: Vec<EventRecord>,
    next_global_id: i64,
    versions: HashMap<String, i64>,
    tags: HashMap<String, Vec<String>>,
    snapshots: HashMap<String, SnapshotRecord>,
    subscriptions: Vec<SubscriptionRow>,
    offsets: BTreeMap<String, i64>,
    activities: BTreeMap<(String, i64), ActivityRecord>,
    schedules: Vec<DelayScheduleRecord>,
    scaling: HashMap<String, i64>,
}

/// In-memory store. Cheap to clone; clones share the same log.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn workflow_lock(&self, workflow_id: &WorkflowId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(workflow_id.as_str().to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

enum ScheduleOp {
    Remove(String),
    RemoveAll,
    Reschedule(String, OffsetDateTime),
}

/// Unit of work over [`MemoryStore`]: stages writes, applies them atomically
/// on commit while holding the per-workflow lock.
pub struct MemoryUnitOfWork {
    store: MemoryStore,
    _guard: OwnedMutexGuard<()>,
    workflow_type: String,
    workflow_id: WorkflowId,
    staged_events: Vec<NewEvent>,
    staged_base_version: Option<i64>,
    staged_snapshot: Option<(i64, Value)>,
    staged_subscriptions: Option<Vec<Sub>>,
    staged_tags: Option<Vec<String>>,
    staged_schedule_ops: Vec<ScheduleOp>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn current_version(&mut self) -> Result<i64> {
        let inner = self.store.inner.lock().await;
        let committed = inner
            .versions
            .get(self.workflow_id.as_str())
            .copied()
            .unwrap_or(0);
        Ok(committed + self.staged_events.len() as i64)
    }

    async fn load_snapshot(&mut self) -> Result<Option<SnapshotRecord>> {
        let inner = self.store.inner.lock().await;
        Ok(inner.snapshots.get(self.workflow_id.as_str()).cloned())
    }

    async fn events_after(&mut self, version: i64) -> Result<Vec<EventRecord>> {
        let inner = self.store.inner.lock().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| {
                e.workflow_id == self.workflow_id && e.workflow_version > version
            })
            .cloned()
            .collect())
    }

    async fn workflow_tags(&mut self) -> Result<Vec<String>> {
        if let Some(tags) = &self.staged_tags {
            return Ok(tags.clone());
        }
        let inner = self.store.inner.lock().await;
        Ok(inner
            .tags
            .get(self.workflow_id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn set_workflow_tags(&mut self, tags: &[String]) -> Result<()> {
        self.staged_tags = Some(tags.to_vec());
        Ok(())
    }

    async fn append_events(&mut self, expected_version: i64, events: Vec<NewEvent>) -> Result<()> {
        let inner = self.store.inner.lock().await;
        let committed = inner
            .versions
            .get(self.workflow_id.as_str())
            .copied()
            .unwrap_or(0);
        drop(inner);

        let staged_next = committed + self.staged_events.len() as i64;
        if expected_version != staged_next {
            return Err(Error::VersionConflict {
                workflow_id: self.workflow_id.as_str().to_owned(),
                version: staged_next,
            });
        }
        if self.staged_base_version.is_none() {
            self.staged_base_version = Some(committed);
        }
        self.staged_events.extend(events);
        Ok(())
    }

    async fn save_snapshot(&mut self, version: i64, state: Value) -> Result<()> {
        self.staged_snapshot = Some((version, state));
        Ok(())
    }

    async fn sync_subscriptions(&mut self, _workflow_type: &str, current: &[Sub]) -> Result<()> {
        self.staged_subscriptions = Some(current.to_vec());
        Ok(())
    }

    async fn remove_delay(&mut self, delay_id: &str) -> Result<()> {
        self.staged_schedule_ops
            .push(ScheduleOp::Remove(delay_id.to_owned()));
        Ok(())
    }

    async fn remove_all_delays(&mut self) -> Result<()> {
        self.staged_schedule_ops.push(ScheduleOp::RemoveAll);
        Ok(())
    }

    async fn reschedule_delay(
        &mut self,
        delay_id: &str,
        delay_until: OffsetDateTime,
    ) -> Result<()> {
        self.staged_schedule_ops
            .push(ScheduleOp::Reschedule(delay_id.to_owned(), delay_until));
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut inner = self.store.inner.lock().await;
        let inner = &mut *inner;
        let wid = self.workflow_id.as_str();

        if !self.staged_events.is_empty() {
            let committed = inner.versions.get(wid).copied().unwrap_or(0);
            if self.staged_base_version != Some(committed) {
                return Err(Error::VersionConflict {
                    workflow_id: wid.to_owned(),
                    version: committed,
                });
            }
            let now = OffsetDateTime::now_utc();
            let count = self.staged_events.len() as i64;
            for (i, event) in self.staged_events.into_iter().enumerate() {
                inner.next_global_id += 1;
                inner.events.push(EventRecord {
                    global_id: inner.next_global_id,
                    workflow_type: self.workflow_type.clone(),
                    workflow_id: self.workflow_id.clone(),
                    workflow_version: committed + 1 + i as i64,
                    event_type: event.event_type,
                    schema_version: event.schema_version,
                    body: event.body,
                    metadata: event.metadata,
                    created_at: now,
                });
            }
            inner.versions.insert(wid.to_owned(), committed + count);
        }

        if let Some(tags) = self.staged_tags {
            inner.tags.insert(wid.to_owned(), tags);
        }

        if let Some((version, state)) = self.staged_snapshot {
            inner.snapshots.insert(
                wid.to_owned(),
                SnapshotRecord {
                    workflow_id: self.workflow_id.clone(),
                    workflow_type: self.workflow_type.clone(),
                    version,
                    state,
                    created_at: OffsetDateTime::now_utc(),
                },
            );
        }

        if let Some(current) = self.staged_subscriptions {
            inner
                .subscriptions
                .retain(|row| row.workflow_id != self.workflow_id);
            for sub in current {
                inner.subscriptions.push(SubscriptionRow {
                    workflow_id: self.workflow_id.clone(),
                    workflow_type: self.workflow_type.clone(),
                    subscribed_to_workflow: sub.workflow_id,
                    subscribed_to_event_type: sub.event_type,
                    tags: sub.tags,
                    tags_all: sub.tags_all,
                });
            }
        }

        for op in self.staged_schedule_ops {
            match op {
                ScheduleOp::Remove(delay_id) => inner
                    .schedules
                    .retain(|s| !(s.workflow_id == self.workflow_id && s.delay_id == delay_id)),
                ScheduleOp::RemoveAll => inner
                    .schedules
                    .retain(|s| s.workflow_id != self.workflow_id),
                ScheduleOp::Reschedule(delay_id, until) => {
                    for s in inner.schedules.iter_mut() {
                        if s.workflow_id == self.workflow_id && s.delay_id == delay_id {
                            s.delay_until = until;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn begin(
        &self,
        workflow_type: &str,
        workflow_id: &WorkflowId,
    ) -> Result<Box<dyn UnitOfWork>> {
        let guard = self.workflow_lock(workflow_id).await;
        Ok(Box::new(MemoryUnitOfWork {
            store: self.clone(),
            _guard: guard,
            workflow_type: workflow_type.to_owned(),
            workflow_id: workflow_id.clone(),
            staged_events: Vec::new(),
            staged_base_version: None,
            staged_snapshot: None,
            staged_subscriptions: None,
            staged_tags: None,
            staged_schedule_ops: Vec::new(),
        }))
    }

    async fn fetch_events_since(
        &self,
        after: i64,
        limit: u32,
        event_types: Option<&[String]>,
    ) -> Result<Vec<EventRecord>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<_> = inner
            .events
            .iter()
            .filter(|e| e.global_id > after)
            .filter(|e| {
                event_types
                    .map(|types| types.iter().any(|t| *t == e.event_type))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.global_id);
        events.truncate(limit as usize);
        Ok(events)
    }

    async fn max_global_id(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.next_global_id)
    }

    async fn events_for_workflow(
        &self,
        workflow_id: &WorkflowId,
        up_to_version: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let inner = self.inner.lock().await;
        let mut events: Vec<_> = inner
            .events
            .iter()
            .filter(|e| e.workflow_id == *workflow_id)
            .filter(|e| up_to_version.map(|v| e.workflow_version <= v).unwrap_or(true))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.workflow_version);
        Ok(events)
    }

    async fn event_by_version(
        &self,
        workflow_id: &WorkflowId,
        workflow_version: i64,
    ) -> Result<Option<EventRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .iter()
            .find(|e| e.workflow_id == *workflow_id && e.workflow_version == workflow_version)
            .cloned())
    }

    async fn latest_version(&self, workflow_id: &WorkflowId) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .versions
            .get(workflow_id.as_str())
            .copied()
            .unwrap_or(0))
    }

    async fn latest_snapshot(
        &self,
        workflow_id: &WorkflowId,
        at_most_version: Option<i64>,
    ) -> Result<Option<SnapshotRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .get(workflow_id.as_str())
            .filter(|s| at_most_version.map(|v| s.version <= v).unwrap_or(true))
            .cloned())
    }

    async fn workflow_tags(&self, workflow_id: &WorkflowId) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .tags
            .get(workflow_id.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn subscriptions_for_type(&self, workflow_type: &str) -> Result<Vec<SubscriptionRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .iter()
            .filter(|row| row.workflow_type == workflow_type)
            .cloned()
            .collect())
    }

    async fn snapshots_for_type(&self, workflow_type: &str) -> Result<Vec<(WorkflowId, i64)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .values()
            .filter(|s| s.workflow_type == workflow_type)
            .map(|s| (s.workflow_id.clone(), s.version))
            .collect())
    }

    async fn truncate_events(
        &self,
        workflow_id: &WorkflowId,
        up_to_version: i64,
        max_global_id: i64,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut deleted = 0u64;
        inner.events.retain(|e| {
            let eligible = e.workflow_id == *workflow_id
                && e.workflow_version <= up_to_version
                && e.global_id <= max_global_id
                && e.created_at < older_than
                && deleted < u64::from(limit);
            if eligible {
                deleted += 1;
            }
            !eligible
        });
        Ok(deleted)
    }
}

#[async_trait]
impl OffsetStore for MemoryStore {
    async fn load_offset(&self, reader: &str) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.offsets.get(reader).copied().unwrap_or(0))
    }

    async fn commit_offset(&self, reader: &str, last_global_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.offsets.get(reader) {
            if *existing > last_global_id {
                return Err(Error::Configuration(format!(
                    "offset for reader {reader} moved backwards ({existing} -> {last_global_id}); \
                     another process owns this reader"
                )));
            }
        }
        inner.offsets.insert(reader.to_owned(), last_global_id);
        Ok(())
    }

    async fn init_offset(&self, reader: &str, last_global_id: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.offsets.contains_key(reader) {
            return Ok(false);
        }
        inner.offsets.insert(reader.to_owned(), last_global_id);
        Ok(true)
    }

    async fn offsets(&self, readers: &[String]) -> Result<Vec<OffsetRow>> {
        let inner = self.inner.lock().await;
        Ok(readers
            .iter()
            .filter_map(|name| {
                inner.offsets.get(name).map(|value| OffsetRow {
                    reader: name.clone(),
                    last_read_event_no: *value,
                })
            })
            .collect())
    }

    async fn min_offset(&self) -> Result<Option<i64>> {
        let inner = self.inner.lock().await;
        Ok(inner.offsets.values().min().copied())
    }

    async fn set_offset(&self, reader: &str, last_global_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.offsets.insert(reader.to_owned(), last_global_id);
        Ok(())
    }

    async fn delete_offsets(&self, readers: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for name in readers {
            inner.offsets.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<Option<ActivityRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .activities
            .get(&(workflow_id.as_str().to_owned(), event_number))
            .cloned())
    }

    async fn create_activity_if_absent(&self, record: ActivityRecord) -> Result<ActivityRecord> {
        let mut inner = self.inner.lock().await;
        let key = (
            record.workflow_id.as_str().to_owned(),
            record.event_number,
        );
        Ok(inner.activities.entry(key).or_insert(record).clone())
    }

    async fn update_activity_status(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        status: ActivityStatus,
        retry_count: u32,
        runner_id: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner
            .activities
            .get_mut(&(workflow_id.as_str().to_owned(), event_number))
        {
            record.status = status;
            record.retry_count = retry_count;
            record.last_attempt_at = Some(OffsetDateTime::now_utc());
            if let Some(runner_id) = runner_id {
                record.runner_id = Some(runner_id.to_owned());
            }
        }
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
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner
            .activities
            .get_mut(&(workflow_id.as_str().to_owned(), event_number))
        {
            record.error_type = Some(error_type.to_owned());
            record.error_message = Some(error_message.to_owned());
            record.retry_count = retry_count;
            record.last_attempt_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        checkpoint: &Map<String, Value>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner
            .activities
            .get_mut(&(workflow_id.as_str().to_owned(), event_number))
        {
            record.checkpoint = checkpoint.clone();
        }
        Ok(())
    }

    async fn mark_activity_completed(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner
            .activities
            .get_mut(&(workflow_id.as_str().to_owned(), event_number))
        {
            record.status = ActivityStatus::Completed;
            record.finished_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn mark_activity_failed(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
        error_type: &str,
        error_message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner
            .activities
            .get_mut(&(workflow_id.as_str().to_owned(), event_number))
        {
            record.status = ActivityStatus::Failed;
            record.finished_at = Some(OffsetDateTime::now_utc());
            record.error_type = Some(error_type.to_owned());
            record.error_message = Some(error_message.to_owned());
        }
        Ok(())
    }

    async fn cancel_activities(
        &self,
        workflow_id: &WorkflowId,
        event_numbers: Option<&[i64]>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for ((wid, event_number), record) in inner.activities.iter_mut() {
            if wid != workflow_id.as_str() {
                continue;
            }
            if let Some(numbers) = event_numbers {
                if !numbers.contains(event_number) {
                    continue;
                }
            }
            if matches!(
                record.status,
                ActivityStatus::Pending | ActivityStatus::Running | ActivityStatus::Retrying
            ) {
                record.status = ActivityStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn reset_failed_activity(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner
            .activities
            .get_mut(&(workflow_id.as_str().to_owned(), event_number))
        else {
            return Ok(false);
        };
        if record.status != ActivityStatus::Failed {
            return Ok(false);
        }
        record.status = ActivityStatus::Pending;
        record.retry_count = 0;
        record.finished_at = None;
        record.error_type = None;
        record.error_message = None;
        Ok(true)
    }

    async fn stale_running_activities(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<ActivityRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .activities
            .values()
            .filter(|record| {
                matches!(
                    record.status,
                    ActivityStatus::Running | ActivityStatus::Retrying
                ) && record
                    .last_attempt_at
                    .map(|at| at < older_than)
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn register_delay(&self, record: DelayScheduleRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.schedules.retain(|s| {
            !(s.workflow_id == record.workflow_id && s.delay_id == record.delay_id)
        });
        inner.schedules.push(record);
        Ok(())
    }

    async fn remove_delay(&self, workflow_id: &WorkflowId, delay_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .schedules
            .retain(|s| !(s.workflow_id == *workflow_id && s.delay_id == delay_id));
        Ok(())
    }

    async fn due_schedules(
        &self,
        workflow_type: &str,
        now: OffsetDateTime,
        limit: u32,
    ) -> Result<Vec<DelayScheduleRecord>> {
        let inner = self.inner.lock().await;
        let mut due: Vec<_> = inner
            .schedules
            .iter()
            .filter(|s| s.workflow_type == workflow_type && s.delay_until <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.delay_until);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn next_fire_at(&self, workflow_type: &str) -> Result<Option<OffsetDateTime>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .schedules
            .iter()
            .filter(|s| s.workflow_type == workflow_type)
            .map(|s| s.delay_until)
            .min())
    }
}

#[async_trait]
impl ScalingStore for MemoryStore {
    async fn create_scaling_operation(
        &self,
        workflow_type: &str,
        target_offset: i64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.scaling.contains_key(workflow_type) {
            return Err(Error::Configuration(format!(
                "scaling operation already in progress for {workflow_type}"
            )));
        }
        inner.scaling.insert(workflow_type.to_owned(), target_offset);
        Ok(())
    }

    async fn active_scaling_target(&self, workflow_type: &str) -> Result<Option<i64>> {
        let inner = self.inner.lock().await;
        Ok(inner.scaling.get(workflow_type).copied())
    }

    async fn complete_scaling_operation(&self, workflow_type: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.scaling.remove(workflow_type);
        Ok(())
    }
}
