//! Command processing: load, decide, evolve, persist under the workflow lock.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CachedState, StateCache};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::event::{EventMetadata, SystemEvent, WorkflowEvent};
use crate::state::{Lifecycle, WorkflowState, fold_events};
use crate::store::{EventRecord, EventStore, NewEvent, UnitOfWork};
use crate::workflow::{Workflow, WorkflowId};

/// A committed `(id, version, state)` triple.
#[derive(Debug, Clone)]
pub struct StoredState<S> {
    pub id: WorkflowId,
    pub version: i64,
    pub state: WorkflowState<S>,
}

/// Result of a successful `create_new` / `process_command`.
#[derive(Debug)]
pub struct CommandOutcome<W: Workflow> {
    pub state: StoredState<W::State>,
    /// The events that were appended; empty for a no-op decision.
    pub events: Vec<WorkflowEvent<W::Event>>,
}

/// Strongly-consistent auxiliary writes that must commit with the events.
///
/// The hook runs inside the append transaction, after subscription handling
/// and before the events become visible. It receives the unit of work and
/// may downcast it (`as_any_mut`) to the concrete store's type to issue
/// arbitrary statements on the same transaction. It must not commit.
#[async_trait]
pub trait SyncDbHook: Send + Sync {
    async fn sync_db(
        &self,
        uow: &mut dyn UnitOfWork,
        workflow_id: &WorkflowId,
        old_state: Option<&Value>,
        new_state: &Value,
        events: &[NewEvent],
    ) -> Result<()>;
}

/// Single entry point for workflow mutation.
///
/// Serializes writers per workflow through the store's exclusive lock,
/// folds `decide` results through the system-event wrapper, and commits
/// events + subscription diff + snapshot + sync-db work atomically. The
/// state cache is updated by CAS after the commit; on CAS failure the entry
/// is deleted so stale readers reload from the store.
pub struct Repository<W: Workflow, S> {
    store: S,
    cache: Arc<dyn StateCache>,
    snapshot_interval: u32,
    command_retry_limit: u32,
    sync_db: Option<Arc<dyn SyncDbHook>>,
    _workflow: PhantomData<fn() -> W>,
}

impl<W: Workflow, S: Clone> Clone for Repository<W, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: Arc::clone(&self.cache),
            snapshot_interval: self.snapshot_interval,
            command_retry_limit: self.command_retry_limit,
            sync_db: self.sync_db.clone(),
            _workflow: PhantomData,
        }
    }
}

impl<W, S> Repository<W, S>
where
    W: Workflow,
    S: EventStore,
{
    pub fn new(store: S, cache: Arc<dyn StateCache>) -> Self {
        Self {
            store,
            cache,
            snapshot_interval: 0,
            command_retry_limit: 5,
            sync_db: None,
            _workflow: PhantomData,
        }
    }

    /// Apply the repository-relevant options from an [`EngineConfig`].
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.snapshot_interval = config.snapshot_interval;
        self.command_retry_limit = config.command_retry_limit;
        self
    }

    /// Snapshot every `interval` events; 0 disables.
    pub fn with_snapshot_interval(mut self, interval: u32) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Install a strongly-consistent sync hook (see [`SyncDbHook`]).
    pub fn with_sync_db(mut self, hook: Arc<dyn SyncDbHook>) -> Self {
        self.sync_db = Some(hook);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn cache_key(workflow_id: &WorkflowId) -> String {
        format!("{}:{}", W::TYPE, workflow_id)
    }

    /// Create a workflow instance from its first command.
    ///
    /// Fails with `AlreadyExists` when any event exists for `workflow_id`.
    /// `tags` are stored on the instance and injected into every appended
    /// event's metadata for tag-based subscription matching.
    pub async fn create_new(
        &self,
        workflow_id: &WorkflowId,
        cmd: &W::Command,
        tags: Vec<String>,
    ) -> Result<CommandOutcome<W>> {
        let events = W::decide(None, cmd).map_err(Error::Rejected)?;
        if events.is_empty() {
            return Err(Error::rejected("decide produced no events for a new workflow"));
        }

        let mut uow = self.store.begin(W::TYPE, workflow_id).await?;
        if uow.current_version().await? != 0 {
            return Err(Error::AlreadyExists {
                workflow_id: workflow_id.as_str().to_owned(),
            });
        }
        if !tags.is_empty() {
            uow.set_workflow_tags(&tags).await?;
        }
        debug!(workflow_type = W::TYPE, workflow_id = %workflow_id, "Creating workflow");
        self.persist(uow, workflow_id, None, events).await
    }

    /// Validate a command against the current state and append the resulting
    /// events.
    ///
    /// `VersionConflict` is retried internally a bounded number of times;
    /// every retry re-runs `decide` against the fresh state.
    pub async fn process_command(
        &self,
        workflow_id: &WorkflowId,
        cmd: &W::Command,
    ) -> Result<CommandOutcome<W>> {
        let mut attempt = 0;
        loop {
            match self.process_command_once(workflow_id, cmd).await {
                Err(Error::VersionConflict { .. }) if attempt < self.command_retry_limit => {
                    attempt += 1;
                    debug!(
                        workflow_id = %workflow_id,
                        attempt,
                        "Version conflict, retrying command"
                    );
                    self.evict_cache(workflow_id).await;
                }
                other => return other,
            }
        }
    }

    async fn process_command_once(
        &self,
        workflow_id: &WorkflowId,
        cmd: &W::Command,
    ) -> Result<CommandOutcome<W>> {
        let mut uow = self.store.begin(W::TYPE, workflow_id).await?;
        let old = self
            .load_current(uow.as_mut(), workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                workflow_type: W::TYPE.to_owned(),
                workflow_id: workflow_id.as_str().to_owned(),
            })?;

        match old.state.lifecycle {
            Lifecycle::Paused => {
                return Err(Error::Paused {
                    workflow_id: workflow_id.as_str().to_owned(),
                });
            }
            Lifecycle::Cancelled => {
                return Err(Error::Cancelled {
                    workflow_id: workflow_id.as_str().to_owned(),
                });
            }
            Lifecycle::Active => {}
        }

        let events = W::decide(Some(&old.state), cmd).map_err(Error::Rejected)?;
        if events.is_empty() {
            return Ok(CommandOutcome {
                state: old,
                events: Vec::new(),
            });
        }
        self.persist(uow, workflow_id, Some(old), events).await
    }

    /// Emit the pause system event. Idempotent when already paused.
    pub async fn pause_workflow(
        &self,
        workflow_id: &WorkflowId,
        reason: impl Into<String>,
    ) -> Result<CommandOutcome<W>> {
        self.apply_system(workflow_id, SystemEvent::Pause {
            reason: reason.into(),
        })
        .await
    }

    /// Emit the resume system event. Fails on cancelled workflows.
    pub async fn resume_workflow(&self, workflow_id: &WorkflowId) -> Result<CommandOutcome<W>> {
        self.apply_system(workflow_id, SystemEvent::Resume).await
    }

    /// Emit the cancel system event and retire the workflow's pending delay
    /// schedules. Idempotent when already cancelled.
    pub async fn cancel_workflow(
        &self,
        workflow_id: &WorkflowId,
        reason: impl Into<String>,
    ) -> Result<CommandOutcome<W>> {
        self.apply_system(workflow_id, SystemEvent::Cancel {
            reason: reason.into(),
        })
        .await
    }

    async fn apply_system(
        &self,
        workflow_id: &WorkflowId,
        event: SystemEvent,
    ) -> Result<CommandOutcome<W>> {
        let mut uow = self.store.begin(W::TYPE, workflow_id).await?;
        let old = self
            .load_current(uow.as_mut(), workflow_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                workflow_type: W::TYPE.to_owned(),
                workflow_id: workflow_id.as_str().to_owned(),
            })?;

        let no_op = match (&event, old.state.lifecycle) {
            (SystemEvent::Cancel { .. }, Lifecycle::Cancelled) => true,
            (SystemEvent::Pause { .. }, Lifecycle::Paused) => true,
            (SystemEvent::Pause { .. } | SystemEvent::Resume, Lifecycle::Cancelled) => {
                return Err(Error::Cancelled {
                    workflow_id: workflow_id.as_str().to_owned(),
                });
            }
            (SystemEvent::Resume, Lifecycle::Active) => true,
            _ => false,
        };
        if no_op {
            return Ok(CommandOutcome {
                state: old,
                events: Vec::new(),
            });
        }

        self.persist(
            uow,
            workflow_id,
            Some(old),
            vec![WorkflowEvent::System(event)],
        )
        .await
    }

    async fn persist(
        &self,
        mut uow: Box<dyn UnitOfWork>,
        workflow_id: &WorkflowId,
        old: Option<StoredState<W::State>>,
        events: Vec<WorkflowEvent<W::Event>>,
    ) -> Result<CommandOutcome<W>> {
        let old_version = old.as_ref().map(|o| o.version).unwrap_or(0);
        let old_state = old.map(|o| o.state);

        let new_state = fold_events::<W>(old_state.clone(), &events)
            .ok_or_else(|| Error::rejected("no state after folding events"))?;

        let subscriptions_changed = match &old_state {
            Some(old_state) => old_state.subscriptions != new_state.subscriptions,
            None => !new_state.subscriptions.is_empty(),
        };
        if subscriptions_changed {
            uow.sync_subscriptions(W::TYPE, &new_state.subscriptions)
                .await?;
        }

        let workflow_tags = uow.workflow_tags().await?;
        let metadata = EventMetadata {
            tags: Vec::new(),
            workflow_tags,
        };
        let new_events = events
            .iter()
            .map(|event| encode_event::<W>(event, &metadata))
            .collect::<Result<Vec<_>>>()?;

        let new_state_value = serde_json::to_value(&new_state)?;
        if let Some(hook) = &self.sync_db {
            let old_state_value = old_state
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?;
            hook.sync_db(
                uow.as_mut(),
                workflow_id,
                old_state_value.as_ref(),
                &new_state_value,
                &new_events,
            )
            .await?;
        }

        let new_version = old_version + events.len() as i64;
        uow.append_events(old_version, new_events).await?;

        if self.snapshot_interval > 0 {
            let interval = i64::from(self.snapshot_interval);
            if new_version / interval > old_version / interval {
                uow.save_snapshot(new_version, new_state_value.clone())
                    .await?;
            }
        }

        if new_state.lifecycle == Lifecycle::Cancelled {
            uow.remove_all_delays().await?;
        }

        uow.commit().await?;
        debug!(
            workflow_type = W::TYPE,
            workflow_id = %workflow_id,
            version = new_version,
            appended = events.len(),
            "Events committed"
        );

        let finished = matches!(
            events.last(),
            Some(WorkflowEvent::Domain(event)) if W::is_final_event(event)
        );
        let key = Self::cache_key(workflow_id);
        let cache_result = if finished {
            self.cache.delete(&key).await
        } else {
            self.cas_cache(&key, old_version, new_version, new_state_value)
                .await
        };
        if let Err(error) = cache_result {
            warn!(workflow_id = %workflow_id, error = %error, "State cache update failed");
        }

        Ok(CommandOutcome {
            state: StoredState {
                id: workflow_id.clone(),
                version: new_version,
                state: new_state,
            },
            events,
        })
    }

    async fn cas_cache(
        &self,
        key: &str,
        old_version: i64,
        new_version: i64,
        state: Value,
    ) -> Result<()> {
        let stored = self
            .cache
            .put_if_version(key, old_version, CachedState {
                version: new_version,
                state,
            })
            .await?;
        if !stored {
            self.cache.delete(key).await?;
        }
        Ok(())
    }

    /// Drop the cached state for a workflow. Used after events are appended
    /// outside the command path (the delay scheduler's direct append).
    pub async fn invalidate_cache(&self, workflow_id: &WorkflowId) {
        self.evict_cache(workflow_id).await;
    }

    async fn evict_cache(&self, workflow_id: &WorkflowId) {
        if let Err(error) = self.cache.delete(&Self::cache_key(workflow_id)).await {
            warn!(workflow_id = %workflow_id, error = %error, "State cache eviction failed");
        }
    }

    /// Load the current state inside the lock: cache when fresh, otherwise
    /// snapshot + replay.
    async fn load_current(
        &self,
        uow: &mut dyn UnitOfWork,
        workflow_id: &WorkflowId,
    ) -> Result<Option<StoredState<W::State>>> {
        let version = uow.current_version().await?;
        if version == 0 {
            return Ok(None);
        }

        let key = Self::cache_key(workflow_id);
        match self.cache.get(&key).await {
            Ok(Some(cached)) if cached.version == version => {
                let state: WorkflowState<W::State> = serde_json::from_value(cached.state)?;
                return Ok(Some(StoredState {
                    id: workflow_id.clone(),
                    version,
                    state,
                }));
            }
            Ok(_) => {}
            Err(error) => {
                warn!(workflow_id = %workflow_id, error = %error, "State cache read failed");
            }
        }

        let snapshot = uow.load_snapshot().await?;
        let (mut state, from_version) = match snapshot {
            Some(snapshot) => (
                Some(serde_json::from_value(snapshot.state)?),
                snapshot.version,
            ),
            None => (None, 0),
        };
        let records = uow.events_after(from_version).await?;
        if state.is_none() && records.is_empty() {
            return Ok(None);
        }
        if last_record_is_final::<W>(&records)? {
            self.evict_cache(workflow_id).await;
            return Ok(None);
        }
        for record in &records {
            let event = decode_record::<W>(record)?;
            state = fold_events::<W>(state, std::slice::from_ref(&event));
        }
        let state = state.ok_or_else(|| Error::NotFound {
            workflow_type: W::TYPE.to_owned(),
            workflow_id: workflow_id.as_str().to_owned(),
        })?;

        let state_value = serde_json::to_value(&state)?;
        if let Err(error) = self.cas_cache(&key, version, version, state_value).await {
            warn!(workflow_id = %workflow_id, error = %error, "State cache refresh failed");
        }

        Ok(Some(StoredState {
            id: workflow_id.clone(),
            version,
            state,
        }))
    }

    /// Materialize state at any historical version (replay semantics).
    ///
    /// Lock-free: may be slightly stale relative to an in-flight command.
    /// Returns `None` when the workflow does not exist, has finished, or the
    /// requested version predates both the oldest remaining event and any
    /// snapshot.
    pub async fn load_state(
        &self,
        workflow_id: &WorkflowId,
        at_version: Option<i64>,
    ) -> Result<Option<StoredState<W::State>>> {
        let snapshot = self.store.latest_snapshot(workflow_id, at_version).await?;
        let (mut state, from_version) = match snapshot {
            Some(snapshot) => (
                Some(serde_json::from_value::<WorkflowState<W::State>>(
                    snapshot.state,
                )?),
                snapshot.version,
            ),
            None => (None, 0),
        };

        let records: Vec<EventRecord> = self
            .store
            .events_for_workflow(workflow_id, at_version)
            .await?
            .into_iter()
            .filter(|record| record.workflow_version > from_version)
            .collect();
        if state.is_none() && records.is_empty() {
            return Ok(None);
        }
        if at_version.is_none() && last_record_is_final::<W>(&records)? {
            return Ok(None);
        }

        let mut version = from_version;
        for record in &records {
            let event = decode_record::<W>(record)?;
            state = fold_events::<W>(state, std::slice::from_ref(&event));
            version = record.workflow_version;
        }

        Ok(state.map(|state| StoredState {
            id: workflow_id.clone(),
            version,
            state,
        }))
    }

    /// Fast current-state read: cache first, store on a miss.
    ///
    /// Lock-free; callers needing read-your-writes go through
    /// [`process_command`](Self::process_command).
    pub async fn current_state(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<StoredState<W::State>>> {
        let key = Self::cache_key(workflow_id);
        match self.cache.get(&key).await {
            Ok(Some(cached)) => {
                let state: WorkflowState<W::State> = serde_json::from_value(cached.state)?;
                return Ok(Some(StoredState {
                    id: workflow_id.clone(),
                    version: cached.version,
                    state,
                }));
            }
            Ok(None) => {}
            Err(error) => {
                warn!(workflow_id = %workflow_id, error = %error, "State cache read failed");
            }
        }

        let loaded = self.load_state(workflow_id, None).await?;
        if let Some(stored) = &loaded {
            let state_value = serde_json::to_value(&stored.state)?;
            if let Err(error) = self
                .cas_cache(&key, stored.version, stored.version, state_value)
                .await
            {
                warn!(workflow_id = %workflow_id, error = %error, "State cache refresh failed");
            }
        }
        Ok(loaded)
    }
}

/// Decode a stored record into the workflow's event sum, applying `upcast`
/// to domain events recorded under an older schema version.
pub(crate) fn decode_record<W: Workflow>(record: &EventRecord) -> Result<WorkflowEvent<W::Event>> {
    if SystemEvent::is_system_type(&record.event_type) {
        return Ok(WorkflowEvent::System(serde_json::from_value(
            record.body.clone(),
        )?));
    }
    let mut body = record.body.clone();
    if record.schema_version < W::SCHEMA_VERSION {
        body = W::upcast(&record.event_type, record.schema_version, body).map_err(|error| {
            Error::upcast(
                record.workflow_id.as_str(),
                &record.event_type,
                record.schema_version,
                error.reason,
            )
        })?;
    }
    Ok(WorkflowEvent::Domain(serde_json::from_value(body)?))
}

fn encode_event<W: Workflow>(
    event: &WorkflowEvent<W::Event>,
    metadata: &EventMetadata,
) -> Result<NewEvent> {
    let (event_type, body) = match event {
        WorkflowEvent::Domain(event) => {
            let body = serde_json::to_value(event)?;
            let event_type = body
                .get("type")
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| std::any::type_name::<W::Event>().to_owned());
            if SystemEvent::is_system_type(&event_type) {
                return Err(Error::Configuration(format!(
                    "domain event type {event_type} collides with a reserved system tag"
                )));
            }
            (event_type, body)
        }
        WorkflowEvent::System(system) => {
            (system.event_type().to_owned(), serde_json::to_value(system)?)
        }
    };
    Ok(NewEvent {
        event_type,
        schema_version: W::SCHEMA_VERSION,
        body,
        metadata: metadata.clone(),
    })
}

fn last_record_is_final<W: Workflow>(records: &[EventRecord]) -> Result<bool> {
    let Some(last) = records.last() else {
        return Ok(false);
    };
    match decode_record::<W>(last)? {
        WorkflowEvent::Domain(event) => Ok(W::is_final_event(&event)),
        WorkflowEvent::System(_) => Ok(false),
    }
}
