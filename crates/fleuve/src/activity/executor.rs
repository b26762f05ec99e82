//! Activity executor: retries, checkpoints, timeouts, dead-lettering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, timeout_at};
use tracing::{debug, error, info, warn};

use super::adapter::{ActionContext, ActionEmitter, ActionItem, Adapter};
use super::retry::RetryPolicy;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::repository::Repository;
use crate::store::{ActivityRecord, ActivityStatus, ActivityStore, EventStore};
use crate::stream::ConsumedEvent;
use crate::workflow::WorkflowId;

type ActionKey = (String, i64);

struct Inner<A, S>
where
    A: Adapter,
    S: EventStore + ActivityStore + Clone,
{
    store: S,
    repo: Repository<A::Workflow, S>,
    adapter: A,
    default_retry_policy: RetryPolicy,
    runner_id: Option<String>,
    action_timeout: Option<Duration>,
    stale_after: Duration,
    recovery_interval: Duration,
    running: Mutex<HashMap<ActionKey, JoinHandle<()>>>,
}

/// Runs adapter side-effects for events, exactly-once on success.
///
/// The activity record keyed on `(workflow_id, event_number)` is the
/// idempotency anchor: `completed` records are never re-run, everything
/// else is at-least-once with checkpoint resume. Cheap to clone; clones
/// share the in-flight action table.
pub struct ActionExecutor<A, S>
where
    A: Adapter,
    S: EventStore + ActivityStore + Clone,
{
    inner: Arc<Inner<A, S>>,
}

impl<A, S> Clone for ActionExecutor<A, S>
where
    A: Adapter,
    S: EventStore + ActivityStore + Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, S> ActionExecutor<A, S>
where
    A: Adapter,
    S: EventStore + ActivityStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: S, repo: Repository<A::Workflow, S>, adapter: A) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                repo,
                adapter,
                default_retry_policy: RetryPolicy::default(),
                runner_id: None,
                action_timeout: None,
                stale_after: Duration::from_secs(5 * 60),
                recovery_interval: Duration::from_secs(30),
                running: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Apply the executor-relevant options from an [`EngineConfig`].
    pub fn with_config(self, config: &EngineConfig) -> Self {
        self.map_inner(|inner| {
            inner.default_retry_policy = config.retry_policy.clone();
            inner.stale_after = config.activity_stale_after;
            inner.recovery_interval = config.activity_recovery_interval;
        })
    }

    /// Default retry policy for new activity records.
    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        self.map_inner(|inner| inner.default_retry_policy = policy)
    }

    /// Identify this executor in activity records (takeover bookkeeping).
    pub fn with_runner_id(self, runner_id: impl Into<String>) -> Self {
        let runner_id = runner_id.into();
        self.map_inner(|inner| inner.runner_id = Some(runner_id))
    }

    /// Wall-clock bound over whole attempts, on top of any `timeout` items
    /// the adapter yields.
    pub fn with_action_timeout(self, timeout: Duration) -> Self {
        self.map_inner(|inner| inner.action_timeout = Some(timeout))
    }

    fn map_inner(mut self, f: impl FnOnce(&mut Inner<A, S>)) -> Self {
        // Builder runs before any clone exists, so the Arc is unique.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            f(inner);
        }
        self
    }

    /// Delegate the adapter's event filter.
    pub fn to_be_act_on(&self, event: &ConsumedEvent) -> bool {
        self.inner.adapter.to_be_act_on(event)
    }

    /// Start executing an activity for `event` in the background.
    ///
    /// Idempotent: completed activities and activities already in flight in
    /// this process are skipped. The activity record is created before the
    /// background task is spawned, so invariant "a record exists iff the
    /// executor attempted the event" holds even across a crash right here.
    pub async fn execute_action(&self, event: ConsumedEvent) -> Result<()> {
        let key: ActionKey = (event.workflow_id.as_str().to_owned(), event.event_no);

        {
            let running = self.inner.running.lock().await;
            if running.contains_key(&key) {
                debug!(
                    workflow_id = %event.workflow_id,
                    event_number = event.event_no,
                    "Action already running"
                );
                return Ok(());
            }
        }

        if let Some(activity) = self
            .inner
            .store
            .activity(&event.workflow_id, event.event_no)
            .await?
        {
            if activity.status == ActivityStatus::Completed {
                debug!(
                    workflow_id = %event.workflow_id,
                    event_number = event.event_no,
                    "Action already completed"
                );
                return Ok(());
            }
        }

        self.inner
            .store
            .create_activity_if_absent(ActivityRecord::pending(
                event.workflow_id.clone(),
                event.event_no,
                self.inner.default_retry_policy.clone(),
                event.reader_name.clone().or_else(|| self.inner.runner_id.clone()),
                OffsetDateTime::now_utc(),
            ))
            .await?;

        let executor = self.clone();
        let task_key = key.clone();
        // The map lock is held across the spawn so the task's final removal
        // cannot run before the handle is registered.
        let mut running = self.inner.running.lock().await;
        let handle = tokio::spawn(async move {
            let workflow_id = event.workflow_id.clone();
            let event_number = event.event_no;
            if let Err(err) = executor.run_action_with_retry(event).await {
                error!(
                    workflow_id = %workflow_id,
                    event_number,
                    error = %err,
                    "Unhandled error in action task"
                );
            }
            executor.inner.running.lock().await.remove(&task_key);
        });
        running.insert(key, handle);
        Ok(())
    }

    /// Cancel running/pending actions for a workflow. `None` cancels all.
    pub async fn cancel_workflow_actions(
        &self,
        workflow_id: &WorkflowId,
        event_numbers: Option<&[i64]>,
    ) -> Result<()> {
        {
            let mut running = self.inner.running.lock().await;
            for ((wid, event_number), handle) in running.iter_mut() {
                if wid != workflow_id.as_str() {
                    continue;
                }
                if event_numbers
                    .map(|numbers| numbers.contains(event_number))
                    .unwrap_or(true)
                {
                    handle.abort();
                }
            }
        }
        self.inner
            .store
            .cancel_activities(workflow_id, event_numbers)
            .await
    }

    /// Reset a dead-lettered activity and re-execute it from scratch.
    ///
    /// Returns false when no failed record (or no stored event) exists for
    /// the key.
    pub async fn retry_failed_action(
        &self,
        workflow_id: &WorkflowId,
        event_number: i64,
    ) -> Result<bool> {
        if !self
            .inner
            .store
            .reset_failed_activity(workflow_id, event_number)
            .await?
        {
            return Ok(false);
        }
        let Some(record) = self
            .inner
            .store
            .event_by_version(workflow_id, event_number)
            .await?
        else {
            warn!(
                workflow_id = %workflow_id,
                event_number,
                "Cannot retry action: event not found"
            );
            return Ok(false);
        };
        self.execute_action(ConsumedEvent::from_record(
            record,
            self.inner.runner_id.clone(),
        ))
        .await?;
        Ok(true)
    }

    /// Take over interrupted activities: `running`/`retrying` records whose
    /// `last_attempt_at` went stale (their runner died or lost the event).
    /// Checkpoints are preserved. Returns the number of takeovers started.
    pub async fn recover_interrupted_actions(&self) -> Result<usize> {
        let threshold = OffsetDateTime::now_utc() - self.inner.stale_after;
        let interrupted = self
            .inner
            .store
            .stale_running_activities(threshold)
            .await?;
        let mut recovered = 0;
        for activity in interrupted {
            let key: ActionKey = (
                activity.workflow_id.as_str().to_owned(),
                activity.event_number,
            );
            if self.inner.running.lock().await.contains_key(&key) {
                continue;
            }
            let Some(record) = self
                .inner
                .store
                .event_by_version(&activity.workflow_id, activity.event_number)
                .await?
            else {
                continue;
            };
            info!(
                workflow_id = %activity.workflow_id,
                event_number = activity.event_number,
                "Recovering interrupted action"
            );
            self.execute_action(ConsumedEvent::from_record(
                record,
                self.inner.runner_id.clone(),
            ))
            .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Periodic recovery scan until the shutdown signal flips.
    pub async fn run_recovery_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.inner.recovery_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Action recovery loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.recover_interrupted_actions().await {
                        error!(error = %err, "Error in action recovery loop");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Action recovery loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Wait for in-flight actions to finish, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut running = self.inner.running.lock().await;
            running.drain().map(|(_, handle)| handle).collect()
        };
        if handles.is_empty() {
            return;
        }
        let deadline = Instant::now() + timeout;
        for handle in handles {
            if timeout_at(deadline, handle).await.is_err() {
                warn!("Timed out waiting for in-flight actions");
                return;
            }
        }
    }

    /// Number of actions currently in flight in this process.
    pub async fn running_actions(&self) -> usize {
        self.inner.running.lock().await.len()
    }

    async fn run_action_with_retry(&self, event: ConsumedEvent) -> Result<()> {
        let workflow_id = event.workflow_id.clone();
        let event_number = event.event_no;

        let Some(mut activity) = self.inner.store.activity(&workflow_id, event_number).await?
        else {
            return Err(crate::Error::Configuration(format!(
                "activity record for {workflow_id}:{event_number} missing after create"
            )));
        };

        let policy = activity.retry_policy.clone();
        let mut retry_count = activity.retry_count;
        let mut last_error = String::new();

        while policy.should_retry(retry_count) {
            let status = if retry_count == 0 {
                ActivityStatus::Running
            } else {
                ActivityStatus::Retrying
            };
            self.inner
                .store
                .update_activity_status(
                    &workflow_id,
                    event_number,
                    status,
                    retry_count,
                    event
                        .reader_name
                        .as_deref()
                        .or(self.inner.runner_id.as_deref()),
                )
                .await?;

            let ctx = ActionContext {
                workflow_id: workflow_id.clone(),
                event_number,
                checkpoint: activity.checkpoint.clone(),
                retry_count,
                retry_policy: policy.clone(),
            };

            let (checkpoint, outcome) = self.drive_adapter(&event, ctx).await;
            let checkpoint_changed = checkpoint != activity.checkpoint;
            if checkpoint_changed {
                // Persist progress either way so a retry resumes from it.
                self.inner
                    .store
                    .save_checkpoint(&workflow_id, event_number, &checkpoint)
                    .await?;
                activity.checkpoint = checkpoint;
            }

            match outcome {
                Ok(()) => {
                    self.inner
                        .store
                        .mark_activity_completed(&workflow_id, event_number)
                        .await?;
                    info!(
                        workflow_id = %workflow_id,
                        event_number,
                        retry_count,
                        "Action completed"
                    );
                    return Ok(());
                }
                Err(message) => {
                    last_error = message;
                    warn!(
                        workflow_id = %workflow_id,
                        event_number,
                        attempt = retry_count + 1,
                        max_attempts = policy.max_retries + 1,
                        error = %last_error,
                        "Action attempt failed"
                    );
                    self.inner
                        .store
                        .record_activity_error(
                            &workflow_id,
                            event_number,
                            "ActionError",
                            &last_error,
                            retry_count,
                        )
                        .await?;
                    retry_count += 1;
                    if policy.should_retry(retry_count) {
                        let delay = policy.jittered_delay(retry_count - 1);
                        debug!(
                            workflow_id = %workflow_id,
                            event_number,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying action after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.inner
            .store
            .mark_activity_failed(&workflow_id, event_number, "ActionError", &last_error)
            .await?;
        error!(
            workflow_id = %workflow_id,
            event_number,
            attempts = policy.max_retries + 1,
            "Action failed permanently, dead-lettered"
        );
        self.inner
            .adapter
            .on_action_failed(&workflow_id, event_number, &last_error)
            .await;
        Ok(())
    }

    /// Drive one attempt: run `act_on` and its yield channel concurrently.
    ///
    /// Returns the merged checkpoint and the attempt outcome. No engine lock
    /// is held while the adapter runs; commands are applied through the
    /// Repository as they are yielded.
    async fn drive_adapter(
        &self,
        event: &ConsumedEvent,
        ctx: ActionContext,
    ) -> (Map<String, Value>, std::result::Result<(), String>) {
        let (tx, mut rx) = mpsc::channel::<ActionItem<_>>(16);
        let emitter = ActionEmitter::new(tx);
        let mut checkpoint = ctx.checkpoint.clone();

        let executor = self.clone();
        let task_event = event.clone();
        let mut producer = tokio::spawn(async move {
            executor
                .inner
                .adapter
                .act_on(&task_event, &ctx, &emitter)
                .await
                .map_err(|err| err.to_string())
        });

        let mut deadline = self
            .inner
            .action_timeout
            .map(|timeout| Instant::now() + timeout);

        loop {
            let received = match deadline {
                Some(deadline) => match timeout_at(deadline, rx.recv()).await {
                    Ok(item) => item,
                    Err(_) => {
                        producer.abort();
                        return (checkpoint, Err("action execution timed out".to_owned()));
                    }
                },
                None => rx.recv().await,
            };

            match received {
                Some(ActionItem::Command(cmd)) => {
                    match self
                        .inner
                        .repo
                        .process_command(&event.workflow_id, &cmd)
                        .await
                    {
                        Ok(_) => {}
                        Err(err) if err.is_expected_rejection() => {
                            // Already handled by a previous attempt.
                            debug!(
                                workflow_id = %event.workflow_id,
                                event_number = event.event_no,
                                rejection = %err,
                                "Yielded command rejected as already handled"
                            );
                        }
                        Err(err) => {
                            producer.abort();
                            return (checkpoint, Err(err.to_string()));
                        }
                    }
                }
                Some(ActionItem::Checkpoint { data, save_now }) => {
                    for (key, value) in data {
                        checkpoint.insert(key, value);
                    }
                    if save_now {
                        if let Err(err) = self
                            .inner
                            .store
                            .save_checkpoint(&event.workflow_id, event.event_no, &checkpoint)
                            .await
                        {
                            producer.abort();
                            return (checkpoint, Err(err.to_string()));
                        }
                    }
                }
                Some(ActionItem::Timeout { seconds }) => {
                    deadline = Some(Instant::now() + Duration::from_secs_f64(seconds.max(0.0)));
                }
                // Producer finished and dropped the emitter.
                None => break,
            }
        }

        let joined = match deadline {
            Some(deadline) => match timeout_at(deadline, &mut producer).await {
                Ok(joined) => joined,
                Err(_) => {
                    producer.abort();
                    return (checkpoint, Err("action execution timed out".to_owned()));
                }
            },
            None => producer.await,
        };

        let outcome = match joined {
            Ok(result) => result,
            Err(join_error) if join_error.is_cancelled() => Err("action cancelled".to_owned()),
            Err(join_error) => Err(format!("action panicked: {join_error}")),
        };
        (checkpoint, outcome)
    }
}
