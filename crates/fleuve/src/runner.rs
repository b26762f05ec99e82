//! Workflow runner: pull from the log, fold events into commands, dispatch.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::activity::{ActionExecutor, Adapter};
use crate::config::EngineConfig;
use crate::delay::DelayScheduler;
use crate::error::Result;
use crate::event::SystemEvent;
use crate::partition::{PartitionedRunnerConfig, make_reader_name};
use crate::repository::Repository;
use crate::store::SubscriptionRow;
use crate::stream::{ConsumedEvent, Reader};
use crate::workflow::{Workflow, WorkflowId};

/// Per-runner rule deciding which workflow ids this runner owns.
pub type WorkflowIdRule = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A subscription row held in memory for fast matching, so routing an event
/// costs no store round-trip.
#[derive(Debug, Clone)]
struct CachedSubscription {
    subscribed_to_workflow: String,
    subscribed_to_event_type: String,
    tags: Vec<String>,
    tags_all: Vec<String>,
}

impl CachedSubscription {
    fn matches_event(&self, event: &ConsumedEvent) -> bool {
        if self.subscribed_to_workflow != "*"
            && self.subscribed_to_workflow != event.workflow_id.as_str()
        {
            return false;
        }
        if self.subscribed_to_event_type != "*"
            && self.subscribed_to_event_type != event.event_type
        {
            return false;
        }
        let has = |tag: &String| {
            event.metadata.tags.contains(tag) || event.metadata.workflow_tags.contains(tag)
        };
        if !self.tags.is_empty() && !self.tags.iter().any(has) {
            return false;
        }
        if !self.tags_all.is_empty() && !self.tags_all.iter().all(has) {
            return false;
        }
        true
    }
}

/// Consumes one reader and drives a workflow type: side effects for its own
/// events, command re-injection for subscribers.
///
/// A runner owns exactly one reader (and therefore one durable offset).
/// Delivery is at-least-once; `decide`'s idempotent rejections make the
/// re-deliveries harmless. The runner never commits past an event whose
/// processing failed with a retryable error.
pub struct WorkflowRunner<W, A, S>
where
    W: Workflow,
    A: Adapter<Workflow = W>,
    S: crate::store::Store + Send + Sync + 'static,
{
    name: String,
    repo: Repository<W, S>,
    reader: Reader<S>,
    executor: ActionExecutor<A, S>,
    scheduler: DelayScheduler<W, S>,
    store: S,
    wf_id_rule: Option<WorkflowIdRule>,
    batch_size: u32,
    scaling_check_interval: u64,
    events_processed: u64,
    subscription_cache: HashMap<String, Vec<CachedSubscription>>,
    cache_initialized: bool,
}

impl<W, A, S> WorkflowRunner<W, A, S>
where
    W: Workflow,
    A: Adapter<Workflow = W>,
    S: crate::store::Store + Send + Sync + 'static,
{
    /// A single-partition runner (reader `{type}.0.of.1`), so growing to N
    /// partitions later is a plain [`rebalance`](crate::scaling::rebalance).
    pub fn new(
        store: S,
        repo: Repository<W, S>,
        executor: ActionExecutor<A, S>,
        scheduler: DelayScheduler<W, S>,
        config: &EngineConfig,
    ) -> Self {
        let name = make_reader_name(W::TYPE, 0, 1);
        Self::with_reader_name(store, repo, executor, scheduler, config, name, None)
    }

    /// A runner with an explicit reader name and no partition rule. The
    /// name must stay unique per process fleet; it owns the durable offset.
    pub fn named(
        store: S,
        repo: Repository<W, S>,
        executor: ActionExecutor<A, S>,
        scheduler: DelayScheduler<W, S>,
        config: &EngineConfig,
        name: impl Into<String>,
    ) -> Self {
        Self::with_reader_name(store, repo, executor, scheduler, config, name.into(), None)
    }

    /// A runner for one partition of the workflow type.
    pub fn for_partition(
        store: S,
        repo: Repository<W, S>,
        executor: ActionExecutor<A, S>,
        scheduler: DelayScheduler<W, S>,
        config: &EngineConfig,
        partition: &PartitionedRunnerConfig,
    ) -> Self {
        let total = partition.total_partitions;
        let index = partition.partition_index;
        let rule: WorkflowIdRule = Arc::new(move |workflow_id: &str| {
            crate::partition::partition_index(workflow_id, total) == index
        });
        Self::with_reader_name(
            store,
            repo,
            executor,
            scheduler,
            config,
            partition.reader_name.clone(),
            Some(rule),
        )
    }

    fn with_reader_name(
        store: S,
        repo: Repository<W, S>,
        executor: ActionExecutor<A, S>,
        scheduler: DelayScheduler<W, S>,
        config: &EngineConfig,
        name: String,
        wf_id_rule: Option<WorkflowIdRule>,
    ) -> Self {
        let reader = Reader::new(name.clone(), store.clone()).with_sleeper(
            crate::stream::Sleeper::new(
                config.reader_poll_interval,
                config.reader_max_poll_interval,
            ),
        );
        Self {
            name,
            repo,
            reader,
            executor,
            scheduler,
            store,
            wf_id_rule,
            batch_size: config.reader_batch_size,
            scaling_check_interval: config.scaling_check_interval,
            events_processed: 0,
            subscription_cache: HashMap::new(),
            cache_initialized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reader(&self) -> &Reader<S> {
        &self.reader
    }

    /// Load every subscription of this workflow type into memory.
    pub async fn load_subscription_cache(&mut self) -> Result<()> {
        let rows = self.store.subscriptions_for_type(W::TYPE).await?;
        self.subscription_cache.clear();
        let count = rows.len();
        for row in rows {
            self.insert_cached(row);
        }
        self.cache_initialized = true;
        info!(
            runner = %self.name,
            subscriptions = count,
            workflows = self.subscription_cache.len(),
            "Subscription cache loaded"
        );
        Ok(())
    }

    fn insert_cached(&mut self, row: SubscriptionRow) {
        self.subscription_cache
            .entry(row.workflow_id.as_str().to_owned())
            .or_default()
            .push(CachedSubscription {
                subscribed_to_workflow: row.subscribed_to_workflow,
                subscribed_to_event_type: row.subscribed_to_event_type,
                tags: row.tags,
                tags_all: row.tags_all,
            });
    }

    fn update_subscription_cache(&mut self, workflow_id: &WorkflowId, subs: &[crate::state::Sub]) {
        if !self.cache_initialized {
            return;
        }
        self.subscription_cache.remove(workflow_id.as_str());
        if subs.is_empty() {
            return;
        }
        let cached = subs
            .iter()
            .map(|sub| CachedSubscription {
                subscribed_to_workflow: sub.workflow_id.clone(),
                subscribed_to_event_type: sub.event_type.clone(),
                tags: sub.tags.clone(),
                tags_all: sub.tags_all.clone(),
            })
            .collect();
        self.subscription_cache
            .insert(workflow_id.as_str().to_owned(), cached);
    }

    fn owns(&self, workflow_id: &str) -> bool {
        self.wf_id_rule
            .as_ref()
            .map(|rule| rule(workflow_id))
            .unwrap_or(true)
    }

    /// An event of this runner's own type whose emitter it owns gets side
    /// effects here.
    fn to_be_act_on(&self, event: &ConsumedEvent) -> bool {
        event.workflow_type == W::TYPE && self.owns(event.workflow_id.as_str())
    }

    /// Workflows to re-inject this event into, as commands.
    fn workflows_to_notify(&self, event: &ConsumedEvent) -> Vec<String> {
        let mut out = BTreeSet::new();

        if event.workflow_type == W::TYPE
            && matches!(event.system_event(), Some(SystemEvent::DelayComplete { .. }))
        {
            // A completed delay resumes the delayed workflow itself.
            out.insert(event.workflow_id.as_str().to_owned());
        }

        for (workflow_id, subs) in &self.subscription_cache {
            if subs.iter().any(|sub| sub.matches_event(event)) {
                out.insert(workflow_id.clone());
            }
        }

        out.into_iter()
            .filter(|workflow_id| self.owns(workflow_id))
            .collect()
    }

    async fn handle_side_effects(&self, event: &ConsumedEvent) -> Result<()> {
        match event.system_event() {
            Some(SystemEvent::ActionCancel { event_numbers }) => {
                self.executor
                    .cancel_workflow_actions(&event.workflow_id, event_numbers.as_deref())
                    .await?;
                return Ok(());
            }
            Some(SystemEvent::Delay(spec)) => {
                self.scheduler
                    .register_delay(&event.workflow_id, &spec, event.event_no)
                    .await?;
            }
            Some(SystemEvent::ScheduleAdded { schedule }) => {
                self.scheduler
                    .register_schedule(&event.workflow_id, &schedule, event.event_no)
                    .await?;
            }
            Some(SystemEvent::ScheduleRemoved { delay_id }) => {
                self.scheduler
                    .cancel_schedule(&event.workflow_id, &delay_id)
                    .await?;
            }
            _ => {}
        }

        if self.executor.to_be_act_on(event) {
            self.executor.execute_action(event.clone()).await?;
        }
        Ok(())
    }

    /// Process one consumed event: side effects, then command re-injection.
    async fn handle_event(&mut self, event: &ConsumedEvent) -> Result<()> {
        if self.to_be_act_on(event) {
            self.handle_side_effects(event).await?;
        }

        let Some(cmd) = W::event_to_cmd(event) else {
            return Ok(());
        };
        for target in self.workflows_to_notify(event) {
            let target_id = WorkflowId::new(target);
            match self.repo.process_command(&target_id, &cmd).await {
                Ok(outcome) => {
                    self.update_subscription_cache(&target_id, &outcome.state.state.subscriptions);
                }
                Err(err) if err.is_expected_rejection() => {
                    debug!(
                        runner = %self.name,
                        target = %target_id,
                        source = %event.workflow_id,
                        event_no = event.event_no,
                        rejection = %err,
                        "Re-injected command rejected"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn check_scaling_operation(&mut self) -> Result<()> {
        if let Some(target) = self.store.active_scaling_target(W::TYPE).await? {
            info!(
                runner = %self.name,
                target_offset = target,
                "Scaling operation detected; runner will stop at target offset"
            );
            self.reader.set_stop_at_offset(Some(target));
        }
        Ok(())
    }

    /// Consume the stream until the shutdown signal flips (or a scaling
    /// operation stops the runner at its target offset). Finishes the
    /// current batch and commits before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.cache_initialized {
            self.load_subscription_cache().await?;
        }
        info!(runner = %self.name, workflow_type = W::TYPE, "Runner started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = self.reader.next_batch(self.batch_size).await?;
            let got_events = !batch.is_empty();

            self.events_processed += batch.len() as u64;
            if self.events_processed >= self.scaling_check_interval.max(1) {
                self.events_processed = 0;
                self.check_scaling_operation().await?;
            }
            let mut failed = false;

            for event in &batch {
                if let Err(err) = self.handle_event(event).await {
                    error!(
                        runner = %self.name,
                        global_id = event.global_id,
                        error = %err,
                        "Event processing failed; will retry from here"
                    );
                    // Do not advance past the failed event.
                    self.reader.rewind_to(event.global_id - 1);
                    failed = true;
                    break;
                }
            }

            let position = self.reader.position();
            if position > 0 {
                if let Err(err) = self.reader.commit(position).await {
                    // Offset conflict: another process owns this reader.
                    error!(runner = %self.name, error = %err, "Offset commit failed; aborting");
                    return Err(err);
                }
            }

            if self.reader.reached_stop_offset() {
                info!(runner = %self.name, "Reached scaling target offset; stopping");
                break;
            }

            if !got_events || failed {
                let backoff = self.reader.idle_backoff(false);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            } else {
                self.reader.idle_backoff(true);
            }
        }

        let position = self.reader.position();
        if position > 0 {
            if let Err(err) = self.reader.commit(position).await {
                warn!(runner = %self.name, error = %err, "Final offset commit failed");
            }
        }
        info!(runner = %self.name, "Runner stopped");
        Ok(())
    }

    /// Drain the stream until no more events match, without sleeping.
    /// Intended for tests and catch-up tooling.
    pub async fn run_until_idle(&mut self) -> Result<usize> {
        if !self.cache_initialized {
            self.load_subscription_cache().await?;
        }
        let mut processed = 0;
        loop {
            let batch = self.reader.next_batch(self.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            for event in &batch {
                self.handle_event(event).await?;
                processed += 1;
            }
            let position = self.reader.position();
            self.reader.commit(position).await?;
        }
        Ok(processed)
    }
}
