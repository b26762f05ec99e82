//! Engine assembly: one workflow type's long-running tasks under a shared
//! shutdown signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{Instrument, Span, info, warn};

use crate::activity::{ActionExecutor, Adapter};
use crate::cache::StateCache;
use crate::config::EngineConfig;
use crate::delay::DelayScheduler;
use crate::error::Result;
use crate::partition::PartitionedRunnerConfig;
use crate::repository::Repository;
use crate::runner::WorkflowRunner;
use crate::store::Store;
use crate::truncation::TruncationService;
use crate::workflow::Workflow;

/// One workflow type's engine: repository, runner, activity executor with
/// its recovery loop, delay scheduler, and (optionally) the truncator.
///
/// # Example
///
/// ```ignore
/// let engine = WorkflowEngine::<OrderWorkflow, _, _>::new(
///     store,
///     Arc::new(MemoryStateCache::new()),
///     OrderAdapter::new(clients),
///     EngineConfig { snapshot_interval: 100, ..Default::default() },
/// );
/// let repo = engine.repository().clone();
/// engine.run(async { signal::ctrl_c().await.ok(); }).await?;
/// ```
pub struct WorkflowEngine<W, A, S>
where
    W: Workflow,
    A: Adapter<Workflow = W>,
    S: Store + Send + Sync + 'static,
{
    repo: Repository<W, S>,
    runner: WorkflowRunner<W, A, S>,
    executor: ActionExecutor<A, S>,
    scheduler: DelayScheduler<W, S>,
    truncator: Option<TruncationService<S>>,
    shutdown_timeout: Duration,
    enable_tracing: bool,
}

impl<W, A, S> WorkflowEngine<W, A, S>
where
    W: Workflow,
    A: Adapter<Workflow = W>,
    S: Store + Send + Sync + 'static,
{
    /// Assemble a single-partition engine.
    pub fn new(store: S, cache: Arc<dyn StateCache>, adapter: A, config: EngineConfig) -> Self {
        Self::assemble(store, cache, adapter, config, None)
    }

    /// Assemble an engine running one partition of the workflow type.
    pub fn for_partition(
        store: S,
        cache: Arc<dyn StateCache>,
        adapter: A,
        config: EngineConfig,
        partition: PartitionedRunnerConfig,
    ) -> Self {
        Self::assemble(store, cache, adapter, config, Some(partition))
    }

    fn assemble(
        store: S,
        cache: Arc<dyn StateCache>,
        adapter: A,
        config: EngineConfig,
        partition: Option<PartitionedRunnerConfig>,
    ) -> Self {
        let repo = Repository::<W, S>::new(store.clone(), cache).with_config(&config);
        let executor = ActionExecutor::new(store.clone(), repo.clone(), adapter)
            .with_config(&config);
        let executor = match &partition {
            Some(partition) => executor.with_runner_id(partition.reader_name.clone()),
            None => executor.with_runner_id(format!("{}-{}", W::TYPE, uuid::Uuid::new_v4())),
        };
        let scheduler = DelayScheduler::new(store.clone(), repo.clone()).with_config(&config);
        let runner = match &partition {
            Some(partition) => WorkflowRunner::for_partition(
                store.clone(),
                repo.clone(),
                executor.clone(),
                scheduler.clone(),
                &config,
                partition,
            ),
            None => WorkflowRunner::new(
                store.clone(),
                repo.clone(),
                executor.clone(),
                scheduler.clone(),
                &config,
            ),
        };
        let truncator = config.enable_truncation.then(|| {
            TruncationService::new(store, W::TYPE).with_config(&config)
        });
        Self {
            repo,
            runner,
            executor,
            scheduler,
            truncator,
            shutdown_timeout: Duration::from_secs(30),
            enable_tracing: config.enable_tracing,
        }
    }

    /// Maximum time to wait for tasks to drain after the shutdown signal.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The command entry point for in-process callers.
    pub fn repository(&self) -> &Repository<W, S> {
        &self.repo
    }

    /// The executor handle, for dead-letter inspection and manual retry.
    pub fn executor(&self) -> &ActionExecutor<A, S> {
        &self.executor
    }

    /// Run every task until `shutdown` completes, then drain.
    ///
    /// Each task finishes its in-flight unit (batch, attempt, delay fire)
    /// and commits progress before exiting; after the shutdown timeout the
    /// engine stops waiting.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Spans at the engine's task boundaries; no-ops unless a subscriber
        // is installed and tracing is enabled.
        let span = if self.enable_tracing {
            tracing::info_span!("fleuve_engine", workflow_type = W::TYPE)
        } else {
            Span::none()
        };

        info!(workflow_type = W::TYPE, "Engine starting");
        let mut handles = Vec::new();

        let runner = self.runner;
        let runner_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(
            async move {
                if let Err(err) = runner.run(runner_rx).await {
                    warn!(error = %err, "Runner exited with error");
                }
            }
            .instrument(span.clone()),
        ));

        let scheduler = self.scheduler;
        let scheduler_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(
            scheduler.run(scheduler_rx).instrument(span.clone()),
        ));

        let recovery = self.executor.clone();
        let recovery_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(
            recovery.run_recovery_loop(recovery_rx).instrument(span.clone()),
        ));

        if let Some(truncator) = self.truncator {
            let truncator_rx = shutdown_rx.clone();
            handles.push(tokio::spawn(
                truncator.run(truncator_rx).instrument(span.clone()),
            ));
        }

        shutdown.await;
        let _ = shutdown_tx.send(true);

        let all_tasks = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        match tokio::time::timeout(self.shutdown_timeout, all_tasks).await {
            Ok(()) => info!(workflow_type = W::TYPE, "Engine stopped gracefully"),
            Err(_) => warn!(
                workflow_type = W::TYPE,
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Shutdown timeout exceeded, forcing stop"
            ),
        }
        self.executor.drain(self.shutdown_timeout).await;

        Ok(())
    }
}
