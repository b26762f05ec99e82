//! Adapter contract: user side-effects driven by the activity executor.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::activity::RetryPolicy;
use crate::stream::ConsumedEvent;
use crate::workflow::{Workflow, WorkflowId};

/// Context for one activity attempt, carrying the checkpoint restored from
/// previous attempts.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub workflow_id: WorkflowId,
    pub event_number: i64,
    /// Checkpoint map merged across attempts; restored on retry and
    /// takeover.
    pub checkpoint: Map<String, Value>,
    /// Failures so far (0 on the first attempt).
    pub retry_count: u32,
    pub retry_policy: RetryPolicy,
}

/// An item yielded from `act_on` to the executor.
#[derive(Debug)]
pub enum ActionItem<C> {
    /// A command to apply to the same workflow through the Repository.
    Command(C),
    /// Checkpoint data merged into the activity record; persisted
    /// immediately when `save_now`, otherwise at the end of the run.
    Checkpoint {
        data: Map<String, Value>,
        save_now: bool,
    },
    /// The remainder of the action must finish within `seconds`; exceeding
    /// it fails the attempt, subject to the retry policy.
    Timeout { seconds: f64 },
}

/// The action was aborted by the executor (timeout or cancellation); the
/// adapter should unwind.
#[derive(Debug)]
pub struct ActionAborted;

impl std::fmt::Display for ActionAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("action aborted by executor")
    }
}

impl std::error::Error for ActionAborted {}

/// Yield channel handed to `act_on`.
///
/// The executor drives the adapter future and this channel concurrently, so
/// yielded commands are applied while the adapter keeps running. Sends fail
/// with [`ActionAborted`] once the executor has given up on the attempt.
pub struct ActionEmitter<C> {
    tx: mpsc::Sender<ActionItem<C>>,
}

impl<C> ActionEmitter<C> {
    pub(crate) fn new(tx: mpsc::Sender<ActionItem<C>>) -> Self {
        Self { tx }
    }

    /// Yield a command; the executor applies it to the same workflow via
    /// `process_command`. Rejections that mean "already handled" count as
    /// success, which is what makes re-delivered events idempotent.
    pub async fn command(&self, cmd: C) -> Result<(), ActionAborted> {
        self.tx
            .send(ActionItem::Command(cmd))
            .await
            .map_err(|_| ActionAborted)
    }

    /// Merge `data` into the checkpoint; persisted at the end of the run.
    pub async fn checkpoint(&self, data: Map<String, Value>) -> Result<(), ActionAborted> {
        self.tx
            .send(ActionItem::Checkpoint {
                data,
                save_now: false,
            })
            .await
            .map_err(|_| ActionAborted)
    }

    /// Merge `data` into the checkpoint and persist it immediately, so a
    /// crash after this point resumes from here.
    pub async fn checkpoint_now(&self, data: Map<String, Value>) -> Result<(), ActionAborted> {
        self.tx
            .send(ActionItem::Checkpoint {
                data,
                save_now: true,
            })
            .await
            .map_err(|_| ActionAborted)
    }

    /// Bound the remainder of this action to `seconds` of wall-clock time.
    pub async fn timeout(&self, seconds: f64) -> Result<(), ActionAborted> {
        self.tx
            .send(ActionItem::Timeout { seconds })
            .await
            .map_err(|_| ActionAborted)
    }
}

/// User code defining which events trigger activities and what they do.
///
/// `act_on` has at-least-once semantics: a retry after partial success
/// re-runs the body with the saved checkpoint, and commands it emits again
/// are rejected by `decide` as already handled. Design adapter side effects
/// to be idempotent (checkpoints and the `(workflow, event)` identity are
/// the tools for that).
///
/// # Example
///
/// ```ignore
/// #[async_trait]
/// impl Adapter for OrderAdapter {
///     type Workflow = OrderWorkflow;
///     type Error = anyhow::Error;
///
///     fn to_be_act_on(&self, event: &ConsumedEvent) -> bool {
///         event.event_type == "OrderPlaced"
///     }
///
///     async fn act_on(
///         &self,
///         event: &ConsumedEvent,
///         ctx: &ActionContext,
///         emit: &ActionEmitter<OrderCommand>,
///     ) -> anyhow::Result<()> {
///         if !ctx.checkpoint.contains_key("charged") {
///             let charge = self.payments.charge(event.workflow_id.as_str()).await?;
///             emit.checkpoint_now(map!{"charged" => charge.id}).await?;
///         }
///         emit.timeout(30.0).await?;
///         emit.command(OrderCommand::MarkBilled).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// The workflow whose events this adapter acts on.
    type Workflow: Workflow;

    /// Error type for failed attempts. `Display` feeds the activity record
    /// and the dead-letter queue.
    type Error: std::fmt::Display + Send + 'static;

    /// Filter deciding which events trigger an activity.
    fn to_be_act_on(&self, event: &ConsumedEvent) -> bool;

    /// Run the side effect for `event`, yielding commands, checkpoints, and
    /// timeouts through `emit`.
    async fn act_on(
        &self,
        event: &ConsumedEvent,
        ctx: &ActionContext,
        emit: &ActionEmitter<<Self::Workflow as Workflow>::Command>,
    ) -> Result<(), Self::Error>;

    /// Called once when an activity exhausts its retries and is
    /// dead-lettered.
    async fn on_action_failed(
        &self,
        _workflow_id: &WorkflowId,
        _event_number: i64,
        _error: &str,
    ) {
    }
}
