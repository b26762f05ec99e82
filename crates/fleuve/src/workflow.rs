//! Core workflow trait and identity types.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::event::WorkflowEvent;
use crate::state::WorkflowState;
use crate::stream::ConsumedEvent;

/// Pure workflow logic: decisions via [`Workflow::decide`], state
/// reconstruction via [`Workflow::evolve`].
///
/// Both functions must be deterministic with no side effects. Side effects
/// live in an [`Adapter`](crate::activity::Adapter) and run in the activity
/// executor; timers are expressed as `delay` system events.
///
/// The framework folds system events (lifecycle, subscriptions, schedules)
/// into the [`WorkflowState`] envelope before delegating domain events to
/// [`Workflow::evolve`], so user code never handles them.
///
/// # Example
///
/// ```ignore
/// impl Workflow for OrderWorkflow {
///     type State = OrderState;
///     type Command = OrderCommand;
///     type Event = OrderEvent;
///
///     const TYPE: &'static str = "order";
///
///     fn decide(
///         state: Option<&WorkflowState<OrderState>>,
///         cmd: &OrderCommand,
///     ) -> Result<Vec<WorkflowEvent<OrderEvent>>, Rejection> {
///         match (state, cmd) {
///             (None, OrderCommand::Place { items, total }) => Ok(vec![
///                 OrderEvent::Placed { items: items.clone(), total: *total }.into(),
///             ]),
///             (Some(s), OrderCommand::Pay { .. }) if s.data.paid => {
///                 Err(Rejection::new("already paid"))
///             }
///             (Some(_), OrderCommand::Pay { payment_id }) => Ok(vec![
///                 OrderEvent::PaymentReceived { payment_id: payment_id.clone() }.into(),
///             ]),
///             _ => Err(Rejection::new("invalid command for state")),
///         }
///     }
///
///     fn evolve(mut state: OrderState, event: &OrderEvent) -> OrderState {
///         match event {
///             OrderEvent::Placed { total, .. } => state.total = *total,
///             OrderEvent::PaymentReceived { .. } => state.paid = true,
///         }
///         state
///     }
///
///     fn event_to_cmd(event: &ConsumedEvent) -> Option<OrderCommand> {
///         event.delay_command()
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Domain state, reconstructed by folding domain events.
    ///
    /// Lives inside a [`WorkflowState`] envelope that carries lifecycle,
    /// subscriptions, and schedules.
    type State: Clone + Default + Serialize + DeserializeOwned + Send + Sync;

    /// Commands validated by [`Self::decide`]. Not persisted; only the
    /// resulting events are. Must be serializable so delays can carry a
    /// `next_command` payload.
    type Command: Serialize + DeserializeOwned + Send + Sync;

    /// Domain events recorded to the event store.
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Workflow type identifier. Events are partitioned and globally ordered
    /// per type; must be stable across deployments.
    const TYPE: &'static str;

    /// Schema version written on every appended event. Bump when evolving
    /// the event schema and migrate old payloads in [`Self::upcast`].
    const SCHEMA_VERSION: i32 = 1;

    /// Decide what happened given the current state and a command.
    ///
    /// `state` is `None` only while the workflow is being created. Returns
    /// the events to append (an empty vec is a no-op success) or a
    /// [`Rejection`], which the engine returns to the caller and never
    /// retries. System events ([`WorkflowEvent::System`]) may be mixed into
    /// the result to manage subscriptions, schedules, and delays.
    fn decide(
        state: Option<&WorkflowState<Self::State>>,
        cmd: &Self::Command,
    ) -> std::result::Result<Vec<WorkflowEvent<Self::Event>>, Rejection>;

    /// Fold one domain event into the domain state.
    ///
    /// Must be deterministic: the same events must always produce the same
    /// state. System events never reach this function.
    fn evolve(state: Self::State, event: &Self::Event) -> Self::State;

    /// Re-materialize a consumed event as a command for a subscribing
    /// workflow (or for this workflow itself, e.g. on `delay_complete`).
    ///
    /// The event may originate from another workflow type, so it is handed
    /// over in raw form; use [`ConsumedEvent::event`] or
    /// [`ConsumedEvent::delay_command`] for typed access. Returning `None`
    /// means the event does not translate into a command.
    fn event_to_cmd(event: &ConsumedEvent) -> Option<Self::Command>;

    /// True when this event terminates the workflow. Finished workflows are
    /// evicted from the state cache and report `NotFound` on further loads.
    fn is_final_event(_event: &Self::Event) -> bool {
        false
    }

    /// Migrate an event payload recorded under an older schema version to
    /// the current one. Runs during replay for every event whose stored
    /// `schema_version` is below [`Self::SCHEMA_VERSION`].
    fn upcast(
        _event_type: &str,
        _schema_version: i32,
        body: Value,
    ) -> std::result::Result<Value, UpcastError> {
        Ok(body)
    }
}

/// A failed event schema migration. Fatal for the affected workflow.
#[derive(Debug, Clone)]
pub struct UpcastError {
    pub reason: String,
}

impl UpcastError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for UpcastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for UpcastError {}

/// A business-level refusal returned by `decide`.
///
/// Rejections are ordinary outcomes, not faults: the engine returns them to
/// the caller and never retries them. Cooperating adapters rely on this to
/// make re-delivered events idempotent.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rejection {
    pub msg: String,
}

impl Rejection {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.msg)
    }
}

/// A workflow instance identifier (business key).
///
/// Use natural business keys (`ord-123`, `proj-7`) rather than synthetic
/// UUIDs; correlation and idempotency stay intuitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Create a new workflow ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
