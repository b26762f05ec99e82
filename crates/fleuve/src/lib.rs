//! Durable, event-sourced workflow engine.
//!
//! Fleuve workflows accept *commands*, emit *events* persisted to an
//! append-only log, and derive *state* by folding events:
//!
//! - **Pure functional core** — [`Workflow::decide`] and [`Workflow::evolve`]
//!   are deterministic with no side effects
//! - **Event sourcing** — state is reconstructed by replaying events, with
//!   snapshots and safe truncation for long-lived instances
//! - **Side effects as activities** — adapters run against the stream with
//!   retries, checkpoints, timeouts, and a dead-letter queue
//! - **Timers** — one-shot and cron delays re-inject commands when they fire
//! - **Horizontal scale** — workflow ids hash-partition across runner
//!   processes; offsets migrate on resize
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Repository<W, S>                              │
//! │                                                                      │
//! │   1. Acquire per-workflow lock (unit of work)                        │
//! │   2. Load state: cache, else snapshot + replay (upcasting)           │
//! │   3. decide(state, cmd) → events | rejection                         │
//! │   4. Fold events (system wrapper, then user evolve)                  │
//! │   5. Append events + subscriptions + snapshot + sync-db atomically   │
//! │   6. CAS the state cache                                             │
//! └──────────────────────────────────────────────────────────────────────┘
//!            │ global event stream (per workflow type)
//!            ▼
//!   Reader ──► WorkflowRunner ──► event_to_cmd ──► Repository
//!       │            │
//!       │            └──► ActionExecutor (adapters, retries, checkpoints)
//!       └──► DelayScheduler (one-shot + cron) / TruncationService
//! ```
//!
//! # Example
//!
//! ```ignore
//! use fleuve::{
//!     EngineConfig, MemoryStateCache, Rejection, Workflow, WorkflowEngine,
//!     WorkflowEvent, WorkflowId, WorkflowState, store::MemoryStore,
//! };
//!
//! struct OrderWorkflow;
//!
//! impl Workflow for OrderWorkflow {
//!     type State = OrderState;
//!     type Command = OrderCommand;
//!     type Event = OrderEvent;
//!
//!     const TYPE: &'static str = "order";
//!
//!     fn decide(
//!         state: Option<&WorkflowState<OrderState>>,
//!         cmd: &OrderCommand,
//!     ) -> Result<Vec<WorkflowEvent<OrderEvent>>, Rejection> {
//!         // pure business logic
//!         # unimplemented!()
//!     }
//!
//!     fn evolve(state: OrderState, event: &OrderEvent) -> OrderState {
//!         # unimplemented!()
//!     }
//!
//!     fn event_to_cmd(event: &fleuve::ConsumedEvent) -> Option<OrderCommand> {
//!         event.delay_command()
//!     }
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `postgres` (default) — enables [`store::PgStore`] for production use

pub mod activity;
mod cache;
mod config;
pub mod delay;
mod error;
mod event;
pub mod partition;
mod repository;
mod runner;
mod runtime;
pub mod scaling;
mod state;
pub mod store;
mod stream;
mod truncation;
mod workflow;

pub use activity::{
    ActionContext, ActionEmitter, ActionExecutor, Adapter, BackoffStrategy, RetryPolicy,
};
pub use cache::{CachedState, MemoryStateCache, StateCache};
pub use config::EngineConfig;
pub use delay::DelayScheduler;
pub use error::{Error, Result};
pub use event::{DelaySpec, EventMetadata, SYSTEM_EVENT_TYPES, SystemEvent, WorkflowEvent};
pub use partition::{
    PartitionedRunnerConfig, create_partitioned_configs, make_partition_predicate,
    make_reader_name, partition_index,
};
pub use repository::{CommandOutcome, Repository, StoredState, SyncDbHook};
pub use runner::{WorkflowIdRule, WorkflowRunner};
pub use runtime::WorkflowEngine;
pub use scaling::{RebalanceReport, rebalance};
pub use state::{Lifecycle, ScheduleSpec, Sub, WILDCARD, WorkflowState, fold_event, fold_events};
pub use store::MemoryStore;
#[cfg(feature = "postgres")]
pub use store::PgStore;
pub use stream::{ConsumedEvent, EventPredicate, Reader, Sleeper};
pub use truncation::TruncationService;
pub use workflow::{Rejection, UpcastError, Workflow, WorkflowId};
