//! System events and the event sum type emitted by `decide`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::state::{ScheduleSpec, Sub};

/// Event emitted from `decide`: either a user-defined domain event or a
/// framework [`SystemEvent`].
///
/// Both kinds land in the same append-only log, in the order `decide`
/// returned them. System events are folded by the framework's state
/// envelope; domain events are delegated to the workflow's `evolve`.
#[derive(Debug, Clone)]
pub enum WorkflowEvent<E> {
    /// A user-defined domain event.
    Domain(E),
    /// A framework event: lifecycle, subscription, or schedule bookkeeping.
    System(SystemEvent),
}

impl<E> WorkflowEvent<E> {
    /// Add a subscription to another workflow's events.
    pub fn subscribe(sub: Sub) -> Self {
        WorkflowEvent::System(SystemEvent::SubscriptionAdded { sub })
    }

    /// Remove a previously added subscription.
    pub fn unsubscribe(sub: Sub) -> Self {
        WorkflowEvent::System(SystemEvent::SubscriptionRemoved { sub })
    }

    /// Request a one-shot delay: `next_command` is dispatched back to this
    /// workflow once `delay_until` passes.
    ///
    /// `next_command` is the serialized form of the workflow's own command
    /// type (`serde_json::to_value`).
    pub fn delay(
        id: impl Into<String>,
        delay_until: OffsetDateTime,
        next_command: Value,
    ) -> Self {
        WorkflowEvent::System(SystemEvent::Delay(DelaySpec {
            id: id.into(),
            delay_until,
            next_command,
            cron_expression: None,
            timezone: None,
        }))
    }

    /// Request a recurring delay driven by a cron expression.
    ///
    /// `delay_until` is the first fire time; after each fire the scheduler
    /// re-enqueues at the next cron boundary computed from the current time
    /// in `timezone` (UTC when `None`).
    pub fn cron_delay(
        id: impl Into<String>,
        delay_until: OffsetDateTime,
        cron_expression: impl Into<String>,
        timezone: Option<String>,
        next_command: Value,
    ) -> Self {
        WorkflowEvent::System(SystemEvent::Delay(DelaySpec {
            id: id.into(),
            delay_until,
            next_command,
            cron_expression: Some(cron_expression.into()),
            timezone,
        }))
    }

    /// Register a cron schedule without an explicit first fire time; the
    /// scheduler computes the first boundary.
    pub fn add_schedule(schedule: ScheduleSpec) -> Self {
        WorkflowEvent::System(SystemEvent::ScheduleAdded { schedule })
    }

    /// Remove a recurring schedule by its delay id.
    pub fn remove_schedule(delay_id: impl Into<String>) -> Self {
        WorkflowEvent::System(SystemEvent::ScheduleRemoved {
            delay_id: delay_id.into(),
        })
    }

    /// Cancel this workflow's in-flight activities. `None` cancels all;
    /// otherwise only the listed event numbers are cancelled.
    pub fn cancel_actions(event_numbers: Option<Vec<i64>>) -> Self {
        WorkflowEvent::System(SystemEvent::ActionCancel { event_numbers })
    }
}

impl<E> From<E> for WorkflowEvent<E> {
    fn from(event: E) -> Self {
        WorkflowEvent::Domain(event)
    }
}

/// Framework-defined events with a closed set of `type` tags.
///
/// The tags are part of the on-disk format: readers and the state fold
/// recognize system events by `event_type` alone, without knowing the
/// workflow's domain event schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SystemEvent {
    /// Workflow paused externally; non-system commands are refused.
    #[serde(rename = "system_pause")]
    Pause {
        #[serde(default)]
        reason: String,
    },

    /// Workflow resumed after a pause.
    #[serde(rename = "system_resume")]
    Resume,

    /// Workflow cancelled externally. Clears pending schedules.
    #[serde(rename = "system_cancel")]
    Cancel {
        #[serde(default)]
        reason: String,
    },

    /// Emitted from `decide` to add a subscription. Updates state and the
    /// subscription table in the same transaction.
    #[serde(rename = "subscription_added")]
    SubscriptionAdded { sub: Sub },

    /// Emitted from `decide` to remove a subscription.
    #[serde(rename = "subscription_removed")]
    SubscriptionRemoved { sub: Sub },

    /// Emitted from `decide` to add a cron schedule.
    #[serde(rename = "schedule_added")]
    ScheduleAdded { schedule: ScheduleSpec },

    /// Emitted from `decide` to remove a cron schedule by id.
    #[serde(rename = "schedule_removed")]
    ScheduleRemoved { delay_id: String },

    /// A delay request. The runner registers it with the delay scheduler;
    /// a cron expression makes it recurring.
    #[serde(rename = "delay")]
    Delay(DelaySpec),

    /// Emitted by the delay scheduler when a delay expires. Workflows only
    /// receive this; they never emit it.
    #[serde(rename = "delay_complete")]
    DelayComplete {
        delay_id: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
        next_command: Value,
    },

    /// Cancel in-flight activities for this workflow. `None` or empty
    /// cancels all; otherwise only the listed event numbers.
    #[serde(rename = "action_cancel")]
    ActionCancel { event_numbers: Option<Vec<i64>> },
}

/// A delay request carried by the `delay` system event.
///
/// `id` is workflow-provided and scopes replacement: re-emitting a delay
/// with the same id supersedes the pending one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelaySpec {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub delay_until: OffsetDateTime,
    pub next_command: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// `type` tags reserved for [`SystemEvent`].
pub const SYSTEM_EVENT_TYPES: &[&str] = &[
    "system_pause",
    "system_resume",
    "system_cancel",
    "subscription_added",
    "subscription_removed",
    "schedule_added",
    "schedule_removed",
    "delay",
    "delay_complete",
    "action_cancel",
];

impl SystemEvent {
    /// The `type` tag this event serializes under.
    pub fn event_type(&self) -> &'static str {
        match self {
            SystemEvent::Pause { .. } => "system_pause",
            SystemEvent::Resume => "system_resume",
            SystemEvent::Cancel { .. } => "system_cancel",
            SystemEvent::SubscriptionAdded { .. } => "subscription_added",
            SystemEvent::SubscriptionRemoved { .. } => "subscription_removed",
            SystemEvent::ScheduleAdded { .. } => "schedule_added",
            SystemEvent::ScheduleRemoved { .. } => "schedule_removed",
            SystemEvent::Delay(_) => "delay",
            SystemEvent::DelayComplete { .. } => "delay_complete",
            SystemEvent::ActionCancel { .. } => "action_cancel",
        }
    }

    /// True when `event_type` belongs to the reserved system tag set.
    pub fn is_system_type(event_type: &str) -> bool {
        SYSTEM_EVENT_TYPES.contains(&event_type)
    }
}

/// Tags attached to a stored event: event-level tags set by the emitter and
/// workflow-level tags injected by the Repository at append time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflow_tags: Vec<String>,
}

impl EventMetadata {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.workflow_tags.is_empty()
    }
}
