//! State envelope, subscriptions, schedules, and the system-event fold.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{SystemEvent, WorkflowEvent};
use crate::workflow::Workflow;

/// Wildcard accepted by [`Sub`] for both `event_type` and `workflow_id`.
pub const WILDCARD: &str = "*";

/// Workflow lifecycle as driven by the pause/resume/cancel system events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Active,
    Paused,
    Cancelled,
}

/// A standing interest by one workflow in another's events.
///
/// `event_type` and `workflow_id` accept `"*"`. The optional tag filters
/// match against the union of the event's tags and the emitting workflow's
/// tags: `tags` requires ANY to match, `tags_all` requires ALL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sub {
    pub event_type: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags_all: Vec<String>,
}

impl Sub {
    /// Subscribe to `event_type` events emitted by `workflow_id`.
    pub fn new(event_type: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            workflow_id: workflow_id.into(),
            tags: Vec::new(),
            tags_all: Vec::new(),
        }
    }

    /// Require at least one of `tags` to be present on the event or its
    /// workflow.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Require every one of `tags` to be present on the event or its
    /// workflow.
    pub fn with_tags_all(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags_all = tags.into_iter().collect();
        self
    }

    /// Check whether this subscription matches an event identified by its
    /// emitter, type, and tag sets.
    pub fn matches(
        &self,
        source_workflow_id: &str,
        event_type: &str,
        event_tags: &[String],
        workflow_tags: &[String],
    ) -> bool {
        if self.workflow_id != WILDCARD && self.workflow_id != source_workflow_id {
            return false;
        }
        if self.event_type != WILDCARD && self.event_type != event_type {
            return false;
        }
        let has = |tag: &String| event_tags.contains(tag) || workflow_tags.contains(tag);
        if !self.tags.is_empty() && !self.tags.iter().any(has) {
            return false;
        }
        if !self.tags_all.is_empty() && !self.tags_all.iter().all(has) {
            return false;
        }
        true
    }
}

/// A recurring schedule recorded in workflow state. The state copy is the
/// source of truth; the scheduler's table row is derived bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub id: String,
    pub cron_expression: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub next_command: Value,
}

/// Framework envelope around the user-defined domain state.
///
/// Carries the attributes every workflow instance has regardless of domain:
/// lifecycle, subscriptions, and recurring schedules. The system-event fold
/// mutates these; domain events only ever touch `data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState<S> {
    pub lifecycle: Lifecycle,
    #[serde(default = "Vec::new")]
    pub subscriptions: Vec<Sub>,
    #[serde(default = "Vec::new")]
    pub schedules: Vec<ScheduleSpec>,
    pub data: S,
}

impl<S: Default> WorkflowState<S> {
    fn apply_system(&mut self, event: &SystemEvent) {
        match event {
            SystemEvent::Pause { .. } => self.lifecycle = Lifecycle::Paused,
            SystemEvent::Resume => self.lifecycle = Lifecycle::Active,
            SystemEvent::Cancel { .. } => {
                self.lifecycle = Lifecycle::Cancelled;
                self.schedules.clear();
            }
            SystemEvent::SubscriptionAdded { sub } => self.subscriptions.push(sub.clone()),
            SystemEvent::SubscriptionRemoved { sub } => {
                self.subscriptions.retain(|s| s != sub);
            }
            SystemEvent::ScheduleAdded { schedule } => {
                self.schedules.retain(|s| s.id != schedule.id);
                self.schedules.push(schedule.clone());
            }
            SystemEvent::ScheduleRemoved { delay_id } => {
                self.schedules.retain(|s| s.id != *delay_id);
            }
            SystemEvent::Delay(spec) => {
                if let Some(cron) = &spec.cron_expression {
                    self.schedules.retain(|s| s.id != spec.id);
                    self.schedules.push(ScheduleSpec {
                        id: spec.id.clone(),
                        cron_expression: cron.clone(),
                        timezone: spec.timezone.clone(),
                        next_command: spec.next_command.clone(),
                    });
                }
            }
            SystemEvent::DelayComplete { .. } | SystemEvent::ActionCancel { .. } => {}
        }
    }
}

/// Fold one event into the state envelope: system events first, then the
/// user's `evolve` for domain events.
pub fn fold_event<W: Workflow>(
    state: Option<WorkflowState<W::State>>,
    event: &WorkflowEvent<W::Event>,
) -> WorkflowState<W::State> {
    let mut state = state.unwrap_or_default();
    match event {
        WorkflowEvent::System(sys) => state.apply_system(sys),
        WorkflowEvent::Domain(ev) => {
            state.data = W::evolve(std::mem::take(&mut state.data), ev);
        }
    }
    state
}

/// Fold a sequence of events, creating the envelope on the first one.
pub fn fold_events<W: Workflow>(
    state: Option<WorkflowState<W::State>>,
    events: &[WorkflowEvent<W::Event>],
) -> Option<WorkflowState<W::State>> {
    let mut state = state;
    for event in events {
        state = Some(fold_event::<W>(state, event));
    }
    state
}
