//! Pull-based event stream reader with a durable per-reader offset.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::Result;
use crate::event::{EventMetadata, SystemEvent};
use crate::store::{EventRecord, EventStore, OffsetStore};
use crate::workflow::WorkflowId;

/// Adaptive sleep between polls: doubles while the log is quiet, resets to
/// the minimum as soon as a poll yields events.
#[derive(Debug, Clone)]
pub struct Sleeper {
    min_sleep: Duration,
    max_sleep: Duration,
    next_sleep: Duration,
}

impl Sleeper {
    pub fn new(min_sleep: Duration, max_sleep: Duration) -> Self {
        Self {
            min_sleep,
            max_sleep,
            next_sleep: min_sleep,
        }
    }

    /// Record whether the last poll made progress and return the sleep to
    /// take before the next one.
    pub fn mark_got_events(&mut self, got_events: bool) -> Duration {
        if got_events {
            self.next_sleep = self.min_sleep;
        } else {
            self.next_sleep = (self.next_sleep * 2).min(self.max_sleep);
        }
        self.next_sleep
    }

    pub async fn sleep(&mut self, got_events: bool) {
        let duration = self.mark_got_events(got_events);
        tokio::time::sleep(duration).await;
    }
}

/// An event pulled from the log, with lazy typed access to the body.
///
/// The body stays raw JSON because a reader sees events of foreign workflow
/// types (via subscriptions); consumers deserialize on demand.
#[derive(Debug, Clone)]
pub struct ConsumedEvent {
    pub workflow_id: WorkflowId,
    pub workflow_type: String,
    pub event_type: String,
    /// The event's `workflow_version`.
    pub event_no: i64,
    pub global_id: i64,
    pub at: OffsetDateTime,
    pub metadata: EventMetadata,
    pub reader_name: Option<String>,
    body: Value,
}

impl ConsumedEvent {
    pub fn from_record(record: EventRecord, reader_name: Option<String>) -> Self {
        Self {
            workflow_id: record.workflow_id,
            workflow_type: record.workflow_type,
            event_type: record.event_type,
            event_no: record.workflow_version,
            global_id: record.global_id,
            at: record.created_at,
            metadata: record.metadata,
            reader_name,
            body: record.body,
        }
    }

    /// The raw event body.
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Deserialize the body as `T`.
    pub fn event<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// True when `event_type` belongs to the framework's reserved tag set.
    pub fn is_system(&self) -> bool {
        SystemEvent::is_system_type(&self.event_type)
    }

    /// Parse the body as a [`SystemEvent`], if this is one.
    pub fn system_event(&self) -> Option<SystemEvent> {
        if !self.is_system() {
            return None;
        }
        serde_json::from_value(self.body.clone()).ok()
    }

    /// For `delay_complete` events: the embedded `next_command`, typed.
    pub fn delay_command<C: DeserializeOwned>(&self) -> Option<C> {
        match self.system_event()? {
            SystemEvent::DelayComplete { next_command, .. } => {
                serde_json::from_value(next_command).ok()
            }
            _ => None,
        }
    }
}

/// Predicate deciding whether any consumer of a reader cares about an event.
pub type EventPredicate = Arc<dyn Fn(&EventRecord) -> bool + Send + Sync>;

/// A long-lived cursor over the event log.
///
/// Delivery is at-least-once: the reader re-delivers everything after the
/// last committed offset on restart. A reader name has exactly one owner at
/// a time; a second claimant is detected through the offset write conflict
/// and aborts.
pub struct Reader<S> {
    name: String,
    store: S,
    event_types: Option<Vec<String>>,
    predicate: Option<EventPredicate>,
    position: Option<i64>,
    committed: Option<i64>,
    stop_at_offset: Option<i64>,
    sleeper: Sleeper,
}

impl<S> Reader<S>
where
    S: EventStore + OffsetStore,
{
    pub fn new(name: impl Into<String>, store: S) -> Self {
        Self {
            name: name.into(),
            store,
            event_types: None,
            predicate: None,
            position: None,
            committed: None,
            stop_at_offset: None,
            sleeper: Sleeper::new(Duration::from_millis(100), Duration::from_secs(20)),
        }
    }

    /// Restrict the scan to the given event types (store-side filter).
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Filter fetched events with a predicate. Filtered events still advance
    /// the scan position, so they are not re-delivered.
    pub fn with_predicate(mut self, predicate: EventPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch the next batch of matching events with `global_id` above the
    /// current position, ascending, up to `max`.
    pub async fn next_batch(&mut self, max: u32) -> Result<Vec<ConsumedEvent>> {
        let after = match self.position {
            Some(position) => position,
            None => {
                let offset = self.store.load_offset(&self.name).await?;
                self.committed = Some(offset);
                self.position = Some(offset);
                offset
            }
        };

        let records = self
            .store
            .fetch_events_since(after, max, self.event_types.as_deref())
            .await?;
        if let Some(last) = records.last() {
            self.position = Some(last.global_id);
        }

        let events = records
            .into_iter()
            .filter(|record| {
                self.predicate
                    .as_ref()
                    .map(|predicate| predicate(record))
                    .unwrap_or(true)
            })
            .map(|record| ConsumedEvent::from_record(record, Some(self.name.clone())))
            .collect();
        Ok(events)
    }

    /// The scan horizon: the highest `global_id` this reader has looked at.
    pub fn position(&self) -> i64 {
        self.position.unwrap_or(0)
    }

    /// Persist the offset durably. Offsets only move forward; committing a
    /// smaller value than already stored means another process owns this
    /// reader and surfaces as a `Configuration` error.
    pub async fn commit(&mut self, last_global_id: i64) -> Result<()> {
        if self.committed.map(|c| c >= last_global_id).unwrap_or(false) {
            return Ok(());
        }
        self.store.commit_offset(&self.name, last_global_id).await?;
        self.committed = Some(last_global_id);
        debug!(reader = %self.name, offset = last_global_id, "Offset committed");
        Ok(())
    }

    /// The durable committed offset.
    pub async fn current_offset(&self) -> Result<i64> {
        match self.committed {
            Some(committed) => Ok(committed),
            None => self.store.load_offset(&self.name).await,
        }
    }

    /// Highest `global_id` in the log, for lag reporting.
    pub async fn max_observed(&self) -> Result<i64> {
        self.store.max_global_id().await
    }

    /// Ask the reader to stop once it has scanned up to `offset` (used by
    /// scaling operations for a clean, synchronized stop).
    pub fn set_stop_at_offset(&mut self, offset: Option<i64>) {
        self.stop_at_offset = offset;
        if let Some(offset) = offset {
            info!(reader = %self.name, offset, "Reader will stop at offset");
        }
    }

    /// True once the scan position reached the stop offset.
    pub fn reached_stop_offset(&self) -> bool {
        match (self.stop_at_offset, self.position) {
            (Some(stop), Some(position)) => position >= stop,
            _ => false,
        }
    }

    /// Rewind the scan position so events after `global_id` are fetched
    /// again. Used when processing fails mid-batch and must be retried.
    pub fn rewind_to(&mut self, global_id: i64) {
        self.position = Some(global_id);
    }

    /// Back off after an empty poll; resets on progress.
    pub async fn idle_sleep(&mut self, got_events: bool) {
        self.sleeper.sleep(got_events).await;
    }

    /// The next backoff duration without sleeping (for select-based loops).
    pub fn idle_backoff(&mut self, got_events: bool) -> Duration {
        self.sleeper.mark_got_events(got_events)
    }
}
