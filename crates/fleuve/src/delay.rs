//! Delay scheduler: fires due delay schedules and re-enqueues cron rows.

use std::str::FromStr;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::event::{DelaySpec, EventMetadata, SystemEvent};
use crate::repository::Repository;
use crate::state::ScheduleSpec;
use crate::store::{DelayScheduleRecord, EventStore, NewEvent, ScheduleStore};
use crate::workflow::{Workflow, WorkflowId};

/// Fires `delay_complete` events when delay schedules expire.
///
/// One-shot rows are deleted on fire; cron rows are moved to the next fire
/// time computed from *now* in the row's timezone, so downtime never
/// stampedes: each visit to a row fires at most once.
pub struct DelayScheduler<W, S>
where
    W: Workflow,
    S: EventStore + ScheduleStore + Clone,
{
    store: S,
    repo: Repository<W, S>,
    poll_interval: Duration,
    batch_size: u32,
}

impl<W, S> Clone for DelayScheduler<W, S>
where
    W: Workflow,
    S: EventStore + ScheduleStore + Clone,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            repo: self.repo.clone(),
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
        }
    }
}

impl<W, S> DelayScheduler<W, S>
where
    W: Workflow,
    S: EventStore + ScheduleStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: S, repo: Repository<W, S>) -> Self {
        Self {
            store,
            repo,
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.poll_interval = config.delay_poll_interval;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Record a delay emitted as a `delay` event. A pending delay with the
    /// same `(workflow_id, id)` is replaced.
    pub async fn register_delay(
        &self,
        workflow_id: &WorkflowId,
        spec: &DelaySpec,
        event_version: i64,
    ) -> Result<()> {
        self.store
            .register_delay(DelayScheduleRecord {
                workflow_id: workflow_id.clone(),
                delay_id: spec.id.clone(),
                workflow_type: W::TYPE.to_owned(),
                delay_until: spec.delay_until,
                event_version,
                next_command: spec.next_command.clone(),
                cron_expression: spec.cron_expression.clone(),
                timezone: spec.timezone.clone(),
                created_at: OffsetDateTime::now_utc(),
            })
            .await?;
        info!(
            workflow_id = %workflow_id,
            delay_id = %spec.id,
            delay_until = %spec.delay_until,
            "Registered delay"
        );
        Ok(())
    }

    /// Record a cron schedule emitted as a `schedule_added` event; the first
    /// fire time is the next cron boundary from now.
    pub async fn register_schedule(
        &self,
        workflow_id: &WorkflowId,
        schedule: &ScheduleSpec,
        event_version: i64,
    ) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let Some(first_fire) = next_cron_fire(
            &schedule.cron_expression,
            schedule.timezone.as_deref(),
            now,
        )?
        else {
            warn!(
                workflow_id = %workflow_id,
                delay_id = %schedule.id,
                "Cron expression never fires; schedule not registered"
            );
            return Ok(());
        };
        self.store
            .register_delay(DelayScheduleRecord {
                workflow_id: workflow_id.clone(),
                delay_id: schedule.id.clone(),
                workflow_type: W::TYPE.to_owned(),
                delay_until: first_fire,
                event_version,
                next_command: schedule.next_command.clone(),
                cron_expression: Some(schedule.cron_expression.clone()),
                timezone: schedule.timezone.clone(),
                created_at: now,
            })
            .await
    }

    /// Drop a schedule row (emitted `schedule_removed`).
    pub async fn cancel_schedule(&self, workflow_id: &WorkflowId, delay_id: &str) -> Result<()> {
        self.store.remove_delay(workflow_id, delay_id).await
    }

    /// One scan: fire every due schedule. Returns the number fired.
    pub async fn check_and_fire(&self) -> Result<usize> {
        let now = OffsetDateTime::now_utc();
        let due = self
            .store
            .due_schedules(W::TYPE, now, self.batch_size)
            .await?;
        let mut fired = 0;
        for schedule in due {
            match self.fire(schedule).await {
                Ok(()) => fired += 1,
                Err(err) => {
                    error!(error = %err, "Error firing delay schedule");
                }
            }
        }
        Ok(fired)
    }

    /// Fire one schedule: atomically append `delay_complete` and retire or
    /// reschedule the row, then dispatch `next_command` through the
    /// Repository.
    async fn fire(&self, schedule: DelayScheduleRecord) -> Result<()> {
        let workflow_id = schedule.workflow_id.clone();
        let now = OffsetDateTime::now_utc();

        let mut uow = self.store.begin(W::TYPE, &workflow_id).await?;
        let version = uow.current_version().await?;
        if version == 0 {
            warn!(
                workflow_id = %workflow_id,
                delay_id = %schedule.delay_id,
                "Cannot fire delay: workflow has no events"
            );
            uow.remove_delay(&schedule.delay_id).await?;
            uow.commit().await?;
            return Ok(());
        }

        let event = SystemEvent::DelayComplete {
            delay_id: schedule.delay_id.clone(),
            at: now,
            next_command: schedule.next_command.clone(),
        };
        uow.append_events(version, vec![NewEvent {
            event_type: event.event_type().to_owned(),
            schema_version: W::SCHEMA_VERSION,
            body: serde_json::to_value(&event)?,
            metadata: EventMetadata::default(),
        }])
        .await?;

        match &schedule.cron_expression {
            Some(expression) => {
                match next_cron_fire(expression, schedule.timezone.as_deref(), now) {
                    Ok(Some(next)) => {
                        uow.reschedule_delay(&schedule.delay_id, next).await?;
                        debug!(
                            workflow_id = %workflow_id,
                            delay_id = %schedule.delay_id,
                            next_fire = %next,
                            "Cron schedule re-enqueued"
                        );
                    }
                    Ok(None) => uow.remove_delay(&schedule.delay_id).await?,
                    Err(err) => {
                        warn!(
                            workflow_id = %workflow_id,
                            delay_id = %schedule.delay_id,
                            error = %err,
                            "Dropping schedule with invalid cron expression"
                        );
                        uow.remove_delay(&schedule.delay_id).await?;
                    }
                }
            }
            None => uow.remove_delay(&schedule.delay_id).await?,
        }

        uow.commit().await?;
        self.repo.invalidate_cache(&workflow_id).await;
        info!(
            workflow_id = %workflow_id,
            delay_id = %schedule.delay_id,
            version = version + 1,
            "Delay fired"
        );

        match serde_json::from_value::<W::Command>(schedule.next_command.clone()) {
            Ok(cmd) => match self.repo.process_command(&workflow_id, &cmd).await {
                Ok(_) => {}
                Err(err) if err.is_expected_rejection() => {
                    debug!(
                        workflow_id = %workflow_id,
                        rejection = %err,
                        "Delayed command rejected"
                    );
                }
                // The delay_complete event is durable; the runner will
                // still deliver it, so a dispatch failure is not fatal.
                Err(err) => {
                    warn!(
                        workflow_id = %workflow_id,
                        error = %err,
                        "Dispatch of delayed command failed"
                    );
                }
            },
            Err(err) => {
                warn!(
                    workflow_id = %workflow_id,
                    error = %err,
                    "Stored next_command no longer decodes as a command"
                );
            }
        }

        Ok(())
    }

    /// Scan loop: fires due schedules, then sleeps until the soonest
    /// pending fire time or the poll interval, whichever comes first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(workflow_type = W::TYPE, "Delay scheduler started");
        loop {
            if let Err(err) = self.check_and_fire().await {
                error!(error = %err, "Error in delay scheduler loop");
            }

            let sleep = match self.store.next_fire_at(W::TYPE).await {
                Ok(Some(next)) => {
                    let until = next - OffsetDateTime::now_utc();
                    let until = Duration::try_from(until).unwrap_or(Duration::ZERO);
                    until.min(self.poll_interval)
                }
                _ => self.poll_interval,
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(workflow_type = W::TYPE, "Delay scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Accept standard five-field cron by prepending a seconds field.
fn normalize_cron(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_owned()
    }
}

/// Next fire time strictly after `now`, in the schedule's timezone.
///
/// Unknown timezone names fall back to UTC. Stepping from `now` rather than
/// the previous fire is what bounds a cron to one fire per visit regardless
/// of downtime.
pub fn next_cron_fire(
    expression: &str,
    timezone: Option<&str>,
    now: OffsetDateTime,
) -> Result<Option<OffsetDateTime>> {
    let schedule = cron::Schedule::from_str(&normalize_cron(expression)).map_err(|err| {
        Error::Configuration(format!("invalid cron expression {expression}: {err}"))
    })?;
    let tz: chrono_tz::Tz = timezone
        .unwrap_or("UTC")
        .parse()
        .unwrap_or(chrono_tz::UTC);
    let now_tz = chrono::DateTime::from_timestamp(now.unix_timestamp(), now.nanosecond())
        .ok_or_else(|| Error::Configuration(format!("timestamp out of range: {now}")))?
        .with_timezone(&tz);
    match schedule.after(&now_tz).next() {
        Some(next) => {
            let next = OffsetDateTime::from_unix_timestamp(next.timestamp()).map_err(|err| {
                Error::Configuration(format!("cron fire time out of range: {err}"))
            })?;
            Ok(Some(next))
        }
        None => Ok(None),
    }
}
