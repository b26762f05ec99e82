//! Background deletion of events superseded by snapshots.
//!
//! An event is deleted only when every condition holds: a snapshot covers
//! its version, every reader's committed offset has passed it, and it is
//! older than the minimum retention. Load paths consult the snapshot first,
//! so replay after truncation is equivalent to replay from zero; the
//! offset floor guarantees no live consumer is still positioned in the
//! deleted range.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::store::{EventStore, OffsetStore};

/// Periodically deletes old events that are safely covered by snapshots.
pub struct TruncationService<S> {
    store: S,
    workflow_type: String,
    min_retention: Duration,
    batch_size: u32,
    check_interval: Duration,
}

impl<S> TruncationService<S>
where
    S: EventStore + OffsetStore + Send + Sync + 'static,
{
    pub fn new(store: S, workflow_type: impl Into<String>) -> Self {
        Self {
            store,
            workflow_type: workflow_type.into(),
            min_retention: Duration::from_secs(7 * 24 * 60 * 60),
            batch_size: 1000,
            check_interval: Duration::from_secs(60 * 60),
        }
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.min_retention = config.truncation_min_retention;
        self.batch_size = config.truncation_batch_size;
        self.check_interval = config.truncation_check_interval;
        self
    }

    pub fn with_min_retention(mut self, min_retention: Duration) -> Self {
        self.min_retention = min_retention;
        self
    }

    /// One truncation cycle. Returns the total number of events deleted.
    pub async fn truncate_once(&self) -> Result<u64> {
        let Some(min_offset) = self.store.min_offset().await? else {
            // No readers yet: nothing is provably consumed.
            return Ok(0);
        };

        let snapshots = self.store.snapshots_for_type(&self.workflow_type).await?;
        if snapshots.is_empty() {
            return Ok(0);
        }

        let cutoff = OffsetDateTime::now_utc() - self.min_retention;
        let mut total_deleted = 0u64;
        for (workflow_id, snapshot_version) in snapshots {
            let deleted = self
                .store
                .truncate_events(
                    &workflow_id,
                    snapshot_version,
                    min_offset,
                    cutoff,
                    self.batch_size,
                )
                .await?;
            if deleted > 0 {
                total_deleted += deleted;
                debug!(
                    workflow_id = %workflow_id,
                    snapshot_version,
                    deleted,
                    "Truncated events"
                );
            }
        }
        Ok(total_deleted)
    }

    /// Truncation loop until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            workflow_type = %self.workflow_type,
            retention_secs = self.min_retention.as_secs(),
            "Truncation service started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.truncate_once().await {
                        Ok(deleted) if deleted > 0 => {
                            info!(
                                workflow_type = %self.workflow_type,
                                deleted,
                                "Truncated old events"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            error!(
                                workflow_type = %self.workflow_type,
                                error = %err,
                                "Error in truncation loop"
                            );
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(workflow_type = %self.workflow_type, "Truncation service shutting down");
                        break;
                    }
                }
            }
        }
    }
}
