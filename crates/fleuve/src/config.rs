//! Engine configuration.

use std::time::Duration;

use crate::activity::RetryPolicy;

/// Configuration shared by the engine's long-running tasks.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use fleuve::EngineConfig;
///
/// let config = EngineConfig {
///     snapshot_interval: 100,
///     enable_truncation: true,
///     reader_batch_size: 500,
///     ..Default::default()
/// };
/// assert_eq!(config.delay_poll_interval, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Domain events between snapshots per workflow. 0 disables snapshotting.
    pub snapshot_interval: u32,

    /// Run the background truncator. Requires snapshotting to make progress.
    pub enable_truncation: bool,

    /// Minimum age before an event becomes eligible for truncation.
    pub truncation_min_retention: Duration,

    /// Maximum events deleted per workflow per truncation cycle.
    pub truncation_batch_size: u32,

    /// How often the truncation loop runs.
    pub truncation_check_interval: Duration,

    /// Default retry policy for adapters without their own.
    pub retry_policy: RetryPolicy,

    /// Reader sleep after an empty poll; doubles up to
    /// [`reader_max_poll_interval`](Self::reader_max_poll_interval) while the
    /// log stays quiet and resets on progress.
    pub reader_poll_interval: Duration,

    /// Upper bound for the reader's backoff sleep.
    pub reader_max_poll_interval: Duration,

    /// Maximum events per reader batch.
    pub reader_batch_size: u32,

    /// How often the delay scheduler scans for due schedules.
    pub delay_poll_interval: Duration,

    /// Emit spans at the Repository, Reader, Executor, and Delay boundaries.
    /// Spans are no-ops when no subscriber is installed.
    pub enable_tracing: bool,

    /// Bounded internal retries of the load-decide-append loop on
    /// `VersionConflict` before surfacing it.
    pub command_retry_limit: u32,

    /// How often the executor scans for interrupted activities to take over.
    pub activity_recovery_interval: Duration,

    /// Age of `last_attempt_at` after which a running activity counts as
    /// abandoned by its runner.
    pub activity_stale_after: Duration,

    /// Events processed between checks for a pending scaling operation.
    pub scaling_check_interval: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 0,
            enable_truncation: false,
            truncation_min_retention: Duration::from_secs(7 * 24 * 60 * 60),
            truncation_batch_size: 1000,
            truncation_check_interval: Duration::from_secs(60 * 60),
            retry_policy: RetryPolicy::default(),
            reader_poll_interval: Duration::from_millis(100),
            reader_max_poll_interval: Duration::from_secs(20),
            reader_batch_size: 100,
            delay_poll_interval: Duration::from_secs(1),
            enable_tracing: false,
            command_retry_limit: 5,
            activity_recovery_interval: Duration::from_secs(30),
            activity_stale_after: Duration::from_secs(5 * 60),
            scaling_check_interval: 50,
        }
    }
}
