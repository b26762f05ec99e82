//! Error types for fleuve.

use thiserror::Error;

use crate::workflow::Rejection;

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fleuve operations.
///
/// The taxonomy separates business rejections (never retried by the engine)
/// from lifecycle gates, concurrency conflicts (retried inside the
/// Repository), and infrastructure failures (retried by workers with
/// backoff).
#[derive(Debug, Error)]
pub enum Error {
    /// `decide` refused the command. Returned to the caller, never retried.
    #[error("command rejected: {0}")]
    Rejected(Rejection),

    /// `create_new` was called for a workflow that already has events.
    #[error("workflow {workflow_id} already exists")]
    AlreadyExists { workflow_id: String },

    /// No events exist for the workflow (or it already reached its final event).
    #[error("workflow {workflow_id} of type {workflow_type} not found")]
    NotFound {
        workflow_type: String,
        workflow_id: String,
    },

    /// The workflow is paused; non-system commands are refused.
    #[error("workflow {workflow_id} is paused")]
    Paused { workflow_id: String },

    /// The workflow is cancelled; commands are refused.
    #[error("workflow {workflow_id} is cancelled")]
    Cancelled { workflow_id: String },

    /// A concurrent writer won the version race.
    ///
    /// The Repository retries the load-decide-append loop a bounded number
    /// of times before surfacing this.
    #[error("version conflict on {workflow_id}: another writer appended at version {version}")]
    VersionConflict { workflow_id: String, version: i64 },

    /// Failed to serialize or deserialize an event, command, or state body.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An event could not be migrated to the workflow's current schema
    /// version. Fatal for that workflow; never auto-retried.
    #[error(
        "failed to upcast event {event_type} of {workflow_id} from schema version {from_version}: {reason}"
    )]
    SchemaUpcast {
        workflow_id: String,
        event_type: String,
        from_version: i32,
        reason: String,
    },

    /// PostgreSQL storage error.
    ///
    /// Preserves the full `sqlx::Error` so callers can match on specific
    /// conditions (connection loss, constraint violations, ...).
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// State cache failure. The cache is best-effort; the Repository treats
    /// this as transient.
    #[error("state cache error: {0}")]
    Cache(String),

    /// Invalid setup: duplicate reader owner, unknown workflow type, bad
    /// partition counts, unparsable cron expressions. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a business rejection from a reason string.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Error::Rejected(Rejection::new(msg))
    }

    pub(crate) fn upcast(
        workflow_id: impl Into<String>,
        event_type: impl Into<String>,
        from_version: i32,
        reason: impl Into<String>,
    ) -> Self {
        Error::SchemaUpcast {
            workflow_id: workflow_id.into(),
            event_type: event_type.into(),
            from_version,
            reason: reason.into(),
        }
    }

    /// True for outcomes a runner treats as "handled" rather than retryable:
    /// business rejections, lifecycle gates, and missing workflows.
    pub fn is_expected_rejection(&self) -> bool {
        matches!(
            self,
            Error::Rejected(_)
                | Error::AlreadyExists { .. }
                | Error::NotFound { .. }
                | Error::Paused { .. }
                | Error::Cancelled { .. }
        )
    }
}
