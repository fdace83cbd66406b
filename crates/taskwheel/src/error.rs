use std::fmt;

/// Errors surfaced by the scheduler, the client and the execution store.
#[derive(Debug)]
pub enum SchedulerError {
    /// The underlying database reported an error.
    Database(sqlx::Error),
    /// A payload could not be serialized or deserialized.
    Serialization(serde_json::Error),
    /// A persisted execution refers to a task name with no registration.
    UnknownTask(String),
    /// All worker permits are in use; the candidate is skipped until the
    /// next poll.
    NoAvailableExecutors,
    /// The configured table name contains characters that cannot be safely
    /// embedded in SQL.
    InvalidTableName(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::Serialization(e) => write!(f, "payload serialization error: {e}"),
            Self::UnknownTask(name) => write!(f, "no task registered under the name `{name}`"),
            Self::NoAvailableExecutors => write!(f, "no executor available to run the execution"),
            Self::InvalidTableName(name) => write!(f, "invalid table name `{name}`"),
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Database(e) => Some(e),
            Self::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(value: sqlx::Error) -> Self {
        Self::Database(value)
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}
