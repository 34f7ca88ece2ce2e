//! The closed error taxonomy of the orchestration core.
//!
//! Every public operation documents which kinds it may raise; callers
//! pattern-match on [`Error::kind`]. Storage failures keep their full
//! `anyhow` context chain from the db crate.

use std::time::Duration;

/// Error kind labels, as surfaced to callers and boundary adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    StateError,
    ValidationError,
    Timeout,
    AgentError,
    StorageError,
    ConfigurationError,
    InternalError,
}

impl ErrorKind {
    /// The snake_case wire label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::StateError => "state_error",
            Self::ValidationError => "validation_error",
            Self::Timeout => "timeout",
            Self::AgentError => "agent_error",
            Self::StorageError => "storage_error",
            Self::ConfigurationError => "configuration_error",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Entity (task, worker, plan, agent) does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Id already registered, or a concurrent state transition lost the race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Requested state transition is not legal under the state machine.
    #[error("invalid state transition: {0}")]
    State(String),

    /// Malformed input: unknown enum value, empty required field, cyclic
    /// dependency graph.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Agent invocation exceeded its phase timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Agent execution raised or returned an error status.
    #[error("agent error: {0}")]
    Agent(String),

    /// Store I/O failure.
    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    /// Required agent or workflow definition missing from its registry.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything uncategorized.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::State(_) => ErrorKind::StateError,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Agent(_) => ErrorKind::AgentError,
            Self::Storage(_) => ErrorKind::StorageError,
            Self::Configuration(_) => ErrorKind::ConfigurationError,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Whether retrying the same operation can succeed without external
    /// intervention.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::Timeout | ErrorKind::AgentError | ErrorKind::StorageError
        )
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(anyhow::Error::new(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels() {
        assert_eq!(Error::not_found("task", "t1").kind().as_str(), "not_found");
        assert_eq!(
            Error::Validation("empty title".into()).kind().as_str(),
            "validation_error"
        );
        assert_eq!(
            Error::Configuration("no such agent".into()).kind().as_str(),
            "configuration_error"
        );
    }

    #[test]
    fn retriability() {
        assert!(Error::Conflict("raced".into()).is_retriable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(!Error::State("bad edge".into()).is_retriable());
        assert!(!Error::Validation("cycle".into()).is_retriable());
    }
}
