//! Error types for session management and telemetry ingestion.

use thiserror::Error;

/// Errors returned by the registry, the ingest engine and storage backends.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollectorError {
    #[error("Session ID ({0}) does not exist")]
    NotFound(String),

    #[error("Session already exists: user_id={user_id}, start={start_ms}, model={model_id}")]
    DuplicateSession {
        user_id: String,
        model_id: String,
        start_ms: i64,
    },

    #[error("Tried to insert data at {event_ms} after session {session_id} ended at {end_ms}")]
    StaleWrite {
        session_id: String,
        event_ms: i64,
        end_ms: i64,
    },

    #[error("Session {session_id} already ended at {recorded_ms}; refusing earlier end {requested_ms}")]
    CloseRegression {
        session_id: String,
        recorded_ms: i64,
        requested_ms: i64,
    },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CollectorError {
    /// Returns `true` for conditions the caller can act on (everything except
    /// storage faults).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }

    /// Returns `true` if the storage engine rejected a row on a uniqueness,
    /// check or interval-overlap constraint.
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }

    /// Prefix the message of row-level errors with where they happened.
    ///
    /// Typed variants carrying structured fields are returned unchanged.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Self::ConstraintViolation(msg) => Self::ConstraintViolation(format!("{ctx}: {msg}")),
            Self::Validation(msg) => Self::Validation(format!("{ctx}: {msg}")),
            Self::Storage(msg) => Self::Storage(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}
