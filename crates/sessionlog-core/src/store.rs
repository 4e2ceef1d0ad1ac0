//! Storage traits the registry and ingest engine are written against.
//!
//! Implementations live in `sessionlog-storage` (in-memory and SQLite).
//! Uniqueness and interval-overlap rules are the backend's responsibility;
//! violations surface as [`CollectorError::ConstraintViolation`].

use async_trait::async_trait;

use crate::channel::{Batch, Channel};
use crate::error::CollectorError;
use crate::types::{Session, SessionId, SessionMeta};

/// Result of a conditional close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The session was open and now carries the requested `end_ms`.
    Closed,
    /// The session was already closed at this time; nothing changed.
    AlreadyClosed(i64),
    /// No such session.
    Missing,
}

/// Conditions a batch insert re-checks inside its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteGuard {
    /// Latest event time in the batch; must not exceed a recorded `end_ms`.
    pub max_event_ms: i64,
    /// Clock time of the write, recorded as the session's last activity.
    pub observed_ms: i64,
}

/// Persistence for session rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. A natural-key collision must be reported as
    /// [`CollectorError::DuplicateSession`].
    async fn insert_session(&self, session: &Session) -> Result<(), CollectorError>;

    /// Resolve a session id from its (normalised) natural key.
    async fn find_session_id(&self, meta: &SessionMeta) -> Result<Option<SessionId>, CollectorError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, CollectorError>;

    /// Set `end_ms` on an open session. Never changes an already recorded
    /// close time.
    async fn set_session_end(&self, id: &SessionId, end_ms: i64) -> Result<CloseOutcome, CollectorError>;

    /// Close every open session whose last activity precedes `cutoff_ms`,
    /// stamping `end_ms = now_ms`, as one set-based update. Returns the number
    /// of sessions closed.
    async fn close_idle(&self, now_ms: i64, cutoff_ms: i64) -> Result<u64, CollectorError>;

    /// All sessions, ordered by start time.
    async fn list_sessions(&self) -> Result<Vec<Session>, CollectorError>;
}

/// Persistence for telemetry rows.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Insert every row of `batch` in order, inside one transaction.
    ///
    /// The guard is re-checked in that transaction: a missing session is
    /// `NotFound`, a closed session with `end_ms < guard.max_event_ms` is
    /// `StaleWrite`. Any failing row aborts the whole batch.
    async fn insert_batch(
        &self,
        session_id: &SessionId,
        batch: &Batch,
        guard: WriteGuard,
    ) -> Result<u64, CollectorError>;

    async fn count_rows(&self, session_id: &SessionId, channel: Channel) -> Result<u64, CollectorError>;

    /// Stored rows for a session, ordered by time then object id.
    async fn fetch_batch(&self, session_id: &SessionId, channel: Channel) -> Result<Batch, CollectorError>;
}

/// A backend that stores both sessions and telemetry.
pub trait Storage: SessionStore + TelemetryStore {}

impl<T: SessionStore + TelemetryStore> Storage for T {}
