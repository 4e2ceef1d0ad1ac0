//! Session registry — creation, lookup, close and idle sweep.
//!
//! The registry is the only writer of session rows. Close times are
//! monotonic: the first close is authoritative, a repeat close at the same
//! or a later time is a no-op, and an earlier one is rejected with
//! [`CollectorError::CloseRegression`].

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::error::CollectorError;
use crate::observer::TelemetryObserver;
use crate::store::{CloseOutcome, SessionStore};
use crate::types::{Session, SessionId, SessionMeta};

pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn TelemetryObserver>,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn TelemetryObserver>,
    ) -> Self {
        Self {
            store,
            clock,
            observer,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn observer(&self) -> &Arc<dyn TelemetryObserver> {
        &self.observer
    }

    /// Create a session and return its new id.
    pub async fn create(&self, meta: SessionMeta) -> Result<SessionId, CollectorError> {
        let meta = meta.normalized();
        meta.validate()?;

        let session = Session {
            id: SessionId::generate(),
            user_id: meta.user_id,
            model_id: meta.model_id,
            start_ms: meta.start_ms,
            end_ms: meta.end_ms,
            last_activity_ms: self.clock.now_ms(),
        };
        self.store.insert_session(&session).await?;

        self.observer.session_created(&session);
        Ok(session.id)
    }

    /// Resolve a session id from user, model and start time.
    pub async fn lookup(&self, meta: &SessionMeta) -> Result<SessionId, CollectorError> {
        let meta = meta.normalized();
        self.store
            .find_session_id(&meta)
            .await?
            .ok_or_else(|| CollectorError::NotFound(meta.describe()))
    }

    pub async fn get(&self, id: &SessionId) -> Result<Session, CollectorError> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| CollectorError::NotFound(id.to_string()))
    }

    /// `Ok(true)` if the session exists, open or closed; `NotFound` otherwise.
    pub async fn exists(&self, id: &SessionId) -> Result<bool, CollectorError> {
        self.get(id).await.map(|_| true)
    }

    /// Check that events up to `reference_ms` may be written to `id`.
    ///
    /// A closed session still accepts events that happened at or before its
    /// recorded close time.
    pub async fn check_writable(&self, id: &SessionId, reference_ms: i64) -> Result<(), CollectorError> {
        let session = self.get(id).await?;
        match session.end_ms {
            Some(end_ms) if reference_ms > end_ms => Err(CollectorError::StaleWrite {
                session_id: id.to_string(),
                event_ms: reference_ms,
                end_ms,
            }),
            _ => Ok(()),
        }
    }

    /// Close a session at `end_ms`.
    pub async fn end(&self, id: &SessionId, end_ms: i64) -> Result<(), CollectorError> {
        let session = self.get(id).await?;
        if end_ms < session.start_ms {
            return Err(CollectorError::Validation(format!(
                "end {end_ms} precedes session start {}",
                session.start_ms
            )));
        }

        match self.store.set_session_end(id, end_ms).await? {
            CloseOutcome::Closed => {
                self.observer.session_closed(id, end_ms);
                Ok(())
            }
            CloseOutcome::AlreadyClosed(recorded_ms) if end_ms >= recorded_ms => {
                debug!(session_id = %id, recorded_ms, requested_ms = end_ms, "session already closed");
                Ok(())
            }
            CloseOutcome::AlreadyClosed(recorded_ms) => Err(CollectorError::CloseRegression {
                session_id: id.to_string(),
                recorded_ms,
                requested_ms: end_ms,
            }),
            CloseOutcome::Missing => Err(CollectorError::NotFound(id.to_string())),
        }
    }

    /// Close every open session idle for longer than `timeout_ms`.
    ///
    /// Idleness is measured from the session's last observed activity.
    pub async fn sweep_idle(&self, timeout_ms: i64) -> Result<u64, CollectorError> {
        let now_ms = self.clock.now_ms();
        let cutoff_ms = now_ms.saturating_sub(timeout_ms);
        let closed = self.store.close_idle(now_ms, cutoff_ms).await?;
        self.observer.idle_swept(closed, cutoff_ms);
        Ok(closed)
    }

    pub async fn sessions(&self) -> Result<Vec<Session>, CollectorError> {
        self.store.list_sessions().await
    }
}
