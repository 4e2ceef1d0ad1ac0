//! Injected observability hooks.
//!
//! The registry and ingest engine report lifecycle events through a
//! [`TelemetryObserver`] handed to them at construction, so embedding
//! processes decide where those events go.

use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::CollectorError;
use crate::types::{Session, SessionId};

/// Lifecycle hooks. Every method defaults to a no-op.
pub trait TelemetryObserver: Send + Sync {
    fn session_created(&self, _session: &Session) {}

    fn session_closed(&self, _session_id: &SessionId, _end_ms: i64) {}

    fn batch_ingested(&self, _session_id: &SessionId, _channel: Channel, _rows: u64) {}

    fn batch_rejected(&self, _session_id: &SessionId, _channel: Channel, _error: &CollectorError) {}

    fn idle_swept(&self, _closed: u64, _cutoff_ms: i64) {}
}

/// Forwards every hook to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl TelemetryObserver for TracingObserver {
    fn session_created(&self, session: &Session) {
        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            model_id = %session.model_id,
            start_ms = session.start_ms,
            "Created new session"
        );
    }

    fn session_closed(&self, session_id: &SessionId, end_ms: i64) {
        info!(session_id = %session_id, end_ms, "session closed");
    }

    fn batch_ingested(&self, session_id: &SessionId, channel: Channel, rows: u64) {
        debug!(session_id = %session_id, %channel, rows, "batch committed");
    }

    fn batch_rejected(&self, session_id: &SessionId, channel: Channel, error: &CollectorError) {
        warn!(session_id = %session_id, %channel, %error, "batch rejected");
    }

    fn idle_swept(&self, closed: u64, cutoff_ms: i64) {
        if closed > 0 {
            info!(closed, cutoff_ms, "closed idle sessions");
        } else {
            debug!(cutoff_ms, "idle sweep found nothing to close");
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TelemetryObserver for NoopObserver {}

/// An event captured by [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    Created(SessionId),
    Closed(SessionId, i64),
    Ingested(SessionId, Channel, u64),
    Rejected(SessionId, Channel, CollectorError),
    Swept(u64),
}

/// Keeps every hook invocation in memory, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn push(&self, event: ObservedEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl TelemetryObserver for RecordingObserver {
    fn session_created(&self, session: &Session) {
        self.push(ObservedEvent::Created(session.id.clone()));
    }

    fn session_closed(&self, session_id: &SessionId, end_ms: i64) {
        self.push(ObservedEvent::Closed(session_id.clone(), end_ms));
    }

    fn batch_ingested(&self, session_id: &SessionId, channel: Channel, rows: u64) {
        self.push(ObservedEvent::Ingested(session_id.clone(), channel, rows));
    }

    fn batch_rejected(&self, session_id: &SessionId, channel: Channel, error: &CollectorError) {
        self.push(ObservedEvent::Rejected(session_id.clone(), channel, error.clone()));
    }

    fn idle_swept(&self, closed: u64, _cutoff_ms: i64) {
        self.push(ObservedEvent::Swept(closed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_observer_keeps_order() {
        let obs = RecordingObserver::new();
        let id = SessionId::from("s1");
        obs.batch_ingested(&id, Channel::Click, 3);
        obs.idle_swept(0, 10);
        obs.session_closed(&id, 99);

        assert_eq!(
            obs.events(),
            vec![
                ObservedEvent::Ingested(id.clone(), Channel::Click, 3),
                ObservedEvent::Swept(0),
                ObservedEvent::Closed(id, 99),
            ]
        );
    }

    #[test]
    fn noop_observer_accepts_everything() {
        let obs = NoopObserver;
        obs.idle_swept(5, 0);
        obs.batch_rejected(
            &SessionId::from("s"),
            Channel::Score,
            &CollectorError::Validation("x".into()),
        );
    }
}
