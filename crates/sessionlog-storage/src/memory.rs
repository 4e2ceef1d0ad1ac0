//! In-memory storage backend.
//!
//! Keeps sessions and telemetry rows in RAM and enforces the same
//! uniqueness and interval-overlap rules as the SQLite schema. Useful for
//! tests and short-lived collectors that don't need persistence.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use sessionlog_core::channel::{
    Batch, Channel, ChannelRow, ClickRow, MouseRow, ScoreRow, SpatialRow, TooltipRow,
};
use sessionlog_core::error::CollectorError;
use sessionlog_core::store::{CloseOutcome, SessionStore, TelemetryStore, WriteGuard};
use sessionlog_core::types::{Session, SessionId, SessionMeta};

/// Rows of one channel, in insertion order.
struct Table<R> {
    rows: Vec<(SessionId, R)>,
}

impl<R> Default for Table<R> {
    fn default() -> Self {
        Self { rows: Vec::new() }
    }
}

impl<R: ChannelRow> Table<R> {
    /// Check every new row against stored rows and earlier rows of the same
    /// batch, then append all of them. Nothing is appended on conflict.
    fn insert(&mut self, session_id: &SessionId, new_rows: &[R]) -> Result<u64, CollectorError> {
        let mut seen: Vec<&R> = self
            .rows
            .iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, r)| r)
            .collect();

        for (i, row) in new_rows.iter().enumerate() {
            if let Some(msg) = seen.iter().find_map(|other| conflict(*other, row)) {
                return Err(CollectorError::ConstraintViolation(msg)
                    .context(format!("{} row {i}", R::CHANNEL)));
            }
            seen.push(row);
        }

        self.rows
            .extend(new_rows.iter().map(|r| (session_id.clone(), r.clone())));
        Ok(new_rows.len() as u64)
    }

    fn count(&self, session_id: &SessionId) -> u64 {
        self.rows.iter().filter(|(s, _)| s == session_id).count() as u64
    }

    fn fetch(&self, session_id: &SessionId) -> Vec<R> {
        let mut rows: Vec<R> = self
            .rows
            .iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, r)| r.clone())
            .collect();
        rows.sort_by(|a, b| {
            a.span()
                .0
                .cmp(&b.span().0)
                .then_with(|| a.object_id().cmp(&b.object_id()))
        });
        rows
    }
}

/// Constraint message if `new` may not coexist with `existing`.
fn conflict<R: ChannelRow>(existing: &R, new: &R) -> Option<String> {
    if existing.object_id() != new.object_id() {
        return None;
    }
    let (s1, e1) = existing.span();
    let (s2, e2) = new.span();
    let table = R::CHANNEL.table();
    if R::CHANNEL.is_interval() && s1 < e2 && s2 < e1 {
        return Some(format!("{table}: interval overlaps an existing row"));
    }
    if s1 == s2 {
        return Some(format!("UNIQUE constraint failed: {table}"));
    }
    None
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Session>,
    clicks: Table<ClickRow>,
    mouse: Table<MouseRow>,
    spatial: Table<SpatialRow>,
    scores: Table<ScoreRow>,
    tooltips: Table<TooltipRow>,
}

/// In-memory collector storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, CollectorError> {
        self.state
            .lock()
            .map_err(|_| CollectorError::Storage("in-memory state poisoned".into()))
    }
}

#[async_trait]
impl SessionStore for InMemoryStorage {
    async fn insert_session(&self, session: &Session) -> Result<(), CollectorError> {
        let mut state = self.state()?;
        let duplicate = state.sessions.values().any(|s| {
            s.user_id == session.user_id
                && s.model_id == session.model_id
                && s.start_ms == session.start_ms
        });
        if duplicate {
            return Err(CollectorError::DuplicateSession {
                user_id: session.user_id.clone(),
                model_id: session.model_id.clone(),
                start_ms: session.start_ms,
            });
        }
        if state.sessions.contains_key(&session.id) {
            return Err(CollectorError::ConstraintViolation(format!(
                "UNIQUE constraint failed: sessions.uuid ({})",
                session.id
            )));
        }
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_session_id(&self, meta: &SessionMeta) -> Result<Option<SessionId>, CollectorError> {
        let state = self.state()?;
        Ok(state
            .sessions
            .values()
            .find(|s| {
                s.user_id == meta.user_id
                    && s.model_id == meta.model_id
                    && s.start_ms == meta.start_ms
            })
            .map(|s| s.id.clone()))
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, CollectorError> {
        Ok(self.state()?.sessions.get(id).cloned())
    }

    async fn set_session_end(&self, id: &SessionId, end_ms: i64) -> Result<CloseOutcome, CollectorError> {
        let mut state = self.state()?;
        let Some(session) = state.sessions.get_mut(id) else {
            return Ok(CloseOutcome::Missing);
        };
        match session.end_ms {
            Some(recorded) => Ok(CloseOutcome::AlreadyClosed(recorded)),
            None => {
                session.end_ms = Some(end_ms);
                Ok(CloseOutcome::Closed)
            }
        }
    }

    async fn close_idle(&self, now_ms: i64, cutoff_ms: i64) -> Result<u64, CollectorError> {
        let mut state = self.state()?;
        let mut closed = 0;
        for session in state.sessions.values_mut() {
            if session.end_ms.is_none() && session.last_activity_ms < cutoff_ms {
                session.end_ms = Some(now_ms);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, CollectorError> {
        let mut sessions: Vec<Session> = self.state()?.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.start_ms.cmp(&b.start_ms).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }
}

#[async_trait]
impl TelemetryStore for InMemoryStorage {
    async fn insert_batch(
        &self,
        session_id: &SessionId,
        batch: &Batch,
        guard: WriteGuard,
    ) -> Result<u64, CollectorError> {
        let mut guarded = self.state()?;
        let state = &mut *guarded;

        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CollectorError::NotFound(session_id.to_string()))?;
        if let Some(end_ms) = session.end_ms {
            if guard.max_event_ms > end_ms {
                return Err(CollectorError::StaleWrite {
                    session_id: session_id.to_string(),
                    event_ms: guard.max_event_ms,
                    end_ms,
                });
            }
        }

        let inserted = match batch {
            Batch::Click(rows) => state.clicks.insert(session_id, rows)?,
            Batch::Mouse(rows) => state.mouse.insert(session_id, rows)?,
            Batch::Spatial(rows) => state.spatial.insert(session_id, rows)?,
            Batch::Score(rows) => state.scores.insert(session_id, rows)?,
            Batch::Tooltip(rows) => state.tooltips.insert(session_id, rows)?,
        };

        session.last_activity_ms = session.last_activity_ms.max(guard.observed_ms);
        Ok(inserted)
    }

    async fn count_rows(&self, session_id: &SessionId, channel: Channel) -> Result<u64, CollectorError> {
        let state = self.state()?;
        Ok(match channel {
            Channel::Click => state.clicks.count(session_id),
            Channel::Mouse => state.mouse.count(session_id),
            Channel::Spatial => state.spatial.count(session_id),
            Channel::Score => state.scores.count(session_id),
            Channel::Tooltip => state.tooltips.count(session_id),
        })
    }

    async fn fetch_batch(&self, session_id: &SessionId, channel: Channel) -> Result<Batch, CollectorError> {
        let state = self.state()?;
        Ok(match channel {
            Channel::Click => Batch::Click(state.clicks.fetch(session_id)),
            Channel::Mouse => Batch::Mouse(state.mouse.fetch(session_id)),
            Channel::Spatial => Batch::Spatial(state.spatial.fetch(session_id)),
            Channel::Score => Batch::Score(state.scores.fetch(session_id)),
            Channel::Tooltip => Batch::Tooltip(state.tooltips.fetch(session_id)),
        })
    }
}
