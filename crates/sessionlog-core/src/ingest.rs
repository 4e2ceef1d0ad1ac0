//! Batch ingestion — validates a batch against its session, then hands it
//! to the store for an all-or-nothing insert.
//!
//! # Flow
//! 1. Empty batch → `0`, storage untouched.
//! 2. Row-local validation (ids, interval order, finite values).
//! 3. `SessionRegistry::check_writable` with the batch's latest event time.
//! 4. `TelemetryStore::insert_batch` — one transaction, rows in order, the
//!    writability guard re-checked inside it. Any row failure rolls back.

use std::sync::Arc;

use crate::channel::{Batch, Channel, ChannelRow};
use crate::error::CollectorError;
use crate::registry::SessionRegistry;
use crate::store::{TelemetryStore, WriteGuard};
use crate::types::SessionId;

pub struct IngestEngine {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn TelemetryStore>,
}

impl IngestEngine {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<dyn TelemetryStore>) -> Self {
        Self { registry, store }
    }

    /// Insert `batch` into `session_id`, returning the number of rows written.
    pub async fn add(&self, session_id: &SessionId, batch: &Batch) -> Result<u64, CollectorError> {
        let Some(max_event_ms) = batch.max_time_ms() else {
            return Ok(0);
        };

        let channel = batch.channel();
        match self.write(session_id, batch, max_event_ms).await {
            Ok(rows) => {
                self.registry
                    .observer()
                    .batch_ingested(session_id, channel, rows);
                Ok(rows)
            }
            Err(err) => {
                self.registry
                    .observer()
                    .batch_rejected(session_id, channel, &err);
                Err(err)
            }
        }
    }

    /// Typed convenience over [`IngestEngine::add`].
    pub async fn add_rows<R: ChannelRow>(
        &self,
        session_id: &SessionId,
        rows: Vec<R>,
    ) -> Result<u64, CollectorError> {
        self.add(session_id, &R::into_batch(rows)).await
    }

    async fn write(
        &self,
        session_id: &SessionId,
        batch: &Batch,
        max_event_ms: i64,
    ) -> Result<u64, CollectorError> {
        batch.validate()?;
        self.registry.check_writable(session_id, max_event_ms).await?;

        let guard = WriteGuard {
            max_event_ms,
            observed_ms: self.registry.clock().now_ms(),
        };
        self.store.insert_batch(session_id, batch, guard).await
    }

    pub async fn count(&self, session_id: &SessionId, channel: Channel) -> Result<u64, CollectorError> {
        self.store.count_rows(session_id, channel).await
    }

    pub async fn rows(&self, session_id: &SessionId, channel: Channel) -> Result<Batch, CollectorError> {
        self.store.fetch_batch(session_id, channel).await
    }
}
