//! The collector — one registry, one ingest engine and the idle reaper
//! sharing a storage backend. This is the surface transport layers call.

use std::sync::Arc;

use tracing::info;

use crate::channel::{Batch, Channel};
use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::error::CollectorError;
use crate::ingest::IngestEngine;
use crate::observer::{TelemetryObserver, TracingObserver};
use crate::reaper::IdleReaper;
use crate::registry::SessionRegistry;
use crate::store::Storage;
use crate::types::{SessionId, SessionMeta};

pub struct Collector {
    registry: Arc<SessionRegistry>,
    engine: IngestEngine,
    reaper: Option<IdleReaper>,
    config: RegistryConfig,
}

impl Collector {
    /// Start a collector with the wall clock and `tracing` observer.
    ///
    /// Must be called inside a tokio runtime when the reaper is enabled.
    pub fn start<S: Storage + 'static>(store: Arc<S>, config: RegistryConfig) -> Self {
        Self::with_parts(store, config, Arc::new(SystemClock), Arc::new(TracingObserver))
    }

    pub(crate) fn with_parts<S: Storage + 'static>(
        store: Arc<S>,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn TelemetryObserver>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(store.clone(), clock, observer));
        let engine = IngestEngine::new(registry.clone(), store);
        let reaper = config
            .reaper_enabled
            .then(|| IdleReaper::spawn(registry.clone(), config.idle_timeout()));

        info!(
            idle_timeout_ms = config.idle_timeout_ms,
            reaper = config.reaper_enabled,
            "collector started"
        );
        Self {
            registry,
            engine,
            reaper,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &IngestEngine {
        &self.engine
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// `CreateSession(userId, modelId, startMs) -> SessionId`
    pub async fn create_session(
        &self,
        user_id: &str,
        model_id: &str,
        start_ms: i64,
    ) -> Result<SessionId, CollectorError> {
        self.registry
            .create(SessionMeta::new(user_id, model_id, start_ms))
            .await
    }

    /// `EndSession(sessionId, endMs)`
    pub async fn end_session(&self, session_id: &SessionId, end_ms: i64) -> Result<(), CollectorError> {
        self.registry.end(session_id, end_ms).await
    }

    /// `IngestBatch(sessionId, channel, rows) -> rowCount`
    pub async fn ingest(&self, session_id: &SessionId, batch: &Batch) -> Result<u64, CollectorError> {
        self.engine.add(session_id, batch).await
    }

    /// Parse a JSON payload for `channel` and ingest it.
    pub async fn ingest_json(
        &self,
        session_id: &SessionId,
        channel: Channel,
        payload: serde_json::Value,
    ) -> Result<u64, CollectorError> {
        let batch = Batch::from_json(channel, payload)?;
        self.engine.add(session_id, &batch).await
    }

    /// Returns `true` if the reaper was started and has since exited.
    pub fn reaper_exited(&self) -> bool {
        self.reaper.as_ref().is_some_and(IdleReaper::is_finished)
    }

    /// Wait until the reaper exits and return its outcome.
    ///
    /// Pending forever when the reaper is disabled, so it can sit in a
    /// `select!` next to the server future.
    pub async fn reaper_exit(&mut self) -> Result<(), CollectorError> {
        match self.reaper.as_mut() {
            Some(reaper) => reaper.join().await,
            None => std::future::pending().await,
        }
    }

    /// Stop the reaper. A fatal sweep error that already happened is
    /// returned here.
    pub async fn shutdown(mut self) -> Result<(), CollectorError> {
        match self.reaper.take() {
            Some(reaper) => reaper.stop().await,
            None => Ok(()),
        }
    }
}
