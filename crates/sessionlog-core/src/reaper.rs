//! Idle reaper — a background task that closes sessions nobody writes to.
//!
//! The task ticks every `timeout / 2`, so a session is closed at most 1.5×
//! the timeout after its last activity. A failed sweep ends the task with
//! the error; the owner sees it from [`IdleReaper::join`] or
//! [`IdleReaper::stop`]. Dropping the reaper stops the task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::CollectorError;
use crate::registry::SessionRegistry;

/// Tick period for a given idle timeout: half the timeout, at least 1 ms.
pub fn reaper_period(timeout: Duration) -> Duration {
    (timeout / 2).max(Duration::from_millis(1))
}

pub struct IdleReaper {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<Result<(), CollectorError>>>,
    period: Duration,
}

impl IdleReaper {
    /// Spawn the reaper on the current tokio runtime.
    pub fn spawn(registry: Arc<SessionRegistry>, timeout: Duration) -> Self {
        let period = reaper_period(timeout);
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let (shutdown, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; sweeping starts one period in.
            ticker.tick().await;

            info!(timeout_ms, period_ms = period.as_millis() as u64, "idle reaper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.sweep_idle(timeout_ms).await {
                            error!(error = %e, "idle sweep failed; reaper stopping");
                            return Err(e);
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            debug!("idle reaper stopped");
                            return Ok(());
                        }
                    }
                }
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns `true` once the task has exited (stopped or failed).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the task to exit and return how it ended.
    ///
    /// Resolves only on stop or on a fatal sweep error. Calling it again
    /// after it has returned yields `Ok(())`.
    pub async fn join(&mut self) -> Result<(), CollectorError> {
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| CollectorError::Storage(format!("idle reaper task failed: {e}")))?,
            None => Ok(()),
        }
    }

    /// Signal the task to stop and wait for it.
    ///
    /// A sweep already in flight completes first; each sweep is a single
    /// statement, so no partial state is left behind.
    pub async fn stop(mut self) -> Result<(), CollectorError> {
        let _ = self.shutdown.send(true);
        self.join().await
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
