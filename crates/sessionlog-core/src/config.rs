//! Collector configuration and fluent builder.
//!
//! # Example
//!
//! ```rust
//! use sessionlog_core::config::RegistryBuilder;
//!
//! let config = RegistryBuilder::new()
//!     .database_url("sqlite:./sessions.db")
//!     .idle_timeout_ms(60_000)
//!     .build_config();
//! assert_eq!(config.reaper_period().as_millis(), 30_000);
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::collector::Collector;
use crate::error::CollectorError;
use crate::observer::{TelemetryObserver, TracingObserver};
use crate::store::Storage;

pub const ENV_DATABASE_URL: &str = "SESSIONLOG_DATABASE_URL";
pub const ENV_IDLE_TIMEOUT_MS: &str = "SESSIONLOG_IDLE_TIMEOUT_MS";
pub const ENV_REAPER_ENABLED: &str = "SESSIONLOG_REAPER_ENABLED";

/// Configuration for a collector instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Storage location, e.g. `"sqlite:./sessions.db"` or `"sqlite::memory:"`.
    pub database_url: String,
    /// Sessions with no activity for this long are closed.
    pub idle_timeout_ms: u64,
    /// Whether to run the idle reaper at all.
    pub reaper_enabled: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            idle_timeout_ms: 5 * 60 * 1000,
            reaper_enabled: true,
        }
    }
}

impl RegistryConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// How often the reaper sweeps: half the idle timeout.
    pub fn reaper_period(&self) -> Duration {
        crate::reaper::reaper_period(self.idle_timeout())
    }

    /// Defaults overridden by `SESSIONLOG_*` environment variables.
    pub fn from_env() -> Result<Self, CollectorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CollectorError> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            config.database_url = url;
        }
        if let Some(raw) = lookup(ENV_IDLE_TIMEOUT_MS) {
            config.idle_timeout_ms = raw.trim().parse().map_err(|_| {
                CollectorError::Validation(format!("{ENV_IDLE_TIMEOUT_MS}: not a number: {raw}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_REAPER_ENABLED) {
            config.reaper_enabled = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(CollectorError::Validation(format!(
                        "{ENV_REAPER_ENABLED}: expected a boolean, got {raw}"
                    )))
                }
            };
        }
        Ok(config)
    }
}

/// Fluent builder for [`RegistryConfig`] and a running [`Collector`].
pub struct RegistryBuilder {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn TelemetryObserver>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::from_config(RegistryConfig::default())
    }

    pub fn from_config(config: RegistryConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.idle_timeout_ms = ms;
        self
    }

    pub fn reaper_enabled(mut self, enabled: bool) -> Self {
        self.config.reaper_enabled = enabled;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TelemetryObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn build_config(self) -> RegistryConfig {
        self.config
    }

    /// Wire a collector over `store` and start its reaper.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start<S: Storage + 'static>(self, store: Arc<S>) -> Collector {
        Collector::with_parts(store, self.config, self.clock, self.observer)
    }
}
