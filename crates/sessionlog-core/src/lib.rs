//! sessionlog-core — session lifecycle and transactional telemetry ingestion.
//!
//! # Architecture
//!
//! ```text
//! Collector
//!     ├── SessionRegistry  (create / lookup / check_writable / end / sweep_idle)
//!     ├── IngestEngine     (all-or-nothing batch insert per channel)
//!     ├── IdleReaper       (background sweep every timeout / 2)
//!     └── Storage backend  (memory / SQLite, see sessionlog-storage)
//! ```

pub mod channel;
pub mod clock;
pub mod collector;
pub mod config;
pub mod error;
pub mod ingest;
pub mod observer;
pub mod reaper;
pub mod registry;
pub mod store;
pub mod types;

pub use channel::{Batch, Channel, ChannelRow, ClickRow, MouseRow, Pose, ScoreRow, SpatialRow, TooltipRow};
pub use clock::{Clock, ManualClock, SystemClock};
pub use collector::Collector;
pub use config::{RegistryBuilder, RegistryConfig};
pub use error::CollectorError;
pub use ingest::IngestEngine;
pub use observer::{NoopObserver, RecordingObserver, TelemetryObserver, TracingObserver};
pub use reaper::IdleReaper;
pub use registry::SessionRegistry;
pub use store::{CloseOutcome, SessionStore, Storage, TelemetryStore, WriteGuard};
pub use types::{Session, SessionId, SessionMeta};
