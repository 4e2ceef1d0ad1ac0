//! sessionlog-storage — pluggable storage backends for sessionlog.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
