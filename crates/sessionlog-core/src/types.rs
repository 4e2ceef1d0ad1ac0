//! Session identity and metadata.

use serde::{Deserialize, Serialize};

use crate::error::CollectorError;

// ─── SessionId ────────────────────────────────────────────────────────────────

/// Opaque session identifier.
///
/// New ids are time-ordered UUIDs (v7), rendered in hyphenated lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh, time-ordered identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ─── SessionMeta ──────────────────────────────────────────────────────────────

/// The natural key of a session plus an optional pre-declared end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub user_id: String,
    pub model_id: String,
    /// Session start, epoch milliseconds.
    pub start_ms: i64,
    /// Session end, epoch milliseconds. `None` = open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ms: Option<i64>,
}

impl SessionMeta {
    pub fn new(user_id: impl Into<String>, model_id: impl Into<String>, start_ms: i64) -> Self {
        Self {
            user_id: user_id.into(),
            model_id: model_id.into(),
            start_ms,
            end_ms: None,
        }
    }

    /// Create the session already closed at `end_ms`.
    pub fn with_end(mut self, end_ms: i64) -> Self {
        self.end_ms = Some(end_ms);
        self
    }

    /// Trim and lower-case the user and model ids.
    ///
    /// The natural key is compared in this form on both create and lookup.
    pub fn normalized(&self) -> Self {
        Self {
            user_id: self.user_id.trim().to_lowercase(),
            model_id: self.model_id.trim().to_lowercase(),
            start_ms: self.start_ms,
            end_ms: self.end_ms,
        }
    }

    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.user_id.trim().is_empty() {
            return Err(CollectorError::Validation("userId must not be empty".into()));
        }
        if self.model_id.trim().is_empty() {
            return Err(CollectorError::Validation("modelId must not be empty".into()));
        }
        if let Some(end) = self.end_ms {
            if end < self.start_ms {
                return Err(CollectorError::Validation(format!(
                    "session end {end} precedes start {}",
                    self.start_ms
                )));
            }
        }
        Ok(())
    }

    /// Human-readable form of the natural key, used in `NotFound` messages.
    pub fn describe(&self) -> String {
        format!(
            "user_id={}, start={}, model={}",
            self.user_id, self.start_ms, self.model_id
        )
    }
}

// ─── Session ──────────────────────────────────────────────────────────────────

/// A persisted session row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub model_id: String,
    pub start_ms: i64,
    /// Close time; once set it never moves earlier.
    pub end_ms: Option<i64>,
    /// Clock time of creation or of the latest committed batch.
    pub last_activity_ms: i64,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    /// Returns `true` if an event at `at_ms` may still be recorded.
    pub fn accepts(&self, at_ms: i64) -> bool {
        self.end_ms.map_or(true, |end| at_ms <= end)
    }

    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            user_id: self.user_id.clone(),
            model_id: self.model_id.clone(),
            start_ms: self.start_ms,
            end_ms: self.end_ms,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_uuids() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
        assert_eq!(a.as_str().len(), 36);
        assert_ne!(a, b);
    }

    #[test]
    fn meta_normalizes_natural_key() {
        let meta = SessionMeta::new("  Demo ", "Demo_Model", 10).normalized();
        assert_eq!(meta.user_id, "demo");
        assert_eq!(meta.model_id, "demo_model");
        assert_eq!(meta.start_ms, 10);
    }

    #[test]
    fn meta_rejects_blank_ids_and_inverted_end() {
        assert!(SessionMeta::new(" ", "m", 0).validate().is_err());
        assert!(SessionMeta::new("u", "", 0).validate().is_err());
        assert!(SessionMeta::new("u", "m", 10).with_end(5).validate().is_err());
        assert!(SessionMeta::new("u", "m", 10).with_end(10).validate().is_ok());
    }

    #[test]
    fn closed_session_accepts_only_earlier_events() {
        let session = Session {
            id: "s".into(),
            user_id: "u".into(),
            model_id: "m".into(),
            start_ms: 0,
            end_ms: Some(100),
            last_activity_ms: 0,
        };
        assert!(!session.is_open());
        assert!(session.accepts(100));
        assert!(!session.accepts(101));
    }

    #[test]
    fn meta_serde_uses_camel_case() {
        let meta: SessionMeta =
            serde_json::from_str(r#"{"userId":"demo","modelId":"m","startMs":5}"#).unwrap();
        assert_eq!(meta, SessionMeta::new("demo", "m", 5));
    }
}
