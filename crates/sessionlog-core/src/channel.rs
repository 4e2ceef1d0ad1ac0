//! Telemetry channels and their row schemas.
//!
//! The set of channels is closed: each one has its own row type and its own
//! table, and a [`Batch`] carries rows for exactly one channel.
//!
//! | Channel   | Time                | Unique per                    | Overlap check      |
//! |-----------|---------------------|-------------------------------|--------------------|
//! | `click`   | `timestamp`         | session, timestamp            | —                  |
//! | `mouse`   | `timestamp`         | session, object, timestamp    | —                  |
//! | `spatial` | `[start, end)`      | session, object, start        | session, object    |
//! | `score`   | `timestamp`         | session, object, timestamp    | —                  |
//! | `tooltip` | `[start, end)`      | session, object, start        | session, object    |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CollectorError;

// ─── Channel ──────────────────────────────────────────────────────────────────

/// A fixed telemetry kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Click,
    Mouse,
    Spatial,
    Score,
    Tooltip,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Click,
        Channel::Mouse,
        Channel::Spatial,
        Channel::Score,
        Channel::Tooltip,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Mouse => "mouse",
            Self::Spatial => "spatial",
            Self::Score => "score",
            Self::Tooltip => "tooltip",
        }
    }

    /// Backing table name.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Click => "click_data",
            Self::Mouse => "mouse_data",
            Self::Spatial => "spatial_data",
            Self::Score => "score_data",
            Self::Tooltip => "tooltip_data",
        }
    }

    /// Returns `true` if rows carry a `[start, end)` interval rather than an
    /// instant.
    pub fn is_interval(&self) -> bool {
        matches!(self, Self::Spatial | Self::Tooltip)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| CollectorError::Validation(format!("unknown channel: {s}")))
    }
}

// ─── Timestamps ───────────────────────────────────────────────────────────────

/// Row times on the wire: epoch milliseconds, or an RFC 3339 string
/// (`"2017-05-23T13:37:53.5580000-04:00"`) as clients serialise dates.
mod epoch_ms {
    use std::fmt;

    use chrono::DateTime;
    use serde::de::{self, Deserializer, Visitor};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        deserializer.deserialize_any(EpochMsVisitor)
    }

    struct EpochMsVisitor;

    impl<'de> Visitor<'de> for EpochMsVisitor {
        type Value = i64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("epoch milliseconds or an RFC 3339 timestamp")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
            Ok(v)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
            i64::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<i64, E> {
            if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                Ok(v as i64)
            } else {
                Err(E::invalid_value(de::Unexpected::Float(v), &self))
            }
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
            let v = v.trim();
            if let Ok(ms) = v.parse::<i64>() {
                return Ok(ms);
            }
            DateTime::parse_from_rfc3339(v)
                .map(|dt| dt.timestamp_millis())
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }
}

// ─── Row types ────────────────────────────────────────────────────────────────

/// A button click at an instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickRow {
    #[serde(rename = "timestamp", deserialize_with = "epoch_ms::deserialize")]
    pub timestamp_ms: i64,
    #[serde(rename = "button", alias = "buttonId")]
    pub button_id: String,
}

/// A mouse button transition on an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseRow {
    #[serde(rename = "timestamp", deserialize_with = "epoch_ms::deserialize")]
    pub timestamp_ms: i64,
    #[serde(alias = "object")]
    pub object_id: String,
    /// `1` = pressed, `0` = released.
    pub down_up: u8,
}

impl MouseRow {
    pub fn is_down(&self) -> bool {
        self.down_up == 1
    }
}

/// Camera / object pose.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Pose {
    fn is_finite(&self) -> bool {
        [self.x, self.y, self.zoom, self.alpha, self.beta, self.gamma]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// A pose held by an object over `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialRow {
    #[serde(alias = "object")]
    pub object_id: String,
    #[serde(rename = "start", deserialize_with = "epoch_ms::deserialize")]
    pub start_ms: i64,
    #[serde(rename = "end", deserialize_with = "epoch_ms::deserialize")]
    pub end_ms: i64,
    #[serde(flatten)]
    pub pose: Pose,
}

/// A comparison between the pose a participant produced and the expected one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreRow {
    #[serde(rename = "timestamp", deserialize_with = "epoch_ms::deserialize")]
    pub timestamp_ms: i64,
    #[serde(alias = "object")]
    pub object_id: String,
    pub actual: Pose,
    pub expected: Pose,
}

/// A tooltip hover over `[start, end)` with pointer positions at both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TooltipRow {
    #[serde(alias = "object")]
    pub object_id: String,
    #[serde(rename = "start", deserialize_with = "epoch_ms::deserialize")]
    pub start_ms: i64,
    #[serde(rename = "end", deserialize_with = "epoch_ms::deserialize")]
    pub end_ms: i64,
    #[serde(alias = "start_x")]
    pub start_x: f64,
    #[serde(alias = "start_y")]
    pub start_y: f64,
    #[serde(alias = "end_x")]
    pub end_x: f64,
    #[serde(alias = "end_y")]
    pub end_y: f64,
}

// ─── ChannelRow ───────────────────────────────────────────────────────────────

/// Behaviour shared by every row type.
pub trait ChannelRow: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const CHANNEL: Channel;

    /// `(start, end)` of the row; instants return the same value twice.
    fn span(&self) -> (i64, i64);

    /// Object the row is keyed on, if the channel has one.
    fn object_id(&self) -> Option<&str>;

    /// Row-local checks that do not need storage.
    fn validate(&self) -> Result<(), CollectorError>;

    fn into_batch(rows: Vec<Self>) -> Batch;
}

fn require_id(field: &str, value: &str) -> Result<(), CollectorError> {
    if value.trim().is_empty() {
        return Err(CollectorError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_interval(start: i64, end: i64) -> Result<(), CollectorError> {
    if end < start {
        return Err(CollectorError::Validation(format!(
            "interval end {end} precedes start {start}"
        )));
    }
    Ok(())
}

impl ChannelRow for ClickRow {
    const CHANNEL: Channel = Channel::Click;

    fn span(&self) -> (i64, i64) {
        (self.timestamp_ms, self.timestamp_ms)
    }

    fn object_id(&self) -> Option<&str> {
        None
    }

    fn validate(&self) -> Result<(), CollectorError> {
        require_id("button", &self.button_id)
    }

    fn into_batch(rows: Vec<Self>) -> Batch {
        Batch::Click(rows)
    }
}

impl ChannelRow for MouseRow {
    const CHANNEL: Channel = Channel::Mouse;

    fn span(&self) -> (i64, i64) {
        (self.timestamp_ms, self.timestamp_ms)
    }

    fn object_id(&self) -> Option<&str> {
        Some(&self.object_id)
    }

    fn validate(&self) -> Result<(), CollectorError> {
        require_id("objectId", &self.object_id)?;
        if self.down_up > 1 {
            return Err(CollectorError::Validation(format!(
                "downUp must be 0 or 1, got {}",
                self.down_up
            )));
        }
        Ok(())
    }

    fn into_batch(rows: Vec<Self>) -> Batch {
        Batch::Mouse(rows)
    }
}

impl ChannelRow for SpatialRow {
    const CHANNEL: Channel = Channel::Spatial;

    fn span(&self) -> (i64, i64) {
        (self.start_ms, self.end_ms)
    }

    fn object_id(&self) -> Option<&str> {
        Some(&self.object_id)
    }

    fn validate(&self) -> Result<(), CollectorError> {
        require_id("objectId", &self.object_id)?;
        require_interval(self.start_ms, self.end_ms)?;
        if !self.pose.is_finite() {
            return Err(CollectorError::Validation("pose values must be finite".into()));
        }
        Ok(())
    }

    fn into_batch(rows: Vec<Self>) -> Batch {
        Batch::Spatial(rows)
    }
}

impl ChannelRow for ScoreRow {
    const CHANNEL: Channel = Channel::Score;

    fn span(&self) -> (i64, i64) {
        (self.timestamp_ms, self.timestamp_ms)
    }

    fn object_id(&self) -> Option<&str> {
        Some(&self.object_id)
    }

    fn validate(&self) -> Result<(), CollectorError> {
        require_id("objectId", &self.object_id)?;
        if !self.actual.is_finite() || !self.expected.is_finite() {
            return Err(CollectorError::Validation("score values must be finite".into()));
        }
        Ok(())
    }

    fn into_batch(rows: Vec<Self>) -> Batch {
        Batch::Score(rows)
    }
}

impl ChannelRow for TooltipRow {
    const CHANNEL: Channel = Channel::Tooltip;

    fn span(&self) -> (i64, i64) {
        (self.start_ms, self.end_ms)
    }

    fn object_id(&self) -> Option<&str> {
        Some(&self.object_id)
    }

    fn validate(&self) -> Result<(), CollectorError> {
        require_id("objectId", &self.object_id)?;
        require_interval(self.start_ms, self.end_ms)?;
        let coords = [self.start_x, self.start_y, self.end_x, self.end_y];
        if !coords.iter().all(|v| v.is_finite()) {
            return Err(CollectorError::Validation("tooltip coordinates must be finite".into()));
        }
        Ok(())
    }

    fn into_batch(rows: Vec<Self>) -> Batch {
        Batch::Tooltip(rows)
    }
}

/// Latest instant covered by any row, or `None` for an empty slice.
pub fn max_time<R: ChannelRow>(rows: &[R]) -> Option<i64> {
    rows.iter()
        .map(|r| {
            let (start, end) = r.span();
            start.max(end)
        })
        .max()
}

fn validate_rows<R: ChannelRow>(rows: &[R]) -> Result<(), CollectorError> {
    for (i, row) in rows.iter().enumerate() {
        row.validate()
            .map_err(|e| e.context(format!("{} row {i}", R::CHANNEL)))?;
    }
    Ok(())
}

// ─── Batch ────────────────────────────────────────────────────────────────────

/// An ordered set of rows for one channel, inserted atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    Click(Vec<ClickRow>),
    Mouse(Vec<MouseRow>),
    Spatial(Vec<SpatialRow>),
    Score(Vec<ScoreRow>),
    Tooltip(Vec<TooltipRow>),
}

impl Batch {
    /// An empty batch for `channel`.
    pub fn empty(channel: Channel) -> Self {
        match channel {
            Channel::Click => Self::Click(vec![]),
            Channel::Mouse => Self::Mouse(vec![]),
            Channel::Spatial => Self::Spatial(vec![]),
            Channel::Score => Self::Score(vec![]),
            Channel::Tooltip => Self::Tooltip(vec![]),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Self::Click(_) => Channel::Click,
            Self::Mouse(_) => Channel::Mouse,
            Self::Spatial(_) => Channel::Spatial,
            Self::Score(_) => Channel::Score,
            Self::Tooltip(_) => Channel::Tooltip,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Click(rows) => rows.len(),
            Self::Mouse(rows) => rows.len(),
            Self::Spatial(rows) => rows.len(),
            Self::Score(rows) => rows.len(),
            Self::Tooltip(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest event time across all rows (interval ends included).
    pub fn max_time_ms(&self) -> Option<i64> {
        match self {
            Self::Click(rows) => max_time(rows),
            Self::Mouse(rows) => max_time(rows),
            Self::Spatial(rows) => max_time(rows),
            Self::Score(rows) => max_time(rows),
            Self::Tooltip(rows) => max_time(rows),
        }
    }

    /// Run row-local validation; the first failing row is reported.
    pub fn validate(&self) -> Result<(), CollectorError> {
        match self {
            Self::Click(rows) => validate_rows(rows),
            Self::Mouse(rows) => validate_rows(rows),
            Self::Spatial(rows) => validate_rows(rows),
            Self::Score(rows) => validate_rows(rows),
            Self::Tooltip(rows) => validate_rows(rows),
        }
    }

    /// Parse rows for `channel` from JSON.
    ///
    /// Accepts either a bare array of rows or an object with a `data` array,
    /// which is the shape request bodies arrive in.
    pub fn from_json(channel: Channel, value: serde_json::Value) -> Result<Self, CollectorError> {
        let rows = match value {
            serde_json::Value::Object(mut obj) => obj.remove("data").ok_or_else(|| {
                CollectorError::Validation(format!("{channel} payload has no `data` array"))
            })?,
            other => other,
        };

        fn parse<R: ChannelRow>(rows: serde_json::Value) -> Result<Batch, CollectorError> {
            let rows: Vec<R> = serde_json::from_value(rows).map_err(|e| {
                CollectorError::Validation(format!("malformed {} rows: {e}", R::CHANNEL))
            })?;
            Ok(R::into_batch(rows))
        }

        match channel {
            Channel::Click => parse::<ClickRow>(rows),
            Channel::Mouse => parse::<MouseRow>(rows),
            Channel::Spatial => parse::<SpatialRow>(rows),
            Channel::Score => parse::<ScoreRow>(rows),
            Channel::Tooltip => parse::<TooltipRow>(rows),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
