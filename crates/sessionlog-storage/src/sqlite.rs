//! SQLite storage backend for sessionlog.
//!
//! Persists sessions and the five telemetry tables to a single SQLite file.
//! All access goes through one pooled connection, so write transactions are
//! serialized. Uniqueness is declared with `UNIQUE`/`CHECK` constraints and
//! interval overlap is rejected by `BEFORE INSERT` triggers; both surface as
//! [`CollectorError::ConstraintViolation`].
//!
//! # Usage
//! ```rust,no_run
//! use sessionlog_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./sessions.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::error::{DatabaseError, ErrorKind};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use sessionlog_core::channel::{
    Batch, Channel, ClickRow, MouseRow, Pose, ScoreRow, SpatialRow, TooltipRow,
};
use sessionlog_core::error::CollectorError;
use sessionlog_core::store::{CloseOutcome, SessionStore, TelemetryStore, WriteGuard};
use sessionlog_core::types::{Session, SessionId, SessionMeta};

/// Primary result code shared by every SQLite constraint failure.
const SQLITE_CONSTRAINT: i32 = 19;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        uuid             TEXT    NOT NULL PRIMARY KEY,
        user_id          TEXT    NOT NULL,
        model_id         TEXT    NOT NULL,
        start_ms         INTEGER NOT NULL,
        end_ms           INTEGER,
        last_activity_ms INTEGER NOT NULL,
        UNIQUE (user_id, start_ms, model_id)
    );",
    "CREATE INDEX IF NOT EXISTS idx_sessions_open ON sessions (last_activity_ms) WHERE end_ms IS NULL;",
    "CREATE TABLE IF NOT EXISTS click_data (
        session_id TEXT    NOT NULL REFERENCES sessions (uuid),
        time_ms    INTEGER NOT NULL,
        button_id  TEXT    NOT NULL,
        UNIQUE (session_id, time_ms)
    );",
    "CREATE TABLE IF NOT EXISTS mouse_data (
        session_id TEXT    NOT NULL REFERENCES sessions (uuid),
        time_ms    INTEGER NOT NULL,
        object_id  TEXT    NOT NULL,
        down_up    INTEGER NOT NULL CHECK (down_up IN (0, 1)),
        UNIQUE (session_id, object_id, time_ms)
    );",
    "CREATE TABLE IF NOT EXISTS spatial_data (
        session_id TEXT    NOT NULL REFERENCES sessions (uuid),
        object_id  TEXT    NOT NULL,
        start_ms   INTEGER NOT NULL,
        end_ms     INTEGER NOT NULL,
        x          REAL    NOT NULL,
        y          REAL    NOT NULL,
        zoom       REAL    NOT NULL DEFAULT 1.0,
        alpha      REAL    NOT NULL DEFAULT 0.0,
        beta       REAL    NOT NULL DEFAULT 0.0,
        gamma      REAL    NOT NULL DEFAULT 0.0,
        CHECK (end_ms >= start_ms),
        UNIQUE (session_id, object_id, start_ms)
    );",
    "CREATE TRIGGER IF NOT EXISTS spatial_data_no_overlap
     BEFORE INSERT ON spatial_data
     WHEN EXISTS (
         SELECT 1 FROM spatial_data
         WHERE session_id = NEW.session_id
           AND object_id  = NEW.object_id
           AND start_ms   < NEW.end_ms
           AND NEW.start_ms < end_ms
     )
     BEGIN
         SELECT RAISE(ABORT, 'spatial_data: interval overlaps an existing row');
     END;",
    "CREATE TABLE IF NOT EXISTS score_data (
        session_id TEXT    NOT NULL REFERENCES sessions (uuid),
        object_id  TEXT    NOT NULL,
        time_ms    INTEGER NOT NULL,
        a_x        REAL    NOT NULL,
        a_y        REAL    NOT NULL,
        a_zoom     REAL    NOT NULL DEFAULT 1.0,
        a_alpha    REAL    NOT NULL DEFAULT 0.0,
        a_beta     REAL    NOT NULL DEFAULT 0.0,
        a_gamma    REAL    NOT NULL DEFAULT 0.0,
        e_x        REAL    NOT NULL,
        e_y        REAL    NOT NULL,
        e_zoom     REAL    NOT NULL DEFAULT 1.0,
        e_alpha    REAL    NOT NULL DEFAULT 0.0,
        e_beta     REAL    NOT NULL DEFAULT 0.0,
        e_gamma    REAL    NOT NULL DEFAULT 0.0,
        UNIQUE (session_id, object_id, time_ms)
    );",
    "CREATE TABLE IF NOT EXISTS tooltip_data (
        session_id TEXT    NOT NULL REFERENCES sessions (uuid),
        object_id  TEXT    NOT NULL,
        start_ms   INTEGER NOT NULL,
        end_ms     INTEGER NOT NULL,
        start_x    REAL    NOT NULL,
        start_y    REAL    NOT NULL,
        end_x      REAL    NOT NULL,
        end_y      REAL    NOT NULL,
        CHECK (end_ms >= start_ms),
        UNIQUE (session_id, object_id, start_ms)
    );",
    "CREATE TRIGGER IF NOT EXISTS tooltip_data_no_overlap
     BEFORE INSERT ON tooltip_data
     WHEN EXISTS (
         SELECT 1 FROM tooltip_data
         WHERE session_id = NEW.session_id
           AND object_id  = NEW.object_id
           AND start_ms   < NEW.end_ms
           AND NEW.start_ms < end_ms
     )
     BEGIN
         SELECT RAISE(ABORT, 'tooltip_data: interval overlaps an existing row');
     END;",
];

const INSERT_CLICK: &str =
    "INSERT INTO click_data (session_id, time_ms, button_id) VALUES (?, ?, ?)";

const INSERT_MOUSE: &str =
    "INSERT INTO mouse_data (session_id, time_ms, object_id, down_up) VALUES (?, ?, ?, ?)";

const INSERT_SPATIAL: &str = "INSERT INTO spatial_data
     (session_id, object_id, start_ms, end_ms, x, y, zoom, alpha, beta, gamma)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const INSERT_SCORE: &str = "INSERT INTO score_data
     (session_id, object_id, time_ms,
      a_x, a_y, a_zoom, a_alpha, a_beta, a_gamma,
      e_x, e_y, e_zoom, e_alpha, e_beta, e_gamma)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const INSERT_TOOLTIP: &str = "INSERT INTO tooltip_data
     (session_id, object_id, start_ms, end_ms, start_x, start_y, end_x, end_y)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)";

/// Translate a driver error: constraint failures (including trigger
/// `RAISE(ABORT)`) become `ConstraintViolation`, everything else `Storage`.
pub(crate) fn map_sqlx_err(err: sqlx::Error) -> CollectorError {
    match &err {
        sqlx::Error::Database(db) if is_constraint(db.as_ref()) => {
            CollectorError::ConstraintViolation(db.message().to_string())
        }
        _ => CollectorError::Storage(err.to_string()),
    }
}

fn is_constraint(db: &dyn DatabaseError) -> bool {
    if !matches!(db.kind(), ErrorKind::Other) {
        return true;
    }
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .map_or(false, |code| code & 0xff == SQLITE_CONSTRAINT)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if matches!(db.kind(), ErrorKind::UniqueViolation))
}

fn session_from_row(row: &SqliteRow) -> Result<Session, CollectorError> {
    Ok(Session {
        id: SessionId::from(row.try_get::<String, _>("uuid").map_err(map_sqlx_err)?),
        user_id: row.try_get("user_id").map_err(map_sqlx_err)?,
        model_id: row.try_get("model_id").map_err(map_sqlx_err)?,
        start_ms: row.try_get("start_ms").map_err(map_sqlx_err)?,
        end_ms: row.try_get("end_ms").map_err(map_sqlx_err)?,
        last_activity_ms: row.try_get("last_activity_ms").map_err(map_sqlx_err)?,
    })
}

fn pose_from_row(row: &SqliteRow, prefix: &str) -> Result<Pose, sqlx::Error> {
    Ok(Pose {
        x: row.try_get(format!("{prefix}x").as_str())?,
        y: row.try_get(format!("{prefix}y").as_str())?,
        zoom: row.try_get(format!("{prefix}zoom").as_str())?,
        alpha: row.try_get(format!("{prefix}alpha").as_str())?,
        beta: row.try_get(format!("{prefix}beta").as_str())?,
        gamma: row.try_get(format!("{prefix}gamma").as_str())?,
    })
}

/// SQLite-backed storage for sessions and telemetry.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./sessions.db"`) or a full
    /// SQLite URL (`"sqlite:./sessions.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, CollectorError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(map_sqlx_err)?
            .foreign_keys(true);
        if !url.contains(":memory:") {
            // WAL — readers don't block the single writer
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        Self::connect(options).await
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the storage is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, CollectorError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(map_sqlx_err)?
            .foreign_keys(true);
        Self::connect(options).await
    }

    /// One long-lived connection: writes are serialized and an in-memory
    /// database lives exactly as long as the pool.
    async fn connect(options: SqliteConnectOptions) -> Result<Self, CollectorError> {
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), CollectorError> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        }
        debug!("schema ready");
        Ok(())
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ─── Row inserts ─────────────────────────────────────────────────────────

    async fn insert_clicks(
        conn: &mut SqliteConnection,
        session_id: &SessionId,
        rows: &[ClickRow],
    ) -> Result<(), CollectorError> {
        for (i, row) in rows.iter().enumerate() {
            sqlx::query(INSERT_CLICK)
                .bind(session_id.as_str())
                .bind(row.timestamp_ms)
                .bind(&row.button_id)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_err(e).context(format!("click row {i}")))?;
        }
        Ok(())
    }

    async fn insert_mouse(
        conn: &mut SqliteConnection,
        session_id: &SessionId,
        rows: &[MouseRow],
    ) -> Result<(), CollectorError> {
        for (i, row) in rows.iter().enumerate() {
            sqlx::query(INSERT_MOUSE)
                .bind(session_id.as_str())
                .bind(row.timestamp_ms)
                .bind(&row.object_id)
                .bind(i64::from(row.down_up))
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_err(e).context(format!("mouse row {i}")))?;
        }
        Ok(())
    }

    async fn insert_spatial(
        conn: &mut SqliteConnection,
        session_id: &SessionId,
        rows: &[SpatialRow],
    ) -> Result<(), CollectorError> {
        for (i, row) in rows.iter().enumerate() {
            sqlx::query(INSERT_SPATIAL)
                .bind(session_id.as_str())
                .bind(&row.object_id)
                .bind(row.start_ms)
                .bind(row.end_ms)
                .bind(row.pose.x)
                .bind(row.pose.y)
                .bind(row.pose.zoom)
                .bind(row.pose.alpha)
                .bind(row.pose.beta)
                .bind(row.pose.gamma)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_err(e).context(format!("spatial row {i}")))?;
        }
        Ok(())
    }

    async fn insert_scores(
        conn: &mut SqliteConnection,
        session_id: &SessionId,
        rows: &[ScoreRow],
    ) -> Result<(), CollectorError> {
        for (i, row) in rows.iter().enumerate() {
            let (a, e) = (&row.actual, &row.expected);
            sqlx::query(INSERT_SCORE)
                .bind(session_id.as_str())
                .bind(&row.object_id)
                .bind(row.timestamp_ms)
                .bind(a.x)
                .bind(a.y)
                .bind(a.zoom)
                .bind(a.alpha)
                .bind(a.beta)
                .bind(a.gamma)
                .bind(e.x)
                .bind(e.y)
                .bind(e.zoom)
                .bind(e.alpha)
                .bind(e.beta)
                .bind(e.gamma)
                .execute(&mut *conn)
                .await
                .map_err(|err| map_sqlx_err(err).context(format!("score row {i}")))?;
        }
        Ok(())
    }

    async fn insert_tooltips(
        conn: &mut SqliteConnection,
        session_id: &SessionId,
        rows: &[TooltipRow],
    ) -> Result<(), CollectorError> {
        for (i, row) in rows.iter().enumerate() {
            sqlx::query(INSERT_TOOLTIP)
                .bind(session_id.as_str())
                .bind(&row.object_id)
                .bind(row.start_ms)
                .bind(row.end_ms)
                .bind(row.start_x)
                .bind(row.start_y)
                .bind(row.end_x)
                .bind(row.end_y)
                .execute(&mut *conn)
                .await
                .map_err(|e| map_sqlx_err(e).context(format!("tooltip row {i}")))?;
        }
        Ok(())
    }

    // ─── Row reads ───────────────────────────────────────────────────────────

    async fn fetch_rows(
        &self,
        sql: &str,
        session_id: &SessionId,
    ) -> Result<Vec<SqliteRow>, CollectorError> {
        sqlx::query(sql)
            .bind(session_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)
    }

    fn decode_batch(channel: Channel, rows: &[SqliteRow]) -> Result<Batch, sqlx::Error> {
        Ok(match channel {
            Channel::Click => Batch::Click(
                rows.iter()
                    .map(|r| -> Result<ClickRow, sqlx::Error> {
                        Ok(ClickRow {
                            timestamp_ms: r.try_get("time_ms")?,
                            button_id: r.try_get("button_id")?,
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
            Channel::Mouse => Batch::Mouse(
                rows.iter()
                    .map(|r| -> Result<MouseRow, sqlx::Error> {
                        Ok(MouseRow {
                            timestamp_ms: r.try_get("time_ms")?,
                            object_id: r.try_get("object_id")?,
                            down_up: u8::from(r.try_get::<i64, _>("down_up")? != 0),
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
            Channel::Spatial => Batch::Spatial(
                rows.iter()
                    .map(|r| -> Result<SpatialRow, sqlx::Error> {
                        Ok(SpatialRow {
                            object_id: r.try_get("object_id")?,
                            start_ms: r.try_get("start_ms")?,
                            end_ms: r.try_get("end_ms")?,
                            pose: pose_from_row(r, "")?,
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
            Channel::Score => Batch::Score(
                rows.iter()
                    .map(|r| -> Result<ScoreRow, sqlx::Error> {
                        Ok(ScoreRow {
                            timestamp_ms: r.try_get("time_ms")?,
                            object_id: r.try_get("object_id")?,
                            actual: pose_from_row(r, "a_")?,
                            expected: pose_from_row(r, "e_")?,
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
            Channel::Tooltip => Batch::Tooltip(
                rows.iter()
                    .map(|r| -> Result<TooltipRow, sqlx::Error> {
                        Ok(TooltipRow {
                            object_id: r.try_get("object_id")?,
                            start_ms: r.try_get("start_ms")?,
                            end_ms: r.try_get("end_ms")?,
                            start_x: r.try_get("start_x")?,
                            start_y: r.try_get("start_y")?,
                            end_x: r.try_get("end_x")?,
                            end_y: r.try_get("end_y")?,
                        })
                    })
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

fn select_sql(channel: Channel) -> &'static str {
    match channel {
        Channel::Click => {
            "SELECT time_ms, button_id FROM click_data WHERE session_id = ? ORDER BY time_ms"
        }
        Channel::Mouse => {
            "SELECT time_ms, object_id, down_up FROM mouse_data
             WHERE session_id = ? ORDER BY time_ms, object_id"
        }
        Channel::Spatial => {
            "SELECT object_id, start_ms, end_ms, x, y, zoom, alpha, beta, gamma
             FROM spatial_data WHERE session_id = ? ORDER BY start_ms, object_id"
        }
        Channel::Score => {
            "SELECT object_id, time_ms,
                    a_x, a_y, a_zoom, a_alpha, a_beta, a_gamma,
                    e_x, e_y, e_zoom, e_alpha, e_beta, e_gamma
             FROM score_data WHERE session_id = ? ORDER BY time_ms, object_id"
        }
        Channel::Tooltip => {
            "SELECT object_id, start_ms, end_ms, start_x, start_y, end_x, end_y
             FROM tooltip_data WHERE session_id = ? ORDER BY start_ms, object_id"
        }
    }
}

// ─── SessionStore impl ───────────────────────────────────────────────────────

#[async_trait]
impl SessionStore for SqliteStorage {
    async fn insert_session(&self, session: &Session) -> Result<(), CollectorError> {
        sqlx::query(
            "INSERT INTO sessions (uuid, user_id, model_id, start_ms, end_ms, last_activity_ms)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.as_str())
        .bind(&session.user_id)
        .bind(&session.model_id)
        .bind(session.start_ms)
        .bind(session.end_ms)
        .bind(session.last_activity_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CollectorError::DuplicateSession {
                    user_id: session.user_id.clone(),
                    model_id: session.model_id.clone(),
                    start_ms: session.start_ms,
                }
            } else {
                map_sqlx_err(e)
            }
        })?;

        debug!(session_id = %session.id, "session stored");
        Ok(())
    }

    async fn find_session_id(&self, meta: &SessionMeta) -> Result<Option<SessionId>, CollectorError> {
        let row = sqlx::query(
            "SELECT uuid FROM sessions WHERE user_id = ? AND start_ms = ? AND model_id = ?",
        )
        .bind(&meta.user_id)
        .bind(meta.start_ms)
        .bind(&meta.model_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.map(|r| r.try_get::<String, _>("uuid").map(SessionId::from))
            .transpose()
            .map_err(map_sqlx_err)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, CollectorError> {
        let row = sqlx::query(
            "SELECT uuid, user_id, model_id, start_ms, end_ms, last_activity_ms
             FROM sessions WHERE uuid = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn set_session_end(&self, id: &SessionId, end_ms: i64) -> Result<CloseOutcome, CollectorError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        let updated = sqlx::query("UPDATE sessions SET end_ms = ? WHERE uuid = ? AND end_ms IS NULL")
            .bind(end_ms)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        let outcome = if updated.rows_affected() == 1 {
            CloseOutcome::Closed
        } else {
            let row = sqlx::query("SELECT end_ms FROM sessions WHERE uuid = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            match row {
                None => CloseOutcome::Missing,
                Some(r) => match r.try_get::<Option<i64>, _>("end_ms").map_err(map_sqlx_err)? {
                    Some(recorded) => CloseOutcome::AlreadyClosed(recorded),
                    None => {
                        return Err(CollectorError::Storage(format!(
                            "session {id} stayed open after close"
                        )))
                    }
                },
            }
        };

        tx.commit().await.map_err(map_sqlx_err)?;
        debug!(session_id = %id, end_ms, ?outcome, "session end requested");
        Ok(outcome)
    }

    async fn close_idle(&self, now_ms: i64, cutoff_ms: i64) -> Result<u64, CollectorError> {
        let result = sqlx::query(
            "UPDATE sessions SET end_ms = ?
             WHERE end_ms IS NULL AND last_activity_ms < ?",
        )
        .bind(now_ms)
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, CollectorError> {
        let rows = sqlx::query(
            "SELECT uuid, user_id, model_id, start_ms, end_ms, last_activity_ms
             FROM sessions ORDER BY start_ms, uuid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(session_from_row).collect()
    }
}

// ─── TelemetryStore impl ─────────────────────────────────────────────────────

#[async_trait]
impl TelemetryStore for SqliteStorage {
    async fn insert_batch(
        &self,
        session_id: &SessionId,
        batch: &Batch,
        guard: WriteGuard,
    ) -> Result<u64, CollectorError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;

        // Re-check writability and record activity in the same transaction.
        let touched = sqlx::query(
            "UPDATE sessions SET last_activity_ms = MAX(last_activity_ms, ?)
             WHERE uuid = ? AND (end_ms IS NULL OR end_ms >= ?)",
        )
        .bind(guard.observed_ms)
        .bind(session_id.as_str())
        .bind(guard.max_event_ms)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        if touched.rows_affected() == 0 {
            let row = sqlx::query("SELECT end_ms FROM sessions WHERE uuid = ?")
                .bind(session_id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            let end_ms = row
                .map(|r| r.try_get::<Option<i64>, _>("end_ms"))
                .transpose()
                .map_err(map_sqlx_err)?
                .flatten();
            return Err(match end_ms {
                Some(end_ms) => CollectorError::StaleWrite {
                    session_id: session_id.to_string(),
                    event_ms: guard.max_event_ms,
                    end_ms,
                },
                None => CollectorError::NotFound(session_id.to_string()),
            });
        }

        match batch {
            Batch::Click(rows) => Self::insert_clicks(&mut tx, session_id, rows).await?,
            Batch::Mouse(rows) => Self::insert_mouse(&mut tx, session_id, rows).await?,
            Batch::Spatial(rows) => Self::insert_spatial(&mut tx, session_id, rows).await?,
            Batch::Score(rows) => Self::insert_scores(&mut tx, session_id, rows).await?,
            Batch::Tooltip(rows) => Self::insert_tooltips(&mut tx, session_id, rows).await?,
        }

        tx.commit().await.map_err(map_sqlx_err)?;

        debug!(
            session_id = %session_id,
            channel = %batch.channel(),
            rows = batch.len(),
            "batch stored"
        );
        Ok(batch.len() as u64)
    }

    async fn count_rows(&self, session_id: &SessionId, channel: Channel) -> Result<u64, CollectorError> {
        let sql = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE session_id = ?",
            channel.table()
        );
        let row = sqlx::query(&sql)
            .bind(session_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        let cnt: i64 = row.try_get("cnt").map_err(map_sqlx_err)?;
        Ok(cnt as u64)
    }

    async fn fetch_batch(&self, session_id: &SessionId, channel: Channel) -> Result<Batch, CollectorError> {
        let rows = self.fetch_rows(select_sql(channel), session_id).await?;
        Self::decode_batch(channel, &rows).map_err(map_sqlx_err)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, start_ms: i64, last_activity_ms: i64) -> Session {
        Session {
            id: id.into(),
            user_id: "demo".into(),
            model_id: "demo_model".into(),
            start_ms,
            end_ms: None,
            last_activity_ms,
        }
    }

    fn spatial(object: &str, start_ms: i64, end_ms: i64) -> SpatialRow {
        SpatialRow {
            object_id: object.into(),
            start_ms,
            end_ms,
            pose: Pose {
                x: 20.0,
                y: 23.4,
                zoom: -1.0,
                alpha: 234.0,
                beta: 234.0,
                gamma: 234.0,
            },
        }
    }

    fn guard(max_event_ms: i64, observed_ms: i64) -> WriteGuard {
        WriteGuard {
            max_event_ms,
            observed_ms,
        }
    }

    // ── SessionStore ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn session_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let s = session("s1", 1_459_857_752_022, 7);
        store.insert_session(&s).await.unwrap();

        let loaded = store.get_session(&"s1".into()).await.unwrap().unwrap();
        assert_eq!(loaded, s);

        let found = store.find_session_id(&s.meta()).await.unwrap();
        assert_eq!(found, Some(SessionId::from("s1")));
        assert!(store.get_session(&"nope".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_natural_key_maps_to_duplicate_session() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.insert_session(&session("a", 10, 0)).await.unwrap();

        let err = store.insert_session(&session("b", 10, 0)).await.unwrap_err();
        assert_eq!(
            err,
            CollectorError::DuplicateSession {
                user_id: "demo".into(),
                model_id: "demo_model".into(),
                start_ms: 10,
            }
        );
    }

    #[tokio::test]
    async fn set_session_end_is_conditional() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.insert_session(&session("s", 0, 0)).await.unwrap();
        let id = SessionId::from("s");

        assert_eq!(store.set_session_end(&id, 900).await.unwrap(), CloseOutcome::Closed);
        assert_eq!(
            store.set_session_end(&id, 100).await.unwrap(),
            CloseOutcome::AlreadyClosed(900)
        );
        let loaded = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.end_ms, Some(900));

        assert_eq!(
            store.set_session_end(&"missing".into(), 5).await.unwrap(),
            CloseOutcome::Missing
        );
    }

    #[tokio::test]
    async fn close_idle_is_set_based() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.insert_session(&session("old-1", 1, 100)).await.unwrap();
        store.insert_session(&session("old-2", 2, 200)).await.unwrap();
        store.insert_session(&session("fresh", 3, 950)).await.unwrap();

        assert_eq!(store.close_idle(1_000, 500).await.unwrap(), 2);
        assert_eq!(store.close_idle(1_000, 500).await.unwrap(), 0);

        let sessions = store.list_sessions().await.unwrap();
        let ends: Vec<_> = sessions.iter().map(|s| (s.id.as_str(), s.end_ms)).collect();
        assert_eq!(
            ends,
            vec![("old-1", Some(1_000)), ("old-2", Some(1_000)), ("fresh", None)]
        );
    }

    // ── TelemetryStore ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn batch_insert_bumps_last_activity() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.insert_session(&session("s", 0, 10)).await.unwrap();
        let id = SessionId::from("s");

        let batch = Batch::Click(vec![
            ClickRow { timestamp_ms: 5, button_id: "play".into() },
            ClickRow { timestamp_ms: 6, button_id: "stop".into() },
        ]);
        assert_eq!(store.insert_batch(&id, &batch, guard(6, 500)).await.unwrap(), 2);

        let loaded = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.last_activity_ms, 500);
        assert_eq!(store.fetch_batch(&id, Channel::Click).await.unwrap(), batch);
    }

    #[tokio::test]
    async fn trigger_rejects_overlap_within_batch() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.insert_session(&session("s", 0, 0)).await.unwrap();
        let id = SessionId::from("s");

        let batch = Batch::Spatial(vec![
            spatial("3d", 60_000, 83_000),
            spatial("3d", 70_000, 90_000),
        ]);
        let err = store.insert_batch(&id, &batch, guard(90_000, 1)).await.unwrap_err();
        match err {
            CollectorError::ConstraintViolation(msg) => {
                assert!(msg.starts_with("spatial row 1:"), "{msg}");
                assert!(msg.contains("overlaps"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.count_rows(&id, Channel::Spatial).await.unwrap(), 0);

        // Activity bump rolled back with the rows.
        let loaded = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.last_activity_ms, 0);
    }

    #[tokio::test]
    async fn unique_click_timestamp_is_constraint_violation() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.insert_session(&session("s", 0, 0)).await.unwrap();
        let id = SessionId::from("s");

        let first = Batch::Click(vec![ClickRow { timestamp_ms: 5, button_id: "a".into() }]);
        store.insert_batch(&id, &first, guard(5, 1)).await.unwrap();

        let err = store.insert_batch(&id, &first, guard(5, 2)).await.unwrap_err();
        assert!(err.is_constraint(), "{err}");
        assert_eq!(store.count_rows(&id, Channel::Click).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn guard_reports_missing_and_stale() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut closed = session("s", 0, 0);
        closed.end_ms = Some(1_000);
        store.insert_session(&closed).await.unwrap();

        let batch = Batch::Click(vec![ClickRow { timestamp_ms: 2_000, button_id: "a".into() }]);
        let err = store
            .insert_batch(&"s".into(), &batch, guard(2_000, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::StaleWrite { end_ms: 1_000, event_ms: 2_000, .. }));

        let err = store
            .insert_batch(&"ghost".into(), &batch, guard(2_000, 1))
            .await
            .unwrap_err();
        assert_eq!(err, CollectorError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn score_rows_roundtrip_both_poses() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.insert_session(&session("s", 0, 0)).await.unwrap();
        let id = SessionId::from("s");

        let pose = spatial("p", 0, 0).pose;
        let batch = Batch::Score(vec![
            ScoreRow {
                timestamp_ms: 10,
                object_id: "p1".into(),
                actual: pose,
                expected: Pose { zoom: 2.0, ..pose },
            },
            ScoreRow {
                timestamp_ms: 10,
                object_id: "p2".into(),
                actual: pose,
                expected: pose,
            },
        ]);
        store.insert_batch(&id, &batch, guard(10, 1)).await.unwrap();
        assert_eq!(store.fetch_batch(&id, Channel::Score).await.unwrap(), batch);
    }

    #[tokio::test]
    async fn file_backed_storage_persists() {
        let path = std::env::temp_dir().join(format!("sessionlog-{}.db", SessionId::generate()));
        let path_str = path.to_string_lossy().to_string();

        {
            let store = SqliteStorage::open(&path_str).await.unwrap();
            store.insert_session(&session("s", 0, 0)).await.unwrap();
            store.close().await;
        }

        let store = SqliteStorage::open(&path_str).await.unwrap();
        assert!(store.get_session(&"s".into()).await.unwrap().is_some());
        store.close().await;

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{path_str}{suffix}"));
        }
    }
}
