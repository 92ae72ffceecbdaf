//! Resume store: durable session records plus append-only history.
//!
//! One record per session id, written by exactly one supervisor at a
//! time. History is append-only in effect — resuming extends a record,
//! it never truncates or loses prior entries.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::session::SessionStats;
use crate::worker::WorkerParams;
use crate::{AppError, Result};

/// Persisted session record, read once at resume time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Session identifier.
    pub id: String,
    /// Originating task prompt.
    pub prompt: String,
    /// Optional exploration scope.
    pub scope: Option<String>,
    /// Optional model override.
    pub model: Option<String>,
    /// Lifetimes resumed from this record so far.
    pub resume_count: u32,
    /// Latest stats snapshot.
    pub stats: SessionStats,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Build a fresh record from creation parameters.
    #[must_use]
    pub fn new(id: &str, params: &WorkerParams) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_owned(),
            prompt: params.prompt.clone(),
            scope: params.scope.clone(),
            model: params.model.clone(),
            resume_count: 0,
            stats: SessionStats::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Repository wrapper around the `SQLite` pool for session records.
#[derive(Clone)]
pub struct ResumeRepo {
    pool: SqlitePool,
}

impl ResumeRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails (including an id reuse).
    pub async fn create(&self, record: &SessionRecord) -> Result<()> {
        let stats = serde_json::to_string(&record.stats)?;
        sqlx::query(
            "INSERT INTO session_record \
             (id, prompt, scope, model, resume_count, stats, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.prompt)
        .bind(&record.scope)
        .bind(&record.model)
        .bind(record.resume_count)
        .bind(stats)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Retrieve a record by session identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT id, prompt, scope, model, resume_count, stats, created_at, updated_at \
             FROM session_record WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<SessionRecord> {
            let stats_json: String = row.try_get("stats")?;
            let stats: SessionStats = serde_json::from_str(&stats_json)?;
            Ok(SessionRecord {
                id: row.try_get("id")?,
                prompt: row.try_get("prompt")?,
                scope: row.try_get("scope")?,
                model: row.try_get("model")?,
                resume_count: row.try_get("resume_count")?,
                stats,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    /// Overwrite the stats snapshot and bump `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails or no record exists.
    pub async fn update_stats(&self, id: &str, stats: &SessionStats) -> Result<()> {
        let stats_json = serde_json::to_string(stats)?;
        let outcome = sqlx::query(
            "UPDATE session_record SET stats = ?, updated_at = ? WHERE id = ?",
        )
        .bind(stats_json)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(AppError::Db(format!("no session record for id {id}")));
        }
        Ok(())
    }

    /// Count one more resumed lifetime for a record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails or no record exists.
    pub async fn mark_resumed(&self, id: &str) -> Result<()> {
        let outcome = sqlx::query(
            "UPDATE session_record SET resume_count = resume_count + 1, updated_at = ? \
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(AppError::Db(format!("no session record for id {id}")));
        }
        Ok(())
    }

    /// Append one history entry for a session. Entries are never updated
    /// or deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn append_history(&self, id: &str, payload: &serde_json::Value) -> Result<()> {
        sqlx::query("INSERT INTO history_entry (session_id, payload, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(payload.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load the full history for a session in append order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or a payload is corrupt.
    pub async fn load_history(&self, id: &str) -> Result<Vec<serde_json::Value>> {
        let rows =
            sqlx::query("SELECT payload FROM history_entry WHERE session_id = ? ORDER BY seq ASC")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.try_get("payload")?;
                serde_json::from_str(&payload).map_err(AppError::from)
            })
            .collect()
    }

    /// Number of history entries recorded for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn history_len(&self, id: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM history_entry WHERE session_id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("cnt")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
