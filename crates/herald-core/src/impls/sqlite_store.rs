//! SqliteMessageStore - sqlx による永続 MessageStore
//!
//! # 設計
//! - 状態遷移はすべて `UPDATE ... WHERE status IN (...)` の単一文で行う
//! - 時刻は固定幅の RFC3339（UTC, ナノ秒）文字列で保存する。固定幅なので文字列比較 = 時刻比較

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::domain::{MessageId, MessageStatus, ScheduledMessage, StatusCounts};
use crate::ports::{MessageStore, StoreError};

const SELECT_COLUMNS: &str = r#"SELECT id, "to", subject, body, sender, status, scheduled_at, created_at, sent_at, error, claimed_at FROM scheduled_messages"#;

type MessageRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// SQLite-backed message store.
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let pool = open_file_pool(path.as_ref()).await.map_err(backend)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Private in-memory database (tests, demos).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = open_memory_pool().await.map_err(backend)?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../migrations/001_scheduled_messages.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn exists(&self, id: MessageId) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM scheduled_messages WHERE id = ?")
            .bind(id.as_ulid().to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }

    /// `rows_affected == 0` は「状態が合わない」か「存在しない」のどちらか
    async fn outcome_written(&self, id: MessageId, rows_affected: u64) -> Result<bool, StoreError> {
        if rows_affected > 0 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound(id))
        }
    }
}

/// File-backed pool; the message store and the job queue may share one file.
pub(crate) async fn open_file_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.to_string_lossy()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

pub(crate) async fn open_memory_pool() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

    // every connection to :memory: is a separate database
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// `2024-01-01T12:00:00.000000000Z`: full precision, sorts as text.
pub(crate) fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn decode_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn parse_id(raw: &str) -> Result<MessageId, StoreError> {
    raw.parse()
        .map_err(|e: crate::domain::ParseIdError| StoreError::Corrupt(e.to_string()))
}

fn row_to_message(row: MessageRow) -> Result<ScheduledMessage, StoreError> {
    let (id, to, subject, body, sender, status, scheduled_at, created_at, sent_at, error, claimed_at) =
        row;
    Ok(ScheduledMessage {
        id: parse_id(&id)?,
        to,
        subject,
        body,
        sender,
        status: status
            .parse::<MessageStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        scheduled_at: decode_time(&scheduled_at)?,
        created_at: decode_time(&created_at)?,
        sent_at: sent_at.as_deref().map(decode_time).transpose()?,
        last_error: error,
        claimed_at: claimed_at.as_deref().map(decode_time).transpose()?,
    })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn insert(&self, message: ScheduledMessage) -> Result<MessageId, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_messages
                (id, "to", subject, body, sender, status, scheduled_at, created_at, sent_at, error, claimed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.as_ulid().to_string())
        .bind(&message.to)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(&message.sender)
        .bind(message.status.as_str())
        .bind(encode_time(message.scheduled_at))
        .bind(encode_time(message.created_at))
        .bind(message.sent_at.map(encode_time))
        .bind(&message.last_error)
        .bind(message.claimed_at.map(encode_time))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(message.id),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate(message.id))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn get(&self, id: MessageId) -> Result<Option<ScheduledMessage>, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.as_ulid().to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(row_to_message).transpose()
    }

    async fn list_recent(&self) -> Result<Vec<ScheduledMessage>, StoreError> {
        let rows: Vec<MessageRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC, id DESC"))
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        rows.into_iter().map(row_to_message).collect()
    }

    async fn find_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE status = 'PENDING' AND scheduled_at <= ? ORDER BY scheduled_at ASC, id ASC LIMIT ?"
        ))
        .bind(encode_time(now))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(row_to_message).collect()
    }

    async fn try_claim(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_messages SET status = 'PROCESSING', claimed_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(encode_time(claimed_at))
        .bind(id.as_ulid().to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_sent(&self, id: MessageId, sent_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_messages SET status = 'SENT', sent_at = ? WHERE id = ? AND status IN ('PROCESSING', 'FAILED')",
        )
        .bind(encode_time(sent_at))
        .bind(id.as_ulid().to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        self.outcome_written(id, result.rows_affected()).await
    }

    async fn mark_failed(&self, id: MessageId, error: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE scheduled_messages SET status = 'FAILED', error = ? WHERE id = ? AND status IN ('PROCESSING', 'FAILED')",
        )
        .bind(error)
        .bind(id.as_ulid().to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        self.outcome_written(id, result.rows_affected()).await
    }

    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageId>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE scheduled_messages
            SET status = 'PENDING', claimed_at = NULL
            WHERE status = 'PROCESSING'
              AND id IN (
                SELECT id FROM scheduled_messages
                WHERE status = 'PROCESSING' AND claimed_at < ?
                ORDER BY claimed_at ASC
                LIMIT ?
              )
            RETURNING id
            "#,
        )
        .bind(encode_time(claimed_before))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(|(id,)| parse_id(id)).collect()
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM scheduled_messages GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let status = status
                .parse::<MessageStatus>()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let count = usize::try_from(count).unwrap_or(0);
            match status {
                MessageStatus::Pending => counts.pending = count,
                MessageStatus::Processing => counts.processing = count,
                MessageStatus::Sent => counts.sent = count,
                MessageStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}
