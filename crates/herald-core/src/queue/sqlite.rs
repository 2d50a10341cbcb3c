//! SQLite-backed dispatch queue.
//!
//! Jobs live in the `delivery_jobs` table, so they survive a restart:
//! - QUEUED / RETRY_SCHEDULED rows are leased once `run_at` has passed
//! - a RUNNING row whose `lease_expires_at` has passed counts as a failed
//!   attempt, exactly like an unreported lease in the in-memory queue
//! - every transition is one conditional statement keyed on `attempts`, so a
//!   stale lease can never overwrite a newer one
//!
//! Several processes may share the file. Local enqueues wake waiting workers
//! at once; rows written by another process are picked up on the next poll.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use ulid::Ulid;

use super::memory::DEFAULT_VISIBILITY_TIMEOUT;
use super::{
    BackoffPolicy, DispatchQueue, FailOutcome, JobLease, JobOptions, JobState, QueueCounts,
    QueueError, ThroughputLimiter,
};
use crate::domain::{DeliveryJob, JobId, MessageId};
use crate::impls::sqlite_store::{decode_time, encode_time, open_file_pool, open_memory_pool};
use crate::ports::Clock;

/// How often an idle worker re-reads the table for rows it was not told about.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

type LeasedRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
    i64,
    f64,
    bool,
);

const LEASED_COLUMNS: &str = r#"id, message_id, "to", subject, body, sender, attempts, max_attempts, backoff_base_ms, backoff_multiplier, remove_on_success"#;

fn db(e: impl std::fmt::Display) -> QueueError {
    QueueError::OperationFailed(e.to_string())
}

fn parse_ulid(raw: &str) -> Result<Ulid, QueueError> {
    Ulid::from_string(raw).map_err(|e| QueueError::OperationFailed(format!("bad id '{raw}': {e}")))
}

/// `now + delay`, clamped instead of overflowing for absurd delays.
fn time_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or_else(|| now + chrono::Duration::days(365))
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// A job as it was when this lease was taken.
#[derive(Debug, Clone)]
struct Held {
    job_id: JobId,
    job: DeliveryJob,
    attempt: u32,
    options: JobOptions,
}

impl Held {
    fn from_row(row: LeasedRow) -> Result<Self, QueueError> {
        let (id, message_id, to, subject, body, sender, attempts, max_attempts, base_ms, multiplier, remove) =
            row;
        Ok(Self {
            job_id: JobId::from_ulid(parse_ulid(&id)?),
            job: DeliveryJob {
                message_id: MessageId::from_ulid(parse_ulid(&message_id)?),
                to,
                subject,
                body,
                sender,
            },
            attempt: to_u32(attempts),
            options: JobOptions {
                max_attempts: to_u32(max_attempts),
                backoff: BackoffPolicy {
                    base_delay: Duration::from_millis(u64::try_from(base_ms).unwrap_or(0)),
                    multiplier,
                },
                remove_on_success: remove,
            },
        })
    }

    fn lost(&self) -> QueueError {
        QueueError::LeaseLost {
            job_id: self.job_id,
            attempt: self.attempt,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Total {
    Succeeded,
    Dead,
}

/// Row-level transitions shared by the queue and its leases.
#[derive(Clone)]
struct JobTable {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl JobTable {
    async fn insert(
        &self,
        job_id: JobId,
        job: &DeliveryJob,
        options: &JobOptions,
    ) -> Result<(), QueueError> {
        let now = encode_time(self.clock.now());
        let base_ms = i64::try_from(options.backoff.base_delay.as_millis()).unwrap_or(i64::MAX);
        sqlx::query(
            r#"
            INSERT INTO delivery_jobs
                (id, message_id, "to", subject, body, sender, state, attempts, max_attempts,
                 backoff_base_ms, backoff_multiplier, remove_on_success, run_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'QUEUED', 0, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id.as_ulid().to_string())
        .bind(job.message_id.as_ulid().to_string())
        .bind(&job.to)
        .bind(&job.subject)
        .bind(&job.body)
        .bind(&job.sender)
        .bind(i64::from(options.max_attempts))
        .bind(base_ms)
        .bind(options.backoff.multiplier)
        .bind(options.remove_on_success)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    /// Move the earliest runnable row to RUNNING and return it.
    async fn claim_next(&self, visibility_timeout: Duration) -> Result<Option<Held>, QueueError> {
        let now = self.clock.now();
        let row: Option<LeasedRow> = sqlx::query_as(&format!(
            r#"
            UPDATE delivery_jobs
            SET state = 'RUNNING', attempts = attempts + 1, lease_expires_at = ?
            WHERE id = (
                SELECT id FROM delivery_jobs
                WHERE state IN ('QUEUED', 'RETRY_SCHEDULED') AND run_at <= ?
                ORDER BY run_at ASC, id ASC
                LIMIT 1
            )
            AND state IN ('QUEUED', 'RETRY_SCHEDULED')
            RETURNING {LEASED_COLUMNS}
            "#
        ))
        .bind(encode_time(time_after(now, visibility_timeout)))
        .bind(encode_time(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        row.map(Held::from_row).transpose()
    }

    /// RUNNING rows whose lease ran out.
    async fn expired(&self) -> Result<Vec<Held>, QueueError> {
        let rows: Vec<LeasedRow> = sqlx::query_as(&format!(
            "SELECT {LEASED_COLUMNS} FROM delivery_jobs WHERE state = 'RUNNING' AND lease_expires_at <= ?"
        ))
        .bind(encode_time(self.clock.now()))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.into_iter().map(Held::from_row).collect()
    }

    async fn succeed(&self, held: &Held) -> Result<(), QueueError> {
        let sql = if held.options.remove_on_success {
            "DELETE FROM delivery_jobs WHERE id = ? AND state = 'RUNNING' AND attempts = ?"
        } else {
            "UPDATE delivery_jobs SET state = 'SUCCEEDED', lease_expires_at = NULL WHERE id = ? AND state = 'RUNNING' AND attempts = ?"
        };
        let result = sqlx::query(sql)
            .bind(held.job_id.as_ulid().to_string())
            .bind(i64::from(held.attempt))
            .execute(&self.pool)
            .await
            .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(held.lost());
        }
        self.bump(Total::Succeeded).await
    }

    /// Schedule a retry, or drop the job once its attempts are used up.
    async fn fail_attempt(&self, held: &Held, error: &str) -> Result<FailOutcome, QueueError> {
        let job_id = held.job_id;

        if held.attempt >= held.options.max_attempts {
            let result = sqlx::query(
                "DELETE FROM delivery_jobs WHERE id = ? AND state = 'RUNNING' AND attempts = ?",
            )
            .bind(job_id.as_ulid().to_string())
            .bind(i64::from(held.attempt))
            .execute(&self.pool)
            .await
            .map_err(db)?;
            if result.rows_affected() == 0 {
                return Err(held.lost());
            }
            warn!(%job_id, attempts = held.attempt, %error, "attempts exhausted, dropping job");
            self.bump(Total::Dead).await?;
            return Ok(FailOutcome::Dead);
        }

        let delay = held.options.backoff.next_delay(held.attempt);
        let run_at = time_after(self.clock.now(), delay);
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET state = 'RETRY_SCHEDULED', run_at = ?, last_error = ?, lease_expires_at = NULL
            WHERE id = ? AND state = 'RUNNING' AND attempts = ?
            "#,
        )
        .bind(encode_time(run_at))
        .bind(error)
        .bind(job_id.as_ulid().to_string())
        .bind(i64::from(held.attempt))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(held.lost());
        }
        debug!(%job_id, attempts = held.attempt, ?delay, "scheduling retry");
        Ok(FailOutcome::RetryScheduled { delay })
    }

    async fn bump(&self, total: Total) -> Result<(), QueueError> {
        let sql = match total {
            Total::Succeeded => "UPDATE delivery_job_totals SET succeeded = succeeded + 1 WHERE id = 1",
            Total::Dead => "UPDATE delivery_job_totals SET dead = dead + 1 WHERE id = 1",
        };
        sqlx::query(sql).execute(&self.pool).await.map_err(db)?;
        Ok(())
    }

    /// Earliest `run_at` or lease expiry still ahead of us.
    async fn next_event(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let (at,): (Option<String>,) = sqlx::query_as(
            r#"
            SELECT MIN(at) FROM (
                SELECT MIN(run_at) AS at FROM delivery_jobs WHERE state IN ('QUEUED', 'RETRY_SCHEDULED')
                UNION ALL
                SELECT MIN(lease_expires_at) AS at FROM delivery_jobs WHERE state = 'RUNNING'
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        at.as_deref().map(decode_time).transpose().map_err(db)
    }
}

/// Result of one look at the table.
enum Poll {
    Leased(Held),
    /// Nothing runnable; look again after this long.
    Idle(Duration),
    /// Runnable jobs are held back until the throughput window resets.
    Limited(Instant),
}

/// Durable dispatch queue over a SQLite table.
///
/// The throughput limiter is per process; each process sharing the file
/// applies its own window.
pub struct SqliteDispatchQueue {
    table: JobTable,
    notify: Arc<Notify>,
    closed: AtomicBool,
    visibility_timeout: Duration,
    poll_interval: Duration,
    limiter: Option<Mutex<ThroughputLimiter>>,
}

impl SqliteDispatchQueue {
    /// Open (or create) the queue tables in the database at `path`.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        let pool = open_file_pool(path.as_ref()).await.map_err(db)?;
        Self::with_pool(pool, clock).await
    }

    /// Private in-memory database (tests).
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        let pool = open_memory_pool().await.map_err(db)?;
        Self::with_pool(pool, clock).await
    }

    async fn with_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        let schema = include_str!("../../migrations/002_delivery_jobs.sql");
        sqlx::raw_sql(schema)
            .execute(&pool)
            .await
            .map_err(|e| QueueError::OperationFailed(format!("migration failed: {e}")))?;

        Ok(Self {
            table: JobTable { pool, clock },
            notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            limiter: None,
        })
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_limiter(mut self, limiter: ThroughputLimiter) -> Self {
        self.limiter = Some(Mutex::new(limiter));
        self
    }

    /// Fail every lease that outlived the visibility timeout.
    async fn expire_leases(&self) -> Result<(), QueueError> {
        for held in self.table.expired().await? {
            warn!(job_id = %held.job_id, attempt = held.attempt, "lease expired without ack, redelivering");
            match self.table.fail_attempt(&held, "lease expired").await {
                // a late ack or another process got there first
                Ok(_) | Err(QueueError::LeaseLost { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn poll(&self) -> Result<Poll, QueueError> {
        self.expire_leases().await?;

        let leased = match &self.limiter {
            Some(limiter) => {
                let mut limiter = limiter.lock().await;
                if let Err(reset_at) = limiter.try_acquire(Instant::now()) {
                    if self.table.next_event().await?.is_some_and(|at| at <= self.table.clock.now()) {
                        return Ok(Poll::Limited(reset_at));
                    }
                    None
                } else {
                    let leased = self.table.claim_next(self.visibility_timeout).await?;
                    if leased.is_none() {
                        limiter.refund();
                    }
                    leased
                }
            }
            None => self.table.claim_next(self.visibility_timeout).await?,
        };

        if let Some(held) = leased {
            return Ok(Poll::Leased(held));
        }

        let now = self.table.clock.now();
        let wait = match self.table.next_event().await? {
            Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
            None => self.poll_interval,
        };
        Ok(Poll::Idle(wait.min(self.poll_interval)))
    }
}

#[async_trait]
impl DispatchQueue for SqliteDispatchQueue {
    async fn enqueue(&self, job: DeliveryJob, options: JobOptions) -> Result<JobId, QueueError> {
        if options.max_attempts == 0 {
            return Err(QueueError::InvalidOptions(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let job_id = JobId::from_ulid(Ulid::new());
        self.table.insert(job_id, &job, &options).await?;
        debug!(%job_id, message_id = %job.message_id, "job enqueued");

        self.notify.notify_one();
        Ok(job_id)
    }

    async fn lease(&self) -> Option<Box<dyn JobLease>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            let wait = match self.poll().await {
                Ok(Poll::Leased(held)) => {
                    debug!(job_id = %held.job_id, attempt = held.attempt, "job leased");
                    let lease: Box<dyn JobLease> = Box::new(SqliteLease {
                        held,
                        table: self.table.clone(),
                        notify: Arc::clone(&self.notify),
                    });
                    return Some(lease);
                }
                Ok(Poll::Idle(wait)) => wait,
                Ok(Poll::Limited(reset_at)) => {
                    debug!("throughput limit reached, holding jobs until window resets");
                    reset_at.saturating_duration_since(Instant::now())
                }
                Err(e) => {
                    error!(error = %e, "queue poll failed");
                    self.poll_interval
                }
            };

            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep(wait) => {},
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM delivery_jobs GROUP BY state")
                .fetch_all(&self.table.pool)
                .await
                .map_err(db)?;
        let (succeeded, dead): (i64, i64) =
            sqlx::query_as("SELECT succeeded, dead FROM delivery_job_totals WHERE id = 1")
                .fetch_one(&self.table.pool)
                .await
                .map_err(db)?;

        let mut counts = QueueCounts {
            succeeded: usize::try_from(succeeded).unwrap_or(0),
            dead: usize::try_from(dead).unwrap_or(0),
            ..QueueCounts::default()
        };
        for (state, count) in rows {
            let count = usize::try_from(count).unwrap_or(0);
            match JobState::from_column(&state) {
                Some(JobState::Queued) => counts.queued = count,
                Some(JobState::Running) => counts.running = count,
                Some(JobState::RetryScheduled) => counts.retry_scheduled = count,
                // kept rows are already in the running total
                Some(JobState::Succeeded | JobState::Dead) => {}
                None => warn!(%state, "unknown job state in delivery_jobs"),
            }
        }
        Ok(counts)
    }
}

struct SqliteLease {
    held: Held,
    table: JobTable,
    notify: Arc<Notify>,
}

#[async_trait]
impl JobLease for SqliteLease {
    fn job_id(&self) -> JobId {
        self.held.job_id
    }

    fn job(&self) -> &DeliveryJob {
        &self.held.job
    }

    fn attempt(&self) -> u32 {
        self.held.attempt
    }

    fn max_attempts(&self) -> u32 {
        self.held.options.max_attempts
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.table.succeed(&self.held).await
    }

    async fn fail(self: Box<Self>, error: String) -> Result<FailOutcome, QueueError> {
        let outcome = self.table.fail_attempt(&self.held, &error).await?;
        if matches!(outcome, FailOutcome::RetryScheduled { .. }) {
            self.notify.notify_one();
        }
        Ok(outcome)
    }
}
