//! In-memory dispatch queue implementation.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use super::{
    DispatchQueue, FailOutcome, JobLease, JobOptions, JobRecord, JobState, QueueCounts,
    QueueError, ThroughputLimiter,
};
use crate::domain::{DeliveryJob, JobId};

/// How long a worker may hold a lease before the job is handed out again.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Timed entry for the retry and lease-expiry heaps.
///
/// We use Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Deadline {
    at: Instant,
    job_id: JobId,
    attempt: u32,
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier times have higher priority
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.job_id.cmp(&self.job_id))
            .then_with(|| other.attempt.cmp(&self.attempt))
    }
}

/// `now + delay`, clamped instead of overflowing for absurd delays.
fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}

/// Everything a lease needs to know about the job it covers.
struct Leased {
    job_id: JobId,
    job: DeliveryJob,
    attempt: u32,
    max_attempts: u32,
}

/// In-memory queue state.
struct QueueState {
    /// All job records (single source of truth for jobs).
    records: HashMap<JobId, JobRecord>,

    /// Ready queue (JobIds only).
    ready: VecDeque<JobId>,

    /// Retry backoff.
    scheduled: BinaryHeap<Deadline>,

    /// Lease expiry of Running jobs.
    inflight: BinaryHeap<Deadline>,

    limiter: Option<ThroughputLimiter>,

    succeeded: usize,
    dead: usize,
    closed: bool,
}

impl QueueState {
    fn new(limiter: Option<ThroughputLimiter>) -> Self {
        Self {
            records: HashMap::new(),
            ready: VecDeque::new(),
            scheduled: BinaryHeap::new(),
            inflight: BinaryHeap::new(),
            limiter,
            succeeded: 0,
            dead: 0,
            closed: false,
        }
    }

    /// Move jobs from scheduled to ready if their time has come.
    fn promote_scheduled(&mut self, now: Instant) {
        while self.scheduled.peek().is_some_and(|entry| entry.at <= now) {
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(record) = self.records.get_mut(&entry.job_id)
                && record.state == JobState::RetryScheduled
            {
                record.requeue();
                self.ready.push_back(entry.job_id);
            }
        }
    }

    /// Treat leases that outlived the visibility timeout as failed attempts.
    fn expire_leases(&mut self, now: Instant) {
        while self.inflight.peek().is_some_and(|entry| entry.at <= now) {
            let Some(entry) = self.inflight.pop() else {
                break;
            };
            let still_held = self
                .records
                .get(&entry.job_id)
                .is_some_and(|record| record.holds_lease(entry.attempt));
            if still_held {
                warn!(job_id = %entry.job_id, attempt = entry.attempt, "lease expired without ack, redelivering");
                self.fail_attempt(entry.job_id, "lease expired".to_string(), now);
            }
        }
    }

    /// Hand out the next ready job, subject to the throughput limiter.
    ///
    /// `Err(reset_at)` means a job is waiting but the limiter window is full.
    fn take_ready(
        &mut self,
        now: Instant,
        visibility_timeout: Duration,
    ) -> Result<Option<Leased>, Instant> {
        while let Some(&job_id) = self.ready.front() {
            let runnable = self
                .records
                .get(&job_id)
                .is_some_and(|record| record.state.is_runnable());
            if !runnable {
                self.ready.pop_front();
                continue;
            }

            if let Some(limiter) = self.limiter.as_mut() {
                limiter.try_acquire(now)?;
            }

            self.ready.pop_front();
            let Some(record) = self.records.get_mut(&job_id) else {
                continue;
            };
            let expires_at = deadline_after(now, visibility_timeout);
            record.start_attempt();
            self.inflight.push(Deadline {
                at: expires_at,
                job_id,
                attempt: record.attempts,
            });

            return Ok(Some(Leased {
                job_id,
                job: record.job.clone(),
                attempt: record.attempts,
                max_attempts: record.options.max_attempts,
            }));
        }
        Ok(None)
    }

    fn succeed(&mut self, job_id: JobId) {
        let Some(record) = self.records.get_mut(&job_id) else {
            return;
        };
        record.mark_succeeded();
        self.succeeded += 1;
        if record.options.remove_on_success {
            self.records.remove(&job_id);
        }
    }

    /// Record a failed attempt: schedule a retry or drop the job.
    fn fail_attempt(&mut self, job_id: JobId, error: String, now: Instant) -> Option<FailOutcome> {
        let record = self.records.get_mut(&job_id)?;

        if record.attempts_exhausted() {
            warn!(%job_id, attempts = record.attempts, %error, "attempts exhausted, dropping job");
            record.mark_dead(error);
            self.records.remove(&job_id);
            self.dead += 1;
            return Some(FailOutcome::Dead);
        }

        let delay = record.options.backoff.next_delay(record.attempts);
        let next_run_at = deadline_after(now, delay);
        debug!(%job_id, attempts = record.attempts, ?delay, "scheduling retry");
        record.schedule_retry(error);
        self.scheduled.push(Deadline {
            at: next_run_at,
            job_id,
            attempt: record.attempts,
        });
        Some(FailOutcome::RetryScheduled { delay })
    }

    /// Earliest instant at which waiting could produce a lease.
    fn next_wake(&self, limiter_reset: Option<Instant>) -> Option<Instant> {
        [
            self.scheduled.peek().map(|entry| entry.at),
            self.inflight.peek().map(|entry| entry.at),
            limiter_reset,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Get counts by state for observability.
    fn counts_by_state(&self) -> QueueCounts {
        let mut counts = QueueCounts {
            succeeded: self.succeeded,
            dead: self.dead,
            ..QueueCounts::default()
        };
        for record in self.records.values() {
            match record.state {
                JobState::Queued => counts.queued += 1,
                JobState::Running => counts.running += 1,
                JobState::RetryScheduled => counts.retry_scheduled += 1,
                // Totals above already include these.
                JobState::Succeeded | JobState::Dead => {}
            }
        }
        counts
    }
}

/// In-memory dispatch queue.
///
/// Jobs survive worker crashes (an unreported lease expires and the job is
/// handed out again) but not a process restart.
pub struct InMemoryDispatchQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
}

impl InMemoryDispatchQueue {
    pub fn new(visibility_timeout: Duration, limiter: Option<ThroughputLimiter>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::new(limiter))),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
        }
    }

    /// Snapshot of a job still held by the queue (pruned jobs return `None`).
    pub async fn get_record(&self, job_id: JobId) -> Option<JobRecord> {
        let state = self.state.lock().await;
        state.records.get(&job_id).cloned()
    }
}

impl Default for InMemoryDispatchQueue {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT, None)
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, job: DeliveryJob, options: JobOptions) -> Result<JobId, QueueError> {
        if options.max_attempts == 0 {
            return Err(QueueError::InvalidOptions(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let job_id = JobId::from_ulid(Ulid::new());
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            let message_id = job.message_id;
            state
                .records
                .insert(job_id, JobRecord::new(job_id, job, options));
            state.ready.push_back(job_id);
            debug!(%job_id, %message_id, "job enqueued");
        }

        // Notify waiting workers
        self.notify.notify_one();
        Ok(job_id)
    }

    async fn lease(&self) -> Option<Box<dyn JobLease>> {
        loop {
            // Register interest before inspecting state so a push or close
            // between the check and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }

                let now = Instant::now();
                state.promote_scheduled(now);
                state.expire_leases(now);

                match state.take_ready(now, self.visibility_timeout) {
                    Ok(Some(leased)) => {
                        debug!(job_id = %leased.job_id, attempt = leased.attempt, "job leased");
                        let lease: Box<dyn JobLease> = Box::new(InMemoryLease {
                            leased,
                            state: Arc::clone(&self.state),
                            notify: Arc::clone(&self.notify),
                        });
                        return Some(lease);
                    }
                    Ok(None) => state.next_wake(None),
                    Err(reset_at) => {
                        debug!("throughput limit reached, holding jobs until window resets");
                        state.next_wake(Some(reset_at))
                    }
                }
            };

            // Wait for notification OR the next timed event
            match next_wake {
                Some(wake_at) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(wake_at) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        Ok(state.counts_by_state())
    }
}

/// Lease implementation for InMemoryDispatchQueue.
struct InMemoryLease {
    leased: Leased,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryLease {
    fn lost(&self) -> QueueError {
        QueueError::LeaseLost {
            job_id: self.leased.job_id,
            attempt: self.leased.attempt,
        }
    }
}

#[async_trait]
impl JobLease for InMemoryLease {
    fn job_id(&self) -> JobId {
        self.leased.job_id
    }

    fn job(&self) -> &DeliveryJob {
        &self.leased.job
    }

    fn attempt(&self) -> u32 {
        self.leased.attempt
    }

    fn max_attempts(&self) -> u32 {
        self.leased.max_attempts
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let held = state
            .records
            .get(&self.leased.job_id)
            .is_some_and(|record| record.holds_lease(self.leased.attempt));
        if !held {
            return Err(self.lost());
        }
        state.succeed(self.leased.job_id);
        Ok(())
    }

    async fn fail(self: Box<Self>, error: String) -> Result<FailOutcome, QueueError> {
        let outcome = {
            let mut state = self.state.lock().await;
            let held = state
                .records
                .get(&self.leased.job_id)
                .is_some_and(|record| record.holds_lease(self.leased.attempt));
            if !held {
                return Err(self.lost());
            }
            state
                .fail_attempt(self.leased.job_id, error, Instant::now())
                .ok_or_else(|| self.lost())?
        }; // Lock released here

        // A waiting worker must recompute its wake-up time.
        if matches!(outcome, FailOutcome::RetryScheduled { .. }) {
            self.notify.notify_one();
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;
    use crate::queue::BackoffPolicy;

    fn job() -> DeliveryJob {
        DeliveryJob {
            message_id: MessageId::from_ulid(Ulid::new()),
            to: "bob@example.com".to_string(),
            subject: "hello".to_string(),
            body: "<p>hi</p>".to_string(),
            sender: Some("alice".to_string()),
        }
    }

    async fn lease_within(queue: &InMemoryDispatchQueue, wait: Duration) -> Option<Box<dyn JobLease>> {
        tokio::time::timeout(wait, queue.lease()).await.ok().flatten()
    }

    #[tokio::test]
    async fn enqueue_and_counts() {
        let queue = InMemoryDispatchQueue::default();
        queue.enqueue(job(), JobOptions::default()).await.unwrap();

        let counts = queue.counts_by_state().await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.running, 0);
    }

    #[tokio::test]
    async fn lease_transitions_to_running() {
        let queue = InMemoryDispatchQueue::default();
        let submitted = job();
        let job_id = queue
            .enqueue(submitted.clone(), JobOptions::default())
            .await
            .unwrap();

        let lease = lease_within(&queue, Duration::from_millis(100)).await.unwrap();
        assert_eq!(lease.job_id(), job_id);
        assert_eq!(lease.job(), &submitted);
        assert_eq!(lease.attempt(), 1);
        assert!(!lease.is_final_attempt());

        let counts = queue.counts_by_state().await.unwrap();
        assert_eq!(counts.queued, 0);
        assert_eq!(counts.running, 1);
    }

    #[tokio::test]
    async fn ack_prunes_record_by_default() {
        let queue = InMemoryDispatchQueue::default();
        let job_id = queue.enqueue(job(), JobOptions::default()).await.unwrap();

        let lease = queue.lease().await.unwrap();
        lease.ack().await.unwrap();

        assert!(queue.get_record(job_id).await.is_none());
        let counts = queue.counts_by_state().await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.running, 0);
    }

    #[tokio::test]
    async fn ack_keeps_record_when_asked() {
        let queue = InMemoryDispatchQueue::default();
        let options = JobOptions {
            remove_on_success: false,
            ..JobOptions::default()
        };
        let job_id = queue.enqueue(job(), options).await.unwrap();

        queue.lease().await.unwrap().ack().await.unwrap();

        let record = queue.get_record(job_id).await.unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(queue.counts_by_state().await.unwrap().succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_is_retried_after_backoff() {
        let queue = InMemoryDispatchQueue::default();
        queue.enqueue(job(), JobOptions::default()).await.unwrap();

        let lease = queue.lease().await.unwrap();
        let outcome = lease.fail("smtp down".to_string()).await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::RetryScheduled {
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(queue.counts_by_state().await.unwrap().retry_scheduled, 1);

        let failed_at = Instant::now();
        let lease = queue.lease().await.unwrap();
        assert!(failed_at.elapsed() >= Duration::from_secs(1));
        assert_eq!(lease.attempt(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_max_attempts_with_growing_delays() {
        let queue = InMemoryDispatchQueue::default();
        let job_id = queue.enqueue(job(), JobOptions::default()).await.unwrap();

        let mut waits = Vec::new();
        let mut outcome = None;
        let mut last_fail = Instant::now();
        for attempt in 1..=3 {
            let lease = queue.lease().await.unwrap();
            if attempt > 1 {
                waits.push(last_fail.elapsed());
            }
            assert_eq!(lease.attempt(), attempt);
            assert_eq!(lease.is_final_attempt(), attempt == 3);
            outcome = Some(lease.fail(format!("failure {attempt}")).await.unwrap());
            last_fail = Instant::now();
        }

        assert_eq!(outcome, Some(FailOutcome::Dead));
        assert!(waits[0] >= Duration::from_secs(1));
        assert!(waits[1] >= Duration::from_secs(2));
        assert!(waits[0] <= waits[1]);

        // Dropped, and never handed out again.
        assert!(queue.get_record(job_id).await.is_none());
        assert!(lease_within(&queue, Duration::from_secs(30)).await.is_none());
        let counts = queue.counts_by_state().await.unwrap();
        assert_eq!(counts.dead, 1);
        assert_eq!(counts.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_redelivered_and_stale_ack_is_rejected() {
        let queue = InMemoryDispatchQueue::new(Duration::from_secs(5), None);
        queue.enqueue(job(), JobOptions::default()).await.unwrap();

        let stale = queue.lease().await.unwrap();

        // Worker "crashed": no ack within the visibility timeout.
        let redelivered = queue.lease().await.unwrap();
        assert_eq!(redelivered.job_id(), stale.job_id());
        assert_eq!(redelivered.attempt(), 2);

        assert!(matches!(
            stale.ack().await,
            Err(QueueError::LeaseLost { attempt: 1, .. })
        ));
        redelivered.ack().await.unwrap();
        assert_eq!(queue.counts_by_state().await.unwrap().succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_limiter_holds_jobs_until_window_resets() {
        let limiter = ThroughputLimiter::new(2, Duration::from_secs(60));
        let queue = InMemoryDispatchQueue::new(DEFAULT_VISIBILITY_TIMEOUT, Some(limiter));
        for _ in 0..3 {
            queue.enqueue(job(), JobOptions::default()).await.unwrap();
        }

        let start = Instant::now();
        queue.lease().await.unwrap().ack().await.unwrap();
        queue.lease().await.unwrap().ack().await.unwrap();
        assert!(lease_within(&queue, Duration::from_secs(30)).await.is_none());
        assert_eq!(queue.counts_by_state().await.unwrap().queued, 1);

        queue.lease().await.unwrap().ack().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn close_wakes_waiting_workers() {
        let queue = Arc::new(InMemoryDispatchQueue::default());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.lease().await.is_none() }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        assert!(waiter.await.unwrap());
        assert!(matches!(
            queue.enqueue(job(), JobOptions::default()).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn push_wakes_pop() {
        let queue = Arc::new(InMemoryDispatchQueue::default());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.lease().await.map(|lease| lease.job_id()) }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let job_id = queue.enqueue(job(), JobOptions::default()).await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some(job_id));
    }

    #[tokio::test]
    async fn zero_attempts_is_rejected() {
        let queue = InMemoryDispatchQueue::default();
        let options = JobOptions {
            max_attempts: 0,
            backoff: BackoffPolicy::fixed(Duration::ZERO),
            remove_on_success: true,
        };
        assert!(matches!(
            queue.enqueue(job(), options).await,
            Err(QueueError::InvalidOptions(_))
        ));
    }
}
