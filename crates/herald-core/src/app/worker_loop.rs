//! WorkerPool - DispatchQueue から lease して配送する
//!
//! # 1 ジョブの流れ
//! 1. sender があれば RateLimiter で判定（超過なら送信せずに retryable な失敗）
//! 2. MailTransport::send()
//! 3. 成功: MessageStore::mark_sent() → ack
//! 4. 送信失敗: MessageStore::mark_failed() → fail（retry/dead はキューが判断）

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{DeliveryJob, ErrorKind, MessageId};
use crate::ports::{
    Clock, CounterError, DeliveryInfo, MailTransport, MessageStore, StoreError, TransportError,
};
use crate::queue::{DispatchQueue, FailOutcome, JobLease};
use crate::rate_limit::RateLimiter;

/// Why a delivery attempt failed. Every variant is handed back to the queue.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Rate limit exceeded for sender {sender}")]
    RateLimited { sender: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("store update failed: {0}")]
    Store(#[from] StoreError),

    #[error("rate limiter unavailable: {0}")]
    Counter(#[from] CounterError),
}

impl DeliveryError {
    /// Used for logging only; the queue retries every variant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::RateLimited { .. } => ErrorKind::Transient,
            DeliveryError::Transport(e) => e.kind(),
            DeliveryError::Store(e) => e.kind(),
            DeliveryError::Counter(_) => ErrorKind::Infrastructure,
        }
    }

    /// Transport failures are written to the store on every attempt.
    fn recorded_every_attempt(&self) -> bool {
        matches!(self, DeliveryError::Transport(_))
    }
}

/// Per-sender throughput ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderLimit {
    pub limit: u64,
    pub window: Duration,
}

impl Default for SenderLimit {
    /// 10 per hour.
    fn default() -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(3600),
        }
    }
}

/// Executes one delivery job against the store, the rate limiter and the transport.
///
/// Shared by every worker in the pool.
pub struct DeliveryWorker {
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn MailTransport>,
    rate_limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    sender_limit: SenderLimit,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn MailTransport>,
        rate_limiter: RateLimiter,
        clock: Arc<dyn Clock>,
        sender_limit: SenderLimit,
    ) -> Self {
        Self {
            store,
            transport,
            rate_limiter,
            clock,
            sender_limit,
        }
    }

    /// Run one attempt of the leased job.
    ///
    /// The store reflects a failure before the error is returned, so a final
    /// failed attempt stays visible after the queue drops the job.
    pub async fn deliver(&self, lease: &dyn JobLease) -> Result<DeliveryInfo, DeliveryError> {
        let job = lease.job();
        let result = self.attempt(job).await;

        if let Err(err) = &result {
            // Earlier rate-limited or infrastructure failures stay PROCESSING.
            if err.recorded_every_attempt() || lease.is_final_attempt() {
                self.record_failure(job.message_id, &err.to_string()).await;
            }
        }
        result
    }

    async fn attempt(&self, job: &DeliveryJob) -> Result<DeliveryInfo, DeliveryError> {
        if let (Some(sender), Some(key)) = (job.sender.as_deref(), job.sender_key()) {
            let limited = self
                .rate_limiter
                .is_limited(&key, self.sender_limit.limit, self.sender_limit.window)
                .await?;
            if limited {
                return Err(DeliveryError::RateLimited {
                    sender: sender.to_string(),
                });
            }
        }

        let info = self
            .transport
            .send(&job.to, &job.subject, &job.body)
            .await?;

        let written = self.store.mark_sent(job.message_id, self.clock.now()).await?;
        if !written {
            warn!(message_id = %job.message_id, "mark_sent ignored, message not in a deliverable state");
        }
        Ok(info)
    }

    /// Best effort: the attempt's own error is what the queue needs to see.
    async fn record_failure(&self, message_id: MessageId, reason: &str) {
        match self.store.mark_failed(message_id, reason).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%message_id, "mark_failed ignored, message already delivered or not claimed");
            }
            Err(e) => {
                error!(%message_id, error = %e, "could not record delivery failure");
            }
        }
    }
}

/// Worker pool handle.
/// - `request_shutdown()` で新しい lease を取らなくなる（実行中のジョブは最後まで走る）
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers.
    pub fn spawn(
        concurrency: usize,
        queue: Arc<dyn DispatchQueue>,
        worker: Arc<DeliveryWorker>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let q = Arc::clone(&queue);
            let w = Arc::clone(&worker);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, q, w, &mut rx).await;
            });
            joins.push(join);
        }

        info!(concurrency, "worker pool started");
        Self { shutdown_tx, joins }
    }

    pub fn size(&self) -> usize {
        self.joins.len()
    }

    /// Request shutdown for all workers.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
        info!("worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn DispatchQueue>,
    worker: Arc<DeliveryWorker>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // lease は待つので shutdown と競合させる
        let lease = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            lease = queue.lease() => lease,
        };

        // None = queue closed
        let Some(lease) = lease else {
            break;
        };

        let job_id = lease.job_id();
        let message_id = lease.job().message_id;
        let attempt = lease.attempt();

        match worker.deliver(lease.as_ref()).await {
            Ok(info) => {
                info!(worker_id, %job_id, %message_id, attempt, transport_id = %info.message_id, "message sent");
                if let Err(e) = lease.ack().await {
                    warn!(worker_id, %job_id, error = %e, "ack failed");
                }
            }
            Err(err) => {
                let kind = err.kind();
                match lease.fail(err.to_string()).await {
                    Ok(FailOutcome::RetryScheduled { delay }) => {
                        warn!(worker_id, %job_id, %message_id, attempt, ?kind, ?delay, error = %err, "delivery failed, retry scheduled");
                    }
                    Ok(FailOutcome::Dead) => {
                        error!(worker_id, %job_id, %message_id, attempt, ?kind, error = %err, "delivery failed, attempts exhausted");
                    }
                    Err(e) => {
                        warn!(worker_id, %job_id, error = %e, "fail report failed");
                    }
                }
            }
        }
    }
    debug!(worker_id, "worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageStatus, NewMessage, ScheduledMessage};
    use crate::impls::{InMemoryCounterStore, InMemoryMessageStore};
    use crate::ports::{CounterStore, FixedClock};
    use crate::queue::{InMemoryDispatchQueue, JobOptions};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::sync::Mutex;
    use ulid::Ulid;

    /// Transport that fails the first `failures` sends.
    #[derive(Default)]
    struct FlakyTransport {
        failures: Mutex<usize>,
        sent: Mutex<Vec<String>>,
    }

    impl FlakyTransport {
        fn failing(failures: usize) -> Self {
            Self {
                failures: Mutex::new(failures),
                sent: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl MailTransport for FlakyTransport {
        async fn send(&self, to: &str, _: &str, _: &str) -> Result<DeliveryInfo, TransportError> {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Unavailable("connection refused".to_string()));
            }
            self.sent.lock().unwrap().push(to.to_string());
            Ok(DeliveryInfo {
                message_id: "<test@local>".to_string(),
                accepted: vec![to.to_string()],
            })
        }
    }

    struct Fixture {
        store: Arc<InMemoryMessageStore>,
        queue: Arc<InMemoryDispatchQueue>,
        transport: Arc<FlakyTransport>,
        worker: Arc<DeliveryWorker>,
    }

    /// Counter store whose backend is gone.
    struct DownCounters;

    #[async_trait]
    impl CounterStore for DownCounters {
        async fn increment(&self, _: &str) -> Result<u64, CounterError> {
            Err(CounterError::Unavailable("redis down".to_string()))
        }

        async fn expire(&self, _: &str, _: Duration) -> Result<bool, CounterError> {
            Err(CounterError::Unavailable("redis down".to_string()))
        }
    }

    fn fixture(transport: FlakyTransport, sender_limit: SenderLimit) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let counters = Arc::new(InMemoryCounterStore::new(clock.clone()));
        fixture_with(transport, sender_limit, clock, counters)
    }

    fn fixture_with(
        transport: FlakyTransport,
        sender_limit: SenderLimit,
        clock: Arc<FixedClock>,
        counters: Arc<dyn CounterStore>,
    ) -> Fixture {
        let store = Arc::new(InMemoryMessageStore::new());
        let transport = Arc::new(transport);
        let limiter = RateLimiter::new(counters);
        let worker = Arc::new(DeliveryWorker::new(
            store.clone(),
            transport.clone(),
            limiter,
            clock,
            sender_limit,
        ));
        Fixture {
            store,
            queue: Arc::new(InMemoryDispatchQueue::default()),
            transport,
            worker,
        }
    }

    async fn claimed_job(store: &InMemoryMessageStore, sender: &str) -> DeliveryJob {
        let message = ScheduledMessage::new(
            MessageId::from_ulid(Ulid::new()),
            NewMessage::new("bob@example.com", "hi", "<p>hi</p>").from_sender(sender),
            Utc::now(),
        );
        let job = DeliveryJob::from(&message);
        store.insert(message).await.unwrap();
        store.try_claim(job.message_id, Utc::now()).await.unwrap();
        job
    }

    #[tokio::test]
    async fn successful_delivery_marks_sent() {
        let f = fixture(FlakyTransport::default(), SenderLimit::default());
        let job = claimed_job(&f.store, "alice").await;
        f.queue.enqueue(job.clone(), JobOptions::default()).await.unwrap();

        let lease = f.queue.lease().await.unwrap();
        f.worker.deliver(lease.as_ref()).await.unwrap();

        let stored = f.store.get(job.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.sent_at.is_some());
        assert_eq!(*f.transport.sent.lock().unwrap(), vec!["bob@example.com"]);
    }

    #[tokio::test]
    async fn transport_failure_marks_failed_and_is_retryable() {
        let f = fixture(FlakyTransport::failing(1), SenderLimit::default());
        let job = claimed_job(&f.store, "alice").await;
        f.queue.enqueue(job.clone(), JobOptions::default()).await.unwrap();

        let lease = f.queue.lease().await.unwrap();
        let err = f.worker.deliver(lease.as_ref()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
        assert!(err.kind().is_retryable());

        let stored = f.store.get(job.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("transport unavailable: connection refused")
        );
    }

    #[tokio::test]
    async fn rate_limited_sender_is_not_sent() {
        let limit = SenderLimit {
            limit: 1,
            window: Duration::from_secs(3600),
        };
        let f = fixture(FlakyTransport::default(), limit);
        let first = claimed_job(&f.store, "alice").await;
        let second = claimed_job(&f.store, "alice").await;
        let options = JobOptions {
            max_attempts: 1,
            ..JobOptions::default()
        };
        f.queue.enqueue(first, options.clone()).await.unwrap();
        f.queue.enqueue(second.clone(), options).await.unwrap();

        let lease = f.queue.lease().await.unwrap();
        f.worker.deliver(lease.as_ref()).await.unwrap();

        let lease = f.queue.lease().await.unwrap();
        let err = f.worker.deliver(lease.as_ref()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::RateLimited { ref sender } if sender == "alice"));
        assert_eq!(f.transport.sent.lock().unwrap().len(), 1);

        // final attempt: failure is recorded in the store
        let stored = f.store.get(second.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("Rate limit exceeded for sender alice")
        );
    }

    #[tokio::test]
    async fn rate_limited_early_attempt_leaves_message_processing() {
        let limit = SenderLimit {
            limit: 0,
            window: Duration::from_secs(3600),
        };
        let f = fixture(FlakyTransport::default(), limit);
        let job = claimed_job(&f.store, "alice").await;
        f.queue.enqueue(job.clone(), JobOptions::default()).await.unwrap();

        let lease = f.queue.lease().await.unwrap();
        assert!(f.worker.deliver(lease.as_ref()).await.is_err());
        assert_eq!(
            f.store.get(job.message_id).await.unwrap().unwrap().status,
            MessageStatus::Processing
        );
    }

    #[tokio::test]
    async fn counter_outage_on_final_attempt_marks_failed() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let f = fixture_with(
            FlakyTransport::default(),
            SenderLimit::default(),
            clock,
            Arc::new(DownCounters),
        );
        let job = claimed_job(&f.store, "alice").await;
        let options = JobOptions {
            max_attempts: 1,
            ..JobOptions::default()
        };
        f.queue.enqueue(job.clone(), options).await.unwrap();

        let lease = f.queue.lease().await.unwrap();
        let err = f.worker.deliver(lease.as_ref()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Counter(_)));
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert_eq!(lease.fail(err.to_string()).await.unwrap(), FailOutcome::Dead);

        let stored = f.store.get(job.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("rate limiter unavailable: counter store unavailable: redis down")
        );
        assert!(f.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn counter_outage_on_early_attempt_leaves_message_processing() {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let f = fixture_with(
            FlakyTransport::default(),
            SenderLimit::default(),
            clock,
            Arc::new(DownCounters),
        );
        let job = claimed_job(&f.store, "alice").await;
        f.queue.enqueue(job.clone(), JobOptions::default()).await.unwrap();

        let lease = f.queue.lease().await.unwrap();
        assert!(f.worker.deliver(lease.as_ref()).await.is_err());
        assert_eq!(
            f.store.get(job.message_id).await.unwrap().unwrap().status,
            MessageStatus::Processing
        );
    }

    #[rstest]
    #[case::rejected(TransportError::Rejected("no such user".into()), ErrorKind::Permanent)]
    #[case::unavailable(TransportError::Unavailable("timeout".into()), ErrorKind::Transient)]
    fn transport_errors_keep_their_kind(#[case] err: TransportError, #[case] kind: ErrorKind) {
        assert_eq!(DeliveryError::Transport(err).kind(), kind);
    }

    #[test]
    fn store_errors_keep_their_kind() {
        let backend = DeliveryError::Store(StoreError::Backend("disk full".into()));
        assert_eq!(backend.kind(), ErrorKind::Infrastructure);
        let missing = DeliveryError::Store(StoreError::NotFound(MessageId::from_ulid(Ulid::new())));
        assert_eq!(missing.kind(), ErrorKind::Permanent);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_retries_until_success() {
        let f = fixture(FlakyTransport::failing(2), SenderLimit::default());
        let job = claimed_job(&f.store, "alice").await;
        f.queue.enqueue(job.clone(), JobOptions::default()).await.unwrap();

        let pool = WorkerPool::spawn(2, f.queue.clone(), f.worker.clone());
        assert_eq!(pool.size(), 2);

        // 1s + 2s of backoff
        tokio::time::sleep(Duration::from_secs(5)).await;
        pool.shutdown_and_join().await;

        let stored = f.store.get(job.message_id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        let counts = f.queue.counts_by_state().await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.in_flight(), 0);
    }

    #[tokio::test]
    async fn pool_stops_when_queue_closes() {
        let f = fixture(FlakyTransport::default(), SenderLimit::default());
        let pool = WorkerPool::spawn(3, f.queue.clone(), f.worker.clone());

        f.queue.close().await;
        // every worker sees None and exits on its own
        tokio::time::timeout(Duration::from_secs(1), pool.shutdown_and_join())
            .await
            .unwrap();
    }
}
