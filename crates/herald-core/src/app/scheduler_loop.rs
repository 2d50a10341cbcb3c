//! SchedulerLoop - due メッセージを claim して DispatchQueue に積む
//!
//! # フロー（1 パス）
//! 1. MessageStore::find_due() で PENDING かつ期限到来のものを scheduled_at 昇順で取得
//! 2. MessageStore::try_claim() で PENDING → PROCESSING（負けたらスキップ）
//! 3. DeliveryJob を組み立てて DispatchQueue::enqueue()
//!
//! パスが終わってから次の interval を待つので、パス同士は重ならない。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::handle::{LoopHandle, wait_next_tick};
use crate::domain::{DeliveryJob, MessageId};
use crate::ports::{Clock, MessageStore, StoreError};
use crate::queue::{DispatchQueue, JobOptions};

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Due candidates returned by `find_due`.
    pub found: usize,

    /// Claims won and enqueued.
    pub enqueued: Vec<MessageId>,

    /// Candidates another scheduler (or an earlier pass) claimed first.
    pub lost_races: usize,

    /// Claimed but never enqueued. These stay PROCESSING with no job.
    pub orphaned: Vec<MessageId>,

    /// Candidates skipped because the claim itself errored.
    pub claim_errors: usize,
}

/// Poller that turns due messages into delivery jobs.
pub struct SchedulerLoop {
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn DispatchQueue>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    batch_size: usize,
    job_options: JobOptions,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<dyn DispatchQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            clock,
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            job_options: JobOptions::default(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_job_options(mut self, job_options: JobOptions) -> Self {
        self.job_options = job_options;
        self
    }

    /// Run a single pass.
    ///
    /// Only a failing `find_due` fails the pass; per-message problems are
    /// logged and reported.
    pub async fn run_once(&self) -> Result<PassReport, StoreError> {
        let now = self.clock.now();
        let candidates = self.store.find_due(self.batch_size, now).await?;

        let mut report = PassReport {
            found: candidates.len(),
            ..PassReport::default()
        };

        for message in candidates {
            match self.store.try_claim(message.id, self.clock.now()).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(message_id = %message.id, "claim lost, skipping");
                    report.lost_races += 1;
                    continue;
                }
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "claim failed");
                    report.claim_errors += 1;
                    continue;
                }
            }

            let job = DeliveryJob::from(&message);
            match self.queue.enqueue(job, self.job_options.clone()).await {
                Ok(job_id) => {
                    debug!(message_id = %message.id, %job_id, "claimed and enqueued");
                    report.enqueued.push(message.id);
                }
                Err(e) => {
                    // Claimed with no job: the scheduler will never see this message again.
                    error!(
                        message_id = %message.id,
                        error = %e,
                        "enqueue failed after claim; message left PROCESSING without a delivery job"
                    );
                    report.orphaned.push(message.id);
                }
            }
        }

        Ok(report)
    }

    /// Run passes until shutdown. A failed pass never stops the loop.
    pub fn spawn(self) -> LoopHandle {
        LoopHandle::spawn(move |mut shutdown_rx| async move {
            info!(interval = ?self.poll_interval, batch_size = self.batch_size, "scheduler started");
            loop {
                match self.run_once().await {
                    Ok(report) if !report.enqueued.is_empty() || !report.orphaned.is_empty() => {
                        info!(
                            found = report.found,
                            enqueued = report.enqueued.len(),
                            lost_races = report.lost_races,
                            orphaned = report.orphaned.len(),
                            "scheduler pass"
                        );
                    }
                    Ok(report) => {
                        debug!(found = report.found, lost_races = report.lost_races, "scheduler pass");
                    }
                    Err(e) => {
                        error!(error = %e, "scheduler pass failed");
                    }
                }

                if !wait_next_tick(self.poll_interval, &mut shutdown_rx).await {
                    break;
                }
            }
            info!("scheduler stopped");
        })
    }
}
