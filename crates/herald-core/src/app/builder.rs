//! AppBuilder - 依存関係のワイヤリングと起動時検証
//!
//! # Fail-fast 設計
//! - build() で config を検証し、MailTransport が未設定ならエラー
//! - store / queue / counter store / clock / id generator は未指定ならデフォルトを作る
//! - `store.kind = "sqlite"` なら queue も同じ DB ファイルに置く（再起動で job が消えない）

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::reaper_loop::ReaperLoop;
use super::scheduler_loop::SchedulerLoop;
use super::status::{PipelineStatus, StatusError};
use super::submission::Submission;
use super::worker_loop::{DeliveryWorker, SenderLimit, WorkerPool};
use super::handle::LoopHandle;
use crate::config::{ConfigError, HeraldConfig, StoreKind};
use crate::impls::{InMemoryCounterStore, InMemoryMessageStore, SqliteMessageStore};
use crate::ports::{
    Clock, CounterStore, IdGenerator, MailTransport, MessageStore, StoreError, SystemClock,
    UlidGenerator,
};
use crate::queue::{
    DispatchQueue, InMemoryDispatchQueue, QueueError, SqliteDispatchQueue, ThroughputLimiter,
};
use crate::rate_limit::RateLimiter;

/// BuildError はアプリケーション構築時のエラー
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no mail transport configured")]
    MissingTransport,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open message store: {0}")]
    Store(#[from] StoreError),

    #[error("failed to open dispatch queue: {0}")]
    Queue(#[from] QueueError),
}

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new(HeraldConfig::default())
///     .transport(Arc::new(LogTransport::new()))
///     .build()
///     .await?;
/// let running = app.start();
/// ```
pub struct AppBuilder {
    config: HeraldConfig,
    store: Option<Arc<dyn MessageStore>>,
    queue: Option<Arc<dyn DispatchQueue>>,
    counters: Option<Arc<dyn CounterStore>>,
    transport: Option<Arc<dyn MailTransport>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

impl AppBuilder {
    pub fn new(config: HeraldConfig) -> Self {
        Self {
            config,
            store: None,
            queue: None,
            counters: None,
            transport: None,
            clock: None,
            ids: None,
        }
    }

    /// Use this store instead of the one named in `[store]`.
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this queue instead of the one built from `[queue]`/`[worker]`/`[store]`.
    pub fn queue(mut self, queue: Arc<dyn DispatchQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn MailTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub async fn build(self) -> Result<App, BuildError> {
        self.config.validate()?;
        let transport = self.transport.ok_or(BuildError::MissingTransport)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let store: Arc<dyn MessageStore> = match self.store {
            Some(store) => store,
            None => match (self.config.store.kind, &self.config.store.sqlite_path) {
                (StoreKind::Sqlite, Some(path)) => Arc::new(SqliteMessageStore::new(path).await?),
                // validate() guarantees a path for sqlite
                _ => Arc::new(InMemoryMessageStore::new()),
            },
        };

        let queue: Arc<dyn DispatchQueue> = match self.queue {
            Some(queue) => queue,
            None => {
                let limiter = ThroughputLimiter::new(
                    self.config.worker.global_limit,
                    self.config.worker.global_window(),
                );
                match (self.config.store.kind, &self.config.store.sqlite_path) {
                    (StoreKind::Sqlite, Some(path)) => Arc::new(
                        SqliteDispatchQueue::open(path, Arc::clone(&clock))
                            .await?
                            .with_visibility_timeout(self.config.queue.visibility_timeout())
                            .with_poll_interval(self.config.queue.poll_interval())
                            .with_limiter(limiter),
                    ),
                    _ => Arc::new(InMemoryDispatchQueue::new(
                        self.config.queue.visibility_timeout(),
                        Some(limiter),
                    )),
                }
            }
        };

        let counters = self
            .counters
            .unwrap_or_else(|| Arc::new(InMemoryCounterStore::new(Arc::clone(&clock))));

        let worker = Arc::new(DeliveryWorker::new(
            Arc::clone(&store),
            transport,
            RateLimiter::new(counters),
            Arc::clone(&clock),
            SenderLimit {
                limit: self.config.worker.sender_limit,
                window: self.config.worker.sender_window(),
            },
        ));

        Ok(App {
            submission: Submission::new(Arc::clone(&store), ids, Arc::clone(&clock)),
            config: self.config,
            store,
            queue,
            clock,
            worker,
        })
    }
}

/// Wired pipeline, not yet running.
pub struct App {
    config: HeraldConfig,
    store: Arc<dyn MessageStore>,
    queue: Arc<dyn DispatchQueue>,
    clock: Arc<dyn Clock>,
    worker: Arc<DeliveryWorker>,
    submission: Submission,
}

impl App {
    pub fn config(&self) -> &HeraldConfig {
        &self.config
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn DispatchQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> SchedulerLoop {
        SchedulerLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            Arc::clone(&self.clock),
        )
        .with_poll_interval(self.config.scheduler.poll_interval())
        .with_batch_size(self.config.scheduler.batch_size)
        .with_job_options(self.config.queue.job_options())
    }

    pub async fn status(&self) -> Result<PipelineStatus, StatusError> {
        PipelineStatus::collect(self.store.as_ref(), self.queue.as_ref()).await
    }

    /// Spawn the scheduler, the worker pool and (if enabled) the reaper.
    pub fn start(&self) -> RunningApp {
        let reaper = self.config.reaper.enabled.then(|| {
            ReaperLoop::new(
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                self.config.reaper.interval(),
                self.config.reaper.stuck_after(),
            )
            .spawn()
        });

        let workers = WorkerPool::spawn(
            self.config.worker.concurrency,
            Arc::clone(&self.queue),
            Arc::clone(&self.worker),
        );
        let scheduler = self.scheduler().spawn();

        info!(reaper = reaper.is_some(), "pipeline started");
        RunningApp {
            scheduler,
            reaper,
            workers,
            queue: Arc::clone(&self.queue),
        }
    }
}

/// Handles to the running loops.
pub struct RunningApp {
    scheduler: LoopHandle,
    reaper: Option<LoopHandle>,
    workers: WorkerPool,
    queue: Arc<dyn DispatchQueue>,
}

impl RunningApp {
    /// Stop producing, let in-flight deliveries finish, then close the queue.
    ///
    /// Jobs still queued are lost with an in-memory queue; their messages stay
    /// PROCESSING (the reaper can release them on the next start). The sqlite
    /// queue keeps them for the next process.
    pub async fn shutdown_and_join(self) {
        self.scheduler.shutdown_and_join().await;
        if let Some(reaper) = self.reaper {
            reaper.shutdown_and_join().await;
        }
        self.workers.shutdown_and_join().await;
        self.queue.close().await;
        info!("pipeline stopped");
    }
}
