//! ReaperLoop - PROCESSING のまま止まった claim を PENDING に戻す
//!
//! claim の後で enqueue に失敗した（あるいはプロセスが落ちた）メッセージは
//! Scheduler からはもう見えない。有効にするとここで定期的に回収する。
//!
//! # 注意
//! 配送ジョブがまだキューに生きている場合、戻したメッセージは再度 claim されて
//! 二重送信になりうる。`stuck_after` はキューの最大リトライ時間より十分長くすること。

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::handle::{LoopHandle, wait_next_tick};
use crate::domain::MessageId;
use crate::ports::{Clock, MessageStore, StoreError};

const DEFAULT_BATCH: usize = 100;

/// Periodic sweep of stale claims.
pub struct ReaperLoop {
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    stuck_after: Duration,
    batch: usize,
}

impl ReaperLoop {
    pub fn new(
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        stuck_after: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            interval,
            stuck_after,
            batch: DEFAULT_BATCH,
        }
    }

    /// Release claims older than `stuck_after`.
    pub async fn run_once(&self) -> Result<Vec<MessageId>, StoreError> {
        let stuck_after = chrono::Duration::from_std(self.stuck_after)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(stuck_after)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let released = self.store.release_stuck(cutoff, self.batch).await?;
        for message_id in &released {
            warn!(%message_id, stuck_after = ?self.stuck_after, "stuck claim released back to PENDING");
        }
        Ok(released)
    }

    pub fn spawn(self) -> LoopHandle {
        LoopHandle::spawn(move |mut shutdown_rx| async move {
            info!(interval = ?self.interval, stuck_after = ?self.stuck_after, "reaper started");
            loop {
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "reaper pass failed");
                }
                if !wait_next_tick(self.interval, &mut shutdown_rx).await {
                    break;
                }
            }
            info!("reaper stopped");
        })
    }
}
