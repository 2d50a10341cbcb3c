//! LoopHandle - 単一のバックグラウンドループ（Scheduler / Reaper）のハンドル

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle to a spawned periodic loop.
/// - `request_shutdown()` で次の待機点で止まる（実行中のパスは最後まで走る）
/// - `shutdown_and_join()` で終了まで待てる
pub struct LoopHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LoopHandle {
    /// Spawn `body` with a shutdown receiver it must watch.
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(body(shutdown_rx));
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already have exited
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

/// Sleep for `period`, waking early on shutdown.
///
/// Returns `false` once the loop should stop.
pub(crate) async fn wait_next_tick(
    period: std::time::Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    let alive = tokio::select! {
        // sender dropped counts as shutdown
        changed = shutdown_rx.changed() => changed.is_ok(),
        _ = tokio::time::sleep(period) => true,
    };
    alive && !*shutdown_rx.borrow()
}
