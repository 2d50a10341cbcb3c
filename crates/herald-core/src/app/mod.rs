//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて配送パイプラインを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: 依存関係の構築とワイヤリング
//! - **Submission**: メッセージの登録と一覧
//! - **SchedulerLoop**: due メッセージの claim → enqueue
//! - **WorkerPool**: lease → rate limit → send → mark_sent / mark_failed
//! - **ReaperLoop**: 停滞した claim の回収（opt-in）
//! - **PipelineStatus**: 件数スナップショット

pub mod builder;
pub mod handle;
pub mod reaper_loop;
pub mod scheduler_loop;
pub mod status;
pub mod submission;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError, RunningApp};
pub use self::handle::LoopHandle;
pub use self::reaper_loop::ReaperLoop;
pub use self::scheduler_loop::{PassReport, SchedulerLoop};
pub use self::status::{PipelineStatus, StatusError};
pub use self::submission::{SubmitError, Submission};
pub use self::worker_loop::{DeliveryError, DeliveryWorker, SenderLimit, WorkerPool};
