//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryMessageStore**: テスト・開発用の正本
//! - **SqliteMessageStore**: sqlx による永続化
//! - **InMemoryCounterStore**: RateLimiter 用の共有カウンタ（単一プロセス）
//! - **LogTransport**: 送信内容をログに出すだけの MailTransport
//!
//! DispatchQueue の実装は `crate::queue` にあります。

pub mod inmem_counter;
pub mod inmem_store;
pub mod log_transport;
pub mod sqlite_store;

// 主要な型を再エクスポート
pub use self::inmem_counter::InMemoryCounterStore;
pub use self::inmem_store::InMemoryMessageStore;
pub use self::log_transport::LogTransport;
pub use self::sqlite_store::SqliteMessageStore;
