//! CounterStore port - RateLimiter の裏側にある共有カウンタ
//!
//! 操作は `increment` と `expire` の二つだけ。
//! 読んでから書くような操作は提供しない（窓の判定は increment の戻り値だけで行う）。

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// 原子的に +1 して、加算後の値を返す（キーがなければ 0 から）
    async fn increment(&self, key: &str) -> Result<u64, CounterError>;

    /// キーの TTL を設定。キーが存在しなければ `false`
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CounterError>;
}
