//! MessageStore port - ScheduledMessage の正本（source of truth）
//!
//! # 実装
//! - **InMemoryMessageStore**: テスト・開発用
//! - **SqliteMessageStore**: 永続化（sqlx）
//!
//! # 設計原則
//! - status の権威はここにある（キューの lease は配送の手段に過ぎない）
//! - `try_claim` は単一の条件付き更新で実装する。read → write に分解してはいけない
//! - すべての更新は return 前に永続化済み

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{ErrorKind, MessageId, ScheduledMessage, StatusCounts};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("message {0} already exists")]
    Duplicate(MessageId),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store backend failed: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) | StoreError::Duplicate(_) | StoreError::Corrupt(_) => {
                ErrorKind::Permanent
            }
            StoreError::Backend(_) => ErrorKind::Infrastructure,
        }
    }
}

/// MessageStore は ScheduledMessage の永続化と状態遷移を担う
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 新しいメッセージを保存（status は呼び出し側で PENDING にしておく）
    async fn insert(&self, message: ScheduledMessage) -> Result<MessageId, StoreError>;

    async fn get(&self, id: MessageId) -> Result<Option<ScheduledMessage>, StoreError>;

    /// 作成日時の新しい順
    async fn list_recent(&self) -> Result<Vec<ScheduledMessage>, StoreError>;

    /// PENDING かつ `scheduled_at <= now` を `scheduled_at` 昇順で最大 `limit` 件
    async fn find_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, StoreError>;

    /// PENDING → PROCESSING を原子的に試みる。遷移したら `true`
    ///
    /// 競合に負けた（すでに PENDING でない）場合は `false` でありエラーではない。
    async fn try_claim(&self, id: MessageId, claimed_at: DateTime<Utc>)
    -> Result<bool, StoreError>;

    /// 送信成功を記録。PROCESSING / FAILED からのみ書き込み、書いたら `true`
    async fn mark_sent(&self, id: MessageId, sent_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// 送信失敗を記録。PROCESSING / FAILED からのみ書き込み、書いたら `true`
    async fn mark_failed(&self, id: MessageId, error: &str) -> Result<bool, StoreError>;

    /// `claimed_before` より前に claim されたまま PROCESSING のものを PENDING に戻す
    ///
    /// ReaperLoop 専用。各行の遷移は `try_claim` と同じく条件付き更新。
    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageId>, StoreError>;

    async fn counts(&self) -> Result<StatusCounts, StoreError>;
}
