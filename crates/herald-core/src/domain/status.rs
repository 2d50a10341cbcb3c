//! Status - ScheduledMessage の状態機械
//!
//! # 状態遷移
//! - PENDING → PROCESSING: Scheduler の claim（条件付き更新）
//! - PROCESSING → SENT: Worker の送信成功
//! - PROCESSING → FAILED: Worker の送信失敗
//! - FAILED → SENT: 同じ配送ジョブのリトライが後から成功した場合（last writer wins）
//! - PROCESSING → PENDING: ReaperLoop による停滞 claim の回収（有効時のみ）

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// MessageStatus は ScheduledMessage の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// 登録済み、claim 待ち
    Pending,
    /// claim 済み、配送ジョブがキューにある（はず）
    Processing,
    /// 配送成功
    Sent,
    /// 配送失敗（`last_error` に理由）
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Processing => "PROCESSING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Failed => "FAILED",
        }
    }

    /// Writes a worker is allowed to make once a message has been claimed.
    ///
    /// Delivery attempts are retried by the queue, so a later attempt may
    /// overwrite an earlier `FAILED` with `SENT` (or `FAILED` again).
    pub fn accepts_outcome(self) -> bool {
        matches!(self, MessageStatus::Processing | MessageStatus::Failed)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message status '{0}'")]
pub struct ParseStatusError(String);

impl FromStr for MessageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(MessageStatus::Pending),
            "PROCESSING" => Ok(MessageStatus::Processing),
            "SENT" => Ok(MessageStatus::Sent),
            "FAILED" => Ok(MessageStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Number of messages in each status, for observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub sent: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: MessageStatus) {
        match status {
            MessageStatus::Pending => self.pending += 1,
            MessageStatus::Processing => self.processing += 1,
            MessageStatus::Sent => self.sent += 1,
            MessageStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.sent + self.failed
    }
}
