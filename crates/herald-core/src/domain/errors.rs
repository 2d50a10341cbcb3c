//! Errors - エラーの運用分類
//!
//! 個々のエラー型は各ポート（MessageStore, DispatchQueue, ...）に置き、
//! ここでは「リトライすべきか」の分類だけを共有します。

use serde::{Deserialize, Serialize};

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（キューのリトライ対象）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（ストア/キューの障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

impl ErrorKind {
    /// Permanent 以外はキューのリトライに任せる
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}
