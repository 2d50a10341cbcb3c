//! MailTransport port - 実際の送信を行う外部コラボレーター
//!
//! 起動時に一度だけ生成し、Worker にコンストラクタで注入します。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ErrorKind;

/// What the transport reports back for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    /// Transport-assigned message id (e.g. the SMTP `Message-ID`).
    pub message_id: String,
    pub accepted: Vec<String>,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("recipient rejected: {0}")]
    Rejected(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Every transport failure is retried by the queue; the kind only feeds logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Rejected(_) => ErrorKind::Permanent,
            TransportError::Unavailable(_) | TransportError::Other(_) => ErrorKind::Transient,
        }
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<DeliveryInfo, TransportError>;
}
