//! LogTransport - 送信せずにログへ書くだけの MailTransport

use async_trait::async_trait;
use tracing::info;
use ulid::Ulid;

use crate::ports::{DeliveryInfo, MailTransport, TransportError};

/// Accepts every message and logs it instead of talking to a mail server.
#[derive(Debug, Clone, Default)]
pub struct LogTransport {
    from: Option<String>,
}

impl LogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Envelope sender shown in the log line.
    pub fn with_from(from: impl Into<String>) -> Self {
        Self {
            from: Some(from.into()),
        }
    }
}

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<DeliveryInfo, TransportError> {
        if to.trim().is_empty() {
            return Err(TransportError::Rejected("empty recipient".to_string()));
        }

        let message_id = format!("<{}@herald.local>", Ulid::new());
        info!(
            %message_id,
            from = self.from.as_deref().unwrap_or("herald"),
            to,
            subject,
            body_len = html_body.len(),
            "mail delivered to log"
        );

        Ok(DeliveryInfo {
            message_id,
            accepted: vec![to.to_string()],
        })
    }
}
