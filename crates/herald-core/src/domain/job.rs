//! DeliveryJob - ディスパッチキューを流れる一時的な配送単位

use serde::{Deserialize, Serialize};

use super::ids::MessageId;
use super::message::ScheduledMessage;

/// A unit of delivery work carried on the dispatch queue.
///
/// Content is copied from the message at claim time so a worker can send
/// without reading the store first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    pub message_id: MessageId,
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

impl From<&ScheduledMessage> for DeliveryJob {
    fn from(message: &ScheduledMessage) -> Self {
        Self {
            message_id: message.id,
            to: message.to.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            sender: message.sender.clone(),
        }
    }
}

impl DeliveryJob {
    /// Rate limiter key for this job's sender, if it has one.
    pub fn sender_key(&self) -> Option<String> {
        self.sender.as_deref().map(|sender| format!("sender:{sender}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewMessage;
    use chrono::Utc;
    use ulid::Ulid;

    #[test]
    fn job_copies_message_content() {
        let msg = ScheduledMessage::new(
            MessageId::from_ulid(Ulid::new()),
            NewMessage::new("bob@example.com", "subject", "body").from_sender("alice"),
            Utc::now(),
        );
        let job = DeliveryJob::from(&msg);

        assert_eq!(job.message_id, msg.id);
        assert_eq!(job.to, "bob@example.com");
        assert_eq!(job.sender_key().as_deref(), Some("sender:alice"));
    }

    #[test]
    fn job_without_sender_has_no_key() {
        let msg = ScheduledMessage::new(
            MessageId::from_ulid(Ulid::new()),
            NewMessage::new("bob@example.com", "subject", "body"),
            Utc::now(),
        );
        assert_eq!(DeliveryJob::from(&msg).sender_key(), None);
    }
}
