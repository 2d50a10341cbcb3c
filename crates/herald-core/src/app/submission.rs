//! Submission - メッセージ登録と一覧（外部 API 層から呼ばれる入口）

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::domain::{ANONYMOUS_SENDER, NewMessage, ScheduledMessage};
use crate::ports::{Clock, IdGenerator, MessageStore, StoreError};

#[derive(Debug, Error)]
pub enum SubmitError {
    /// Client error: a required field is empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registers messages as PENDING and lists them back.
#[derive(Clone)]
pub struct Submission {
    store: Arc<dyn MessageStore>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl Submission {
    pub fn new(
        store: Arc<dyn MessageStore>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, ids, clock }
    }

    /// Validate and insert. `sender` defaults to `"anonymous"`, `scheduled_at` to now.
    pub async fn schedule(&self, mut new: NewMessage) -> Result<ScheduledMessage, SubmitError> {
        for (name, value) in [("to", &new.to), ("subject", &new.subject), ("body", &new.body)] {
            if value.trim().is_empty() {
                return Err(SubmitError::MissingField(name));
            }
        }

        new.sender = new
            .sender
            .filter(|sender| !sender.trim().is_empty())
            .or_else(|| Some(ANONYMOUS_SENDER.to_string()));

        let message = ScheduledMessage::new(self.ids.generate_message_id(), new, self.clock.now());
        self.store.insert(message.clone()).await?;
        info!(
            message_id = %message.id,
            scheduled_at = %message.scheduled_at,
            sender = message.sender.as_deref().unwrap_or(ANONYMOUS_SENDER),
            "message scheduled"
        );
        Ok(message)
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<ScheduledMessage>, StoreError> {
        self.store.list_recent().await
    }
}
