//! InMemoryMessageStore - テスト・開発用の MessageStore
//!
//! 1 つの Mutex の中で読み取りと書き込みを完結させるので、
//! `try_claim` などの条件付き更新はそのまま原子的になります。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{MessageId, MessageStatus, ScheduledMessage, StatusCounts};
use crate::ports::{MessageStore, StoreError};

/// HashMap ベースの MessageStore（プロセス終了で消える）
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<HashMap<MessageId, ScheduledMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, message: ScheduledMessage) -> Result<MessageId, StoreError> {
        let mut messages = self.messages.lock().await;
        if messages.contains_key(&message.id) {
            return Err(StoreError::Duplicate(message.id));
        }
        let id = message.id;
        messages.insert(id, message);
        Ok(id)
    }

    async fn get(&self, id: MessageId) -> Result<Option<ScheduledMessage>, StoreError> {
        let messages = self.messages.lock().await;
        Ok(messages.get(&id).cloned())
    }

    async fn list_recent(&self) -> Result<Vec<ScheduledMessage>, StoreError> {
        let messages = self.messages.lock().await;
        let mut all: Vec<_> = messages.values().cloned().collect();
        // ULID は生成順なので id を同着時のタイブレークに使う
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(all)
    }

    async fn find_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, StoreError> {
        let messages = self.messages.lock().await;
        let mut due: Vec<_> = messages
            .values()
            .filter(|message| message.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn try_claim(
        &self,
        id: MessageId,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut messages = self.messages.lock().await;
        match messages.get_mut(&id) {
            Some(message) if message.status == MessageStatus::Pending => {
                message.status = MessageStatus::Processing;
                message.claimed_at = Some(claimed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_sent(&self, id: MessageId, sent_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut messages = self.messages.lock().await;
        let message = messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !message.status.accepts_outcome() {
            return Ok(false);
        }
        message.status = MessageStatus::Sent;
        message.sent_at = Some(sent_at);
        Ok(true)
    }

    async fn mark_failed(&self, id: MessageId, error: &str) -> Result<bool, StoreError> {
        let mut messages = self.messages.lock().await;
        let message = messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !message.status.accepts_outcome() {
            return Ok(false);
        }
        message.status = MessageStatus::Failed;
        message.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn release_stuck(
        &self,
        claimed_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MessageId>, StoreError> {
        let mut messages = self.messages.lock().await;
        let mut stuck: Vec<_> = messages
            .values()
            .filter(|message| {
                message.status == MessageStatus::Processing
                    && message.claimed_at.is_some_and(|at| at < claimed_before)
            })
            .map(|message| (message.claimed_at, message.id))
            .collect();
        stuck.sort();
        stuck.truncate(limit);

        let mut released = Vec::with_capacity(stuck.len());
        for (_, id) in stuck {
            if let Some(message) = messages.get_mut(&id) {
                message.status = MessageStatus::Pending;
                message.claimed_at = None;
                released.push(id);
            }
        }
        Ok(released)
    }

    async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let messages = self.messages.lock().await;
        let mut counts = StatusCounts::default();
        for message in messages.values() {
            counts.record(message.status);
        }
        Ok(counts)
    }
}
