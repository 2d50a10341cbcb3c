//! Status - パイプライン全体の件数スナップショット

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::StatusCounts;
use crate::ports::{MessageStore, StoreError};
use crate::queue::{DispatchQueue, QueueCounts, QueueError};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Message statuses from the store plus job states from the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub messages: StatusCounts,
    pub queue: QueueCounts,
}

impl PipelineStatus {
    pub async fn collect(
        store: &dyn MessageStore,
        queue: &dyn DispatchQueue,
    ) -> Result<Self, StatusError> {
        Ok(Self {
            messages: store.counts().await?,
            queue: queue.counts_by_state().await?,
        })
    }

    /// Nothing waiting or in flight anywhere.
    pub fn is_idle(&self) -> bool {
        self.messages.pending == 0 && self.queue.in_flight() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeliveryJob, MessageId, NewMessage, ScheduledMessage};
    use crate::impls::InMemoryMessageStore;
    use crate::queue::{InMemoryDispatchQueue, JobOptions};
    use chrono::Utc;
    use ulid::Ulid;

    #[tokio::test]
    async fn collects_both_sides() {
        let store = InMemoryMessageStore::new();
        let queue = InMemoryDispatchQueue::default();
        assert!(PipelineStatus::collect(&store, &queue).await.unwrap().is_idle());

        let message = ScheduledMessage::new(
            MessageId::from_ulid(Ulid::new()),
            NewMessage::new("bob@example.com", "hi", "body"),
            Utc::now(),
        );
        queue
            .enqueue(DeliveryJob::from(&message), JobOptions::default())
            .await
            .unwrap();
        store.insert(message).await.unwrap();

        let status = PipelineStatus::collect(&store, &queue).await.unwrap();
        assert_eq!(status.messages.pending, 1);
        assert_eq!(status.queue.queued, 1);
        assert!(!status.is_idle());
    }
}
