//! Job state machine for the dispatch queue.

use serde::{Deserialize, Serialize};

/// Job state inside the queue.
///
/// State transitions:
/// - Queued -> Running -> Succeeded
/// - Queued -> Running -> RetryScheduled -> Queued (loop until max_attempts)
/// - Queued -> Running -> Dead (when max_attempts exhausted)
///
/// A lease that expires without ack/fail counts as a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Ready to be leased.
    Queued,

    /// Leased by a worker.
    Running,

    /// Waiting out its backoff delay.
    RetryScheduled,

    /// Processed successfully.
    Succeeded,

    /// Failed permanently (max_attempts exhausted).
    Dead,
}

impl JobState {
    /// Is this job eligible for lease?
    pub fn is_runnable(self) -> bool {
        matches!(self, JobState::Queued)
    }

    /// Value stored in the `delivery_jobs.state` column.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::RetryScheduled => "RETRY_SCHEDULED",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Dead => "DEAD",
        }
    }

    pub fn from_column(raw: &str) -> Option<Self> {
        [
            JobState::Queued,
            JobState::Running,
            JobState::RetryScheduled,
            JobState::Succeeded,
            JobState::Dead,
        ]
        .into_iter()
        .find(|state| state.as_str() == raw)
    }
}
