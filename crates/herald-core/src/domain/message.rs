//! ScheduledMessage - 配送単位の永続レコード

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::MessageId;
use super::status::MessageStatus;

/// Sender recorded when the submitter does not name one.
pub const ANONYMOUS_SENDER: &str = "anonymous";

/// A message registered for delivery at or after `scheduled_at`.
///
/// Design:
/// - The message store is the single source of truth for `status`.
/// - `id`, `created_at` and the content fields never change after insert.
/// - `sent_at` is only set on success, `last_error` only on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
    pub id: MessageId,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub sender: Option<String>,
    pub status: MessageStatus,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "error")]
    pub last_error: Option<String>,

    /// When the last PENDING → PROCESSING claim happened.
    /// Only the reaper reads this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl ScheduledMessage {
    /// Build a fresh `PENDING` record from a validated submission.
    pub fn new(id: MessageId, message: NewMessage, now: DateTime<Utc>) -> Self {
        Self {
            id,
            to: message.to,
            subject: message.subject,
            body: message.body,
            sender: message.sender,
            status: MessageStatus::Pending,
            scheduled_at: message.scheduled_at.unwrap_or(now),
            created_at: now,
            sent_at: None,
            last_error: None,
            claimed_at: None,
        }
    }

    /// Due = still `PENDING` and `scheduled_at <= now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Pending && self.scheduled_at <= now
    }
}

/// What a submitter provides. `scheduled_at` defaults to "now" on insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            sender: None,
            scheduled_at: None,
        }
    }

    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }
}
