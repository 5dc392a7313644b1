//! Message ledger and answered-status tracking
//!
//! Every inbound client message and every outbound reply is recorded per
//! conversation, keyed by `(channel, chat_id, message_id)` where the channel
//! is the business connection id (empty for the direct bot chat). Each row
//! carries an answered envelope that drives the reconciliation sweep.

use crate::config::{IMMEDIATE_RETRY_ATTEMPTS, RETRY_COOLDOWN_SECS};
use crate::storage::{StorageError, StorageProvider};
use crate::who::Who;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Answered status, attempt counter and last attempt time of a message
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnsweredEnvelope {
    /// The message has been answered
    #[serde(default)]
    pub status: bool,
    /// Number of explicit status changes so far; never decreases
    #[serde(default)]
    pub retry: u32,
    /// Time of the last explicit status change
    #[serde(default, rename = "lastRetryAt", deserialize_with = "lenient_timestamp")]
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl AnsweredEnvelope {
    /// Envelope of a message that needs no answer
    #[must_use]
    pub fn answered() -> Self {
        Self {
            status: true,
            ..Self::default()
        }
    }

    /// Backoff gate: unanswered, and either fewer than two attempts were made
    /// or the last one is more than an hour old.
    ///
    /// A missing timestamp counts as old.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.status {
            return false;
        }
        if self.retry < IMMEDIATE_RETRY_ATTEMPTS {
            return true;
        }
        self.last_retry_at
            .is_none_or(|at| now - at > Duration::seconds(RETRY_COOLDOWN_SECS))
    }

    /// Record an explicit status change
    pub fn transition(&mut self, status: bool, now: DateTime<Utc>) {
        self.status = status;
        self.retry = self.retry.saturating_add(1);
        self.last_retry_at = Some(now);
    }
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?
        .and_then(|raw| serde_json::from_value(raw).ok()))
}

// A missing or malformed envelope degrades to the default instead of
// failing the whole row.
fn lenient_envelope<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<AnsweredEnvelope, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(raw).unwrap_or_default())
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Conversation chat id
    pub chat_id: i64,
    /// Platform message id
    pub message_id: i64,
    /// Business connection id; empty for the direct bot chat
    #[serde(default)]
    pub business_connection_id: String,
    /// Message text
    pub message: String,
    /// When the message was sent
    pub timestamp: DateTime<Utc>,
    /// Channel and author role
    pub who: Who,
    /// Sent by the bot itself
    #[serde(default, rename = "isBot")]
    pub is_bot: bool,
    /// Answered envelope
    #[serde(default, deserialize_with = "lenient_envelope")]
    pub answered: AnsweredEnvelope,
    /// Text of the message this one quotes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replied_message: Option<String>,
}

impl ChatMessage {
    /// New row stamped with the current time.
    ///
    /// Client turns start unanswered; everything else starts answered.
    pub fn new(
        chat_id: i64,
        message_id: i64,
        channel: impl Into<String>,
        text: impl Into<String>,
        who: Who,
    ) -> Self {
        Self {
            chat_id,
            message_id,
            business_connection_id: channel.into(),
            message: text.into(),
            timestamp: Utc::now(),
            who,
            is_bot: false,
            answered: if who.is_client() {
                AnsweredEnvelope::default()
            } else {
                AnsweredEnvelope::answered()
            },
            replied_message: None,
        }
    }

    /// Mark as written by the bot
    #[must_use]
    pub fn from_bot(mut self) -> Self {
        self.is_bot = true;
        self.answered = AnsweredEnvelope::answered();
        self
    }

    /// Attach the quoted text
    #[must_use]
    pub fn replying_to(mut self, quoted: Option<String>) -> Self {
        self.replied_message = quoted.filter(|q| !q.trim().is_empty());
        self
    }

    /// Override the timestamp
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Chronological ordering key
    #[must_use]
    pub fn sort_key(&self) -> (DateTime<Utc>, i64) {
        (self.timestamp, self.message_id)
    }
}

/// Outcome of a batch status change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkReport {
    /// Rows updated
    pub updated: usize,
    /// Ids with no ledger row
    pub missing: Vec<i64>,
    /// Ids whose read or write failed
    pub failed: Vec<i64>,
}

/// Ledger operations over a storage provider
#[derive(Clone)]
pub struct MessageLedger {
    storage: Arc<dyn StorageProvider>,
}

impl MessageLedger {
    /// Create a ledger over `storage`
    #[must_use]
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }

    /// Record a message; repeated delivery of the same id overwrites the row.
    ///
    /// The answered envelope of an existing row is kept, so a duplicate of an
    /// already answered message never re-enters the sweep.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read or write fails.
    pub async fn append(&self, mut message: ChatMessage) -> Result<ChatMessage, StorageError> {
        if let Some(existing) = self
            .storage
            .get_chat_message(
                &message.business_connection_id,
                message.chat_id,
                message.message_id,
            )
            .await?
        {
            debug!(
                chat_id = message.chat_id,
                message_id = message.message_id,
                "Duplicate delivery, overwriting ledger row"
            );
            message.answered = existing.answered;
        }
        self.storage.upsert_chat_message(&message).await?;
        Ok(message)
    }

    /// Rewrite the text of a recorded message, leaving its envelope intact.
    ///
    /// Returns `false` when the message was never recorded.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read or write fails.
    pub async fn edit(
        &self,
        chat_id: i64,
        message_id: i64,
        channel: &str,
        new_text: &str,
    ) -> Result<bool, StorageError> {
        let Some(mut row) = self
            .storage
            .get_chat_message(channel, chat_id, message_id)
            .await?
        else {
            debug!(chat_id, message_id, channel, "Edit for unknown message ignored");
            return Ok(false);
        };
        row.message = new_text.to_string();
        self.storage.upsert_chat_message(&row).await?;
        Ok(true)
    }

    /// The last `limit` messages of a conversation in chronological order
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub async fn list_recent(
        &self,
        chat_id: i64,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let mut rows = self
            .storage
            .list_chat_messages(channel, chat_id, limit)
            .await?;
        rows.reverse();
        Ok(rows)
    }

    /// Set the answered status of each id, bumping its attempt counter.
    ///
    /// Ids are processed independently: missing rows and per-row failures are
    /// reported, never propagated.
    pub async fn mark_answered(
        &self,
        chat_id: i64,
        channel: &str,
        message_ids: &[i64],
        status: bool,
        now: DateTime<Utc>,
    ) -> MarkReport {
        let mut report = MarkReport::default();
        for &message_id in message_ids {
            match self.mark_one(chat_id, channel, message_id, status, now).await {
                Ok(true) => report.updated += 1,
                Ok(false) => {
                    warn!(chat_id, message_id, channel, "Cannot mark missing message");
                    report.missing.push(message_id);
                }
                Err(e) => {
                    warn!(chat_id, message_id, channel, error = %e, "Failed to mark message");
                    report.failed.push(message_id);
                }
            }
        }
        report
    }

    async fn mark_one(
        &self,
        chat_id: i64,
        channel: &str,
        message_id: i64,
        status: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let Some(mut row) = self
            .storage
            .get_chat_message(channel, chat_id, message_id)
            .await?
        else {
            return Ok(false);
        };
        row.answered.transition(status, now);
        self.storage.upsert_chat_message(&row).await?;
        Ok(true)
    }

    /// Every message that is unanswered and passes the backoff gate
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub async fn list_all_unanswered(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let rows = self.storage.list_unanswered_messages().await?;
        Ok(rows
            .into_iter()
            .filter(|m| m.answered.is_eligible(now))
            .collect())
    }

    /// Unanswered client turns among the last `limit` messages, oldest first
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub async fn pending_client_messages(
        &self,
        chat_id: i64,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        Ok(self
            .list_recent(chat_id, channel, limit)
            .await?
            .into_iter()
            .filter(|m| m.who.is_client() && !m.answered.status)
            .collect())
    }
}
