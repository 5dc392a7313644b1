//! Storage layer for owners, clients, questionnaires and the message ledger
//!
//! Provides a persistent implementation on Cloudflare R2 / AWS S3 and an
//! in-memory one for tests and local runs.

mod memory;
mod r2;

pub use memory::InMemoryStorage;
pub use r2::R2Storage;

use crate::clients::ClientRecord;
use crate::ledger::ChatMessage;
use crate::prompt::{PromptKind, PromptRecord};
use crate::quiz::{QuizConfigRecord, QuizState};
use crate::users::{BusinessConnectionLink, UserRecord};
use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error retrieving object from S3
    #[error("S3 Get error: {0}")]
    S3Get(Box<SdkError<GetObjectError>>),
    /// Error writing, deleting or listing objects in S3
    #[error("S3 put error: {0}")]
    S3Put(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration error (missing credentials, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Interface for storage providers
///
/// Every write is an idempotent upsert keyed by the record's identity.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Read an owner row
    async fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>, StorageError>;
    /// Insert or replace an owner row
    async fn upsert_user(&self, user: &UserRecord) -> Result<(), StorageError>;

    /// Read a business connection link
    async fn get_business_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<BusinessConnectionLink>, StorageError>;
    /// Insert or replace a business connection link
    async fn save_business_connection(
        &self,
        link: &BusinessConnectionLink,
    ) -> Result<(), StorageError>;

    /// Read a client row
    async fn get_client(&self, client_id: i64) -> Result<Option<ClientRecord>, StorageError>;
    /// Insert or replace a client row
    async fn upsert_client(&self, client: &ClientRecord) -> Result<(), StorageError>;

    /// Read the durable questionnaire state
    async fn get_quiz_state(&self, user_id: i64) -> Result<Option<QuizState>, StorageError>;
    /// Persist the questionnaire state
    async fn save_quiz_state(&self, user_id: i64, state: &QuizState) -> Result<(), StorageError>;
    /// Remove the questionnaire state
    async fn delete_quiz_state(&self, user_id: i64) -> Result<(), StorageError>;

    /// Insert or replace a ledger row keyed by (channel, chat, message id)
    async fn upsert_chat_message(&self, message: &ChatMessage) -> Result<(), StorageError>;
    /// Read one ledger row
    async fn get_chat_message(
        &self,
        channel: &str,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<ChatMessage>, StorageError>;
    /// Most recent ledger rows of a conversation, newest first
    async fn list_chat_messages(
        &self,
        channel: &str,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError>;
    /// Every ledger row whose answered status is false
    async fn list_unanswered_messages(&self) -> Result<Vec<ChatMessage>, StorageError>;

    /// Store a prompt snapshot
    async fn save_prompt(&self, prompt: &PromptRecord) -> Result<(), StorageError>;
    /// Latest prompt of a kind by creation time
    async fn latest_prompt(&self, kind: PromptKind) -> Result<Option<PromptRecord>, StorageError>;

    /// Store a questionnaire configuration snapshot
    async fn save_quiz_config(&self, config: &QuizConfigRecord) -> Result<(), StorageError>;
    /// Latest questionnaire configuration by creation time
    async fn latest_quiz_config(&self) -> Result<Option<QuizConfigRecord>, StorageError>;

    /// Check connection to storage
    async fn check_connection(&self) -> Result<(), String>;
}

/// Path segment of a ledger partition; the direct bot chat has no connection id
#[must_use]
pub fn channel_segment(channel: &str) -> String {
    if channel.is_empty() {
        "direct".to_string()
    } else {
        format!("bc-{channel}")
    }
}

/// Returns the R2 key for an owner's row
#[must_use]
pub fn user_key(user_id: i64) -> String {
    format!("users/{user_id}/profile.json")
}

/// Returns the R2 key for an owner's questionnaire state
#[must_use]
pub fn quiz_state_key(user_id: i64) -> String {
    format!("users/{user_id}/quiz_state.json")
}

/// Returns the R2 key for a client row
#[must_use]
pub fn client_key(client_id: i64) -> String {
    format!("clients/{client_id}.json")
}

/// Returns the R2 key for a business connection link
#[must_use]
pub fn business_connection_key(connection_id: &str) -> String {
    format!("business_connections/{connection_id}.json")
}

/// Returns the R2 prefix holding one conversation's ledger rows
#[must_use]
pub fn ledger_prefix(channel: &str, chat_id: i64) -> String {
    format!("ledger/{}/{chat_id}/", channel_segment(channel))
}

/// Returns the R2 key for a ledger row
#[must_use]
pub fn ledger_key(channel: &str, chat_id: i64, message_id: i64) -> String {
    format!("{}{message_id}.json", ledger_prefix(channel, chat_id))
}

/// Returns the R2 key for a prompt snapshot.
///
/// The timestamp is zero-padded so lexical order matches creation order.
#[must_use]
pub fn prompt_key(kind: PromptKind, created_at_ms: i64) -> String {
    format!("prompts/{}/{created_at_ms:020}.json", kind.as_str())
}

/// Returns the R2 key for a questionnaire configuration snapshot
#[must_use]
pub fn quiz_config_key(created_at_ms: i64) -> String {
    format!("quiz_configs/{created_at_ms:020}.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_channel_has_its_own_partition() {
        assert_eq!(ledger_key("", 10, 3), "ledger/direct/10/3.json");
        assert_eq!(ledger_key("abc", 10, 3), "ledger/bc-abc/10/3.json");
        assert_ne!(ledger_prefix("direct", 1), ledger_prefix("", 1));
    }

    #[test]
    fn test_snapshot_keys_sort_by_time() {
        let older = prompt_key(PromptKind::Assistant, 999);
        let newer = prompt_key(PromptKind::Assistant, 1_000);
        assert!(older < newer);
        assert!(quiz_config_key(5) < quiz_config_key(50));
    }
}
