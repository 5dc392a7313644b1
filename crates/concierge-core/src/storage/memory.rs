use super::{StorageError, StorageProvider};
use crate::clients::ClientRecord;
use crate::ledger::ChatMessage;
use crate::prompt::{PromptKind, PromptRecord};
use crate::quiz::{QuizConfigRecord, QuizState};
use crate::users::{BusinessConnectionLink, UserRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

type LedgerKey = (String, i64, i64);

#[derive(Default)]
struct Tables {
    users: HashMap<i64, UserRecord>,
    connections: HashMap<String, BusinessConnectionLink>,
    clients: HashMap<i64, ClientRecord>,
    quiz_states: HashMap<i64, QuizState>,
    ledger: HashMap<LedgerKey, ChatMessage>,
    prompts: Vec<PromptRecord>,
    quiz_configs: Vec<QuizConfigRecord>,
}

/// Process-local storage used by tests and `STORAGE_BACKEND=memory` runs
#[derive(Default)]
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger rows across all conversations
    pub async fn ledger_len(&self) -> usize {
        self.tables.read().await.ledger.len()
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorage {
    async fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>, StorageError> {
        Ok(self.tables.read().await.users.get(&user_id).cloned())
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), StorageError> {
        self.tables
            .write()
            .await
            .users
            .insert(user.user_id, user.clone());
        Ok(())
    }

    async fn get_business_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<BusinessConnectionLink>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .connections
            .get(connection_id)
            .cloned())
    }

    async fn save_business_connection(
        &self,
        link: &BusinessConnectionLink,
    ) -> Result<(), StorageError> {
        self.tables
            .write()
            .await
            .connections
            .insert(link.connection_id.clone(), link.clone());
        Ok(())
    }

    async fn get_client(&self, client_id: i64) -> Result<Option<ClientRecord>, StorageError> {
        Ok(self.tables.read().await.clients.get(&client_id).cloned())
    }

    async fn upsert_client(&self, client: &ClientRecord) -> Result<(), StorageError> {
        self.tables
            .write()
            .await
            .clients
            .insert(client.id, client.clone());
        Ok(())
    }

    async fn get_quiz_state(&self, user_id: i64) -> Result<Option<QuizState>, StorageError> {
        Ok(self.tables.read().await.quiz_states.get(&user_id).cloned())
    }

    async fn save_quiz_state(&self, user_id: i64, state: &QuizState) -> Result<(), StorageError> {
        self.tables
            .write()
            .await
            .quiz_states
            .insert(user_id, state.clone());
        Ok(())
    }

    async fn delete_quiz_state(&self, user_id: i64) -> Result<(), StorageError> {
        self.tables.write().await.quiz_states.remove(&user_id);
        Ok(())
    }

    async fn upsert_chat_message(&self, message: &ChatMessage) -> Result<(), StorageError> {
        let key = (
            message.business_connection_id.clone(),
            message.chat_id,
            message.message_id,
        );
        self.tables.write().await.ledger.insert(key, message.clone());
        Ok(())
    }

    async fn get_chat_message(
        &self,
        channel: &str,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<ChatMessage>, StorageError> {
        let key = (channel.to_string(), chat_id, message_id);
        Ok(self.tables.read().await.ledger.get(&key).cloned())
    }

    async fn list_chat_messages(
        &self,
        channel: &str,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ChatMessage> = tables
            .ledger
            .values()
            .filter(|m| m.business_connection_id == channel && m.chat_id == chat_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_unanswered_messages(&self) -> Result<Vec<ChatMessage>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .ledger
            .values()
            .filter(|m| !m.answered.status)
            .cloned()
            .collect())
    }

    async fn save_prompt(&self, prompt: &PromptRecord) -> Result<(), StorageError> {
        self.tables.write().await.prompts.push(prompt.clone());
        Ok(())
    }

    async fn latest_prompt(&self, kind: PromptKind) -> Result<Option<PromptRecord>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .prompts
            .iter()
            .filter(|p| p.kind == kind)
            .max_by_key(|p| p.created_at)
            .cloned())
    }

    async fn save_quiz_config(&self, config: &QuizConfigRecord) -> Result<(), StorageError> {
        self.tables.write().await.quiz_configs.push(config.clone());
        Ok(())
    }

    async fn latest_quiz_config(&self) -> Result<Option<QuizConfigRecord>, StorageError> {
        Ok(self
            .tables
            .read()
            .await
            .quiz_configs
            .iter()
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn check_connection(&self) -> Result<(), String> {
        Ok(())
    }
}
