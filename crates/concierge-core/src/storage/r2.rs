use super::{
    business_connection_key, client_key, ledger_key, ledger_prefix, prompt_key, quiz_config_key,
    quiz_state_key, user_key, StorageError, StorageProvider,
};
use crate::clients::ClientRecord;
use crate::config::AppSettings;
use crate::ledger::ChatMessage;
use crate::prompt::{PromptKind, PromptRecord};
use crate::quiz::{QuizConfigRecord, QuizState};
use crate::users::{BusinessConnectionLink, UserRecord};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use futures_util::stream::{self, StreamExt};
use moka::future::Cache;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Concurrent object reads during prefix scans
const SCAN_CONCURRENCY: usize = 16;

/// R2-backed storage implementation
pub struct R2Storage {
    client: Client,
    bucket: String,
    cache: Cache<String, Arc<Vec<u8>>>,
}

impl R2Storage {
    /// Create a new R2 storage instance
    ///
    /// # Errors
    ///
    /// Returns an error if R2 configuration is missing.
    pub async fn new(settings: &AppSettings) -> Result<Self, StorageError> {
        let endpoint_url = settings
            .r2_endpoint_url
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ENDPOINT_URL is missing".into()))?;
        let access_key = settings
            .r2_access_key_id
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_ACCESS_KEY_ID is missing".into()))?;
        let secret_key = settings
            .r2_secret_access_key
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_SECRET_ACCESS_KEY is missing".into()))?;
        let bucket = settings
            .r2_bucket_name
            .as_ref()
            .ok_or_else(|| StorageError::Config("R2_BUCKET_NAME is missing".into()))?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "r2-storage");

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("auto"))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build();

        let client = Client::from_conf(s3_config);

        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(60 * 60))
            .time_to_idle(Duration::from_secs(30 * 60))
            .build();

        Ok(Self {
            client,
            bucket: bucket.clone(),
            cache,
        })
    }

    /// Save data as JSON to R2
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization or S3 upload fails.
    pub async fn save_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        data: &T,
    ) -> Result<(), StorageError> {
        let body_bytes = serde_json::to_vec_pretty(data)?;

        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body_bytes.clone()))
            .content_type("application/json")
            .send()
            .await;
        if let Err(e) = put {
            // The stored object is unknown now; force the next read to go to R2.
            self.cache.invalidate(key).await;
            return Err(StorageError::S3Put(e.to_string()));
        }

        // Write-through, only once the object is persisted
        self.cache.insert(key.to_string(), Arc::new(body_bytes)).await;
        Ok(())
    }

    /// Load data from JSON in R2
    ///
    /// # Errors
    ///
    /// Returns an error if S3 download or JSON deserialization fails.
    pub async fn load_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        // Read-through
        if let Some(cached_data) = self.cache.get(key).await {
            match serde_json::from_slice(&cached_data) {
                Ok(data) => return Ok(Some(data)),
                Err(e) => {
                    warn!("Cache deserialization failed for {}: {}", key, e);
                    self.cache.invalidate(key).await;
                }
            }
        }

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
                    .into_bytes();

                self.cache
                    .insert(key.to_string(), Arc::new(data.to_vec()))
                    .await;

                let json_data = serde_json::from_slice(&data)?;
                Ok(Some(json_data))
            }
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => Ok(None),
            Err(e) => Err(StorageError::S3Get(Box::new(e))),
        }
    }

    /// Delete object from R2
    ///
    /// # Errors
    ///
    /// Returns an error if S3 deletion fails.
    pub async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.cache.invalidate(key).await;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::S3Put(e.to_string()))?;

        Ok(())
    }

    /// List every key under `prefix`, following continuation tokens
    ///
    /// # Errors
    ///
    /// Returns an error if an S3 list request fails.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StorageError::S3Put(e.to_string()))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(ToString::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(prefix, count = keys.len(), "Listed R2 keys");
        Ok(keys)
    }

    /// Load every key of a scan; rows that no longer decode are skipped
    async fn load_many<T: DeserializeOwned + Send>(
        &self,
        keys: Vec<String>,
    ) -> Result<Vec<T>, StorageError> {
        let loaded: Vec<(String, Result<Option<T>, StorageError>)> = stream::iter(keys)
            .map(|key| async move {
                let row = self.load_json::<T>(&key).await;
                (key, row)
            })
            .buffer_unordered(SCAN_CONCURRENCY)
            .collect()
            .await;
        keep_decodable(loaded)
    }

    async fn latest_under<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Option<T>, StorageError> {
        let keys = self.list_keys(prefix).await?;
        match keys.into_iter().max() {
            Some(key) => self.load_json(&key).await,
            None => Ok(None),
        }
    }
}

/// Drop rows that fail to decode so one corrupt object cannot hide the rest
/// of a scan. Transport errors still fail the scan.
fn keep_decodable<T>(
    loaded: Vec<(String, Result<Option<T>, StorageError>)>,
) -> Result<Vec<T>, StorageError> {
    let mut rows = Vec::with_capacity(loaded.len());
    for (key, row) in loaded {
        match row {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => {}
            Err(StorageError::Json(e)) => {
                warn!(key = %key, error = %e, "Skipping undecodable object");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(rows)
}

#[async_trait]
impl StorageProvider for R2Storage {
    async fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>, StorageError> {
        self.load_json(&user_key(user_id)).await
    }

    async fn upsert_user(&self, user: &UserRecord) -> Result<(), StorageError> {
        self.save_json(&user_key(user.user_id), user).await
    }

    async fn get_business_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<BusinessConnectionLink>, StorageError> {
        self.load_json(&business_connection_key(connection_id))
            .await
    }

    async fn save_business_connection(
        &self,
        link: &BusinessConnectionLink,
    ) -> Result<(), StorageError> {
        self.save_json(&business_connection_key(&link.connection_id), link)
            .await
    }

    async fn get_client(&self, client_id: i64) -> Result<Option<ClientRecord>, StorageError> {
        self.load_json(&client_key(client_id)).await
    }

    async fn upsert_client(&self, client: &ClientRecord) -> Result<(), StorageError> {
        self.save_json(&client_key(client.id), client).await
    }

    async fn get_quiz_state(&self, user_id: i64) -> Result<Option<QuizState>, StorageError> {
        self.load_json(&quiz_state_key(user_id)).await
    }

    async fn save_quiz_state(&self, user_id: i64, state: &QuizState) -> Result<(), StorageError> {
        self.save_json(&quiz_state_key(user_id), state).await
    }

    async fn delete_quiz_state(&self, user_id: i64) -> Result<(), StorageError> {
        self.delete_object(&quiz_state_key(user_id)).await
    }

    async fn upsert_chat_message(&self, message: &ChatMessage) -> Result<(), StorageError> {
        let key = ledger_key(
            &message.business_connection_id,
            message.chat_id,
            message.message_id,
        );
        self.save_json(&key, message).await
    }

    async fn get_chat_message(
        &self,
        channel: &str,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<ChatMessage>, StorageError> {
        self.load_json(&ledger_key(channel, chat_id, message_id))
            .await
    }

    async fn list_chat_messages(
        &self,
        channel: &str,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let keys = self.list_keys(&ledger_prefix(channel, chat_id)).await?;
        let mut rows: Vec<ChatMessage> = self.load_many(keys).await?;
        rows.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn list_unanswered_messages(&self) -> Result<Vec<ChatMessage>, StorageError> {
        let keys = self.list_keys("ledger/").await?;
        let rows: Vec<ChatMessage> = self.load_many(keys).await?;
        Ok(rows.into_iter().filter(|m| !m.answered.status).collect())
    }

    async fn save_prompt(&self, prompt: &PromptRecord) -> Result<(), StorageError> {
        let key = prompt_key(prompt.kind, prompt.created_at.timestamp_millis());
        self.save_json(&key, prompt).await
    }

    async fn latest_prompt(&self, kind: PromptKind) -> Result<Option<PromptRecord>, StorageError> {
        self.latest_under(&format!("prompts/{}/", kind.as_str()))
            .await
    }

    async fn save_quiz_config(&self, config: &QuizConfigRecord) -> Result<(), StorageError> {
        let key = quiz_config_key(config.created_at.timestamp_millis());
        self.save_json(&key, config).await
    }

    async fn latest_quiz_config(&self) -> Result<Option<QuizConfigRecord>, StorageError> {
        self.latest_under("quiz_configs/").await
    }

    async fn check_connection(&self) -> Result<(), String> {
        match self.client.list_buckets().send().await {
            Ok(_) => {
                info!("Successfully connected to R2 storage.");
                Ok(())
            }
            Err(e) => {
                let err_msg = format!("R2 connectivity test failed: {e:#?}");
                error!("{}", err_msg);
                Err(err_msg)
            }
        }
    }
}
