//! LLM providers and client
//!
//! A unified interface over the `OpenAI`-compatible and `OpenRouter` backends.
//! The backend is chosen from the model name; transient failures are retried
//! here so callers only ever see a final answer or a final error.

mod common;
mod http_utils;
mod openai_compat;
/// Implementations of specific LLM providers
pub mod providers;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{AppSettings, LLM_INITIAL_BACKOFF_MS, LLM_MAX_RETRIES, OPENROUTER_MODEL_PREFIX};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

/// Errors that can occur during LLM operations
#[derive(Debug, Error)]
pub enum LlmError {
    /// Error returned by the provider's API
    #[error("API error: {0}")]
    ApiError(String),
    /// Error during network communication
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Error during JSON serialization or deserialization
    #[error("JSON error: {0}")]
    JsonError(String),
    /// Missing provider configuration or API key
    #[error("Missing client/API key: {0}")]
    MissingConfig(String),
    /// Rate limit exceeded (429), optionally with a wait time
    #[error("Rate limit exceeded: {message} (wait: {wait_secs:?}s)")]
    RateLimit {
        /// Retry-After duration in seconds, if provided by the server
        wait_secs: Option<u64>,
        /// Error message from the server
        message: String,
    },
    /// Any other unexpected error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// A transcript turn sent to the model
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    /// `user` or `assistant`
    pub role: String,
    /// Text content of the turn
    pub content: String,
}

impl Message {
    /// Create a new user message
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    /// Create a new assistant message
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

/// Token usage statistics from API response
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Input tokens (system prompt + transcript)
    pub prompt_tokens: u32,
    /// Output tokens
    pub completion_tokens: u32,
    /// Total tokens used
    pub total_tokens: u32,
}

/// A finished completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Generated text
    pub text: String,
    /// Token usage, when the API reports it
    pub usage: Option<TokenUsage>,
}

/// Per-request generation settings
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    /// Model name; `openrouter/` routes to `OpenRouter`
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Output token limit
    pub max_tokens: u32,
    /// Accepted for compatibility; responses are never streamed
    pub stream: bool,
}

/// Interface for all LLM providers
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a chat completion
    async fn chat_completion(
        &self,
        system_prompt: &str,
        history: &[Message],
        model_id: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion, LlmError>;

    /// Transcribe audio content
    async fn transcribe_audio(
        &self,
        audio_bytes: Vec<u8>,
        mime_type: &str,
        model_id: &str,
    ) -> Result<String, LlmError>;
}

/// Provider name and provider-side model id for a configured model name
#[must_use]
pub fn route_model(model: &str) -> (&'static str, &str) {
    match model.strip_prefix(OPENROUTER_MODEL_PREFIX) {
        Some(model_id) => ("openrouter", model_id),
        None => ("openai", model),
    }
}

/// Unified client for interacting with the configured LLM providers
pub struct LlmClient {
    openai: Option<providers::OpenAiProvider>,
    openrouter: Option<providers::OpenRouterProvider>,
    custom_providers: HashMap<String, Arc<dyn LlmProvider>>,
    /// Model used for voice transcription
    pub transcription_model: String,
}

impl LlmClient {
    /// Create a new LLM client with providers configured from settings
    #[must_use]
    pub fn new(settings: &AppSettings) -> Self {
        Self {
            openai: settings
                .openai_api_key
                .as_ref()
                .filter(|k| !k.is_empty())
                .map(|k| providers::OpenAiProvider::new(k.clone(), settings.openai_api_base.clone())),
            openrouter: settings
                .openrouter_api_key
                .as_ref()
                .filter(|k| !k.is_empty())
                .map(|k| {
                    providers::OpenRouterProvider::new(
                        k.clone(),
                        settings.openrouter_site_url.clone(),
                        settings.openrouter_site_name.clone(),
                    )
                }),
            custom_providers: HashMap::new(),
            transcription_model: settings.transcription_model(),
        }
    }

    /// Register a custom/mock LLM provider; it shadows a built-in one of the same name
    pub fn register_provider(&mut self, name: String, provider: Arc<dyn LlmProvider>) {
        self.custom_providers.insert(name, provider);
    }

    /// Returns true if requested provider is configured.
    #[must_use]
    pub fn is_provider_available(&self, name: &str) -> bool {
        self.get_provider(name).is_ok()
    }

    fn get_provider(&self, provider_name: &str) -> Result<&dyn LlmProvider, LlmError> {
        if let Some(provider) = self.custom_providers.get(provider_name) {
            return Ok(provider.as_ref());
        }
        match provider_name {
            "openai" => self.openai.as_ref().map(|p| p as &dyn LlmProvider),
            "openrouter" => self.openrouter.as_ref().map(|p| p as &dyn LlmProvider),
            _ => None,
        }
        .ok_or_else(|| LlmError::MissingConfig(provider_name.to_string()))
    }

    /// Complete a transcript.
    ///
    /// `system_parts` are joined with blank lines into one system prompt.
    /// Rate limits, 5xx and network errors are retried with exponential
    /// backoff; an empty answer is an error.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingConfig` if the routed provider is not
    /// configured, or the provider's last error once retries are exhausted.
    #[instrument(skip(self, history, system_parts, settings), fields(model = %settings.model))]
    pub async fn complete(
        &self,
        history: &[Message],
        system_parts: &[String],
        settings: &CompletionSettings,
    ) -> Result<Completion, LlmError> {
        let (provider_name, model_id) = route_model(&settings.model);
        let provider = self.get_provider(provider_name)?;
        let system_prompt = system_parts
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        debug!(
            provider = provider_name,
            turns = history.len(),
            "Sending request to LLM"
        );
        trace!(system_prompt = %system_prompt, history = ?history, "Full LLM Request");

        for attempt in 1..=LLM_MAX_RETRIES {
            let start = Instant::now();
            let result = provider
                .chat_completion(
                    &system_prompt,
                    history,
                    model_id,
                    settings.max_tokens,
                    settings.temperature,
                )
                .await
                .and_then(|c| {
                    if c.text.trim().is_empty() {
                        Err(LlmError::ApiError("Empty response".to_string()))
                    } else {
                        Ok(c)
                    }
                });
            let duration = start.elapsed();

            match result {
                Ok(completion) => {
                    if attempt > 1 {
                        info!(attempt, duration_ms = duration.as_millis(), "LLM retry succeeded");
                    }
                    if let Some(usage) = completion.usage {
                        info!(
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            total_tokens = usage.total_tokens,
                            duration_ms = duration.as_millis(),
                            "LLM completion"
                        );
                    }
                    trace!(response = %completion.text, "Full LLM Response");
                    return Ok(completion);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = LLM_MAX_RETRIES,
                        duration_ms = duration.as_millis(),
                        error = %e,
                        "LLM request failed"
                    );
                    if attempt < LLM_MAX_RETRIES {
                        if let Some(backoff) = Self::get_retry_delay(&e, attempt) {
                            info!(backoff_ms = backoff.as_millis(), attempt, "Retrying LLM request");
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                    }
                    return Err(e);
                }
            }
        }

        Err(LlmError::ApiError(
            "All retry attempts exhausted".to_string(),
        ))
    }

    /// Delay before the next attempt, or `None` if the error is not retryable.
    fn get_retry_delay(error: &LlmError, attempt: usize) -> Option<Duration> {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        let factor = 2u64.pow(exponent);
        match error {
            LlmError::RateLimit { wait_secs, .. } => Some(
                wait_secs.map_or_else(|| Duration::from_secs(10 * factor), |secs| {
                    Duration::from_secs(secs + 1)
                }),
            ),
            LlmError::ApiError(msg) => {
                let msg_lower = msg.to_lowercase();
                if msg_lower.contains("429") {
                    return Some(Duration::from_secs(10 * factor));
                }
                let transient = ["500", "502", "503", "504", "timeout", "overloaded"]
                    .iter()
                    .any(|marker| msg_lower.contains(marker));
                transient.then(|| Duration::from_millis(LLM_INITIAL_BACKOFF_MS * factor))
            }
            LlmError::NetworkError(_) => Some(Duration::from_millis(LLM_INITIAL_BACKOFF_MS * factor)),
            _ => None,
        }
    }

    /// Transcribe a voice message with the configured transcription model
    ///
    /// # Errors
    ///
    /// Returns `LlmError::MissingConfig` if the routed provider is not
    /// configured, or any error from the provider.
    #[instrument(skip(self, audio_bytes), fields(bytes = audio_bytes.len()))]
    pub async fn transcribe(&self, audio_bytes: Vec<u8>, mime_type: &str) -> Result<String, LlmError> {
        let (provider_name, model_id) = route_model(&self.transcription_model);
        let provider = self.get_provider(provider_name)?;
        let text = provider
            .transcribe_audio(audio_bytes, mime_type, model_id)
            .await?;
        debug!(chars = text.chars().count(), "Voice message transcribed");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(model: &str) -> CompletionSettings {
        CompletionSettings {
            model: model.to_string(),
            temperature: 0.2,
            max_tokens: 64,
            stream: false,
        }
    }

    fn client_with(name: &str, provider: MockLlmProvider) -> LlmClient {
        let mut client = LlmClient::new(&AppSettings::default());
        client.register_provider(name.to_string(), Arc::new(provider));
        client
    }

    #[test]
    fn test_model_prefix_routes_to_openrouter() {
        assert_eq!(
            route_model("openrouter/anthropic/claude-3.5-haiku"),
            ("openrouter", "anthropic/claude-3.5-haiku")
        );
        assert_eq!(route_model("gpt-4o-mini"), ("openai", "gpt-4o-mini"));
    }

    #[tokio::test]
    async fn test_system_parts_are_joined_and_prefix_stripped() {
        let mut provider = MockLlmProvider::new();
        provider
            .expect_chat_completion()
            .withf(|system, history, model, _, _| {
                system == "first\n\nsecond" && history.len() == 1 && model == "some/model"
            })
            .times(1)
            .returning(|_, _, _, _, _| {
                Ok(Completion {
                    text: "hello".into(),
                    usage: Some(TokenUsage {
                        prompt_tokens: 1,
                        completion_tokens: 2,
                        total_tokens: 3,
                    }),
                })
            });
        let client = client_with("openrouter", provider);

        let completion = client
            .complete(
                &[Message::user("hi")],
                &["first".into(), "  ".into(), "second".into()],
                &settings("openrouter/some/model"),
            )
            .await
            .expect("completion");
        assert_eq!(completion.text, "hello");
        assert_eq!(completion.usage.map(|u| u.total_tokens), Some(3));
    }

    #[tokio::test]
    async fn test_empty_answer_is_an_error() {
        let mut provider = MockLlmProvider::new();
        provider
            .expect_chat_completion()
            .times(1)
            .returning(|_, _, _, _, _| {
                Ok(Completion {
                    text: "  ".into(),
                    usage: None,
                })
            });
        let client = client_with("openai", provider);
        let err = client
            .complete(&[Message::user("hi")], &[], &settings("gpt-4o-mini"))
            .await
            .expect_err("empty");
        assert!(matches!(err, LlmError::ApiError(ref m) if m == "Empty response"));
    }

    #[tokio::test]
    async fn test_network_error_is_retried() {
        let mut provider = MockLlmProvider::new();
        let mut seq = mockall::Sequence::new();
        provider
            .expect_chat_completion()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _, _| Err(LlmError::NetworkError("reset".into())));
        provider
            .expect_chat_completion()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _, _| {
                Ok(Completion {
                    text: "ok".into(),
                    usage: None,
                })
            });
        let client = client_with("openai", provider);
        let completion = client
            .complete(&[Message::user("hi")], &[], &settings("gpt-4o-mini"))
            .await
            .expect("retried");
        assert_eq!(completion.text, "ok");
    }

    #[tokio::test]
    async fn test_missing_provider_is_a_config_error() {
        let client = LlmClient::new(&AppSettings::default());
        let err = client
            .complete(&[], &[], &settings("openrouter/x"))
            .await
            .expect_err("missing");
        assert!(matches!(err, LlmError::MissingConfig(ref p) if p == "openrouter"));
    }

    #[test]
    fn test_retry_delays() {
        let rate = LlmError::RateLimit {
            wait_secs: Some(4),
            message: String::new(),
        };
        assert_eq!(LlmClient::get_retry_delay(&rate, 1), Some(Duration::from_secs(5)));
        let server = LlmError::ApiError("API error: 503 Service Unavailable".into());
        assert_eq!(
            LlmClient::get_retry_delay(&server, 2),
            Some(Duration::from_millis(2000))
        );
        let bad = LlmError::ApiError("API error: 400 Bad Request".into());
        assert_eq!(LlmClient::get_retry_delay(&bad, 1), None);
    }

    #[tokio::test]
    async fn test_transcription_uses_configured_model() {
        let mut provider = MockLlmProvider::new();
        provider
            .expect_transcribe_audio()
            .withf(|bytes, mime, model| {
                *bytes == vec![1u8, 2, 3] && mime == "audio/ogg" && model == "whisper-1"
            })
            .times(1)
            .returning(|_, _, _| Ok("transcript".into()));
        let client = client_with("openai", provider);
        let text = client
            .transcribe(vec![1, 2, 3], "audio/ogg")
            .await
            .expect("transcript");
        assert_eq!(text, "transcript");
    }
}
