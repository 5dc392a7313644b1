//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and defines
//! the tunables of the ledger, the sweep and the LLM transport.

use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Core application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppSettings {
    /// `OpenAI` (or compatible) API key
    pub openai_api_key: Option<String>,
    /// Override for the OpenAI-compatible base URL
    pub openai_api_base: Option<String>,
    /// `OpenRouter` API key
    pub openrouter_api_key: Option<String>,
    /// Site URL for `OpenRouter` identification
    #[serde(default)]
    pub openrouter_site_url: String,
    /// Site name for `OpenRouter` identification
    #[serde(default = "default_openrouter_site_name")]
    pub openrouter_site_name: String,

    /// Model used to answer clients
    pub chat_model: Option<String>,
    /// Sampling temperature for client answers
    pub chat_temperature: Option<f32>,
    /// Output token limit for client answers
    pub chat_max_tokens: Option<u32>,
    /// Model used for voice transcription
    pub transcription_model: Option<String>,

    /// Storage backend: `r2` (default) or `memory`
    pub storage_backend: Option<String>,
    /// R2 Storage access key ID
    pub r2_access_key_id: Option<String>,
    /// R2 Storage secret access key
    pub r2_secret_access_key: Option<String>,
    /// R2 Storage endpoint URL
    pub r2_endpoint_url: Option<String>,
    /// R2 Storage bucket name
    pub r2_bucket_name: Option<String>,

    /// Fallback system message when no prompt is stored
    pub system_message: Option<String>,
    /// Default client pause duration in minutes
    pub default_pause_minutes: Option<u32>,
}

fn default_openrouter_site_name() -> String {
    "Concierge Bot".to_string()
}

/// Build the layered configuration shared by every settings struct.
///
/// # Errors
///
/// Returns a `ConfigError` if a source cannot be read.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
    layered_builder(&run_mode).build()
}

fn layered_builder(run_mode: &str) -> ConfigBuilder<config::builder::DefaultState> {
    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Local overrides, not checked into git
        .add_source(File::with_name("config/local").required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Plain UPPER_SNAKE_CASE variables; empty values count as unset
        .add_source(Environment::default().ignore_empty(true))
}

impl AppSettings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        build_config()?.try_deserialize()
    }

    /// Model used to answer clients
    #[must_use]
    pub fn chat_model(&self) -> String {
        self.chat_model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string())
    }

    /// Completion settings used for client answers
    #[must_use]
    pub fn completion_settings(&self) -> crate::llm::CompletionSettings {
        crate::llm::CompletionSettings {
            model: self.chat_model(),
            temperature: self.chat_temperature.unwrap_or(DEFAULT_CHAT_TEMPERATURE),
            max_tokens: self.chat_max_tokens.unwrap_or(DEFAULT_CHAT_MAX_TOKENS),
            stream: false,
        }
    }

    /// Model used for voice transcription
    #[must_use]
    pub fn transcription_model(&self) -> String {
        self.transcription_model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_TRANSCRIPTION_MODEL.to_string())
    }

    /// Pause duration applied when an owner has not configured one
    #[must_use]
    pub fn default_pause_minutes(&self) -> u32 {
        self.default_pause_minutes
            .filter(|m| *m > 0)
            .unwrap_or(DEFAULT_PAUSE_MINUTES)
    }

    /// Fallback system message, if configured and non-empty
    #[must_use]
    pub fn fallback_system_message(&self) -> Option<&str> {
        self.system_message.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// True when the in-memory store was requested
    #[must_use]
    pub fn uses_memory_storage(&self) -> bool {
        self.storage_backend
            .as_deref()
            .is_some_and(|b| b.eq_ignore_ascii_case("memory"))
    }
}

/// Default model for client answers
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
/// Default sampling temperature
pub const DEFAULT_CHAT_TEMPERATURE: f32 = 0.7;
/// Default output token limit
pub const DEFAULT_CHAT_MAX_TOKENS: u32 = 1024;
/// Default transcription model
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";
/// Model name prefix routed to `OpenRouter`
pub const OPENROUTER_MODEL_PREFIX: &str = "openrouter/";

/// Number of transcript turns fed to the model per conversation
pub const TRANSCRIPT_TURN_LIMIT: usize = 20;
/// Attempts a message may take before eligibility cools down
pub const IMMEDIATE_RETRY_ATTEMPTS: u32 = 2;
/// Cool-down between attempts once the immediate ones are spent
pub const RETRY_COOLDOWN_SECS: i64 = 60 * 60;
/// Client pause duration when nothing is configured
pub const DEFAULT_PAUSE_MINUTES: u32 = 60;

/// Maximum attempts for one LLM request on transient errors
pub const LLM_MAX_RETRIES: usize = 3;
/// Initial backoff between LLM attempts
pub const LLM_INITIAL_BACKOFF_MS: u64 = 1000;
/// Default HTTP timeout for LLM requests
pub const LLM_HTTP_TIMEOUT_SECS: u64 = 60;

/// Initial backoff for chat platform API retries
pub const TRANSPORT_INITIAL_BACKOFF_MS: u64 = 500;
/// Maximum backoff for chat platform API retries
pub const TRANSPORT_MAX_BACKOFF_MS: u64 = 4000;
/// Maximum attempts for chat platform API calls
pub const TRANSPORT_MAX_RETRIES: usize = 3;

/// Bound on the storage readiness check at startup
pub const STORAGE_READY_TIMEOUT_SECS: u64 = 10;
/// Interval between reconciliation sweeps
pub const SWEEP_INTERVAL_SECS: u64 = 60;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Get LLM HTTP timeout from env or default.
///
/// Environment variable: `LLM_HTTP_TIMEOUT_SECS`.
#[must_use]
pub fn get_llm_http_timeout_secs() -> u64 {
    env_u64("LLM_HTTP_TIMEOUT_SECS", LLM_HTTP_TIMEOUT_SECS)
}

/// Get storage readiness timeout from env or default.
///
/// Environment variable: `STORAGE_READY_TIMEOUT_SECS`.
#[must_use]
pub fn get_storage_ready_timeout_secs() -> u64 {
    env_u64("STORAGE_READY_TIMEOUT_SECS", STORAGE_READY_TIMEOUT_SECS)
}

/// Get sweep interval from env or default.
///
/// Environment variable: `SWEEP_INTERVAL_SECS`.
#[must_use]
pub fn get_sweep_interval_secs() -> u64 {
    env_u64("SWEEP_INTERVAL_SECS", SWEEP_INTERVAL_SECS).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_when_unset() {
        let settings = AppSettings::default();
        assert_eq!(settings.chat_model(), DEFAULT_CHAT_MODEL);
        assert_eq!(settings.default_pause_minutes(), 60);
        assert!(settings.fallback_system_message().is_none());
        assert!(!settings.uses_memory_storage());

        let completion = settings.completion_settings();
        assert_eq!(completion.max_tokens, DEFAULT_CHAT_MAX_TOKENS);
        assert!(!completion.stream);
    }

    #[test]
    fn test_zero_pause_falls_back_to_default() {
        let settings = AppSettings {
            default_pause_minutes: Some(0),
            ..AppSettings::default()
        };
        assert_eq!(settings.default_pause_minutes(), DEFAULT_PAUSE_MINUTES);
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let settings = AppSettings {
            chat_model: Some(String::new()),
            system_message: Some("   ".to_string()),
            storage_backend: Some("MEMORY".to_string()),
            ..AppSettings::default()
        };
        assert_eq!(settings.chat_model(), DEFAULT_CHAT_MODEL);
        assert!(settings.fallback_system_message().is_none());
        assert!(settings.uses_memory_storage());
    }
}
