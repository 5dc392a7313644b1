//! Telegram transport settings.

use concierge_core::config::AppSettings;
use config::ConfigError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Telegram transport settings loaded from environment variables.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TelegramSettings {
    /// Telegram Bot API token.
    pub telegram_token: String,
}

/// Combined settings used by the Telegram transport layer.
#[derive(Clone)]
pub struct BotSettings {
    /// Core settings shared with the conversation service.
    pub core: Arc<AppSettings>,
    /// Telegram-specific settings.
    pub telegram: Arc<TelegramSettings>,
}

impl BotSettings {
    /// Create a new combined settings bundle.
    #[must_use]
    pub fn new(core: AppSettings, telegram: TelegramSettings) -> Self {
        Self {
            core: Arc::new(core),
            telegram: Arc::new(telegram),
        }
    }
}

impl TelegramSettings {
    /// Create new settings by loading from environment and files.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        concierge_core::config::build_config()?.try_deserialize()
    }

    /// True when a non-blank token is configured.
    #[must_use]
    pub fn has_token(&self) -> bool {
        !self.telegram_token.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::TelegramSettings;

    #[test]
    fn test_blank_token_is_rejected() {
        let mut settings = TelegramSettings::default();
        assert!(!settings.has_token());
        settings.telegram_token = "  ".to_string();
        assert!(!settings.has_token());
        settings.telegram_token = "123:abc".to_string();
        assert!(settings.has_token());
    }
}
