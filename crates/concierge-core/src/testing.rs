use crate::config::AppSettings;
use crate::llm::{Completion, LlmClient, MockLlmProvider};
use crate::platform::{ChatPlatform, CommandInfo, InlineKeyboard, PlatformError, SendOptions};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// A message the platform was asked to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Target chat
    pub chat_id: i64,
    /// Text
    pub text: String,
    /// Delivery options
    pub options: SendOptions,
}

/// Platform double that records every call
#[derive(Default)]
pub struct RecordingPlatform {
    next_id: AtomicI64,
    /// Sent messages in order
    pub sent: Mutex<Vec<SentMessage>>,
    /// Keyboard edits as `(chat_id, message_id, keyboard)`
    pub edits: Mutex<Vec<(i64, i64, InlineKeyboard)>>,
    /// Callback acknowledgements as `(callback_id, notice)`
    pub notices: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingPlatform {
    /// Fresh platform behind an `Arc`
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1000),
            ..Self::default()
        })
    }

    /// Texts sent to `chat_id`
    #[must_use]
    pub fn texts_to(&self, chat_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .map(|sent| {
                sent.iter()
                    .filter(|m| m.chat_id == chat_id)
                    .map(|m| m.text.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Last message sent anywhere
    #[must_use]
    pub fn last_sent(&self) -> Option<SentMessage> {
        self.sent.lock().ok().and_then(|sent| sent.last().cloned())
    }
}

#[async_trait]
impl ChatPlatform for RecordingPlatform {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<i64, PlatformError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMessage {
                chat_id,
                text: text.to_string(),
                options: options.clone(),
            });
        }
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_typing(&self, _chat_id: i64, _options: &SendOptions) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn edit_keyboard(
        &self,
        chat_id: i64,
        message_id: i64,
        keyboard: &InlineKeyboard,
    ) -> Result<(), PlatformError> {
        if let Ok(mut edits) = self.edits.lock() {
            edits.push((chat_id, message_id, keyboard.clone()));
        }
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, PlatformError> {
        Ok(file_id.as_bytes().to_vec())
    }

    async fn set_command_menu(&self, _commands: &[CommandInfo]) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), PlatformError> {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push((callback_id.to_string(), text.map(str::to_string)));
        }
        Ok(())
    }
}

/// LLM client whose `openai` route always answers `reply`
#[must_use]
pub fn llm_replying(settings: &AppSettings, reply: &'static str) -> Arc<LlmClient> {
    let mut provider = MockLlmProvider::new();
    provider.expect_chat_completion().returning(move |_, _, _, _, _| {
        Ok(Completion {
            text: reply.to_string(),
            usage: None,
        })
    });
    provider
        .expect_transcribe_audio()
        .returning(|bytes, _, _| Ok(String::from_utf8_lossy(&bytes).into_owned()));
    let mut llm = LlmClient::new(settings);
    llm.register_provider("openai".to_string(), Arc::new(provider));
    Arc::new(llm)
}
