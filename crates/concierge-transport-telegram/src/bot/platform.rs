//! `ChatPlatform` on top of `teloxide::Bot`

use super::resilient::{edit_keyboard_resilient, send_message_resilient, send_typing_resilient};
use async_trait::async_trait;
use concierge_core::platform::{
    ChatPlatform, CommandInfo, InlineKeyboard, PlatformError, SendOptions,
};
use concierge_core::utils::{split_long_message, MESSAGE_CHUNK_CHARS};
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    BotCommand, CallbackQueryId, FileId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId,
    ParseMode,
};
use tracing::debug;

/// Telegram implementation of the chat platform boundary
#[derive(Clone)]
pub struct TelegramPlatform {
    bot: Bot,
}

impl TelegramPlatform {
    /// Wrap a bot handle
    #[must_use]
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

/// Convert a platform-neutral keyboard into Telegram markup
#[must_use]
pub fn to_markup(keyboard: &InlineKeyboard) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(keyboard.rows.iter().map(|row| {
        row.iter()
            .map(|b| InlineKeyboardButton::callback(b.text.clone(), b.callback_data.clone()))
            .collect::<Vec<_>>()
    }))
}

fn request_error(e: &anyhow::Error) -> PlatformError {
    PlatformError::Request(e.to_string())
}

#[async_trait]
impl ChatPlatform for TelegramPlatform {
    /// Long texts are split into several messages; the keyboard is attached
    /// to the last one and its id is returned.
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<i64, PlatformError> {
        let parts = split_long_message(text, MESSAGE_CHUNK_CHARS);
        let Some(last_index) = parts.len().checked_sub(1) else {
            return Err(PlatformError::Request("refusing to send an empty message".into()));
        };
        let markup = options.keyboard.as_ref().map(to_markup);
        let parse_mode = options.html.then_some(ParseMode::Html);

        let mut last_id = 0;
        for (index, part) in parts.iter().enumerate() {
            let reply_markup = if index == last_index { markup.as_ref() } else { None };
            let sent = send_message_resilient(
                &self.bot,
                ChatId(chat_id),
                part,
                options.business_connection_id.as_deref(),
                reply_markup,
                parse_mode,
            )
            .await
            .map_err(|e| request_error(&e))?;
            last_id = i64::from(sent.id.0);
        }
        if parts.len() > 1 {
            debug!(chat_id, parts = parts.len(), "Long message split");
        }
        Ok(last_id)
    }

    async fn send_typing(&self, chat_id: i64, options: &SendOptions) -> Result<(), PlatformError> {
        send_typing_resilient(
            &self.bot,
            ChatId(chat_id),
            options.business_connection_id.as_deref(),
        )
        .await
        .map_err(|e| request_error(&e))
    }

    async fn edit_keyboard(
        &self,
        chat_id: i64,
        message_id: i64,
        keyboard: &InlineKeyboard,
    ) -> Result<(), PlatformError> {
        let msg_id = i32::try_from(message_id)
            .map_err(|_| PlatformError::NotFound(format!("message {message_id}")))?;
        edit_keyboard_resilient(&self.bot, ChatId(chat_id), MessageId(msg_id), &to_markup(keyboard))
            .await
            .map_err(|e| request_error(&e))
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, PlatformError> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(|e| PlatformError::NotFound(format!("file {file_id}: {e}")))?;

        let mut buf = Vec::new();
        self.bot
            .download_file(&file.path, &mut buf)
            .await
            .map_err(|e| PlatformError::Request(format!("failed to download file: {e}")))?;
        debug!(file_id, size = buf.len(), "Downloaded file from Telegram");
        Ok(buf)
    }

    async fn set_command_menu(&self, commands: &[CommandInfo]) -> Result<(), PlatformError> {
        let commands = commands
            .iter()
            .map(|c| BotCommand::new(c.command.clone(), c.description.clone()));
        self.bot
            .set_my_commands(commands)
            .await
            .map(|_| ())
            .map_err(|e| PlatformError::Request(e.to_string()))
    }

    async fn answer_callback(
        &self,
        callback_id: &str,
        notice: Option<&str>,
    ) -> Result<(), PlatformError> {
        let mut req = self
            .bot
            .answer_callback_query(CallbackQueryId(callback_id.to_string()));
        if let Some(text) = notice {
            req = req.text(text.to_string());
        }
        req.await
            .map(|_| ())
            .map_err(|e| PlatformError::Request(e.to_string()))
    }
}
