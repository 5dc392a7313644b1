//! Chat platform boundary
//!
//! Core logic talks to the messenger only through [`ChatPlatform`]; the
//! Telegram transport implements it on top of `teloxide`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by the chat platform
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform rejected or failed the request
    #[error("platform request failed: {0}")]
    Request(String),
    /// The referenced message or file does not exist
    #[error("not found: {0}")]
    NotFound(String),
}

/// One inline button
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    /// Button label
    pub text: String,
    /// Payload delivered back on tap
    pub callback_data: String,
}

impl InlineButton {
    /// Build a callback button
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// Platform-neutral inline keyboard
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InlineKeyboard {
    /// Button rows
    pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    /// Keyboard with one button per row
    #[must_use]
    pub fn column(buttons: Vec<InlineButton>) -> Self {
        Self {
            rows: buttons.into_iter().map(|b| vec![b]).collect(),
        }
    }

    /// Append a row
    #[must_use]
    pub fn row(mut self, buttons: Vec<InlineButton>) -> Self {
        self.rows.push(buttons);
        self
    }

    /// All buttons in reading order
    pub fn buttons(&self) -> impl Iterator<Item = &InlineButton> {
        self.rows.iter().flatten()
    }
}

/// Per-call delivery options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Routes the call through a business connection
    pub business_connection_id: Option<String>,
    /// Inline keyboard attached to the message
    pub keyboard: Option<InlineKeyboard>,
    /// Text uses HTML markup
    pub html: bool,
}

impl SendOptions {
    /// Options routed through `business_connection_id` when it is non-empty
    #[must_use]
    pub fn routed(business_connection_id: &str) -> Self {
        Self {
            business_connection_id: (!business_connection_id.is_empty())
                .then(|| business_connection_id.to_string()),
            ..Self::default()
        }
    }

    /// Attach a keyboard
    #[must_use]
    pub fn with_keyboard(mut self, keyboard: InlineKeyboard) -> Self {
        self.keyboard = Some(keyboard);
        self
    }

    /// Mark the text as HTML
    #[must_use]
    pub fn html(mut self) -> Self {
        self.html = true;
        self
    }
}

/// Bot command shown in the client's command menu
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInfo {
    /// Command name without the slash
    pub command: String,
    /// Short description
    pub description: String,
}

/// Outbound operations the core needs from a messenger
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Send text; returns the id of the last message sent
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<i64, PlatformError>;

    /// Show the typing indicator
    async fn send_typing(&self, chat_id: i64, options: &SendOptions) -> Result<(), PlatformError>;

    /// Replace the inline keyboard of a sent message in place
    async fn edit_keyboard(
        &self,
        chat_id: i64,
        message_id: i64,
        keyboard: &InlineKeyboard,
    ) -> Result<(), PlatformError>;

    /// Download a file by platform file id
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, PlatformError>;

    /// Publish the command menu
    async fn set_command_menu(&self, commands: &[CommandInfo]) -> Result<(), PlatformError>;

    /// Acknowledge a button tap, optionally with a transient notice
    async fn answer_callback(
        &self,
        callback_id: &str,
        notice: Option<&str>,
    ) -> Result<(), PlatformError>;
}
