use crate::clients::ClientRecord;
use chrono::{DateTime, Utc};

/// Identity of the author of an update
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sender {
    /// Platform user id
    pub id: i64,
    /// First name
    pub first_name: Option<String>,
    /// Last name
    pub last_name: Option<String>,
    /// Username without `@`
    pub username: Option<String>,
    /// IETF language tag
    pub language_code: Option<String>,
}

impl Sender {
    /// Sender with only an id
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Client record fields known from this sender, keyed by `chat_id`
    #[must_use]
    pub fn to_client(&self, chat_id: i64) -> ClientRecord {
        ClientRecord {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            username: self.username.clone(),
            language_code: self.language_code.clone(),
            ..ClientRecord::new(chat_id)
        }
    }
}

/// Payload of an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundContent {
    /// Plain text or caption
    Text(String),
    /// Voice note to transcribe
    Voice {
        /// Platform file id
        file_id: String,
        /// MIME type reported by the platform
        mime_type: Option<String>,
    },
    /// Anything the bot does not process
    Unsupported,
}

/// A message delivered to the bot, directly or through a business connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Chat the message was posted in
    pub chat_id: i64,
    /// Platform message id
    pub message_id: i64,
    /// Author, when known
    pub sender: Option<Sender>,
    /// Set for messages proxied through a business connection
    pub business_connection_id: Option<String>,
    /// Message payload
    pub content: InboundContent,
    /// Text of the quoted message
    pub replied_text: Option<String>,
    /// Send time
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// Text message from `sender` in its own private chat
    #[must_use]
    pub fn direct_text(sender: Sender, message_id: i64, text: &str) -> Self {
        Self {
            chat_id: sender.id,
            message_id,
            sender: Some(sender),
            business_connection_id: None,
            content: InboundContent::Text(text.to_string()),
            replied_text: None,
            timestamp: Utc::now(),
        }
    }

    /// Business channel key; empty for the direct bot chat
    #[must_use]
    pub fn channel(&self) -> &str {
        self.business_connection_id.as_deref().unwrap_or_default()
    }

    /// Text content, if the message is a text message
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            InboundContent::Text(text) => Some(text),
            InboundContent::Voice { .. } | InboundContent::Unsupported => None,
        }
    }
}

/// A tap on an inline button
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCallback {
    /// Callback id to acknowledge
    pub id: String,
    /// Who tapped
    pub from: Sender,
    /// Chat of the message carrying the keyboard
    pub chat_id: i64,
    /// Message carrying the keyboard, when still accessible
    pub message_id: Option<i64>,
    /// Callback payload
    pub data: String,
}

/// A business connection was created, changed or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessLink {
    /// Platform connection id
    pub connection_id: String,
    /// Business account owner
    pub owner: Sender,
    /// Whether the bot may act on the connection
    pub enabled: bool,
}

/// Result of routing an update through the handler chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// A handler took the update
    Handled,
    /// No handler took the update
    Continue,
}
