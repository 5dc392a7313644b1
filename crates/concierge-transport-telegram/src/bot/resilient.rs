//! Resilient messaging utilities with automatic retry for Telegram API operations.
//!
//! Every wrapper goes through [`concierge_core::utils::retry_transport_operation`],
//! so transient network failures are retried with exponential backoff and jitter.

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{
    BusinessConnectionId, ChatAction, ChatId, InlineKeyboardMarkup, Message, MessageId, ParseMode,
};
use tracing::debug;

/// Error text Telegram returns when an edit would not change anything
const ERROR_NOT_MODIFIED: &str = "message is not modified";

/// Send one message with automatic retry on network failures.
///
/// `business_connection_id` routes the message through the owner's business
/// account; `None` sends from the bot itself.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    business_connection_id: Option<&str>,
    reply_markup: Option<&InlineKeyboardMarkup>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    concierge_core::utils::retry_transport_operation(|| async {
        let mut req = bot.send_message(chat_id, text.to_string());
        if let Some(id) = business_connection_id {
            req = req.business_connection_id(BusinessConnectionId(id.to_string()));
        }
        if let Some(markup) = reply_markup {
            req = req.reply_markup(markup.clone());
        }
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Show the typing indicator, routed like [`send_message_resilient`].
pub async fn send_typing_resilient(
    bot: &Bot,
    chat_id: ChatId,
    business_connection_id: Option<&str>,
) -> Result<()> {
    concierge_core::utils::retry_transport_operation(|| async {
        let mut req = bot.send_chat_action(chat_id, ChatAction::Typing);
        if let Some(id) = business_connection_id {
            req = req.business_connection_id(BusinessConnectionId(id.to_string()));
        }
        req.await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("Telegram chat action error: {e}"))
    })
    .await
}

/// Replace the inline keyboard of a message.
///
/// An edit that would not change the keyboard counts as success.
pub async fn edit_keyboard_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    markup: &InlineKeyboardMarkup,
) -> Result<()> {
    concierge_core::utils::retry_transport_operation(|| async {
        match bot
            .edit_message_reply_markup(chat_id, msg_id)
            .reply_markup(markup.clone())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains(ERROR_NOT_MODIFIED) => {
                debug!("Keyboard update skipped: message is not modified");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Telegram edit error: {e}")),
        }
    })
    .await
}
