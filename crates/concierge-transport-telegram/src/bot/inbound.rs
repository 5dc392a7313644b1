//! Telegram updates to core inbound events

use concierge_core::conversation::{
    BusinessLink, InboundCallback, InboundContent, InboundMessage, Sender,
};
use teloxide::types::{BusinessConnection, CallbackQuery, Message, MessageKind, User};

/// Core sender from a Telegram user
#[must_use]
pub fn to_sender(user: &User) -> Sender {
    Sender {
        id: user.id.0.cast_signed(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
        username: user.username.clone(),
        language_code: user.language_code.clone(),
    }
}

fn content(msg: &Message) -> InboundContent {
    if let Some(text) = msg.text().or_else(|| msg.caption()) {
        return InboundContent::Text(text.to_string());
    }
    if let Some(voice) = msg.voice() {
        return InboundContent::Voice {
            file_id: voice.file.id.0.clone(),
            mime_type: voice.mime_type.as_ref().map(ToString::to_string),
        };
    }
    InboundContent::Unsupported
}

/// Convert a message update.
///
/// Returns `None` for messages the bot itself sent on behalf of a business
/// account: they echo back as business updates and must not be recorded twice.
#[must_use]
pub fn to_inbound_message(msg: &Message) -> Option<InboundMessage> {
    if msg.sender_business_bot.is_some() {
        return None;
    }
    Some(InboundMessage {
        chat_id: msg.chat.id.0,
        message_id: i64::from(msg.id.0),
        sender: msg.from.as_ref().map(to_sender),
        business_connection_id: match &msg.kind {
            MessageKind::Common(common) => {
                common.business_connection_id.as_ref().map(|id| id.0.clone())
            }
            _ => None,
        },
        content: content(msg),
        replied_text: msg
            .reply_to_message()
            .and_then(|quoted| quoted.text().or_else(|| quoted.caption()))
            .map(str::to_string),
        timestamp: msg.date,
    })
}

/// Convert a button tap; `None` when it carries no payload
#[must_use]
pub fn to_inbound_callback(q: &CallbackQuery) -> Option<InboundCallback> {
    let data = q.data.clone()?;
    let from = to_sender(&q.from);
    let (chat_id, message_id) = q.message.as_ref().map_or((from.id, None), |m| {
        (m.chat().id.0, Some(i64::from(m.id().0)))
    });
    Some(InboundCallback {
        id: q.id.0.clone(),
        from,
        chat_id,
        message_id,
        data,
    })
}

/// Convert a business connection update
#[must_use]
pub fn to_business_link(connection: &BusinessConnection) -> BusinessLink {
    BusinessLink {
        connection_id: connection.id.0.clone(),
        owner: to_sender(&connection.user),
        enabled: connection.is_enabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(json: serde_json::Value) -> Message {
        serde_json::from_value(json).expect("failed to deserialize mock message")
    }

    #[test]
    fn test_business_client_message() {
        let msg = message(serde_json::json!({
            "message_id": 12,
            "date": 1_700_000_000i64,
            "business_connection_id": "conn-1",
            "chat": {"id": 555, "type": "private", "first_name": "Ana"},
            "from": {"id": 555, "is_bot": false, "first_name": "Ana", "username": "ana"},
            "text": "Hello",
            "reply_to_message": {
                "message_id": 11,
                "date": 1_699_999_000i64,
                "chat": {"id": 555, "type": "private", "first_name": "Ana"},
                "text": "Welcome!"
            }
        }));
        let inbound = to_inbound_message(&msg).expect("converted");
        assert_eq!(inbound.chat_id, 555);
        assert_eq!(inbound.message_id, 12);
        assert_eq!(inbound.business_connection_id.as_deref(), Some("conn-1"));
        assert_eq!(inbound.content, InboundContent::Text("Hello".into()));
        assert_eq!(inbound.replied_text.as_deref(), Some("Welcome!"));
        assert_eq!(inbound.sender.and_then(|s| s.username).as_deref(), Some("ana"));
    }

    #[test]
    fn test_messages_sent_by_the_bot_are_dropped() {
        let msg = message(serde_json::json!({
            "message_id": 13,
            "date": 1_700_000_000i64,
            "business_connection_id": "conn-1",
            "chat": {"id": 555, "type": "private", "first_name": "Ana"},
            "from": {"id": 1, "is_bot": false, "first_name": "Owner"},
            "sender_business_bot": {"id": 99, "is_bot": true, "first_name": "Concierge"},
            "text": "Automated answer"
        }));
        assert!(to_inbound_message(&msg).is_none());
    }

    #[test]
    fn test_voice_message() {
        let msg = message(serde_json::json!({
            "message_id": 14,
            "date": 1_700_000_000i64,
            "chat": {"id": 7, "type": "private", "first_name": "Olga"},
            "from": {"id": 7, "is_bot": false, "first_name": "Olga"},
            "voice": {
                "file_id": "voice-file",
                "file_unique_id": "u1",
                "duration": 3,
                "mime_type": "audio/ogg",
                "file_size": 1200
            }
        }));
        let inbound = to_inbound_message(&msg).expect("converted");
        assert_eq!(
            inbound.content,
            InboundContent::Voice {
                file_id: "voice-file".into(),
                mime_type: Some("audio/ogg".into()),
            }
        );
        assert_eq!(inbound.channel(), "");
    }
}
