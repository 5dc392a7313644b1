//! Message origin classification
//!
//! Every inbound event is tagged with the channel it arrived through (the
//! bot's own chat or a proxied business chat) and the role of its author
//! (the bot owner or the owner's end customer).

use crate::mode::UserMode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery channel of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Room {
    /// Direct chat with the bot
    Bot,
    /// Business chat proxied on behalf of the owner
    Chat,
}

/// Author role as persisted in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Bot owner
    #[serde(rename = "user")]
    User,
    /// Owner's end customer
    #[serde(rename = "client")]
    Client,
    /// Owner posing as a customer in demo mode
    #[serde(rename = "client&user")]
    ClientAndUser,
}

/// Origin of a message: channel and role combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "WhoRepr", into = "WhoRepr")]
pub enum Who {
    /// Owner talking to the bot directly
    BotUser,
    /// Owner rehearsing as a customer in the bot chat (demo mode)
    BotClient,
    /// Owner replying to a customer through the business chat
    ChatUser,
    /// Customer writing into the business chat
    ChatClient,
}

#[derive(Serialize, Deserialize)]
struct WhoRepr {
    room: Room,
    role: Role,
}

impl From<Who> for WhoRepr {
    fn from(who: Who) -> Self {
        Self {
            room: who.room(),
            role: who.role(),
        }
    }
}

impl TryFrom<WhoRepr> for Who {
    type Error = String;

    fn try_from(repr: WhoRepr) -> Result<Self, Self::Error> {
        match (repr.room, repr.role) {
            (Room::Bot, Role::User) => Ok(Self::BotUser),
            (Room::Bot, Role::Client | Role::ClientAndUser) => Ok(Self::BotClient),
            (Room::Chat, Role::User) => Ok(Self::ChatUser),
            (Room::Chat, Role::Client) => Ok(Self::ChatClient),
            (Room::Chat, Role::ClientAndUser) => {
                Err("role client&user is only valid in the bot room".to_string())
            }
        }
    }
}

impl Who {
    /// Channel the message arrived through
    #[must_use]
    pub const fn room(self) -> Room {
        match self {
            Self::BotUser | Self::BotClient => Room::Bot,
            Self::ChatUser | Self::ChatClient => Room::Chat,
        }
    }

    /// Persisted role of the author
    #[must_use]
    pub const fn role(self) -> Role {
        match self {
            Self::BotUser | Self::ChatUser => Role::User,
            Self::BotClient => Role::ClientAndUser,
            Self::ChatClient => Role::Client,
        }
    }

    /// True when the author plays the customer part of the conversation
    #[must_use]
    pub const fn is_client(self) -> bool {
        match self {
            Self::BotClient | Self::ChatClient => true,
            Self::BotUser | Self::ChatUser => false,
        }
    }

    /// Origin used when the bot itself answers in the same room
    #[must_use]
    pub const fn responder(self) -> Self {
        match self {
            Self::BotUser | Self::BotClient => Self::BotUser,
            Self::ChatUser | Self::ChatClient => Self::ChatUser,
        }
    }
}

impl fmt::Display for Who {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BotUser => "bot-user",
            Self::BotClient => "bot-client",
            Self::ChatUser => "chat-user",
            Self::ChatClient => "chat-client",
        };
        f.write_str(label)
    }
}

/// Classification input extracted from an inbound event
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    /// Chat the message was posted in
    pub chat_id: i64,
    /// Sender identity, if the platform reported one
    pub sender_id: Option<i64>,
    /// Business connection marker of proxied messages
    pub business_connection_id: Option<&'a str>,
}

/// Outcome of classifying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Classified; downstream handlers may route on it
    Resolved(Who),
    /// Origin could not be determined; pass to the next handler
    Unresolved,
}

/// Classify a direct (non-proxied) message.
///
/// The sender's persisted mode decides the role: in demo mode the owner is
/// treated as a customer.
#[must_use]
pub fn classify_direct(mode: UserMode) -> Who {
    match mode {
        UserMode::Demo => Who::BotClient,
        UserMode::None
        | UserMode::Start
        | UserMode::Quiz
        | UserMode::Idle
        | UserMode::Activation => Who::BotUser,
    }
}

/// Classify a proxied business message.
///
/// `owner_resolved` tells whether the business connection maps to a known
/// owner; an unknown connection leaves the event unresolved.
#[must_use]
pub fn classify_business(origin: Origin<'_>, owner_resolved: bool) -> Classification {
    if origin.business_connection_id.is_none() || !owner_resolved {
        return Classification::Unresolved;
    }
    // In a business chat the customer's private chat id equals their user id.
    match origin.sender_id {
        Some(sender) if sender == origin.chat_id => Classification::Resolved(Who::ChatClient),
        Some(_) => Classification::Resolved(Who::ChatUser),
        None => Classification::Unresolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_classification_follows_mode() {
        assert_eq!(classify_direct(UserMode::Demo), Who::BotClient);
        assert_eq!(classify_direct(UserMode::None), Who::BotUser);
        assert_eq!(classify_direct(UserMode::Idle), Who::BotUser);
    }

    #[test]
    fn test_business_client_writes_into_own_chat() {
        let origin = Origin {
            chat_id: 42,
            sender_id: Some(42),
            business_connection_id: Some("bc-1"),
        };
        assert_eq!(
            classify_business(origin, true),
            Classification::Resolved(Who::ChatClient)
        );
    }

    #[test]
    fn test_business_owner_reply() {
        let origin = Origin {
            chat_id: 42,
            sender_id: Some(7),
            business_connection_id: Some("bc-1"),
        };
        assert_eq!(
            classify_business(origin, true),
            Classification::Resolved(Who::ChatUser)
        );
    }

    #[test]
    fn test_unknown_owner_is_unresolved() {
        let origin = Origin {
            chat_id: 42,
            sender_id: Some(42),
            business_connection_id: Some("bc-unknown"),
        };
        assert_eq!(classify_business(origin, false), Classification::Unresolved);
    }

    #[test]
    fn test_who_serializes_as_room_and_role() {
        let json = serde_json::to_value(Who::BotClient).expect("serialize");
        assert_eq!(json["room"], "bot");
        assert_eq!(json["role"], "client&user");

        let back: Who = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, Who::BotClient);

        let bad = serde_json::json!({"room": "chat", "role": "client&user"});
        assert!(serde_json::from_value::<Who>(bad).is_err());
    }

    #[test]
    fn test_responder_stays_in_room() {
        assert_eq!(Who::ChatClient.responder(), Who::ChatUser);
        assert_eq!(Who::BotClient.responder(), Who::BotUser);
        assert!(Who::ChatClient.is_client());
        assert!(!Who::ChatUser.is_client());
    }
}
