//! User-facing texts and keyboards

use crate::clients::ClientRecord;
use crate::platform::{CommandInfo, InlineButton, InlineKeyboard};
use crate::quiz::QuizCallback;
use chrono::{DateTime, Utc};

pub const WELCOME: &str = "Hi! I am your business assistant. I answer your clients in \
Telegram Business chats while you are busy.\n\nFirst, tell me about your business: it takes \
a couple of minutes.";

pub const WELCOME_BACK: &str = "Welcome back! Send /help to see what I can do.";

pub const HELP: &str = "/quiz - fill in or update your business profile\n\
/exit - leave the questionnaire\n\
/activate - connect the assistant to your Telegram Business account\n\
/demo - talk to the assistant as if you were a client (toggle)\n\
/pause <minutes> - how long a client stays paused after you press Pause\n\
/help - this message";

pub const PROFILE_INCOMPLETE: &str =
    "Your profile is not complete yet. Let's finish the questionnaire first.";

pub const QUIZ_FINISHED: &str = "Your profile is ready. Send /activate to connect your \
business account, or /demo to try the assistant yourself.";

pub const QUIZ_EXITED: &str = "Questionnaire closed. Send /quiz to continue later.";

pub const NO_QUIZ: &str = "There is no questionnaire in progress. Send /quiz to start one.";

pub const QUIZ_EXPIRED: &str =
    "Your questionnaire session has expired. Send /quiz to start again.";

pub const EMPTY_SELECTION: &str = "Pick at least one option first.";

pub const STALE_BUTTON: &str = "This button is no longer active.";

pub const ACTIVATION_STEPS: &str = "Almost there! Open Telegram Settings → Telegram Business → \
Chatbots and add this bot. I will confirm as soon as the connection arrives.";

pub const ALREADY_LINKED: &str = "Your business account is already connected. The assistant \
is answering your clients again.";

pub const LINKED: &str =
    "Your business account is connected. From now on I answer your clients.";

pub const LINKED_NOT_ACTIVE: &str =
    "Business account connected. Send /activate to let me answer your clients.";

pub const DEMO_ON: &str = "Demo mode is on. Write to me as if you were one of your clients. \
Send /demo again to stop.";

pub const DEMO_OFF: &str = "Demo mode is off.";

pub const ASSISTANT_ACTIVE: &str =
    "The assistant is answering your clients. Send /help for commands.";

pub const WAITING_FOR_LINK: &str = "I am waiting for your business account. Open Telegram \
Settings → Telegram Business → Chatbots and add this bot.";

pub const START_HINT: &str = "Send /quiz to set up your assistant, or /help for commands.";

pub const NOT_NOW: &str = "That is not available right now. Send /help for commands.";

pub const NOT_YOUR_CLIENT: &str = "This client is not in your business chats.";

pub const PAUSE_USAGE: &str = "Usage: /pause <minutes>, for example /pause 30";

/// Keyboard offering the questionnaire
#[must_use]
pub fn start_keyboard() -> InlineKeyboard {
    InlineKeyboard::column(vec![InlineButton::new(
        "Take the survey",
        QuizCallback::Start.encode(),
    )])
}

/// Current `/pause` setting
#[must_use]
pub fn pause_setting(minutes: u32) -> String {
    format!("Pausing a client stops my replies to them for {minutes} minutes.")
}

/// Command menu published at startup
#[must_use]
pub fn command_menu() -> Vec<CommandInfo> {
    [
        ("start", "Start"),
        ("quiz", "Fill in your business profile"),
        ("exit", "Leave the questionnaire"),
        ("activate", "Connect your business account"),
        ("demo", "Toggle demo mode"),
        ("pause", "Set the client pause duration"),
        ("help", "Show help"),
    ]
    .into_iter()
    .map(|(command, description)| CommandInfo {
        command: command.to_string(),
        description: description.to_string(),
    })
    .collect()
}

/// Action behind a client card button
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    /// Suppress automated replies for the owner's pause duration
    Pause(i64),
    /// Lift the pause
    Resume(i64),
    /// Flip quick mode
    ToggleQuick(i64),
}

impl ClientAction {
    /// Callback data prefix of client card buttons
    pub const PREFIX: &'static str = "client:";

    /// Parse callback data; `None` for foreign or malformed payloads
    #[must_use]
    pub fn parse(data: &str) -> Option<Self> {
        let rest = data.strip_prefix(Self::PREFIX)?;
        let (action, id) = rest.split_once(':')?;
        let id = id.parse().ok()?;
        match action {
            "pause" => Some(Self::Pause(id)),
            "resume" => Some(Self::Resume(id)),
            "quick" => Some(Self::ToggleQuick(id)),
            _ => None,
        }
    }

    /// Encode as callback data
    #[must_use]
    pub fn encode(self) -> String {
        match self {
            Self::Pause(id) => format!("client:pause:{id}"),
            Self::Resume(id) => format!("client:resume:{id}"),
            Self::ToggleQuick(id) => format!("client:quick:{id}"),
        }
    }

    /// Client the action applies to
    #[must_use]
    pub const fn client_id(self) -> i64 {
        match self {
            Self::Pause(id) | Self::Resume(id) | Self::ToggleQuick(id) => id,
        }
    }
}

/// Card sent to the owner when a new client writes (HTML)
#[must_use]
pub fn client_card_text(client: &ClientRecord) -> String {
    let name = client.display_name();
    let mut text = format!("New client: <b>{}</b>", html_escape::encode_text(&name));
    if let Some(username) = client.username.as_deref().filter(|u| !u.is_empty()) {
        text.push_str(&format!(" (@{})", html_escape::encode_text(username)));
    }
    text.push_str("\nUse the buttons to pause my replies or to answer them instantly.");
    text
}

/// Toggles of a client card reflecting the current record
#[must_use]
pub fn client_card_keyboard(client: &ClientRecord, now: DateTime<Utc>) -> InlineKeyboard {
    let paused = client.mute.status && !client.mute.is_expired(now);
    let pause = if paused {
        InlineButton::new("▶️ Resume replies", ClientAction::Resume(client.id).encode())
    } else {
        InlineButton::new("⏸ Pause replies", ClientAction::Pause(client.id).encode())
    };
    let quick_label = if client.quick_mode {
        "⚡ Quick mode: on"
    } else {
        "⚡ Quick mode: off"
    };
    InlineKeyboard::column(vec![
        pause,
        InlineButton::new(quick_label, ClientAction::ToggleQuick(client.id).encode()),
    ])
}
