//! Direct-chat commands, questionnaire delivery and button callbacks

use super::views::{self, ClientAction};
use super::{ConversationService, InboundCallback};
use crate::error::ConciergeError;
use crate::mode::{ModeError, ModeEvent, TransitionError, UserMode};
use crate::platform::{InlineKeyboard, SendOptions};
use crate::quiz::{active_config, QuestionView, QuizCallback, QuizConfig, QuizOutcome};
use crate::users::UserRecord;
use chrono::Utc;
use tracing::{debug, error, info, warn};

/// Longest accepted `/pause` value: one week
const MAX_PAUSE_MINUTES: u32 = 7 * 24 * 60;

/// Slash commands understood in the direct chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Command {
    Start,
    Quiz,
    Exit,
    Activate,
    Demo,
    Pause(Option<String>),
    Help,
    Unknown(String),
}

impl Command {
    /// Parse `/name[@bot] [args]`; `None` for plain text
    pub(super) fn parse(text: &str) -> Option<Self> {
        let body = text.trim().strip_prefix('/')?;
        let (head, rest) = body
            .split_once(char::is_whitespace)
            .map_or((body, ""), |(head, rest)| (head, rest.trim()));
        let name = head.split('@').next().unwrap_or_default().to_lowercase();
        if name.is_empty() {
            return None;
        }
        Some(match name.as_str() {
            "start" => Self::Start,
            "quiz" => Self::Quiz,
            "exit" => Self::Exit,
            "activate" => Self::Activate,
            "demo" => Self::Demo,
            "pause" => Self::Pause(Some(rest.to_string()).filter(|r| !r.is_empty())),
            "help" => Self::Help,
            _ => Self::Unknown(name),
        })
    }
}

impl ConversationService {
    pub(super) async fn run_command(
        &self,
        user: &UserRecord,
        command: Command,
    ) -> Result<(), ConciergeError> {
        info!(user_id = user.user_id, ?command, "Command");
        match command {
            Command::Start => self.start(user).await,
            Command::Quiz => self.open_quiz(user.user_id).await,
            Command::Exit => self.exit_quiz(user.user_id).await,
            Command::Activate => self.activate(user).await,
            Command::Demo => self.toggle_demo(user).await,
            Command::Pause(arg) => self.set_pause(user, arg.as_deref()).await,
            Command::Help | Command::Unknown(_) => self.say(user.user_id, views::HELP).await,
        }
    }

    async fn start(&self, user: &UserRecord) -> Result<(), ConciergeError> {
        match user.mode {
            UserMode::None | UserMode::Start => {
                if user.mode == UserMode::None {
                    self.modes.transition(user.user_id, ModeEvent::Start).await?;
                }
                let options = SendOptions::default().with_keyboard(views::start_keyboard());
                self.platform
                    .send_text(user.user_id, views::WELCOME, &options)
                    .await?;
                Ok(())
            }
            _ => self.say(user.user_id, views::WELCOME_BACK).await,
        }
    }

    pub(super) async fn open_quiz(&self, user_id: i64) -> Result<(), ConciergeError> {
        let mode = self.modes.mode(user_id).await?;
        if mode != UserMode::Quiz {
            match self.modes.transition(user_id, ModeEvent::OpenQuiz).await {
                Ok(_) => {}
                Err(TransitionError::Mode(e)) => {
                    debug!(user_id, error = %e, "Questionnaire not available");
                    return self.say(user_id, views::NOT_NOW).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        let config = active_config(self.storage.as_ref()).await?;
        if mode != UserMode::Quiz {
            if let Some(title) = config.title.as_deref() {
                self.say(user_id, title).await?;
            }
        }
        let outcome = self.quiz.start(user_id, &config).await?;
        self.deliver_quiz(user_id, outcome).await
    }

    async fn redirect_to_quiz(&self, user_id: i64, config: &QuizConfig) -> Result<(), ConciergeError> {
        self.modes
            .transition(user_id, ModeEvent::ProfileIncomplete)
            .await?;
        self.say(user_id, views::PROFILE_INCOMPLETE).await?;
        let outcome = self.quiz.start(user_id, config).await?;
        self.deliver_quiz(user_id, outcome).await
    }

    async fn exit_quiz(&self, user_id: i64) -> Result<(), ConciergeError> {
        if self.modes.mode(user_id).await? != UserMode::Quiz {
            return self.say(user_id, views::NO_QUIZ).await;
        }
        self.quiz.exit(user_id).await?;
        self.modes.transition(user_id, ModeEvent::LeaveQuiz).await?;
        self.say(user_id, views::QUIZ_EXITED).await
    }

    pub(super) async fn answer_quiz_text(&self, user_id: i64, text: &str) -> Result<(), ConciergeError> {
        let config = active_config(self.storage.as_ref()).await?;
        let outcome = self.quiz.answer_text(user_id, &config, text).await?;
        self.deliver_quiz(user_id, outcome).await
    }

    async fn deliver_quiz(&self, user_id: i64, outcome: QuizOutcome) -> Result<(), ConciergeError> {
        match outcome {
            QuizOutcome::Next(view) => self.send_question(user_id, view).await,
            QuizOutcome::Completed { summary, .. } => {
                self.say(user_id, &summary).await?;
                if self.modes.mode(user_id).await? == UserMode::Quiz {
                    self.modes.transition(user_id, ModeEvent::LeaveQuiz).await?;
                }
                self.say(user_id, views::QUIZ_FINISHED).await
            }
            QuizOutcome::Rejected { message, question } => {
                self.say(user_id, &message).await?;
                if question.keyboard.is_some() {
                    self.send_question(user_id, question).await?;
                }
                Ok(())
            }
            QuizOutcome::NoSession => {
                if self.modes.mode(user_id).await? == UserMode::Quiz {
                    self.modes.transition(user_id, ModeEvent::LeaveQuiz).await?;
                }
                self.say(user_id, views::QUIZ_EXPIRED).await
            }
            QuizOutcome::SelectionChanged(_)
            | QuizOutcome::EmptySelection
            | QuizOutcome::Ignored => Ok(()),
        }
    }

    async fn send_question(&self, user_id: i64, view: QuestionView) -> Result<(), ConciergeError> {
        let options = match view.keyboard {
            Some(keyboard) => SendOptions::default().with_keyboard(keyboard),
            None => SendOptions::default(),
        };
        self.platform.send_text(user_id, &view.text, &options).await?;
        Ok(())
    }

    async fn activate(&self, user: &UserRecord) -> Result<(), ConciergeError> {
        let user_id = user.user_id;
        if user.mode == UserMode::Activation {
            return self.say(user_id, views::ACTIVATION_STEPS).await;
        }
        let config = active_config(self.storage.as_ref()).await?;
        let event = ModeEvent::Activate {
            profile_complete: config.is_complete(&user.profile),
        };
        match self.modes.transition(user_id, event).await {
            Ok(_) => {
                if self.has_enabled_link(user).await? {
                    self.modes.transition(user_id, ModeEvent::Linked).await?;
                    self.say(user_id, views::ALREADY_LINKED).await
                } else {
                    self.say(user_id, views::ACTIVATION_STEPS).await
                }
            }
            Err(TransitionError::Mode(ModeError::ProfileIncomplete)) => {
                self.redirect_to_quiz(user_id, &config).await
            }
            Err(TransitionError::Mode(ModeError::NotAllowed { .. })) => {
                self.say(user_id, views::NOT_NOW).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has_enabled_link(&self, user: &UserRecord) -> Result<bool, ConciergeError> {
        let Some(connection_id) = user.business_connection_id.as_deref() else {
            return Ok(false);
        };
        Ok(self
            .storage
            .get_business_connection(connection_id)
            .await?
            .is_some_and(|link| link.enabled && link.owner_id == user.user_id))
    }

    async fn toggle_demo(&self, user: &UserRecord) -> Result<(), ConciergeError> {
        let user_id = user.user_id;
        let config = active_config(self.storage.as_ref()).await?;
        let event = ModeEvent::ToggleDemo {
            profile_complete: config.is_complete(&user.profile),
        };
        match self.modes.transition(user_id, event).await {
            Ok(UserMode::Demo) => self.say(user_id, views::DEMO_ON).await,
            Ok(_) => self.say(user_id, views::DEMO_OFF).await,
            Err(TransitionError::Mode(ModeError::ProfileIncomplete)) => {
                self.redirect_to_quiz(user_id, &config).await
            }
            Err(TransitionError::Mode(ModeError::NotAllowed { .. })) => {
                self.say(user_id, views::NOT_NOW).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn set_pause(&self, user: &UserRecord, arg: Option<&str>) -> Result<(), ConciergeError> {
        let current = user.pause_minutes_or(self.settings.default_pause_minutes());
        let Some(raw) = arg else {
            let text = format!("{}\n{}", views::pause_setting(current), views::PAUSE_USAGE);
            return self.say(user.user_id, &text).await;
        };
        match raw.parse::<u32>() {
            Ok(minutes) if (1..=MAX_PAUSE_MINUTES).contains(&minutes) => {
                let mut updated = user.clone();
                updated.pause_minutes = Some(minutes);
                self.storage.upsert_user(&updated).await?;
                info!(user_id = user.user_id, minutes, "Pause duration set");
                self.say(user.user_id, &views::pause_setting(minutes)).await
            }
            _ => self.say(user.user_id, views::PAUSE_USAGE).await,
        }
    }

    /// Handle an inline button tap and acknowledge it
    #[tracing::instrument(skip(self, callback), fields(user_id = callback.from.id, data = %callback.data))]
    pub async fn handle_callback(&self, callback: InboundCallback) {
        let notice = match self.route_callback(&callback).await {
            Ok(notice) => notice,
            Err(e) => {
                error!(error = %e, "Failed to handle callback");
                Some(e.user_message().to_string())
            }
        };
        if let Err(e) = self
            .platform
            .answer_callback(&callback.id, notice.as_deref())
            .await
        {
            warn!(error = %e, "Failed to acknowledge callback");
        }
    }

    async fn route_callback(&self, callback: &InboundCallback) -> Result<Option<String>, ConciergeError> {
        if let Some(action) = QuizCallback::parse(&callback.data) {
            return self.on_quiz_callback(callback, action).await;
        }
        if let Some(action) = ClientAction::parse(&callback.data) {
            return self.on_client_action(callback, action).await;
        }
        debug!("Unknown callback payload");
        Ok(None)
    }

    async fn on_quiz_callback(
        &self,
        callback: &InboundCallback,
        action: QuizCallback,
    ) -> Result<Option<String>, ConciergeError> {
        let user_id = callback.from.id;
        match action {
            QuizCallback::Start => self.open_quiz(user_id).await?,
            QuizCallback::Exit => self.exit_quiz(user_id).await?,
            QuizCallback::Button { .. } | QuizCallback::Toggle { .. } | QuizCallback::Done { .. } => {
                let config = active_config(self.storage.as_ref()).await?;
                match self.quiz.handle_callback(user_id, &config, action).await? {
                    QuizOutcome::SelectionChanged(keyboard) => {
                        self.replace_keyboard(callback, &keyboard).await?;
                    }
                    QuizOutcome::EmptySelection => return Ok(Some(views::EMPTY_SELECTION.into())),
                    QuizOutcome::Ignored => return Ok(Some(views::STALE_BUTTON.into())),
                    outcome => {
                        if matches!(outcome, QuizOutcome::Next(_) | QuizOutcome::Completed { .. }) {
                            self.clear_keyboard(callback).await;
                        }
                        self.deliver_quiz(user_id, outcome).await?;
                    }
                }
            }
        }
        Ok(None)
    }

    async fn on_client_action(
        &self,
        callback: &InboundCallback,
        action: ClientAction,
    ) -> Result<Option<String>, ConciergeError> {
        let now = Utc::now();
        let owner = self.modes.load_user(callback.from.id).await?;
        if !self.owns_client(&owner, action.client_id()).await? {
            warn!(
                user_id = owner.user_id,
                client_id = action.client_id(),
                "Client card action from a user who does not own the client"
            );
            return Ok(Some(views::NOT_YOUR_CLIENT.into()));
        }
        let (client, notice) = match action {
            ClientAction::Pause(id) => {
                let minutes = owner.pause_minutes_or(self.settings.default_pause_minutes());
                let client = self.clients.pause(id, minutes, now).await?;
                (client, format!("Paused for {minutes} minutes"))
            }
            ClientAction::Resume(id) => (self.clients.resume(id).await?, "Replies resumed".into()),
            ClientAction::ToggleQuick(id) => {
                let client = self.clients.toggle_quick_mode(id).await?;
                let state = if client.quick_mode { "on" } else { "off" };
                (client, format!("Quick mode {state}"))
            }
        };
        info!(client_id = action.client_id(), ?action, "Client card toggled");
        self.replace_keyboard(callback, &views::client_card_keyboard(&client, now))
            .await?;
        Ok(Some(notice))
    }

    /// The client has written to the owner's linked business account
    async fn owns_client(&self, owner: &UserRecord, client_id: i64) -> Result<bool, ConciergeError> {
        let Some(connection_id) = owner.business_connection_id.as_deref() else {
            return Ok(false);
        };
        let linked = self
            .storage
            .get_business_connection(connection_id)
            .await?
            .is_some_and(|link| link.owner_id == owner.user_id);
        if !linked {
            return Ok(false);
        }
        let history = self.ledger.list_recent(client_id, connection_id, 1).await?;
        Ok(!history.is_empty())
    }

    async fn replace_keyboard(
        &self,
        callback: &InboundCallback,
        keyboard: &InlineKeyboard,
    ) -> Result<(), ConciergeError> {
        if let Some(message_id) = callback.message_id {
            self.platform
                .edit_keyboard(callback.chat_id, message_id, keyboard)
                .await?;
        }
        Ok(())
    }

    /// Drop the buttons of an answered question
    async fn clear_keyboard(&self, callback: &InboundCallback) {
        if let Err(e) = self.replace_keyboard(callback, &InlineKeyboard::default()).await {
            debug!(error = %e, "Could not clear answered keyboard");
        }
    }
}
