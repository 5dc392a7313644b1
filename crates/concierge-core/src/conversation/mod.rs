//! Inbound event routing
//!
//! [`ConversationService`] is the single entry point for every update the
//! transport receives. Messages run through a short handler chain: the
//! business-chat handler, then the direct-chat handler. An update nobody
//! takes is logged and reported as [`Flow::Continue`].
//!
//! Errors never escape the public handlers. In the direct chat the user gets
//! an apology; in business chats the client never sees internals and the
//! failure is only logged.

mod commands;
mod inbound;
mod views;

pub use inbound::{
    BusinessLink, Flow, InboundCallback, InboundContent, InboundMessage, Sender,
};
pub use views::ClientAction;

use crate::clients::{ClientCache, ClientRecord};
use crate::config::{AppSettings, TRANSCRIPT_TURN_LIMIT};
use crate::error::ConciergeError;
use crate::ledger::{ChatMessage, MessageLedger};
use crate::llm::LlmClient;
use crate::mode::{ModeEvent, ModeStore, UserMode};
use crate::platform::{ChatPlatform, PlatformError, SendOptions};
use crate::quiz::QuizEngine;
use crate::reconciler::{Batch, Reconciler};
use crate::storage::StorageProvider;
use crate::users::{resolve_owner, BusinessConnectionLink, UserRecord};
use crate::who::{classify_business, classify_direct, Classification, Origin, Who};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Routes inbound updates to the mode, quiz, client and ledger components
#[derive(Clone)]
pub struct ConversationService {
    storage: Arc<dyn StorageProvider>,
    modes: ModeStore,
    quiz: QuizEngine,
    clients: ClientCache,
    ledger: MessageLedger,
    reconciler: Reconciler,
    llm: Arc<LlmClient>,
    platform: Arc<dyn ChatPlatform>,
    settings: Arc<AppSettings>,
}

impl ConversationService {
    /// Wire the components over shared storage, LLM client and platform
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        llm: Arc<LlmClient>,
        platform: Arc<dyn ChatPlatform>,
        settings: Arc<AppSettings>,
    ) -> Self {
        let clients = ClientCache::new(storage.clone());
        let reconciler = Reconciler::new(
            storage.clone(),
            clients.clone(),
            llm.clone(),
            platform.clone(),
            settings.clone(),
        );
        Self {
            modes: ModeStore::new(storage.clone()),
            quiz: QuizEngine::new(storage.clone()),
            ledger: MessageLedger::new(storage.clone()),
            clients,
            reconciler,
            storage,
            llm,
            platform,
            settings,
        }
    }

    /// Sweep entry point sharing this service's client cache
    #[must_use]
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Process-wide client cache
    #[must_use]
    pub fn clients(&self) -> &ClientCache {
        &self.clients
    }

    /// Message ledger
    #[must_use]
    pub fn ledger(&self) -> &MessageLedger {
        &self.ledger
    }

    /// Persisted user modes
    #[must_use]
    pub fn modes(&self) -> &ModeStore {
        &self.modes
    }

    /// Questionnaire engine
    #[must_use]
    pub fn quiz(&self) -> &QuizEngine {
        &self.quiz
    }

    /// Publish the command menu
    ///
    /// # Errors
    ///
    /// Returns the platform error if the menu cannot be set.
    pub async fn publish_commands(&self) -> Result<(), PlatformError> {
        self.platform.set_command_menu(&views::command_menu()).await
    }

    /// Handle a new message
    #[instrument(skip(self, message), fields(chat_id = message.chat_id, message_id = message.message_id))]
    pub async fn handle_message(&self, message: InboundMessage) -> Flow {
        match self.route_message(&message).await {
            Ok(Flow::Continue) => {
                debug!("No handler took the message");
                Flow::Continue
            }
            Ok(Flow::Handled) => Flow::Handled,
            Err(e) => {
                error!(error = %e, "Failed to handle message");
                if message.business_connection_id.is_none() {
                    self.apologize(message.chat_id, &e).await;
                }
                Flow::Handled
            }
        }
    }

    /// Propagate an edited business message into the ledger
    #[instrument(skip(self, message), fields(chat_id = message.chat_id, message_id = message.message_id))]
    pub async fn handle_edit(&self, message: InboundMessage) {
        let Some(connection_id) = message.business_connection_id.as_deref() else {
            debug!("Ignoring edit outside business chats");
            return;
        };
        let Some(text) = message.text() else {
            return;
        };
        match self
            .ledger
            .edit(message.chat_id, message.message_id, connection_id, text)
            .await
        {
            Ok(true) => debug!("Ledger row updated from edit"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to apply edit"),
        }
    }

    /// Record a business connection and finish activation
    #[instrument(skip(self, link), fields(owner_id = link.owner.id, connection_id = %link.connection_id))]
    pub async fn handle_business_link(&self, link: BusinessLink) {
        if let Err(e) = self.link_business(&link).await {
            error!(error = %e, "Failed to process business connection");
        }
    }

    async fn route_message(&self, message: &InboundMessage) -> Result<Flow, ConciergeError> {
        if self.route_business(message).await? == Flow::Handled {
            return Ok(Flow::Handled);
        }
        self.route_direct(message).await
    }

    async fn route_business(&self, message: &InboundMessage) -> Result<Flow, ConciergeError> {
        let Some(connection_id) = message.business_connection_id.as_deref() else {
            return Ok(Flow::Continue);
        };
        let owner = resolve_owner(self.storage.as_ref(), connection_id).await?;
        let origin = Origin {
            chat_id: message.chat_id,
            sender_id: message.sender.as_ref().map(|s| s.id),
            business_connection_id: Some(connection_id),
        };
        let (Classification::Resolved(who), Some(owner)) =
            (classify_business(origin, owner.is_some()), owner)
        else {
            warn!(connection_id, "Cannot resolve business message origin");
            return Ok(Flow::Continue);
        };

        let Some(text) = self.message_text(message).await? else {
            debug!("Unsupported business message ignored");
            return Ok(Flow::Handled);
        };
        match who {
            Who::ChatClient => self.on_client_message(message, &owner, text).await?,
            Who::ChatUser => self.on_owner_reply(message, text).await?,
            Who::BotUser | Who::BotClient => return Ok(Flow::Continue),
        }
        Ok(Flow::Handled)
    }

    async fn route_direct(&self, message: &InboundMessage) -> Result<Flow, ConciergeError> {
        if message.business_connection_id.is_some() {
            return Ok(Flow::Continue);
        }
        let Some(sender) = message.sender.as_ref() else {
            return Ok(Flow::Continue);
        };
        if sender.id != message.chat_id {
            debug!("Ignoring message outside the private chat");
            return Ok(Flow::Continue);
        }

        let user = self.refresh_user(sender).await?;
        if let Some(command) = message.text().and_then(commands::Command::parse) {
            self.run_command(&user, command).await?;
            return Ok(Flow::Handled);
        }

        let Some(text) = self.message_text(message).await? else {
            self.say(user.user_id, views::NOT_NOW).await?;
            return Ok(Flow::Handled);
        };
        match classify_direct(user.mode) {
            Who::BotClient => self.on_demo_message(message, &user, text).await?,
            Who::BotUser => self.on_owner_text(&user, &text).await?,
            Who::ChatUser | Who::ChatClient => return Ok(Flow::Continue),
        }
        Ok(Flow::Handled)
    }

    /// Text of a message; voice notes are transcribed
    async fn message_text(&self, message: &InboundMessage) -> Result<Option<String>, ConciergeError> {
        match &message.content {
            InboundContent::Text(text) => Ok(Some(text.clone())),
            InboundContent::Voice { file_id, mime_type } => {
                let audio = self.platform.download_file(file_id).await?;
                let mime = mime_type.as_deref().unwrap_or("audio/ogg");
                let text = self.llm.transcribe(audio, mime).await?;
                Ok(Some(text).filter(|t| !t.trim().is_empty()))
            }
            InboundContent::Unsupported => Ok(None),
        }
    }

    async fn refresh_user(&self, sender: &Sender) -> Result<UserRecord, ConciergeError> {
        let mut user = self.modes.load_user(sender.id).await?;
        let fresh_name = sender.first_name.clone().filter(|n| !n.trim().is_empty());
        if fresh_name.is_some() && fresh_name != user.first_name {
            user.first_name = fresh_name;
            self.storage.upsert_user(&user).await?;
        }
        Ok(user)
    }

    async fn on_client_message(
        &self,
        message: &InboundMessage,
        owner: &UserRecord,
        text: String,
    ) -> Result<(), ConciergeError> {
        let sender = message
            .sender
            .clone()
            .unwrap_or_else(|| Sender::new(message.chat_id));
        let (client, is_new) = self.clients.observe(sender.to_client(message.chat_id)).await?;
        if is_new {
            self.send_client_card(owner.user_id, &client).await;
        }

        let row = ChatMessage::new(
            message.chat_id,
            message.message_id,
            message.channel(),
            text,
            Who::ChatClient,
        )
        .replying_to(message.replied_text.clone())
        .at(message.timestamp);
        self.ledger.append(row).await?;
        info!(owner_id = owner.user_id, "Client message recorded");

        if client.quick_mode && owner.mode == UserMode::Idle {
            if let Err(e) = self.answer_immediately(message.chat_id, message.channel()).await {
                warn!(error = %e, "Quick answer failed, leaving it to the sweep");
            }
        }
        Ok(())
    }

    async fn on_owner_reply(&self, message: &InboundMessage, text: String) -> Result<(), ConciergeError> {
        let (chat_id, channel) = (message.chat_id, message.channel());
        let row = ChatMessage::new(chat_id, message.message_id, channel, text, Who::ChatUser)
            .replying_to(message.replied_text.clone())
            .at(message.timestamp);
        self.ledger.append(row).await?;

        let pending = self
            .ledger
            .pending_client_messages(chat_id, channel, TRANSCRIPT_TURN_LIMIT)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = pending.iter().map(|m| m.message_id).collect();
        let report = self
            .ledger
            .mark_answered(chat_id, channel, &ids, true, Utc::now())
            .await;
        info!(answered = report.updated, "Owner replied manually");
        Ok(())
    }

    async fn on_demo_message(
        &self,
        message: &InboundMessage,
        user: &UserRecord,
        text: String,
    ) -> Result<(), ConciergeError> {
        let row = ChatMessage::new(user.user_id, message.message_id, "", text, Who::BotClient)
            .replying_to(message.replied_text.clone())
            .at(message.timestamp);
        self.ledger.append(row).await?;
        self.answer_immediately(user.user_id, "").await
    }

    async fn on_owner_text(&self, user: &UserRecord, text: &str) -> Result<(), ConciergeError> {
        match user.mode {
            UserMode::Quiz => self.answer_quiz_text(user.user_id, text).await,
            UserMode::None | UserMode::Start => {
                let options = SendOptions::default().with_keyboard(views::start_keyboard());
                self.platform
                    .send_text(user.user_id, views::START_HINT, &options)
                    .await?;
                Ok(())
            }
            UserMode::Idle => self.say(user.user_id, views::ASSISTANT_ACTIVE).await,
            UserMode::Activation => self.say(user.user_id, views::WAITING_FOR_LINK).await,
            UserMode::Demo => self.say(user.user_id, views::DEMO_ON).await,
        }
    }

    /// Answer the pending messages of a conversation now.
    ///
    /// A failed attempt is recorded with `mark_answered(false)`, which
    /// advances the backoff counters before the sweep retries.
    async fn answer_immediately(&self, chat_id: i64, channel: &str) -> Result<(), ConciergeError> {
        let pending = self
            .ledger
            .pending_client_messages(chat_id, channel, TRANSCRIPT_TURN_LIMIT)
            .await?;
        let Some(batch) = Batch::from_messages(&pending) else {
            return Ok(());
        };
        let now = Utc::now();
        match self.reconciler.answer_batch(&batch, now).await {
            Ok(outcome) => {
                debug!(?outcome, "Immediate answer");
                Ok(())
            }
            Err(e) => {
                self.ledger
                    .mark_answered(chat_id, channel, &batch.message_ids, false, now)
                    .await;
                Err(e)
            }
        }
    }

    async fn send_client_card(&self, owner_id: i64, client: &ClientRecord) {
        let options = SendOptions::default()
            .with_keyboard(views::client_card_keyboard(client, Utc::now()))
            .html();
        if let Err(e) = self
            .platform
            .send_text(owner_id, &views::client_card_text(client), &options)
            .await
        {
            warn!(owner_id, client_id = client.id, error = %e, "Failed to send client card");
        }
    }

    async fn link_business(&self, link: &BusinessLink) -> Result<(), ConciergeError> {
        let owner_id = link.owner.id;
        self.storage
            .save_business_connection(&BusinessConnectionLink {
                connection_id: link.connection_id.clone(),
                owner_id,
                enabled: link.enabled,
                linked_at: Utc::now(),
            })
            .await?;

        let mut user = self.refresh_user(&link.owner).await?;
        if user.business_connection_id.as_deref() != Some(link.connection_id.as_str()) {
            user.business_connection_id = Some(link.connection_id.clone());
            self.storage.upsert_user(&user).await?;
        }

        if !link.enabled {
            info!("Business connection disabled, link kept");
            return Ok(());
        }
        match user.mode {
            UserMode::Activation => {
                self.modes.transition(owner_id, ModeEvent::Linked).await?;
                self.say(owner_id, views::LINKED).await
            }
            UserMode::Idle => {
                debug!("Business connection refreshed");
                Ok(())
            }
            UserMode::None | UserMode::Start | UserMode::Quiz | UserMode::Demo => {
                self.say(owner_id, views::LINKED_NOT_ACTIVE).await
            }
        }
    }

    async fn say(&self, chat_id: i64, text: &str) -> Result<(), ConciergeError> {
        self.platform
            .send_text(chat_id, text, &SendOptions::default())
            .await?;
        Ok(())
    }

    async fn apologize(&self, chat_id: i64, cause: &ConciergeError) {
        if let Err(e) = self
            .platform
            .send_text(chat_id, cause.user_message(), &SendOptions::default())
            .await
        {
            warn!(chat_id, error = %e, "Failed to send apology");
        }
    }
}
