//! End-to-end scenarios over the conversation service with in-memory storage

use chrono::{Duration, Utc};
use concierge_core::config::AppSettings;
use concierge_core::conversation::{
    BusinessLink, ConversationService, InboundContent, InboundMessage, Sender,
};
use concierge_core::llm::{Completion, LlmClient, LlmError, LlmProvider, Message};
use concierge_core::mode::UserMode;
use concierge_core::platform::{
    ChatPlatform, CommandInfo, InlineKeyboard, PlatformError, SendOptions,
};
use concierge_core::quiz::{QuizConfig, QuizConfigRecord};
use concierge_core::reconciler::SweepReport;
use concierge_core::storage::{InMemoryStorage, StorageProvider};
use concierge_core::users::{ProfileValue, UserRecord};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const OWNER: i64 = 42;
const CLIENT: i64 = 4242;
const OTHER_CLIENT: i64 = 4343;
const CONNECTION: &str = "biz-1";

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(i64, String, Option<InlineKeyboard>)>>,
    /// Sends to this chat fail; 0 disables
    refused_chat: AtomicI64,
}

impl Outbox {
    fn to(&self, chat_id: i64) -> Vec<(String, Option<InlineKeyboard>)> {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .filter(|(chat, _, _)| *chat == chat_id)
            .map(|(_, text, keyboard)| (text.clone(), keyboard.clone()))
            .collect()
    }
}

#[async_trait::async_trait]
impl ChatPlatform for Outbox {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        options: &SendOptions,
    ) -> Result<i64, PlatformError> {
        if chat_id == self.refused_chat.load(Ordering::SeqCst) {
            return Err(PlatformError::Request("Forbidden: bot was blocked".to_string()));
        }
        let mut sent = self.sent.lock().expect("lock");
        sent.push((chat_id, text.to_string(), options.keyboard.clone()));
        Ok(i64::try_from(sent.len()).unwrap_or_default())
    }

    async fn send_typing(&self, _chat_id: i64, _options: &SendOptions) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn edit_keyboard(
        &self,
        _chat_id: i64,
        _message_id: i64,
        _keyboard: &InlineKeyboard,
    ) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, PlatformError> {
        Err(PlatformError::NotFound(file_id.to_string()))
    }

    async fn set_command_menu(&self, _commands: &[CommandInfo]) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn answer_callback(
        &self,
        _callback_id: &str,
        _notice: Option<&str>,
    ) -> Result<(), PlatformError> {
        Ok(())
    }
}

/// Answers with a fixed text, or fails when `fail` is set
struct ScriptedMock {
    fail: bool,
    calls: AtomicUsize,
    turns_seen: Mutex<Vec<usize>>,
}

impl ScriptedMock {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            calls: AtomicUsize::new(0),
            turns_seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedMock {
    async fn chat_completion(
        &self,
        _system_prompt: &str,
        history: &[Message],
        _model_id: &str,
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.turns_seen.lock().expect("lock").push(history.len());
        if self.fail {
            return Err(LlmError::ApiError("API error: 500 - boom".to_string()));
        }
        Ok(Completion {
            text: "We are open until 8pm.".to_string(),
            usage: None,
        })
    }

    async fn transcribe_audio(
        &self,
        _audio_bytes: Vec<u8>,
        _mime_type: &str,
        _model_id: &str,
    ) -> Result<String, LlmError> {
        Err(LlmError::Unknown("Not implemented".to_string()))
    }
}

struct Setup {
    storage: Arc<InMemoryStorage>,
    outbox: Arc<Outbox>,
    service: ConversationService,
}

/// Logs go to the test harness; `RUST_LOG=concierge_core=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup(provider: Arc<dyn LlmProvider>) -> Setup {
    init_tracing();
    let settings = AppSettings {
        system_message: Some("Answer for {{owner_name}}.".to_string()),
        ..AppSettings::default()
    };
    let mut llm = LlmClient::new(&settings);
    llm.register_provider("openai".to_string(), provider);
    let storage = Arc::new(InMemoryStorage::new());
    let outbox = Arc::new(Outbox::default());
    let service = ConversationService::new(
        storage.clone(),
        Arc::new(llm),
        outbox.clone(),
        Arc::new(settings),
    );
    Setup {
        storage,
        outbox,
        service,
    }
}

fn owner() -> Sender {
    Sender {
        first_name: Some("Lena".to_string()),
        ..Sender::new(OWNER)
    }
}

/// Owner with a complete profile and a live business connection
async fn linked_owner(s: &Setup) {
    let mut user = UserRecord::new(OWNER);
    user.merge_profile("owner_name", ProfileValue::Text("Lena".into()));
    user.mode = UserMode::Activation;
    s.storage.upsert_user(&user).await.expect("upsert");
    s.service
        .handle_business_link(BusinessLink {
            connection_id: CONNECTION.to_string(),
            owner: owner(),
            enabled: true,
        })
        .await;
}

fn client_text(message_id: i64, text: &str) -> InboundMessage {
    text_from(CLIENT, message_id, text)
}

fn text_from(client: i64, message_id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        chat_id: client,
        message_id,
        sender: Some(Sender::new(client)),
        business_connection_id: Some(CONNECTION.to_string()),
        content: InboundContent::Text(text.to_string()),
        replied_text: None,
        timestamp: Utc::now(),
    }
}

async fn three_unanswered(s: &Setup) {
    for (id, text) in [(1, "Hi"), (2, "Are you open today?"), (3, "Until when?")] {
        s.service.handle_message(client_text(id, text)).await;
    }
}

#[tokio::test]
async fn scenario_a_start_sends_welcome_with_survey_button() {
    let s = setup(ScriptedMock::new(false));
    s.service
        .handle_message(InboundMessage::direct_text(owner(), 1, "/start"))
        .await;

    assert_eq!(s.service.modes().mode(OWNER).await.expect("mode"), UserMode::Start);
    let (_, keyboard) = s.outbox.to(OWNER).pop().expect("welcome");
    let keyboard = keyboard.expect("survey keyboard");
    assert!(keyboard.buttons().any(|b| b.callback_data == "quiz:start"));
}

#[tokio::test]
async fn scenario_b_invalid_email_does_not_advance() {
    let s = setup(ScriptedMock::new(false));
    let config = QuizConfig::from_yaml(
        r"
questions:
  - id: email
    text: Your e-mail?
    required: true
    validation: {rule: email}
  - id: city
    text: Your city?
",
    )
    .expect("config");
    s.storage
        .save_quiz_config(&QuizConfigRecord {
            created_at: Utc::now(),
            config,
        })
        .await
        .expect("save config");

    s.service
        .handle_message(InboundMessage::direct_text(owner(), 1, "/quiz"))
        .await;
    s.service
        .handle_message(InboundMessage::direct_text(owner(), 2, "not-an-email"))
        .await;
    let state = s.service.quiz().load_state(OWNER).await.expect("state").expect("session");
    assert_eq!(state.step, 0);
    let texts: Vec<String> = s.outbox.to(OWNER).into_iter().map(|(text, _)| text).collect();
    assert!(texts.iter().any(|t| t == "Please enter a valid e-mail address."));
    // The question comes back with its exit button after the error.
    assert_eq!(texts.last().map(String::as_str), Some("(1/2) Your e-mail?"));

    s.service
        .handle_message(InboundMessage::direct_text(owner(), 3, "a@b.com"))
        .await;
    let state = s.service.quiz().load_state(OWNER).await.expect("state").expect("session");
    assert_eq!(state.step, 1);
    assert_eq!(
        s.outbox.to(OWNER).last().map(|(text, _)| text.clone()).as_deref(),
        Some("(2/2) Your city?")
    );
}

#[tokio::test]
async fn scenario_c_duplicate_delivery_keeps_one_row() {
    let s = setup(ScriptedMock::new(false));
    linked_owner(&s).await;

    s.service.handle_message(client_text(7, "Hello")).await;
    s.service.handle_message(client_text(7, "Hello")).await;

    let rows = s
        .service
        .ledger()
        .list_recent(CLIENT, CONNECTION, 10)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn scenario_d_sweep_answers_the_whole_batch_once() {
    let mock = ScriptedMock::new(false);
    let s = setup(mock.clone());
    linked_owner(&s).await;
    three_unanswered(&s).await;

    let report = s
        .service
        .reconciler()
        .process_all_unanswered_chats()
        .await
        .expect("sweep");
    assert_eq!(report.succeeded, 1);
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    // Consecutive client turns are merged into one user turn.
    assert_eq!(*mock.turns_seen.lock().expect("lock"), vec![1]);

    let rows = s
        .service
        .ledger()
        .list_recent(CLIENT, CONNECTION, 10)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|m| m.answered.status));
    assert_eq!(rows.iter().filter(|m| m.is_bot).count(), 1);
    assert_eq!(s.outbox.to(CLIENT).len(), 1);
}

#[tokio::test]
async fn scenario_e_llm_failure_leaves_batch_pending_without_retry_bump() {
    let s = setup(ScriptedMock::new(true));
    linked_owner(&s).await;
    three_unanswered(&s).await;

    let report = s
        .service
        .reconciler()
        .process_all_unanswered_chats()
        .await
        .expect("sweep");
    assert_eq!(report.failed, 1);

    let rows = s
        .service
        .ledger()
        .list_recent(CLIENT, CONNECTION, 10)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|m| !m.answered.status && m.answered.retry == 0));

    let candidates = s
        .service
        .ledger()
        .list_all_unanswered(Utc::now())
        .await
        .expect("candidates");
    assert_eq!(candidates.len(), 3);
}

#[tokio::test]
async fn test_reply_also_settles_messages_in_backoff() {
    let s = setup(ScriptedMock::new(false));
    linked_owner(&s).await;
    let now = Utc::now();

    s.service.handle_message(client_text(5, "Is anyone there?")).await;
    for _ in 0..2 {
        s.service
            .ledger()
            .mark_answered(CLIENT, CONNECTION, &[5], false, now)
            .await;
    }
    s.service.handle_message(client_text(6, "Hello?")).await;

    let reconciler = s.service.reconciler();
    let first = reconciler
        .process_all_unanswered_chats_at(now)
        .await
        .expect("first sweep");
    assert_eq!(first.succeeded, 1);

    let rows = s
        .service
        .ledger()
        .list_recent(CLIENT, CONNECTION, 10)
        .await
        .expect("rows");
    assert!(rows.iter().all(|m| m.answered.status));

    let second = reconciler
        .process_all_unanswered_chats_at(now + Duration::minutes(61))
        .await
        .expect("second sweep");
    assert_eq!(second, SweepReport::default());
    assert_eq!(s.outbox.to(CLIENT).len(), 1);
}

#[tokio::test]
async fn test_failed_conversation_does_not_block_its_neighbour() {
    let s = setup(ScriptedMock::new(false));
    linked_owner(&s).await;
    s.outbox.refused_chat.store(OTHER_CLIENT, Ordering::SeqCst);

    s.service.handle_message(client_text(1, "Do you deliver?")).await;
    s.service
        .handle_message(text_from(OTHER_CLIENT, 1, "Price list please"))
        .await;

    let report = s
        .service
        .reconciler()
        .process_all_unanswered_chats()
        .await
        .expect("sweep");
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(s.outbox.to(CLIENT).len(), 1);

    let blocked = s
        .service
        .ledger()
        .list_recent(OTHER_CLIENT, CONNECTION, 10)
        .await
        .expect("rows");
    assert_eq!(blocked.len(), 1);
    assert!(!blocked[0].answered.status);
    assert_eq!(blocked[0].answered.retry, 0);
}
