//! Questionnaire step machine
//!
//! State lives in a process-local cache backed by storage. A cache miss is
//! always resolved from storage before giving up; state is never fabricated
//! outside [`QuizEngine::start`].

use super::config::{Question, QuestionKind, QuizConfig};
use super::validation::validate_answer;
use super::{QuizCallback, QuizError, QuizState};
use crate::platform::{InlineButton, InlineKeyboard};
use crate::storage::StorageProvider;
use crate::users::{Profile, ProfileValue, UserRecord};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const STATE_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A question rendered for the chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionView {
    /// Message text
    pub text: String,
    /// Answer buttons, if any
    pub keyboard: Option<InlineKeyboard>,
}

/// Result of feeding input into the questionnaire
#[derive(Debug, Clone, PartialEq)]
pub enum QuizOutcome {
    /// Answer accepted; ask this question next
    Next(QuestionView),
    /// Last answer accepted; state cleared
    Completed {
        /// Formatted summary of all answers
        summary: String,
        /// Profile after merging the answers
        profile: Profile,
    },
    /// Answer rejected; step unchanged
    Rejected {
        /// Why the answer was rejected
        message: String,
        /// The same question again
        question: QuestionView,
    },
    /// Multi-select keyboard to edit in place
    SelectionChanged(InlineKeyboard),
    /// "Done" pressed with nothing selected
    EmptySelection,
    /// Input does not match the current question (old keyboard, wrong kind)
    Ignored,
    /// No state in memory or storage
    NoSession,
}

/// Per-user questionnaire engine
#[derive(Clone)]
pub struct QuizEngine {
    storage: Arc<dyn StorageProvider>,
    states: Cache<i64, QuizState>,
}

impl QuizEngine {
    /// Create an engine over `storage`
    #[must_use]
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            storage,
            states: Cache::builder()
                .max_capacity(10_000)
                .time_to_idle(STATE_IDLE_TTL)
                .build(),
        }
    }

    /// Current state: memory first, then storage
    ///
    /// # Errors
    ///
    /// Returns a storage error if the durable read fails.
    pub async fn load_state(&self, user_id: i64) -> Result<Option<QuizState>, QuizError> {
        if let Some(state) = self.states.get(&user_id).await {
            return Ok(Some(state));
        }
        let stored = self.storage.get_quiz_state(user_id).await?;
        if let Some(state) = &stored {
            debug!(user_id, step = state.step, "Quiz state restored from storage");
            self.states.insert(user_id, state.clone()).await;
        }
        Ok(stored)
    }

    async fn save_state(&self, user_id: i64, state: QuizState) -> Result<(), QuizError> {
        self.storage.save_quiz_state(user_id, &state).await?;
        self.states.insert(user_id, state).await;
        Ok(())
    }

    async fn clear_state(&self, user_id: i64) -> Result<(), QuizError> {
        self.states.invalidate(&user_id).await;
        self.storage.delete_quiz_state(user_id).await?;
        Ok(())
    }

    /// Start or resume the questionnaire and render the current question
    ///
    /// # Errors
    ///
    /// Returns a storage error if state cannot be read or written.
    pub async fn start(&self, user_id: i64, config: &QuizConfig) -> Result<QuizOutcome, QuizError> {
        let state = match self.load_state(user_id).await? {
            Some(state) => {
                info!(user_id, step = state.step, "Resuming quiz");
                state
            }
            None => {
                info!(user_id, "Starting quiz");
                let state = QuizState::default();
                self.save_state(user_id, state.clone()).await?;
                state
            }
        };
        if state.step >= config.len() {
            return self.complete(user_id, config, state).await;
        }
        Ok(QuizOutcome::Next(render_question(config, &state)))
    }

    /// Leave the questionnaire regardless of progress
    ///
    /// # Errors
    ///
    /// Returns a storage error if the durable state cannot be deleted.
    pub async fn exit(&self, user_id: i64) -> Result<(), QuizError> {
        info!(user_id, "Quiz exited");
        self.clear_state(user_id).await
    }

    /// Feed a text message into the current question
    ///
    /// # Errors
    ///
    /// Returns a storage error if state or profile persistence fails.
    pub async fn answer_text(
        &self,
        user_id: i64,
        config: &QuizConfig,
        text: &str,
    ) -> Result<QuizOutcome, QuizError> {
        let Some(state) = self.load_state(user_id).await? else {
            return Ok(QuizOutcome::NoSession);
        };
        let Some(question) = config.question(state.step) else {
            return self.complete(user_id, config, state).await;
        };
        if question.kind != QuestionKind::Text {
            return Ok(QuizOutcome::Rejected {
                message: "Please use the buttons below.".to_string(),
                question: render_question(config, &state),
            });
        }
        if let Err(e) = validate_answer(question.validation.as_ref(), text) {
            debug!(user_id, step = state.step, "Quiz answer rejected");
            return Ok(QuizOutcome::Rejected {
                message: e.message,
                question: render_question(config, &state),
            });
        }
        let answer = ProfileValue::Text(text.trim().to_string());
        self.accept(user_id, config, state, answer).await
    }

    /// Handle a questionnaire button
    ///
    /// # Errors
    ///
    /// Returns a storage error if state or profile persistence fails.
    pub async fn handle_callback(
        &self,
        user_id: i64,
        config: &QuizConfig,
        callback: QuizCallback,
    ) -> Result<QuizOutcome, QuizError> {
        match callback {
            QuizCallback::Start => self.start(user_id, config).await,
            QuizCallback::Exit => {
                self.exit(user_id).await?;
                Ok(QuizOutcome::Ignored)
            }
            QuizCallback::Button { step, option } => {
                self.press_button(user_id, config, step, option).await
            }
            QuizCallback::Toggle { step, option } => {
                self.toggle_option(user_id, config, step, option).await
            }
            QuizCallback::Done { step } => self.finish_selection(user_id, config, step).await,
        }
    }

    async fn current(
        &self,
        user_id: i64,
        config: &QuizConfig,
        step: usize,
        kind: QuestionKind,
    ) -> Result<Result<QuizState, QuizOutcome>, QuizError> {
        let Some(state) = self.load_state(user_id).await? else {
            return Ok(Err(QuizOutcome::NoSession));
        };
        let matches = state.step == step
            && config
                .question(step)
                .is_some_and(|question| question.kind == kind);
        if !matches {
            debug!(user_id, step, current = state.step, "Stale quiz callback");
            return Ok(Err(QuizOutcome::Ignored));
        }
        Ok(Ok(state))
    }

    async fn press_button(
        &self,
        user_id: i64,
        config: &QuizConfig,
        step: usize,
        option: usize,
    ) -> Result<QuizOutcome, QuizError> {
        let state = match self
            .current(user_id, config, step, QuestionKind::Buttons)
            .await?
        {
            Ok(state) => state,
            Err(outcome) => return Ok(outcome),
        };
        let Some(choice) = config
            .question(step)
            .and_then(|question| question.options.get(option))
        else {
            return Ok(QuizOutcome::Ignored);
        };
        let answer = ProfileValue::Text(choice.clone());
        self.accept(user_id, config, state, answer).await
    }

    async fn toggle_option(
        &self,
        user_id: i64,
        config: &QuizConfig,
        step: usize,
        option: usize,
    ) -> Result<QuizOutcome, QuizError> {
        let mut state = match self
            .current(user_id, config, step, QuestionKind::MultiSelect)
            .await?
        {
            Ok(state) => state,
            Err(outcome) => return Ok(outcome),
        };
        let Some(question) = config.question(step) else {
            return Ok(QuizOutcome::Ignored);
        };
        let Some(choice) = question.options.get(option) else {
            return Ok(QuizOutcome::Ignored);
        };

        let mut selected = selection(&state, question);
        if let Some(pos) = selected.iter().position(|s| s == choice) {
            selected.remove(pos);
        } else {
            selected.push(choice.clone());
        }
        state
            .answers
            .insert(question.id.clone(), ProfileValue::List(selected));

        let keyboard = question_keyboard(question, &state);
        self.save_state(user_id, state).await?;
        Ok(QuizOutcome::SelectionChanged(keyboard))
    }

    async fn finish_selection(
        &self,
        user_id: i64,
        config: &QuizConfig,
        step: usize,
    ) -> Result<QuizOutcome, QuizError> {
        let state = match self
            .current(user_id, config, step, QuestionKind::MultiSelect)
            .await?
        {
            Ok(state) => state,
            Err(outcome) => return Ok(outcome),
        };
        let Some(question) = config.question(step) else {
            return Ok(QuizOutcome::Ignored);
        };
        let selected = selection(&state, question);
        if selected.is_empty() {
            return Ok(QuizOutcome::EmptySelection);
        }
        self.accept(user_id, config, state, ProfileValue::List(selected))
            .await
    }

    async fn accept(
        &self,
        user_id: i64,
        config: &QuizConfig,
        mut state: QuizState,
        answer: ProfileValue,
    ) -> Result<QuizOutcome, QuizError> {
        let Some(question) = config.question(state.step) else {
            return self.complete(user_id, config, state).await;
        };

        let mut user = self
            .storage
            .get_user(user_id)
            .await?
            .unwrap_or_else(|| UserRecord::new(user_id));
        if user.merge_profile(question.profile_key(), answer.clone()) {
            self.storage.upsert_user(&user).await?;
        }

        state.answers.insert(question.id.clone(), answer);
        state.step += 1;
        debug!(user_id, step = state.step, "Quiz answer accepted");

        if state.step >= config.len() {
            return self.complete(user_id, config, state).await;
        }
        let view = render_question(config, &state);
        self.save_state(user_id, state).await?;
        Ok(QuizOutcome::Next(view))
    }

    async fn complete(
        &self,
        user_id: i64,
        config: &QuizConfig,
        state: QuizState,
    ) -> Result<QuizOutcome, QuizError> {
        self.clear_state(user_id).await?;
        let profile = self
            .storage
            .get_user(user_id)
            .await?
            .map(|u| u.profile)
            .unwrap_or_default();
        info!(user_id, "Quiz completed");
        Ok(QuizOutcome::Completed {
            summary: render_summary(config, &state),
            profile,
        })
    }
}

fn selection(state: &QuizState, question: &Question) -> Vec<String> {
    match state.answers.get(&question.id) {
        Some(ProfileValue::List(items)) => items.clone(),
        Some(ProfileValue::Text(item)) if !item.is_empty() => vec![item.clone()],
        _ => Vec::new(),
    }
}

fn question_keyboard(question: &Question, state: &QuizState) -> InlineKeyboard {
    let step = state.step;
    let mut keyboard = match question.kind {
        QuestionKind::Text => InlineKeyboard::default(),
        QuestionKind::Buttons => InlineKeyboard::column(
            question
                .options
                .iter()
                .enumerate()
                .map(|(option, label)| {
                    InlineButton::new(label, QuizCallback::Button { step, option }.encode())
                })
                .collect(),
        ),
        QuestionKind::MultiSelect => {
            let selected = selection(state, question);
            InlineKeyboard::column(
                question
                    .options
                    .iter()
                    .enumerate()
                    .map(|(option, label)| {
                        let mark = if selected.contains(label) { "✅" } else { "⬜" };
                        InlineButton::new(
                            format!("{mark} {label}"),
                            QuizCallback::Toggle { step, option }.encode(),
                        )
                    })
                    .collect(),
            )
            .row(vec![InlineButton::new(
                "Done",
                QuizCallback::Done { step }.encode(),
            )])
        }
    };
    if state.allow_exit {
        keyboard = keyboard.row(vec![InlineButton::new(
            "Exit questionnaire",
            QuizCallback::Exit.encode(),
        )]);
    }
    keyboard
}

/// Render the question at the state's step
#[must_use]
pub fn render_question(config: &QuizConfig, state: &QuizState) -> QuestionView {
    let Some(question) = config.question(state.step) else {
        return QuestionView {
            text: "The questionnaire is complete.".to_string(),
            keyboard: None,
        };
    };
    let keyboard = question_keyboard(question, state);
    QuestionView {
        text: format!(
            "({}/{}) {}",
            state.step + 1,
            config.len(),
            question.text
        ),
        keyboard: (!keyboard.rows.is_empty()).then_some(keyboard),
    }
}

/// Summary of collected answers in question order
#[must_use]
pub fn render_summary(config: &QuizConfig, state: &QuizState) -> String {
    let mut lines = vec!["Thank you! Here is what you told me:".to_string()];
    for question in &config.questions {
        if let Some(answer) = state.answers.get(&question.id).filter(|a| !a.is_empty()) {
            lines.push(format!("• {}\n  {}", question.text, answer.render()));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    const YAML: &str = r"
questions:
  - id: email
    text: Your e-mail?
    profile_key: contact_email
    required: true
    validation: {rule: email}
  - id: tone
    text: Tone?
    kind: buttons
    options: [Formal, Friendly]
  - id: services
    text: Services?
    kind: multi-select
    options: [Delivery, Booking]
";

    fn setup() -> (Arc<InMemoryStorage>, QuizEngine, QuizConfig) {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = QuizEngine::new(storage.clone());
        let config = QuizConfig::from_yaml(YAML).expect("config");
        (storage, engine, config)
    }

    #[tokio::test]
    async fn test_invalid_text_does_not_advance() {
        let (_, engine, config) = setup();
        engine.start(1, &config).await.expect("start");

        let outcome = engine
            .answer_text(1, &config, "not-an-email")
            .await
            .expect("answer");
        assert!(matches!(outcome, QuizOutcome::Rejected { .. }));
        assert_eq!(engine.load_state(1).await.expect("state").expect("some").step, 0);

        let outcome = engine.answer_text(1, &config, "a@b.com").await.expect("answer");
        assert!(matches!(outcome, QuizOutcome::Next(_)));
        assert_eq!(engine.load_state(1).await.expect("state").expect("some").step, 1);
    }

    #[tokio::test]
    async fn test_state_resumes_from_storage_after_restart() {
        let (storage, engine, config) = setup();
        engine.start(1, &config).await.expect("start");
        engine.answer_text(1, &config, "a@b.com").await.expect("answer");

        let restarted = QuizEngine::new(storage);
        let outcome = restarted
            .handle_callback(1, &config, QuizCallback::Button { step: 1, option: 1 })
            .await
            .expect("button");
        assert!(matches!(outcome, QuizOutcome::Next(_)));
    }

    #[tokio::test]
    async fn test_no_state_is_not_fabricated() {
        let (storage, engine, config) = setup();
        let outcome = engine.answer_text(1, &config, "a@b.com").await.expect("answer");
        assert_eq!(outcome, QuizOutcome::NoSession);
        assert!(storage.get_quiz_state(1).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_multi_select_requires_a_selection() {
        let (storage, engine, config) = setup();
        storage
            .save_quiz_state(
                1,
                &QuizState {
                    step: 2,
                    ..QuizState::default()
                },
            )
            .await
            .expect("seed");

        let done = QuizCallback::Done { step: 2 };
        assert_eq!(
            engine.handle_callback(1, &config, done).await.expect("done"),
            QuizOutcome::EmptySelection
        );

        let toggle = QuizCallback::Toggle { step: 2, option: 0 };
        let outcome = engine.handle_callback(1, &config, toggle).await.expect("toggle");
        let QuizOutcome::SelectionChanged(keyboard) = outcome else {
            panic!("expected keyboard edit, got {outcome:?}");
        };
        assert!(keyboard.buttons().any(|b| b.text == "✅ Delivery"));

        let outcome = engine.handle_callback(1, &config, done).await.expect("done");
        assert!(matches!(outcome, QuizOutcome::Completed { .. }));
        assert!(storage.get_quiz_state(1).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_stale_callback_is_ignored() {
        let (_, engine, config) = setup();
        engine.start(1, &config).await.expect("start");
        let outcome = engine
            .handle_callback(1, &config, QuizCallback::Button { step: 1, option: 0 })
            .await
            .expect("callback");
        assert_eq!(outcome, QuizOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_full_run_merges_profile_and_summarises() {
        let (storage, engine, config) = setup();
        engine.start(7, &config).await.expect("start");
        engine.answer_text(7, &config, "a@b.com").await.expect("email");
        engine
            .handle_callback(7, &config, QuizCallback::Button { step: 1, option: 1 })
            .await
            .expect("tone");
        engine
            .handle_callback(7, &config, QuizCallback::Toggle { step: 2, option: 1 })
            .await
            .expect("toggle");
        let outcome = engine
            .handle_callback(7, &config, QuizCallback::Done { step: 2 })
            .await
            .expect("done");

        let QuizOutcome::Completed { summary, profile } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        insta::assert_snapshot!(summary, @r"
        Thank you! Here is what you told me:
        • Your e-mail?
          a@b.com
        • Tone?
          Friendly
        • Services?
          Booking
        ");
        assert!(config.is_complete(&profile));
        let user = storage.get_user(7).await.expect("read").expect("user");
        assert_eq!(
            user.profile.get("contact_email"),
            Some(&ProfileValue::Text("a@b.com".into()))
        );
    }

    #[tokio::test]
    async fn test_exit_clears_everything() {
        let (storage, engine, config) = setup();
        engine.start(1, &config).await.expect("start");
        engine.exit(1).await.expect("exit");
        assert!(engine.load_state(1).await.expect("state").is_none());
        assert!(storage.get_quiz_state(1).await.expect("read").is_none());
    }
}
