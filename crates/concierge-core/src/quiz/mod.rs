//! Onboarding questionnaire
//!
//! - [`config`]: questionnaire model, built-in YAML and the completeness predicate
//! - [`validation`]: typed checks for text answers
//! - [`engine`]: per-user step machine with durable, resumable state

/// Questionnaire model and loading
pub mod config;
/// Step machine and state persistence
pub mod engine;
/// Answer validation rules
pub mod validation;

pub use config::{
    Question, QuestionKind, QuizConfig, QuizConfigRecord, ValidationRule, ValidationSpec,
};
pub use engine::{QuestionView, QuizEngine, QuizOutcome};
pub use validation::{validate_answer, ValidationError};

use crate::storage::{StorageError, StorageProvider};
use crate::users::ProfileValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Questionnaire errors
#[derive(Debug, Error)]
pub enum QuizError {
    /// The questionnaire definition is unusable
    #[error("quiz configuration error: {0}")]
    Config(String),
    /// Reading or writing state failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn default_allow_exit() -> bool {
    true
}

/// Durable questionnaire progress of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizState {
    /// Index of the current question; equals the question count when done
    pub step: usize,
    /// Answers keyed by question id
    #[serde(default)]
    pub answers: BTreeMap<String, ProfileValue>,
    /// Show the exit button
    #[serde(default = "default_allow_exit", rename = "allowExit")]
    pub allow_exit: bool,
}

impl Default for QuizState {
    fn default() -> Self {
        Self {
            step: 0,
            answers: BTreeMap::new(),
            allow_exit: true,
        }
    }
}

/// Parsed questionnaire callback payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizCallback {
    /// Open the questionnaire
    Start,
    /// Single-choice tap
    Button {
        /// Step the keyboard belongs to
        step: usize,
        /// Option index
        option: usize,
    },
    /// Multi-select toggle
    Toggle {
        /// Step the keyboard belongs to
        step: usize,
        /// Option index
        option: usize,
    },
    /// Multi-select confirmation
    Done {
        /// Step the keyboard belongs to
        step: usize,
    },
    /// Leave the questionnaire
    Exit,
}

impl QuizCallback {
    /// Callback data prefix shared by every questionnaire button
    pub const PREFIX: &'static str = "quiz:";

    /// Parse callback data; `None` for foreign or malformed payloads
    #[must_use]
    pub fn parse(data: &str) -> Option<Self> {
        let rest = data.strip_prefix(Self::PREFIX)?;
        let mut parts = rest.split(':');
        let action = parts.next()?;
        let mut number = || parts.next().and_then(|p| p.parse::<usize>().ok());
        match action {
            "start" => Some(Self::Start),
            "exit" => Some(Self::Exit),
            "btn" => Some(Self::Button {
                step: number()?,
                option: number()?,
            }),
            "ms" => Some(Self::Toggle {
                step: number()?,
                option: number()?,
            }),
            "done" => Some(Self::Done { step: number()? }),
            _ => None,
        }
    }

    /// Encode as callback data
    #[must_use]
    pub fn encode(self) -> String {
        match self {
            Self::Start => "quiz:start".to_string(),
            Self::Exit => "quiz:exit".to_string(),
            Self::Button { step, option } => format!("quiz:btn:{step}:{option}"),
            Self::Toggle { step, option } => format!("quiz:ms:{step}:{option}"),
            Self::Done { step } => format!("quiz:done:{step}"),
        }
    }
}

/// Active questionnaire: the latest stored snapshot, else the built-in one.
///
/// An invalid stored snapshot is logged and skipped.
///
/// # Errors
///
/// Returns a storage error, or `QuizError::Config` if the built-in
/// questionnaire cannot be parsed.
pub async fn active_config(storage: &dyn StorageProvider) -> Result<QuizConfig, QuizError> {
    if let Some(record) = storage.latest_quiz_config().await? {
        match record.config.check() {
            Ok(()) => return Ok(record.config),
            Err(e) => warn!(error = %e, "Stored quiz config is invalid, using built-in"),
        }
    }
    QuizConfig::builtin()
}
