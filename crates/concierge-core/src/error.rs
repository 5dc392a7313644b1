use crate::llm::LlmError;
use crate::mode::{ModeError, TransitionError};
use crate::platform::PlatformError;
use crate::prompt::TemplateError;
use crate::quiz::{QuizError, ValidationError};
use crate::storage::StorageError;
use thiserror::Error;

/// Any failure surfaced by the conversation layer
#[derive(Debug, Error)]
pub enum ConciergeError {
    /// Storage read or write failed
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// LLM request failed
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// Chat platform call failed
    #[error(transparent)]
    Platform(#[from] PlatformError),
    /// Mode transition refused
    #[error(transparent)]
    Mode(#[from] ModeError),
    /// Questionnaire failure
    #[error(transparent)]
    Quiz(#[from] QuizError),
    /// Answer rejected by a validation rule
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// No usable prompt template
    #[error(transparent)]
    Template(#[from] TemplateError),
}

impl From<TransitionError> for ConciergeError {
    fn from(error: TransitionError) -> Self {
        match error {
            TransitionError::Mode(e) => Self::Mode(e),
            TransitionError::Storage(e) => Self::Storage(e),
        }
    }
}

impl ConciergeError {
    /// True for missing prompts, keys or questionnaire definitions
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Template(TemplateError::Missing(_))
                | Self::Llm(LlmError::MissingConfig(_))
                | Self::Quiz(QuizError::Config(_))
        )
    }

    /// Apology shown to the user when an interactive operation fails
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        if self.is_configuration() {
            "Sorry, the assistant is not configured yet. Please try again later."
        } else {
            "Sorry, something went wrong. Please try again."
        }
    }
}
