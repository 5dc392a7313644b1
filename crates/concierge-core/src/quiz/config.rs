use super::QuizError;
use crate::users::Profile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const BUILTIN_QUIZ: &str = include_str!("../../assets/default_quiz.yaml");

/// Input style of a question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionKind {
    /// Free-form text, optionally validated
    #[default]
    Text,
    /// Single choice from the options
    Buttons,
    /// Any non-empty subset of the options
    MultiSelect,
}

/// Typed validation rule for text answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidationRule {
    /// E-mail address
    Email,
    /// Phone number
    Phone,
    /// http(s) URL
    Url,
    /// Number within optional `min`/`max`
    Number,
    /// At least `min` characters
    MinLength,
    /// At most `max` characters
    MaxLength,
    /// Must match `pattern`
    Regex,
    /// Owner-defined check: `pattern` when present, otherwise any non-blank text
    Custom,
}

/// Validation attached to a text question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSpec {
    /// Rule to apply
    pub rule: ValidationRule,
    /// Lower bound (value or length)
    #[serde(default)]
    pub min: Option<f64>,
    /// Upper bound (value or length)
    #[serde(default)]
    pub max: Option<f64>,
    /// Regular expression for `regex` and `custom`
    #[serde(default)]
    pub pattern: Option<String>,
    /// Message shown when the answer is rejected
    #[serde(default)]
    pub message: Option<String>,
}

/// One questionnaire step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Stable question id
    pub id: String,
    /// Question text
    pub text: String,
    /// Input style
    #[serde(default)]
    pub kind: QuestionKind,
    /// Choices for button and multi-select questions
    #[serde(default)]
    pub options: Vec<String>,
    /// Profile key the answer is stored under (defaults to `id`)
    #[serde(default)]
    pub profile_key: Option<String>,
    /// Counts toward profile completeness
    #[serde(default)]
    pub required: bool,
    /// Validation for text answers
    #[serde(default)]
    pub validation: Option<ValidationSpec>,
}

impl Question {
    /// Profile key of the answer
    #[must_use]
    pub fn profile_key(&self) -> &str {
        self.profile_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&self.id)
    }
}

/// A questionnaire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizConfig {
    /// Heading shown when the questionnaire starts
    #[serde(default)]
    pub title: Option<String>,
    /// Ordered questions
    pub questions: Vec<Question>,
}

/// Stored questionnaire snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizConfigRecord {
    /// Creation time; the latest snapshot is active
    pub created_at: DateTime<Utc>,
    /// Questionnaire
    pub config: QuizConfig,
}

impl QuizConfig {
    /// Questionnaire shipped with the binary
    ///
    /// # Errors
    ///
    /// Returns `QuizError::Config` if the bundled YAML is invalid.
    pub fn builtin() -> Result<Self, QuizError> {
        Self::from_yaml(BUILTIN_QUIZ)
    }

    /// Parse and check a YAML questionnaire
    ///
    /// # Errors
    ///
    /// Returns `QuizError::Config` on parse or consistency errors.
    pub fn from_yaml(source: &str) -> Result<Self, QuizError> {
        let config: Self =
            serde_yaml::from_str(source).map_err(|e| QuizError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Consistency checks: non-empty, unique ids, options where needed,
    /// compilable patterns.
    ///
    /// # Errors
    ///
    /// Returns `QuizError::Config` describing the first problem found.
    pub fn check(&self) -> Result<(), QuizError> {
        if self.questions.is_empty() {
            return Err(QuizError::Config("questionnaire has no questions".into()));
        }
        let mut ids = HashSet::new();
        for q in &self.questions {
            if !ids.insert(q.id.as_str()) {
                return Err(QuizError::Config(format!("duplicate question id {}", q.id)));
            }
            if q.kind != QuestionKind::Text && q.options.is_empty() {
                return Err(QuizError::Config(format!("question {} has no options", q.id)));
            }
            if let Some(pattern) = q.validation.as_ref().and_then(|v| v.pattern.as_deref()) {
                regex::Regex::new(pattern).map_err(|e| {
                    QuizError::Config(format!("question {} has an invalid pattern: {e}", q.id))
                })?;
            }
        }
        Ok(())
    }

    /// Number of questions
    #[must_use]
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// True when there are no questions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Question at `step`
    #[must_use]
    pub fn question(&self, step: usize) -> Option<&Question> {
        self.questions.get(step)
    }

    /// Profile completeness: every required question has a non-empty answer
    #[must_use]
    pub fn is_complete(&self, profile: &Profile) -> bool {
        self.questions
            .iter()
            .filter(|q| q.required)
            .all(|q| profile.get(q.profile_key()).is_some_and(|v| !v.is_empty()))
    }
}
