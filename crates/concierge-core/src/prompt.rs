//! Prompt templates and placeholder substitution
//!
//! Templates use `{{key}}` placeholders resolved from an ordered list of
//! bindings in a single scan. `{{profile}}` is a block placeholder rendered
//! by [`render_profile`] from the owner's full profile. Substituted values are
//! never scanned again, so user-provided answers cannot inject placeholders.

#![allow(clippy::non_std_lazy_statics)]

use crate::config::AppSettings;
use crate::storage::{StorageError, StorageProvider};
use crate::users::Profile;
use chrono::{DateTime, Utc};
use lazy_regex::lazy_regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

static RE_PLACEHOLDER: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}");

/// Block placeholder expanded from the full profile
pub const PROFILE_PLACEHOLDER: &str = "profile";

/// Prompt resolution errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// Neither a stored prompt nor a fallback system message exists
    #[error("no {0} prompt configured and no fallback system message set")]
    Missing(PromptKind),
    /// Reading the stored prompt failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Purpose of a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    /// Answers the owner's clients
    Assistant,
    /// Answers the owner rehearsing in demo mode
    Demo,
}

impl PromptKind {
    /// Storage name of the kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::Demo => "demo",
        }
    }
}

impl std::fmt::Display for PromptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored prompt snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRecord {
    /// Kind of prompt
    pub kind: PromptKind,
    /// Template text
    pub text: String,
    /// Creation time; the latest snapshot wins
    pub created_at: DateTime<Utc>,
}

/// Ordered placeholder bindings; the first binding of a key wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateBindings {
    entries: Vec<(String, String)>,
}

impl TemplateBindings {
    /// Empty binding list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a binding
    #[must_use]
    pub fn bind(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), value.into()));
        self
    }

    /// Append every profile answer as a binding
    #[must_use]
    pub fn with_profile(mut self, profile: &Profile) -> Self {
        for (key, value) in profile {
            self.entries.push((key.clone(), value.render()));
        }
        self
    }

    /// Value bound to `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Render the profile block as `key: value` lines
#[must_use]
pub fn render_profile(profile: &Profile) -> String {
    profile
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{key}: {}", value.render()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A prompt template ready for substitution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    text: String,
}

impl PromptTemplate {
    /// Wrap template text
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Raw template text
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Substitute placeholders. Unbound placeholders render empty.
    #[must_use]
    pub fn render(&self, bindings: &TemplateBindings, profile: &Profile) -> String {
        RE_PLACEHOLDER
            .replace_all(&self.text, |caps: &regex::Captures<'_>| {
                let key = &caps[1];
                if key == PROFILE_PLACEHOLDER {
                    return render_profile(profile);
                }
                bindings.get(key).map_or_else(
                    || {
                        debug!(placeholder = key, "Unbound prompt placeholder");
                        String::new()
                    },
                    ToString::to_string,
                )
            })
            .into_owned()
    }
}

/// Select the active template of `kind`.
///
/// Demo falls back to the assistant prompt, and both fall back to the
/// configured system message.
///
/// # Errors
///
/// Returns `TemplateError::Missing` when nothing is configured, or a storage
/// error if the lookup fails.
pub async fn resolve_template(
    storage: &dyn StorageProvider,
    kind: PromptKind,
    settings: &AppSettings,
) -> Result<PromptTemplate, TemplateError> {
    if let Some(stored) = storage.latest_prompt(kind).await? {
        return Ok(PromptTemplate::new(stored.text));
    }
    if kind == PromptKind::Demo {
        if let Some(stored) = storage.latest_prompt(PromptKind::Assistant).await? {
            return Ok(PromptTemplate::new(stored.text));
        }
    }
    match settings.fallback_system_message() {
        Some(text) => Ok(PromptTemplate::new(text)),
        None => {
            warn!(%kind, "No prompt available");
            Err(TemplateError::Missing(kind))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::users::ProfileValue;
    use proptest::prelude::*;

    fn profile() -> Profile {
        let mut profile = Profile::new();
        profile.insert("business".into(), ProfileValue::Text("Bakery".into()));
        profile.insert(
            "services".into(),
            ProfileValue::List(vec!["cakes".into(), "bread".into()]),
        );
        profile
    }

    #[test]
    fn test_single_pass_substitution() {
        let template = PromptTemplate::new("Hi {{client_name}}, I am {{ owner_name }}. {{unknown}}!");
        let bindings = TemplateBindings::new()
            .bind("client_name", "{{owner_name}}")
            .bind("owner_name", "Anna");
        assert_eq!(
            template.render(&bindings, &Profile::new()),
            "Hi {{owner_name}}, I am Anna. !"
        );
    }

    #[test]
    fn test_profile_block() {
        let template = PromptTemplate::new("About:\n{{profile}}\nSell {{services}}.");
        let bindings = TemplateBindings::new().with_profile(&profile());
        insta::assert_snapshot!(template.render(&bindings, &profile()), @r"
        About:
        business: Bakery
        services: cakes, bread
        Sell cakes, bread.
        ");
    }

    #[tokio::test]
    async fn test_resolution_order() {
        let storage = InMemoryStorage::new();
        let settings = AppSettings::default();
        assert!(matches!(
            resolve_template(&storage, PromptKind::Assistant, &settings).await,
            Err(TemplateError::Missing(PromptKind::Assistant))
        ));

        let with_fallback = AppSettings {
            system_message: Some("fallback".into()),
            ..AppSettings::default()
        };
        let t = resolve_template(&storage, PromptKind::Demo, &with_fallback)
            .await
            .expect("fallback");
        assert_eq!(t.text(), "fallback");

        storage
            .save_prompt(&PromptRecord {
                kind: PromptKind::Assistant,
                text: "assistant".into(),
                created_at: Utc::now(),
            })
            .await
            .expect("save");
        let t = resolve_template(&storage, PromptKind::Demo, &with_fallback)
            .await
            .expect("assistant");
        assert_eq!(t.text(), "assistant");
    }

    proptest! {
        #[test]
        fn text_without_braces_is_unchanged(text in "[^{}]{0,200}") {
            let template = PromptTemplate::new(text.clone());
            prop_assert_eq!(template.render(&TemplateBindings::new(), &Profile::new()), text);
        }
    }
}
