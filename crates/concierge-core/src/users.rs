//! Bot owners, their profiles and business connection links

use crate::mode::UserMode;
use crate::storage::{StorageError, StorageProvider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// A single profile answer: free text or a list of selected options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileValue {
    /// Free-form or single-choice answer
    Text(String),
    /// Multi-select answer
    List(Vec<String>),
}

impl ProfileValue {
    /// True when the answer carries no usable content
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::List(items) => items.iter().all(|i| i.trim().is_empty()),
        }
    }

    /// Human-readable rendering; lists are joined with `, `
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::List(items) => items.join(", "),
        }
    }
}

/// Profile answers keyed by profile key
pub type Profile = BTreeMap<String, ProfileValue>;

/// A bot owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Platform user id
    pub user_id: i64,
    /// Current conversational mode
    #[serde(default)]
    pub mode: UserMode,
    /// Questionnaire answers
    #[serde(default)]
    pub profile: Profile,
    /// Linked business connection, if any
    #[serde(default)]
    pub business_connection_id: Option<String>,
    /// Display name captured from the platform
    #[serde(default)]
    pub first_name: Option<String>,
    /// Pause duration chosen with `/pause`
    #[serde(default)]
    pub pause_minutes: Option<u32>,
}

impl UserRecord {
    /// Fresh record for a user seen for the first time
    #[must_use]
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            mode: UserMode::None,
            profile: Profile::new(),
            business_connection_id: None,
            first_name: None,
            pause_minutes: None,
        }
    }

    /// Merge an answer into the profile.
    ///
    /// Empty answers never overwrite an existing value. Returns `true` if the
    /// profile changed.
    pub fn merge_profile(&mut self, key: &str, value: ProfileValue) -> bool {
        if value.is_empty() {
            return false;
        }
        if self.profile.get(key) == Some(&value) {
            return false;
        }
        self.profile.insert(key.to_string(), value);
        true
    }

    /// Name used in prompts and notifications
    #[must_use]
    pub fn display_name(&self) -> String {
        self.first_name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("user {}", self.user_id))
    }

    /// Pause duration for this owner's clients
    #[must_use]
    pub fn pause_minutes_or(&self, default: u32) -> u32 {
        self.pause_minutes.filter(|m| *m > 0).unwrap_or(default)
    }
}

/// Mapping from a business connection to its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessConnectionLink {
    /// Platform connection id
    pub connection_id: String,
    /// Owner's user id
    pub owner_id: i64,
    /// Whether the connection is currently enabled
    pub enabled: bool,
    /// When the link was last written
    pub linked_at: DateTime<Utc>,
}

/// Resolve the owner behind a business connection.
///
/// Returns `None` when the connection is unknown or points to a missing user.
///
/// # Errors
///
/// Returns a storage error if a read fails.
pub async fn resolve_owner(
    storage: &dyn StorageProvider,
    connection_id: &str,
) -> Result<Option<UserRecord>, StorageError> {
    let Some(link) = storage.get_business_connection(connection_id).await? else {
        return Ok(None);
    };
    let owner = storage.get_user(link.owner_id).await?;
    if owner.is_none() {
        warn!(
            connection_id,
            owner_id = link.owner_id,
            "Business connection points to an unknown user"
        );
    }
    Ok(owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_answer_never_overwrites() {
        let mut user = UserRecord::new(1);
        assert!(user.merge_profile("name", ProfileValue::Text("Anna".into())));
        assert!(!user.merge_profile("name", ProfileValue::Text("  ".into())));
        assert!(!user.merge_profile("name", ProfileValue::List(vec![])));
        assert_eq!(
            user.profile.get("name"),
            Some(&ProfileValue::Text("Anna".into()))
        );
    }

    #[test]
    fn test_profile_value_is_untagged() {
        let text: ProfileValue = serde_json::from_str("\"hello\"").expect("text");
        let list: ProfileValue = serde_json::from_str("[\"a\",\"b\"]").expect("list");
        assert_eq!(text, ProfileValue::Text("hello".into()));
        assert_eq!(list.render(), "a, b");
    }

    #[test]
    fn test_old_rows_deserialize_with_defaults() {
        let user: UserRecord = serde_json::from_str(r#"{"user_id": 5}"#).expect("row");
        assert_eq!(user.mode, UserMode::None);
        assert!(user.profile.is_empty());
        assert_eq!(user.pause_minutes_or(60), 60);
        assert_eq!(user.display_name(), "user 5");
    }
}
