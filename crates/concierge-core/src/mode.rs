//! Per-user conversational mode
//!
//! The mode gates which handlers may act on a user's messages. Transitions
//! are explicit and single-step; anything not listed in [`UserMode::apply`]
//! is refused.

use crate::storage::{StorageError, StorageProvider};
use crate::users::UserRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Coarse per-user state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserMode {
    /// No flow in progress
    #[default]
    None,
    /// Welcome shown, questionnaire not yet taken
    Start,
    /// Questionnaire in progress
    Quiz,
    /// Business account linked, bot answering clients
    Idle,
    /// Owner rehearsing conversations as a customer
    Demo,
    /// Waiting for the business account to be linked
    Activation,
}

impl fmt::Display for UserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::None => "none",
            Self::Start => "start",
            Self::Quiz => "quiz",
            Self::Idle => "idle",
            Self::Demo => "demo",
            Self::Activation => "activation",
        };
        f.write_str(label)
    }
}

/// Events that move a user between modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
    /// `/start` command
    Start,
    /// User opted into the questionnaire
    OpenQuiz,
    /// A gated transition failed the completeness check; send the user to the quiz
    ProfileIncomplete,
    /// Questionnaire completed or exited
    LeaveQuiz,
    /// `/activate` command
    Activate {
        /// Result of the profile-completeness predicate
        profile_complete: bool,
    },
    /// Business account linked while in activation
    Linked,
    /// `/demo` command
    ToggleDemo {
        /// Result of the profile-completeness predicate
        profile_complete: bool,
    },
}

/// Refused mode transitions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModeError {
    /// The event is not valid in the current mode
    #[error("transition {event:?} is not allowed from mode {from}")]
    NotAllowed {
        /// Current mode
        from: UserMode,
        /// Rejected event
        event: ModeEvent,
    },
    /// The profile is incomplete; the user must take the questionnaire
    #[error("profile incomplete, questionnaire required")]
    ProfileIncomplete,
}

impl UserMode {
    /// Compute the next mode for `event`.
    ///
    /// `Start` is a welcomed-but-idle marker and accepts the same gated
    /// entries as `None`.
    ///
    /// # Errors
    ///
    /// Returns `ModeError::NotAllowed` for transitions outside the table and
    /// `ModeError::ProfileIncomplete` when a gated entry is refused.
    pub fn apply(self, event: ModeEvent) -> Result<Self, ModeError> {
        use ModeEvent as E;
        use UserMode as M;

        let refused = || ModeError::NotAllowed { from: self, event };
        match (self, event) {
            (M::None, E::Start) => Ok(M::Start),
            (M::None | M::Start, E::OpenQuiz) => Ok(M::Quiz),
            (M::None | M::Start | M::Idle, E::ProfileIncomplete) => Ok(M::Quiz),
            (M::Quiz, E::LeaveQuiz) => Ok(M::None),
            (M::None | M::Start | M::Idle, E::Activate { profile_complete }) => {
                if profile_complete {
                    Ok(M::Activation)
                } else {
                    Err(ModeError::ProfileIncomplete)
                }
            }
            (M::Activation, E::Linked) => Ok(M::Idle),
            (M::None | M::Start, E::ToggleDemo { profile_complete }) => {
                if profile_complete {
                    Ok(M::Demo)
                } else {
                    Err(ModeError::ProfileIncomplete)
                }
            }
            (M::Demo, E::ToggleDemo { .. }) => Ok(M::None),
            _ => Err(refused()),
        }
    }
}

/// Errors from persisted mode transitions
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The transition was refused
    #[error(transparent)]
    Mode(#[from] ModeError),
    /// Reading or writing the user row failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persisted mode reads and writes (last write wins)
#[derive(Clone)]
pub struct ModeStore {
    storage: Arc<dyn StorageProvider>,
}

impl ModeStore {
    /// Create a mode store over `storage`
    #[must_use]
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self { storage }
    }

    /// Load the user row, creating a fresh one on first interaction
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub async fn load_user(&self, user_id: i64) -> Result<UserRecord, StorageError> {
        Ok(self
            .storage
            .get_user(user_id)
            .await?
            .unwrap_or_else(|| UserRecord::new(user_id)))
    }

    /// Current mode of the user (`None` when never seen)
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails.
    pub async fn mode(&self, user_id: i64) -> Result<UserMode, StorageError> {
        Ok(self.load_user(user_id).await?.mode)
    }

    /// Apply `event` and persist the resulting mode.
    ///
    /// # Errors
    ///
    /// Returns `TransitionError::Mode` when refused (nothing is written) or a
    /// storage error.
    pub async fn transition(
        &self,
        user_id: i64,
        event: ModeEvent,
    ) -> Result<UserMode, TransitionError> {
        let mut user = self.load_user(user_id).await?;
        let from = user.mode;
        let to = from.apply(event)?;
        if from != to {
            user.mode = to;
            self.storage.upsert_user(&user).await?;
            info!(user_id, %from, %to, "Mode transition");
        }
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[test]
    fn test_start_only_from_none() {
        assert_eq!(UserMode::None.apply(ModeEvent::Start), Ok(UserMode::Start));
        assert!(UserMode::Quiz.apply(ModeEvent::Start).is_err());
        assert!(UserMode::Idle.apply(ModeEvent::Start).is_err());
    }

    #[test]
    fn test_quiz_entry_and_exit() {
        assert_eq!(UserMode::Start.apply(ModeEvent::OpenQuiz), Ok(UserMode::Quiz));
        assert_eq!(UserMode::None.apply(ModeEvent::OpenQuiz), Ok(UserMode::Quiz));
        assert!(UserMode::Demo.apply(ModeEvent::OpenQuiz).is_err());
        assert_eq!(UserMode::Quiz.apply(ModeEvent::LeaveQuiz), Ok(UserMode::None));
        assert!(UserMode::Idle.apply(ModeEvent::LeaveQuiz).is_err());
    }

    #[test]
    fn test_activation_is_gated() {
        let complete = ModeEvent::Activate {
            profile_complete: true,
        };
        let incomplete = ModeEvent::Activate {
            profile_complete: false,
        };
        assert_eq!(UserMode::None.apply(complete), Ok(UserMode::Activation));
        assert_eq!(UserMode::Idle.apply(complete), Ok(UserMode::Activation));
        assert_eq!(
            UserMode::None.apply(incomplete),
            Err(ModeError::ProfileIncomplete)
        );
        assert!(UserMode::Demo.apply(complete).is_err());
        assert_eq!(UserMode::Activation.apply(ModeEvent::Linked), Ok(UserMode::Idle));
        assert!(UserMode::None.apply(ModeEvent::Linked).is_err());
    }

    #[test]
    fn test_demo_toggle() {
        let on = ModeEvent::ToggleDemo {
            profile_complete: true,
        };
        let gated = ModeEvent::ToggleDemo {
            profile_complete: false,
        };
        assert_eq!(UserMode::None.apply(on), Ok(UserMode::Demo));
        assert_eq!(UserMode::Demo.apply(gated), Ok(UserMode::None));
        assert_eq!(UserMode::None.apply(gated), Err(ModeError::ProfileIncomplete));
        assert!(UserMode::Activation.apply(on).is_err());
    }

    #[tokio::test]
    async fn test_refused_transition_writes_nothing() {
        let storage = Arc::new(InMemoryStorage::new());
        let modes = ModeStore::new(storage.clone());

        let err = modes.transition(1, ModeEvent::Linked).await;
        assert!(matches!(err, Err(TransitionError::Mode(_))));
        assert!(storage.get_user(1).await.expect("read").is_none());

        assert_eq!(
            modes.transition(1, ModeEvent::Start).await.expect("start"),
            UserMode::Start
        );
        assert_eq!(modes.mode(1).await.expect("mode"), UserMode::Start);
    }
}
