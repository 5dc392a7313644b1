//! Client records and the per-process client cache
//!
//! A client is an owner's end customer, identified by its business chat id.
//! Once loaded, a record lives in [`ClientCache`] for the rest of the process
//! and is only replaced through [`ClientCache::set`].
//!
//! Read-modify-write sequences (`get`, mutate, `set`) are not atomic: two
//! handlers touching the same client concurrently race and the last `set`
//! wins. Mutations therefore always rebuild the full record from the latest
//! read instead of applying blind deltas. This is an accepted race for
//! human-paced toggles, not a serialized section.
//!
//! Skipping unchanged writes assumes this process is the only writer of
//! client rows.

use crate::storage::{StorageError, StorageProvider};
use chrono::{DateTime, Duration, Utc};
use moka::future::Cache;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pause window of a client
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MuteState {
    /// Automated replies are suppressed
    #[serde(default)]
    pub status: bool,
    /// End of the pause; `None` is an indefinite pause
    #[serde(
        default,
        rename = "muteUntil",
        serialize_with = "serialize_mute_until",
        deserialize_with = "deserialize_mute_until"
    )]
    pub mute_until: Option<DateTime<Utc>>,
}

// Stored as an RFC 3339 string; the empty string means "no deadline".
fn serialize_mute_until<S: Serializer>(
    value: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
        None => serializer.serialize_str(""),
    }
}

fn deserialize_mute_until<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    if raw.trim().is_empty() {
        return Ok(None);
    }
    // An unreadable deadline counts as already passed, never as a pause
    // without end.
    Ok(Some(DateTime::parse_from_rfc3339(&raw).map_or_else(
        |e| {
            warn!(mute_until = %raw, error = %e, "Unreadable pause deadline, treating as expired");
            DateTime::<Utc>::MIN_UTC
        },
        |ts| ts.with_timezone(&Utc),
    )))
}

impl MuteState {
    /// Paused until `until`
    #[must_use]
    pub fn until(until: DateTime<Utc>) -> Self {
        Self {
            status: true,
            mute_until: Some(until),
        }
    }

    /// True when the pause had a deadline that is now in the past
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status && self.mute_until.is_some_and(|until| until <= now)
    }
}

/// An owner's end customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Business chat id of the client
    pub id: i64,
    /// First name
    #[serde(default)]
    pub first_name: Option<String>,
    /// Last name
    #[serde(default)]
    pub last_name: Option<String>,
    /// Username without `@`
    #[serde(default)]
    pub username: Option<String>,
    /// IETF language tag
    #[serde(default)]
    pub language_code: Option<String>,
    /// Answer this client immediately instead of waiting for the sweep
    #[serde(default, rename = "quickMode")]
    pub quick_mode: bool,
    /// Pause window
    #[serde(default)]
    pub mute: MuteState,
}

impl ClientRecord {
    /// Fresh record with no pause and quick mode off
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self {
            id,
            first_name: None,
            last_name: None,
            username: None,
            language_code: None,
            quick_mode: false,
            mute: MuteState::default(),
        }
    }

    /// Best available display name
    #[must_use]
    pub fn display_name(&self) -> String {
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            return full;
        }
        self.username
            .as_ref()
            .map_or_else(|| format!("client {}", self.id), |u| format!("@{u}"))
    }
}

/// Result of [`ClientCache::check_and_clear_expired_mute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteCheck {
    /// Paused, and the pause still applies
    Active,
    /// Not paused
    Inactive,
    /// Was paused until now; the pause has just been cleared and persisted
    Expired,
}

impl MuteCheck {
    /// True while automated replies must stay suppressed
    #[must_use]
    pub const fn is_muted(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Process-local client cache backed by storage
///
/// Entries never expire and are never evicted; they are only replaced by
/// [`ClientCache::set`].
#[derive(Clone)]
pub struct ClientCache {
    storage: Arc<dyn StorageProvider>,
    entries: Cache<i64, ClientRecord>,
}

impl ClientCache {
    /// Create an empty cache over `storage`
    #[must_use]
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self {
            storage,
            entries: Cache::builder().build(),
        }
    }

    /// Read a client; a miss falls through to storage and caches the row
    ///
    /// # Errors
    ///
    /// Returns a storage error if the point read fails.
    pub async fn get(&self, id: i64) -> Result<Option<ClientRecord>, StorageError> {
        if let Some(hit) = self.entries.get(&id).await {
            return Ok(Some(hit));
        }
        let loaded = self.storage.get_client(id).await?;
        if let Some(record) = &loaded {
            self.entries.insert(id, record.clone()).await;
        }
        Ok(loaded)
    }

    /// Store a client unless it deep-equals the cached value.
    ///
    /// Returns `true` when a write happened.
    ///
    /// # Errors
    ///
    /// Returns a storage error if persisting fails; the cache is left untouched.
    pub async fn set(&self, client: ClientRecord) -> Result<bool, StorageError> {
        if self.entries.get(&client.id).await.as_ref() == Some(&client) {
            debug!(client_id = client.id, "Client unchanged, skipping write");
            return Ok(false);
        }
        self.storage.upsert_client(&client).await?;
        self.entries.insert(client.id, client).await;
        Ok(true)
    }

    /// Clear a pause whose deadline has passed.
    ///
    /// Idempotent: after an `Expired` result the next call returns `Inactive`
    /// without writing.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read or the clearing write fails.
    pub async fn check_and_clear_expired_mute(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<MuteCheck, StorageError> {
        let Some(mut client) = self.get(id).await? else {
            return Ok(MuteCheck::Inactive);
        };
        if !client.mute.status {
            return Ok(MuteCheck::Inactive);
        }
        if !client.mute.is_expired(now) {
            return Ok(MuteCheck::Active);
        }
        client.mute = MuteState::default();
        self.set(client).await?;
        info!(client_id = id, "Client pause expired and was cleared");
        Ok(MuteCheck::Expired)
    }

    /// Pause automated replies for `minutes` starting at `now`.
    ///
    /// The deadline is computed once here and never recomputed. Unknown
    /// clients get a fresh record.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read or write fails.
    pub async fn pause(
        &self,
        id: i64,
        minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<ClientRecord, StorageError> {
        let mut client = self.get(id).await?.unwrap_or_else(|| ClientRecord::new(id));
        client.mute = MuteState::until(now + Duration::minutes(i64::from(minutes)));
        self.set(client.clone()).await?;
        Ok(client)
    }

    /// Lift a pause immediately
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read or write fails.
    pub async fn resume(&self, id: i64) -> Result<ClientRecord, StorageError> {
        let mut client = self.get(id).await?.unwrap_or_else(|| ClientRecord::new(id));
        client.mute = MuteState::default();
        self.set(client.clone()).await?;
        Ok(client)
    }

    /// Flip quick mode and return the updated record
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read or write fails.
    pub async fn toggle_quick_mode(&self, id: i64) -> Result<ClientRecord, StorageError> {
        let mut client = self.get(id).await?.unwrap_or_else(|| ClientRecord::new(id));
        client.quick_mode = !client.quick_mode;
        self.set(client.clone()).await?;
        Ok(client)
    }

    /// Register a client on first contact, refreshing its profile fields.
    ///
    /// Returns the record and whether it was seen for the first time.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read or write fails.
    pub async fn observe(
        &self,
        profile: ClientRecord,
    ) -> Result<(ClientRecord, bool), StorageError> {
        let existing = self.get(profile.id).await?;
        let is_new = existing.is_none();
        let mut client = existing.unwrap_or_else(|| ClientRecord::new(profile.id));
        client.first_name = profile.first_name.or(client.first_name);
        client.last_name = profile.last_name.or(client.last_name);
        client.username = profile.username.or(client.username);
        client.language_code = profile.language_code.or(client.language_code);
        if let Err(e) = self.set(client.clone()).await {
            warn!(client_id = client.id, error = %e, "Failed to store client");
            return Err(e);
        }
        Ok((client, is_new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStorage, MockStorageProvider};

    fn cache() -> (Arc<InMemoryStorage>, ClientCache) {
        let storage = Arc::new(InMemoryStorage::new());
        (storage.clone(), ClientCache::new(storage))
    }

    #[tokio::test]
    async fn test_miss_reads_through_and_caches() {
        let (storage, clients) = cache();
        storage
            .upsert_client(&ClientRecord::new(9))
            .await
            .expect("seed");
        assert!(clients.get(9).await.expect("get").is_some());
        assert!(clients.get(10).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_set_skips_identical_value() {
        let (_, clients) = cache();
        let record = ClientRecord::new(1);
        assert!(clients.set(record.clone()).await.expect("first"));
        assert!(!clients.set(record.clone()).await.expect("same"));

        let mut changed = record;
        changed.quick_mode = true;
        assert!(clients.set(changed).await.expect("changed"));
    }

    #[tokio::test]
    async fn test_expired_mute_is_cleared_once() {
        let (storage, clients) = cache();
        let now = Utc::now();
        clients.pause(5, 10, now).await.expect("pause");

        let later = now + Duration::minutes(11);
        assert_eq!(
            clients
                .check_and_clear_expired_mute(5, later)
                .await
                .expect("first"),
            MuteCheck::Expired
        );
        assert_eq!(
            clients
                .check_and_clear_expired_mute(5, later)
                .await
                .expect("second"),
            MuteCheck::Inactive
        );
        let stored = storage.get_client(5).await.expect("read").expect("row");
        assert!(!stored.mute.status);
    }

    #[tokio::test]
    async fn test_expired_mute_is_persisted_exactly_once() {
        let now = Utc::now();
        let mut paused = ClientRecord::new(5);
        paused.mute = MuteState::until(now - Duration::minutes(1));

        let mut storage = MockStorageProvider::new();
        storage
            .expect_get_client()
            .times(1)
            .returning(move |_| Ok(Some(paused.clone())));
        storage
            .expect_upsert_client()
            .withf(|client| !client.mute.status)
            .times(1)
            .returning(|_| Ok(()));
        let clients = ClientCache::new(Arc::new(storage));

        let first = clients.check_and_clear_expired_mute(5, now).await.expect("first");
        let second = clients.check_and_clear_expired_mute(5, now).await.expect("second");
        assert_eq!((first, second), (MuteCheck::Expired, MuteCheck::Inactive));
    }

    #[tokio::test]
    async fn test_loaded_clients_are_read_from_storage_once() {
        let mut storage = MockStorageProvider::new();
        storage
            .expect_get_client()
            .times(500)
            .returning(|id| Ok(Some(ClientRecord::new(id))));
        let clients = ClientCache::new(Arc::new(storage));

        for _ in 0..3 {
            for id in 0..500 {
                assert!(clients.get(id).await.expect("get").is_some());
            }
        }
    }

    #[tokio::test]
    async fn test_unreadable_deadline_is_cleared() {
        let (storage, clients) = cache();
        let record: ClientRecord = serde_json::from_str(
            r#"{"id": 8, "mute": {"status": true, "muteUntil": "next tuesday"}}"#,
        )
        .expect("parse");
        storage.upsert_client(&record).await.expect("seed");

        let check = clients
            .check_and_clear_expired_mute(8, Utc::now())
            .await
            .expect("check");
        assert_eq!(check, MuteCheck::Expired);
    }

    #[tokio::test]
    async fn test_active_and_indefinite_pauses_stay() {
        let (_, clients) = cache();
        let now = Utc::now();
        clients.pause(1, 60, now).await.expect("pause");
        assert_eq!(
            clients
                .check_and_clear_expired_mute(1, now + Duration::minutes(30))
                .await
                .expect("check"),
            MuteCheck::Active
        );

        let mut forever = ClientRecord::new(2);
        forever.mute.status = true;
        clients.set(forever).await.expect("set");
        let check = clients
            .check_and_clear_expired_mute(2, now + Duration::days(365))
            .await
            .expect("check");
        assert!(check.is_muted());
    }

    #[test]
    fn test_mute_until_wire_format() {
        let json = serde_json::to_value(MuteState::default()).expect("serialize");
        assert_eq!(json["muteUntil"], "");

        let parsed: MuteState =
            serde_json::from_str(r#"{"status": true, "muteUntil": ""}"#).expect("parse");
        assert!(parsed.status);
        assert!(parsed.mute_until.is_none());
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut client = ClientRecord::new(3);
        assert_eq!(client.display_name(), "client 3");
        client.username = Some("ivan".into());
        assert_eq!(client.display_name(), "@ivan");
        client.first_name = Some("Ivan".into());
        client.last_name = Some("Petrov".into());
        assert_eq!(client.display_name(), "Ivan Petrov");
    }
}
