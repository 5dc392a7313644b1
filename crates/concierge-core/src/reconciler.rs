//! Batch answering of unanswered conversations
//!
//! The sweep groups every eligible unanswered message by conversation
//! (chat id and channel) and answers each conversation once, concurrently.
//! A conversation whose answer fails stays unanswered with its attempt
//! counters untouched; only an explicit status change advances them, so the
//! next sweep picks it up again.
//!
//! [`Reconciler::answer_batch`] is also the immediate-answer path for quick
//! mode and demo mode.

use crate::clients::ClientCache;
use crate::config::{AppSettings, TRANSCRIPT_TURN_LIMIT};
use crate::error::ConciergeError;
use crate::ledger::{ChatMessage, MessageLedger};
use crate::llm::{LlmClient, Message};
use crate::mode::UserMode;
use crate::platform::{ChatPlatform, SendOptions};
use crate::prompt::{resolve_template, PromptKind, TemplateBindings};
use crate::storage::{StorageError, StorageProvider};
use crate::users::{ProfileValue, UserRecord};
use crate::who::{Room, Who};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Counts of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Conversations answered
    pub succeeded: usize,
    /// Conversations whose answer failed
    pub failed: usize,
    /// Conversations deliberately left alone (paused client, unknown owner)
    pub skipped: usize,
}

/// Unanswered messages of one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Conversation chat id
    pub chat_id: i64,
    /// Business connection id; empty for the direct bot chat
    pub channel: String,
    /// Ids that triggered the answer; the reply also covers any other
    /// unanswered client turn of the transcript
    pub message_ids: Vec<i64>,
    /// Origin of the newest pending message
    pub who: Who,
}

impl Batch {
    /// Batch for the pending messages of one conversation
    #[must_use]
    pub fn from_messages(messages: &[ChatMessage]) -> Option<Self> {
        let mut sorted: Vec<&ChatMessage> = messages.iter().collect();
        sorted.sort_by_key(|m| m.sort_key());
        let newest = sorted.last()?;
        Some(Self {
            chat_id: newest.chat_id,
            channel: newest.business_connection_id.clone(),
            message_ids: sorted.iter().map(|m| m.message_id).collect(),
            who: newest.who,
        })
    }
}

/// What happened to one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Reply sent and the batch marked answered
    Answered {
        /// Platform id of the reply
        reply_id: i64,
    },
    /// Not answered on purpose
    Skipped(&'static str),
}

struct AnswerContext {
    owner: UserRecord,
    kind: PromptKind,
    client_name: String,
}

/// Answers conversations through the LLM and records the replies
#[derive(Clone)]
pub struct Reconciler {
    storage: Arc<dyn StorageProvider>,
    ledger: MessageLedger,
    clients: ClientCache,
    llm: Arc<LlmClient>,
    platform: Arc<dyn ChatPlatform>,
    settings: Arc<AppSettings>,
}

impl Reconciler {
    /// Create a reconciler; `clients` should be the process-wide cache
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        clients: ClientCache,
        llm: Arc<LlmClient>,
        platform: Arc<dyn ChatPlatform>,
        settings: Arc<AppSettings>,
    ) -> Self {
        Self {
            ledger: MessageLedger::new(storage.clone()),
            storage,
            clients,
            llm,
            platform,
            settings,
        }
    }

    /// Answer every conversation with eligible unanswered messages
    ///
    /// # Errors
    ///
    /// Returns a storage error only if the ledger scan itself fails; failures
    /// of single conversations are counted in the report.
    pub async fn process_all_unanswered_chats(&self) -> Result<SweepReport, StorageError> {
        self.process_all_unanswered_chats_at(Utc::now()).await
    }

    /// [`Self::process_all_unanswered_chats`] with an explicit clock
    ///
    /// # Errors
    ///
    /// Returns a storage error if the ledger scan fails.
    #[instrument(skip(self))]
    pub async fn process_all_unanswered_chats_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, StorageError> {
        let candidates = self.ledger.list_all_unanswered(now).await?;
        let mut conversations: BTreeMap<(String, i64), Vec<ChatMessage>> = BTreeMap::new();
        for message in candidates {
            conversations
                .entry((message.business_connection_id.clone(), message.chat_id))
                .or_default()
                .push(message);
        }
        debug!(conversations = conversations.len(), "Sweep started");

        let batches = conversations
            .values()
            .filter_map(|messages| Batch::from_messages(messages));
        let outcomes = join_all(batches.map(|batch| async move {
            let result = self.answer_batch(&batch, now).await;
            (batch, result)
        }))
        .await;

        let mut report = SweepReport::default();
        for (batch, outcome) in outcomes {
            match outcome {
                Ok(BatchOutcome::Answered { .. }) => report.succeeded += 1,
                Ok(BatchOutcome::Skipped(reason)) => {
                    debug!(chat_id = batch.chat_id, channel = %batch.channel, reason, "Conversation skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(
                        chat_id = batch.chat_id,
                        channel = %batch.channel,
                        pending = batch.message_ids.len(),
                        error = %e,
                        "Failed to answer conversation"
                    );
                    report.failed += 1;
                }
            }
        }
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Answer one conversation and mark its batch answered.
    ///
    /// Nothing is marked when this returns an error.
    ///
    /// # Errors
    ///
    /// Returns storage, template, LLM or platform errors.
    pub async fn answer_batch(
        &self,
        batch: &Batch,
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, ConciergeError> {
        let context = match self.resolve_context(batch, now).await? {
            Ok(context) => context,
            Err(reason) => return Ok(BatchOutcome::Skipped(reason)),
        };

        let history = self
            .ledger
            .list_recent(batch.chat_id, &batch.channel, TRANSCRIPT_TURN_LIMIT)
            .await?;
        let transcript = build_transcript(&history);
        if transcript.is_empty() {
            return Ok(BatchOutcome::Skipped("empty transcript"));
        }

        let template = resolve_template(self.storage.as_ref(), context.kind, &self.settings).await?;
        let bindings = TemplateBindings::new()
            .bind("owner_name", owner_name(&context.owner))
            .bind("client_name", context.client_name.as_str())
            .bind("date", now.format("%Y-%m-%d").to_string())
            .with_profile(&context.owner.profile);
        let system_prompt = template.render(&bindings, &context.owner.profile);

        let options = SendOptions::routed(&batch.channel);
        if let Err(e) = self.platform.send_typing(batch.chat_id, &options).await {
            debug!(chat_id = batch.chat_id, error = %e, "Typing indicator failed");
        }

        let completion = self
            .llm
            .complete(&transcript, &[system_prompt], &self.settings.completion_settings())
            .await?;
        let reply_id = self
            .platform
            .send_text(batch.chat_id, &completion.text, &options)
            .await?;

        let covered = covered_message_ids(&batch.message_ids, &history);
        self.record_reply(batch, &covered, reply_id, &completion.text, now)
            .await;
        Ok(BatchOutcome::Answered { reply_id })
    }

    // The reply is already delivered here, so failures are logged rather
    // than reported: returning an error would get the conversation answered twice.
    async fn record_reply(
        &self,
        batch: &Batch,
        covered: &[i64],
        reply_id: i64,
        text: &str,
        now: DateTime<Utc>,
    ) {
        let reply = ChatMessage::new(
            batch.chat_id,
            reply_id,
            batch.channel.as_str(),
            text,
            batch.who.responder(),
        )
        .from_bot()
        .at(now);
        if let Err(e) = self.ledger.append(reply).await {
            warn!(chat_id = batch.chat_id, error = %e, "Failed to record bot reply");
        }

        let report = self
            .ledger
            .mark_answered(batch.chat_id, &batch.channel, covered, true, now)
            .await;
        info!(
            chat_id = batch.chat_id,
            channel = %batch.channel,
            answered = report.updated,
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Conversation answered"
        );
    }

    async fn resolve_context(
        &self,
        batch: &Batch,
        now: DateTime<Utc>,
    ) -> Result<Result<AnswerContext, &'static str>, ConciergeError> {
        match batch.who.room() {
            Room::Bot => {
                // Demo conversations: the chat id is the owner's own id.
                let Some(owner) = self.storage.get_user(batch.chat_id).await? else {
                    return Ok(Err("unknown owner"));
                };
                if owner.mode != UserMode::Demo {
                    return Ok(Err("owner left demo mode"));
                }
                let client_name = owner.display_name();
                Ok(Ok(AnswerContext {
                    owner,
                    kind: PromptKind::Demo,
                    client_name,
                }))
            }
            Room::Chat => {
                let Some(link) = self.storage.get_business_connection(&batch.channel).await? else {
                    return Ok(Err("unknown business connection"));
                };
                if !link.enabled {
                    return Ok(Err("business connection disabled"));
                }
                let Some(owner) = self.storage.get_user(link.owner_id).await? else {
                    return Ok(Err("unknown owner"));
                };
                if owner.mode != UserMode::Idle {
                    return Ok(Err("assistant not active"));
                }
                let mute = self
                    .clients
                    .check_and_clear_expired_mute(batch.chat_id, now)
                    .await?;
                if mute.is_muted() {
                    return Ok(Err("client paused"));
                }
                let client_name = self
                    .clients
                    .get(batch.chat_id)
                    .await?
                    .map_or_else(|| format!("client {}", batch.chat_id), |c| c.display_name());
                Ok(Ok(AnswerContext {
                    owner,
                    kind: PromptKind::Assistant,
                    client_name,
                }))
            }
        }
    }
}

fn owner_name(owner: &UserRecord) -> String {
    match owner.profile.get("owner_name") {
        Some(value @ ProfileValue::Text(_)) if !value.is_empty() => value.render(),
        _ => owner.display_name(),
    }
}

/// Ids a reply built from `history` answers: the batch plus every unanswered
/// client turn the model saw, including turns still held back by the backoff
/// gate.
#[must_use]
pub fn covered_message_ids(batch_ids: &[i64], history: &[ChatMessage]) -> Vec<i64> {
    let mut ids: Vec<i64> = batch_ids.to_vec();
    ids.extend(
        history
            .iter()
            .filter(|m| m.who.is_client() && !m.answered.status)
            .map(|m| m.message_id),
    );
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Map ledger rows onto alternating model turns.
///
/// Customer turns become `user`, everything else `assistant`; consecutive
/// turns of the same role are merged and quoted text is folded into the
/// quoting turn.
#[must_use]
pub fn build_transcript(history: &[ChatMessage]) -> Vec<Message> {
    let mut turns: Vec<Message> = Vec::new();
    for row in history {
        let text = row.message.trim();
        if text.is_empty() {
            continue;
        }
        let content = match row.replied_message.as_deref() {
            Some(quoted) => format!("[In reply to: {}]\n{text}", quoted.trim()),
            None => text.to_string(),
        };
        let role = if row.who.is_client() { "user" } else { "assistant" };
        match turns.last_mut() {
            Some(last) if last.role == role => {
                last.content.push('\n');
                last.content.push_str(&content);
            }
            _ => turns.push(Message {
                role: role.to_string(),
                content,
            }),
        }
    }
    turns
}
