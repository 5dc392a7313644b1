#![deny(missing_docs)]
//! Concierge core library.
//!
//! Conversation routing, the questionnaire engine, client pause state and the
//! unanswered-message ledger shared by every transport.

/// Client records and the per-process client cache.
pub mod clients;
/// Configuration management.
pub mod config;
/// Inbound event routing (commands, messages, callbacks).
pub mod conversation;
/// Umbrella error type.
pub mod error;
/// Append-only chat message ledger with answered-status tracking.
pub mod ledger;
/// LLM providers and client.
pub mod llm;
/// Per-user conversational mode state machine.
pub mod mode;
/// Chat platform boundary (sending, keyboards, downloads).
pub mod platform;
/// Prompt templates and placeholder substitution.
pub mod prompt;
/// Questionnaire configuration, validation and engine.
pub mod quiz;
/// Batch answering of unanswered conversations.
pub mod reconciler;
/// Storage layer (R2/S3 and in-memory).
pub mod storage;
/// User records and profiles.
pub mod users;
/// Utility functions.
pub mod utils;
/// Message origin classification.
pub mod who;

/// Test doubles shared by unit tests.
#[cfg(test)]
pub mod testing;
