#![deny(missing_docs)]
//! Telegram transport adapter for the concierge bot.

/// Telegram-specific platform implementation and update conversion.
pub mod bot;
/// Telegram transport configuration.
pub mod config;
/// Telegram runtime entrypoint.
pub mod runner;
