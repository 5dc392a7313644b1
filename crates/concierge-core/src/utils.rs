//! Text helpers and transport retry policy

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Maximum characters per outgoing chat message
pub const MESSAGE_CHUNK_CHARS: usize = 4000;

/// Split a reply into chunks of at most `max_chars` characters.
///
/// Breaks on line boundaries when possible; a single line longer than the
/// limit is cut on grapheme boundaries so no character is ever split.
#[must_use]
pub fn split_long_message(message: &str, max_chars: usize) -> Vec<String> {
    if message.trim().is_empty() || max_chars == 0 {
        return Vec::new();
    }
    if message.chars().count() <= max_chars {
        return vec![message.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    let flush = |parts: &mut Vec<String>, current: &mut String, len: &mut usize| {
        let trimmed = current.trim_end();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
        current.clear();
        *len = 0;
    };

    for line in message.lines() {
        let line_len = line.chars().count();

        if line_len > max_chars {
            flush(&mut parts, &mut current, &mut current_len);
            for grapheme in line.graphemes(true) {
                let g_len = grapheme.chars().count();
                if current_len + g_len > max_chars {
                    flush(&mut parts, &mut current, &mut current_len);
                }
                current.push_str(grapheme);
                current_len += g_len;
            }
            current.push('\n');
            current_len += 1;
            continue;
        }

        if current_len + line_len + 1 > max_chars && current_len > 0 {
            flush(&mut parts, &mut current, &mut current_len);
        }
        current.push_str(line);
        current.push('\n');
        current_len += line_len + 1;
    }
    flush(&mut parts, &mut current, &mut current_len);

    parts
}

/// Truncate to at most `max_chars` characters (not bytes)
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Retry a chat-platform operation with exponential backoff and jitter.
///
/// Delays start at `TRANSPORT_INITIAL_BACKOFF_MS` and are capped at
/// `TRANSPORT_MAX_BACKOFF_MS`; at most `TRANSPORT_MAX_RETRIES` retries run.
///
/// # Errors
///
/// Returns the last error once every attempt failed.
pub async fn retry_transport_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    use crate::config::{
        TRANSPORT_INITIAL_BACKOFF_MS, TRANSPORT_MAX_BACKOFF_MS, TRANSPORT_MAX_RETRIES,
    };

    let retry_strategy = ExponentialBackoff::from_millis(TRANSPORT_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TRANSPORT_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TRANSPORT_MAX_RETRIES);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            "Transport operation failed after {} retries: {}",
            TRANSPORT_MAX_RETRIES, e
        );
        e
    })
}
