//! HTTP helpers shared by the `reqwest`-based providers

use crate::config::get_llm_http_timeout_secs;
use crate::llm::{LlmError, TokenUsage};
use crate::utils::truncate_str;
use reqwest::Client as HttpClient;
use serde_json::Value;
use std::time::Duration;

const ERROR_BODY_CHARS: usize = 500;

/// Creates an HTTP client configured with the standard LLM timeout.
///
/// Uses `LLM_HTTP_TIMEOUT_SECS` or the default, so a stalled API turns into a
/// network error instead of a hung sweep.
#[must_use]
pub fn create_http_client() -> HttpClient {
    let timeout = Duration::from_secs(get_llm_http_timeout_secs());
    HttpClient::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| HttpClient::new())
}

/// Converts a non-success response into an `LlmError`.
///
/// 429 becomes `RateLimit` (honouring `Retry-After`); everything else is an
/// `ApiError` carrying the status and a trimmed body.
pub async fn error_from_response(response: reqwest::Response) -> LlmError {
    let status = response.status();
    let wait_secs = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let error_text = response.text().await.unwrap_or_default();

    let trimmed = error_text.trim_start();
    let is_html = trimmed.starts_with("<!DOCTYPE")
        || trimmed.starts_with("<html")
        || trimmed.starts_with("<HTML");
    let detail = if is_html {
        "(Server returned HTML error page)".to_string()
    } else if error_text.chars().count() > ERROR_BODY_CHARS {
        format!("{}... (truncated)", truncate_str(&error_text, ERROR_BODY_CHARS))
    } else {
        error_text
    };

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return LlmError::RateLimit {
            wait_secs,
            message: detail,
        };
    }
    LlmError::ApiError(format!("API error: {status} - {detail}"))
}

/// Sends a JSON POST and returns the parsed JSON response.
///
/// # Errors
///
/// Returns `LlmError::NetworkError` on connectivity issues, `LlmError::ApiError`
/// or `LlmError::RateLimit` on non-success status codes, and
/// `LlmError::JsonError` if parsing fails.
pub async fn send_json_request(
    client: &HttpClient,
    url: &str,
    body: &Value,
    auth_header: Option<&str>,
    extra_headers: &[(&str, &str)],
) -> Result<Value, LlmError> {
    let mut request = client.post(url).json(body);

    if let Some(auth) = auth_header {
        request = request.header("Authorization", auth);
    }
    for (key, value) in extra_headers {
        request = request.header(*key, *value);
    }

    let response = request
        .send()
        .await
        .map_err(|e| LlmError::NetworkError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }

    response
        .json()
        .await
        .map_err(|e| LlmError::JsonError(e.to_string()))
}

/// Extracts text content from a JSON response by navigating a path.
///
/// Numeric segments index into arrays.
///
/// # Errors
///
/// Returns `LlmError::ApiError` if the path is invalid or the target is not a string.
pub fn extract_text_content(response: &Value, path: &[&str]) -> Result<String, LlmError> {
    let mut current = response;

    for segment in path {
        if let Ok(index) = segment.parse::<usize>() {
            current = current.get(index).ok_or_else(|| {
                LlmError::ApiError(format!("Invalid path: missing index {index}"))
            })?;
        } else {
            current = current.get(*segment).ok_or_else(|| {
                LlmError::ApiError(format!("Invalid path: missing key {segment}"))
            })?;
        }
    }

    current
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| LlmError::ApiError(format!("Expected string at path, got: {current:?}")))
}

/// Reads an OpenAI-style `usage` object, if complete
#[must_use]
pub fn parse_usage(response: &Value) -> Option<TokenUsage> {
    let usage = response.get("usage")?;
    let field = |name: &str| {
        usage
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    };
    Some(TokenUsage {
        prompt_tokens: field("prompt_tokens")?,
        completion_tokens: field("completion_tokens")?,
        total_tokens: field("total_tokens")?,
    })
}
