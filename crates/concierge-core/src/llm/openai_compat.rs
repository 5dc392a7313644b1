//! Chat completion over the async-openai client

use super::common::{build_openai_messages, extract_openai_response};
use super::{Completion, LlmError, Message};
use async_openai::{config::OpenAIConfig, types::chat::CreateChatCompletionRequestArgs, Client};

/// Perform a chat completion against an OpenAI-compatible API
///
/// # Errors
///
/// Returns `LlmError::ApiError` for API failures or an empty answer.
pub async fn chat_completion(
    client: &Client<OpenAIConfig>,
    system_prompt: &str,
    history: &[Message],
    model_id: &str,
    max_tokens: u32,
    temperature: f32,
) -> Result<Completion, LlmError> {
    let messages = build_openai_messages(system_prompt, history)?;

    let request = CreateChatCompletionRequestArgs::default()
        .model(model_id)
        .messages(messages)
        .max_tokens(max_tokens)
        .temperature(temperature)
        .build()
        .map_err(|e| LlmError::Unknown(e.to_string()))?;

    let response = client
        .chat()
        .create(request)
        .await
        .map_err(|e| LlmError::ApiError(e.to_string()))?;

    extract_openai_response(&response)
}
