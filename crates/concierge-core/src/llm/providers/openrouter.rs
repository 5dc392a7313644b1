use crate::llm::http_utils::{
    create_http_client, extract_text_content, parse_usage, send_json_request,
};
use crate::llm::{Completion, LlmError, LlmProvider, Message};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client as HttpClient;
use serde_json::json;

const CHAT_COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const TRANSCRIBE_PROMPT: &str =
    "Transcribe this voice message verbatim. Reply with the transcript only.";

/// LLM provider implementation for `OpenRouter`
pub struct OpenRouterProvider {
    http_client: HttpClient,
    api_key: String,
    site_url: String,
    site_name: String,
}

impl OpenRouterProvider {
    /// Create a new `OpenRouter` provider instance
    #[must_use]
    pub fn new(api_key: String, site_url: String, site_name: String) -> Self {
        Self {
            http_client: create_http_client(),
            api_key,
            site_url,
            site_name,
        }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<serde_json::Value, LlmError> {
        let mut extra_headers = Vec::new();
        if !self.site_url.is_empty() {
            extra_headers.push(("HTTP-Referer", self.site_url.as_str()));
        }
        if !self.site_name.is_empty() {
            extra_headers.push(("X-Title", self.site_name.as_str()));
        }

        let auth = format!("Bearer {}", self.api_key);
        send_json_request(
            &self.http_client,
            CHAT_COMPLETIONS_URL,
            body,
            Some(&auth),
            &extra_headers,
        )
        .await
    }
}

/// `input_audio` format name for a MIME type
fn audio_format(mime_type: &str) -> &str {
    match mime_type.rsplit_once('/') {
        Some((_, "mpeg")) => "mp3",
        Some((_, "x-wav")) => "wav",
        Some((_, subtype)) if !subtype.is_empty() => subtype,
        _ => "ogg",
    }
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    async fn chat_completion(
        &self,
        system_prompt: &str,
        history: &[Message],
        model_id: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion, LlmError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": system_prompt}));
        }
        for msg in history {
            messages.push(json!({"role": msg.role, "content": msg.content}));
        }

        let body = json!({
            "model": model_id,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": temperature
        });

        let res_json = self.post(&body).await?;
        let text = res_json["choices"][0]["message"]["content"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| LlmError::ApiError("Empty response".to_string()))?;

        Ok(Completion {
            text,
            usage: parse_usage(&res_json),
        })
    }

    async fn transcribe_audio(
        &self,
        audio_bytes: Vec<u8>,
        mime_type: &str,
        model_id: &str,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": model_id,
            "messages": [
                {
                    "role": "user",
                    "content": [
                        {"type": "text", "text": TRANSCRIBE_PROMPT},
                        {
                            "type": "input_audio",
                            "input_audio": {
                                "data": BASE64.encode(&audio_bytes),
                                "format": audio_format(mime_type)
                            }
                        }
                    ]
                }
            ],
            "temperature": 0.0
        });

        let res_json = self.post(&body).await?;
        extract_text_content(&res_json, &["choices", "0", "message", "content"])
    }
}
