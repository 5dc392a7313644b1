use crate::llm::http_utils::{create_http_client, error_from_response};
use crate::llm::{openai_compat, Completion, LlmError, LlmProvider, Message};
use async_openai::{config::OpenAIConfig, Client};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client as HttpClient;

/// Default OpenAI API base
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Largest upload the transcription endpoint accepts
const MAX_AUDIO_BYTES: usize = 25 * 1024 * 1024;

/// LLM provider for `OpenAI` and compatible APIs
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    http_client: HttpClient,
    api_key: String,
    api_base: String,
}

impl OpenAiProvider {
    /// Create a provider; `api_base` overrides the `OpenAI` endpoint
    #[must_use]
    pub fn new(api_key: String, api_base: Option<String>) -> Self {
        let api_base = api_base
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| OPENAI_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let config = OpenAIConfig::new()
            .with_api_key(api_key.clone())
            .with_api_base(api_base.clone());
        Self {
            client: Client::with_config(config),
            http_client: create_http_client(),
            api_key,
            api_base,
        }
    }
}

/// File name the transcription endpoint uses to detect the container
fn audio_file_name(mime_type: &str) -> &'static str {
    match mime_type {
        "audio/mpeg" | "audio/mp3" => "audio.mp3",
        "audio/mp4" | "audio/m4a" => "audio.m4a",
        "audio/wav" | "audio/x-wav" => "audio.wav",
        "audio/webm" => "audio.webm",
        _ => "audio.ogg",
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat_completion(
        &self,
        system_prompt: &str,
        history: &[Message],
        model_id: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Completion, LlmError> {
        openai_compat::chat_completion(
            &self.client,
            system_prompt,
            history,
            model_id,
            max_tokens,
            temperature,
        )
        .await
    }

    async fn transcribe_audio(
        &self,
        audio_bytes: Vec<u8>,
        mime_type: &str,
        model_id: &str,
    ) -> Result<String, LlmError> {
        if audio_bytes.len() > MAX_AUDIO_BYTES {
            return Err(LlmError::ApiError(format!(
                "Audio file too large ({} bytes, max {MAX_AUDIO_BYTES})",
                audio_bytes.len()
            )));
        }

        let mime = if mime_type.is_empty() {
            "audio/ogg"
        } else {
            mime_type
        };
        let file_part = Part::bytes(audio_bytes)
            .file_name(audio_file_name(mime))
            .mime_str(mime)
            .map_err(|e| LlmError::Unknown(e.to_string()))?;
        let form = Form::new()
            .part("file", file_part)
            .text("model", model_id.to_string())
            .text("response_format", "json");

        let response = self
            .http_client
            .post(format!("{}/audio/transcriptions", self.api_base))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::JsonError(e.to_string()))?;
        body["text"]
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| LlmError::ApiError("Transcription response missing 'text'".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_notes_upload_as_ogg() {
        assert_eq!(audio_file_name("audio/ogg"), "audio.ogg");
        assert_eq!(audio_file_name("audio/mpeg"), "audio.mp3");
    }

    #[tokio::test]
    async fn test_oversized_audio_is_rejected_locally() {
        let provider = OpenAiProvider::new("key".into(), Some("http://127.0.0.1:9/".into()));
        let err = provider
            .transcribe_audio(vec![0; MAX_AUDIO_BYTES + 1], "audio/ogg", "whisper-1")
            .await
            .expect_err("too large");
        assert!(err.to_string().contains("too large"));
    }
}
