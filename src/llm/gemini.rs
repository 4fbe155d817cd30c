//! Google Gemini Provider.
//!
//! Gemini has no separate system channel here: the system and user contents
//! are joined with a blank line into one prompt. Sampling is fixed at
//! construction to temperature 0 and 2048 output tokens.

use super::provider::{LLMProvider, ModelMetadata};
use super::types::{split_conversation, CompletionResponse, Message, Usage};
use crate::config::{GeminiSettings, GOOGLE_API_KEY_ENV};
use crate::error::MedRagError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const MAX_OUTPUT_TOKENS: u32 = 2048;

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    model: String,
    context_window: usize,
    generation_config: GenerationConfig,
}

impl GeminiProvider {
    pub fn new(settings: &GeminiSettings, model: String, context_window: usize) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or(MedRagError::MissingCredential {
                backend: "Gemini",
                env_var: GOOGLE_API_KEY_ENV,
            })?;

        tracing::info!("Gemini backend: {}", model);

        Ok(Self {
            client: Client::new(),
            api_key,
            model,
            context_window,
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", GEMINI_API_BASE, self.model)
    }

    fn request_body(&self, messages: &[Message]) -> GenerateRequest {
        GenerateRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: combined_prompt(messages),
                }],
            }],
            generation_config: self.generation_config.clone(),
        }
    }
}

/// `system + "\n\n" + user`
fn combined_prompt(messages: &[Message]) -> String {
    let (system, user) = split_conversation(messages);
    format!("{}\n\n{}", system, user)
}

#[async_trait]
impl LLMProvider for GeminiProvider {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            id: self.model.clone(),
            context_window: self.context_window,
        }
    }

    async fn completion(&self, messages: &[Message]) -> Result<CompletionResponse> {
        let request = self.request_body(messages);

        tracing::debug!("Gemini request to {}", self.model);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Gemini")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MedRagError::Api {
                backend: "Gemini",
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Gemini response")?;

        let usage = parsed.usage_metadata.as_ref().map(Usage::from).unwrap_or_default();
        let content = parsed.first_text().context("No candidates returned from Gemini")?;

        Ok(CompletionResponse { content, usage })
    }
}

// -----------------------------------------------------------------------------
// Gemini DTOs
// -----------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

impl GenerateResponse {
    /// First candidate, first part
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .map(|p| p.text)
    }
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: usize,
    #[serde(default)]
    candidates_token_count: usize,
}

impl From<&UsageMetadata> for Usage {
    fn from(u: &UsageMetadata) -> Self {
        Usage::new(u.prompt_token_count, u.candidates_token_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiProvider {
        let settings = GeminiSettings {
            api_key: Some("g-key".to_string()),
        };
        GeminiProvider::new(&settings, "gemini-1.5-pro".to_string(), 1_048_576).unwrap()
    }

    #[test]
    fn test_missing_key_fails_at_construction() {
        let err = GeminiProvider::new(&GeminiSettings::default(), "gemini-pro".to_string(), 30720)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<MedRagError>(),
            Some(MedRagError::MissingCredential { env_var: GOOGLE_API_KEY_ENV, .. })
        ));
    }

    #[test]
    fn test_request_joins_system_and_user() {
        let body = serde_json::to_value(
            provider().request_body(&[Message::system("You are a doctor."), Message::user("Question?")]),
        )
        .unwrap();

        assert_eq!(body["contents"][0]["parts"][0]["text"], "You are a doctor.\n\nQuestion?");
        assert_eq!(body["generationConfig"]["temperature"], 0.0);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(
            provider().endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:generateContent"
        );
    }

    #[test]
    fn test_first_candidate_first_part() {
        let json = r#"{
            "candidates": [
                {"content": {"role": "model", "parts": [{"text": "first"}, {"text": "second"}]}},
                {"content": {"role": "model", "parts": [{"text": "other"}]}}
            ],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 2, "totalTokenCount": 9}
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(json).unwrap();
        let usage = parsed.usage_metadata.as_ref().map(Usage::from).unwrap();
        assert_eq!(usage.total_tokens, 9);
        assert_eq!(parsed.first_text().as_deref(), Some("first"));
    }

    #[test]
    fn test_no_candidates() {
        let parsed: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.first_text().is_none());
    }
}
