//! OpenAI API Provider.
//!
//! Implements the `LLMProvider` trait for the Chat Completions API, against
//! either the public endpoint (model named in the body) or an Azure
//! deployment (model named by the deployment in the URL).

use super::provider::{LLMProvider, ModelMetadata};
use super::types::{CompletionResponse, Message, Usage};
use crate::config::{ApiType, OpenAiSettings, OPENAI_API_KEY_ENV};
use crate::error::MedRagError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const AZURE_DEFAULT_API_VERSION: &str = "2023-05-15";

/// OpenAI Provider configuration and state.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    api_type: ApiType,
    api_base: String,
    api_version: String,
    model: String,
    context_window: usize,
}

impl OpenAIProvider {
    /// Build from explicit settings; a missing key fails here rather than on
    /// the first request.
    pub fn new(settings: &OpenAiSettings, model: String, context_window: usize) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or(MedRagError::MissingCredential {
                backend: "OpenAI",
                env_var: OPENAI_API_KEY_ENV,
            })?;

        let api_base = settings
            .api_base
            .clone()
            .unwrap_or_else(|| OPENAI_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        let api_version = settings
            .api_version
            .clone()
            .unwrap_or_else(|| AZURE_DEFAULT_API_VERSION.to_string());

        tracing::info!("OpenAI backend: {} ({:?} at {})", model, settings.api_type, api_base);

        Ok(Self {
            client: Client::new(),
            api_key,
            api_type: settings.api_type,
            api_base,
            api_version,
            model,
            context_window,
        })
    }

    fn endpoint(&self) -> String {
        match self.api_type {
            ApiType::OpenAi => format!("{}/chat/completions", self.api_base),
            ApiType::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                self.api_base, self.model, self.api_version
            ),
        }
    }

    fn request_body(&self, messages: &[Message]) -> ChatRequest {
        ChatRequest {
            // Azure addresses the deployment (engine) in the URL instead
            model: match self.api_type {
                ApiType::OpenAi => Some(self.model.clone()),
                ApiType::Azure => None,
            },
            messages: messages.iter().map(ApiMessage::from).collect(),
            temperature: 0.0,
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            id: self.model.clone(),
            context_window: self.context_window,
        }
    }

    async fn completion(&self, messages: &[Message]) -> Result<CompletionResponse> {
        let request = self.request_body(messages);
        let builder = self.client.post(self.endpoint()).json(&request);
        let builder = match self.api_type {
            ApiType::OpenAi => builder.bearer_auth(&self.api_key),
            ApiType::Azure => builder.header("api-key", &self.api_key),
        };

        tracing::debug!("OpenAI request: {} messages to {}", messages.len(), self.model);

        let response = builder
            .send()
            .await
            .context("Failed to send request to OpenAI")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MedRagError::Api {
                backend: "OpenAI",
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .context("Failed to parse OpenAI response")?;

        let choice = chat_response.choices.into_iter().next().context("No choices returned from OpenAI")?;

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            usage: chat_response.usage.map(Usage::from).unwrap_or_default(),
        })
    }
}

// -----------------------------------------------------------------------------
// OpenAI DTOs (Data Transfer Objects)
// -----------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<ApiMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl From<&Message> for ApiMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.as_str(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ApiResponseMessage,
}

#[derive(Deserialize)]
struct ApiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}
