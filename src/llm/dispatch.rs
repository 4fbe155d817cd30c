//! Generation dispatch.
//!
//! Binds a resolved `BackendProfile` to the provider that serves it and to the
//! encoding its context budget is measured in.

use super::candle::CandleProvider;
use super::context::{TextEncoder, TokenizerEncoder};
use super::gemini::GeminiProvider;
use super::openai::OpenAIProvider;
use super::profile::{BackendKind, BackendProfile};
use super::provider::LLMProvider;
use super::types::Message;
use crate::config::Config;
use anyhow::Result;
use std::io::Write;

pub struct GenerationDispatcher {
    profile: BackendProfile,
    provider: Box<dyn LLMProvider>,
    encoder: Box<dyn TextEncoder>,
}

impl GenerationDispatcher {
    /// Construct the backend eagerly: credentials are checked, templates and
    /// local weights loaded here. Streamed output goes to stdout.
    pub fn connect(profile: BackendProfile, config: &Config) -> Result<Self> {
        Self::connect_with_stream(profile, config, Box::new(std::io::stdout()))
    }

    /// Like `connect`, with streamed tokens written to `stream`
    pub fn connect_with_stream(
        profile: BackendProfile,
        config: &Config,
        stream: Box<dyn Write + Send>,
    ) -> Result<Self> {
        let (provider, encoder): (Box<dyn LLMProvider>, Box<dyn TextEncoder>) = match profile.kind {
            BackendKind::OpenAi => {
                let provider =
                    OpenAIProvider::new(&config.openai, profile.model.clone(), profile.max_length)?;
                let encoder = TokenizerEncoder::hosted(&config.hosted_tokenizer, config.cache_dir.clone())?;
                (Box::new(provider), Box::new(encoder))
            }
            BackendKind::Gemini => {
                let provider =
                    GeminiProvider::new(&config.gemini, profile.model.clone(), profile.max_length)?;
                let encoder = TokenizerEncoder::hosted(&config.hosted_tokenizer, config.cache_dir.clone())?;
                (Box::new(provider), Box::new(encoder))
            }
            BackendKind::LocalGeneric
            | BackendKind::LocalMistral
            | BackendKind::LocalLlama3
            | BackendKind::LocalMeditron
            | BackendKind::LocalPmcLlama => {
                let (provider, encoder) = CandleProvider::load(&profile, config, stream)?;
                (Box::new(provider), Box::new(encoder))
            }
        };

        let metadata = provider.metadata();
        tracing::info!("Connected to {} (context window {})", metadata.id, metadata.context_window);

        Ok(Self::from_parts(profile, provider, encoder))
    }

    /// Assemble from already-built parts
    pub fn from_parts(
        profile: BackendProfile,
        provider: Box<dyn LLMProvider>,
        encoder: Box<dyn TextEncoder>,
    ) -> Self {
        Self {
            profile,
            provider,
            encoder,
        }
    }

    pub fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    pub fn encoder(&self) -> &dyn TextEncoder {
        self.encoder.as_ref()
    }

    /// Raw answer text for one system + user conversation
    pub async fn generate(&self, messages: &[Message]) -> Result<String> {
        tracing::debug!("Dispatching to {} ({})", self.profile.name, self.profile.kind.name());
        let response = self.provider.completion(messages).await?;
        tracing::debug!(
            "Generation done: {} prompt / {} completion tokens",
            response.usage.prompt_tokens,
            response.usage.completion_tokens
        );
        Ok(response.content)
    }

    /// Drop any decode state carried between calls
    pub fn reset_session(&self) -> Result<()> {
        self.provider.reset_session()
    }
}
