//! The Provider Abstraction.
//!
//! This trait defines the standard interface for every generation backend,
//! whether it's a hosted API (OpenAI, Gemini) or a local model (Candle).

use anyhow::Result;
use async_trait::async_trait;
use super::types::{Message, CompletionResponse};

/// Metadata about a model's capabilities.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub id: String,
    pub context_window: usize,
}

/// The core trait for LLM interactions.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Get the model's metadata (context window, ID, etc).
    fn metadata(&self) -> ModelMetadata;

    /// Send a system + user conversation and return the raw answer.
    ///
    /// No retries: any transport or inference failure is returned as is.
    async fn completion(&self, messages: &[Message]) -> Result<CompletionResponse>;

    /// Drop any incremental decode state kept between calls.
    fn reset_session(&self) -> Result<()> {
        Ok(())
    }
}
