//! Context Window Management.
//!
//! Retrieved text is the scarce resource: it has to fit the backend's reserved
//! context budget, measured in that backend's own tokens. Truncation therefore
//! goes through the exact encoding of the backend (cl100k_base for hosted
//! APIs, the model tokenizer for local models).

use crate::error::MedRagError;
use anyhow::{Context, Result};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use std::path::PathBuf;
use tokenizers::Tokenizer;

/// Encode/decode text with a backend's tokenizer.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// `tokenizers`-backed encoder.
///
/// `add_special_tokens` is true for hosted encodings and false for local
/// models; the difference shifts truncation by a few tokens.
#[derive(Clone)]
pub struct TokenizerEncoder {
    tokenizer: Tokenizer,
    add_special_tokens: bool,
    skip_special_tokens: bool,
}

impl TokenizerEncoder {
    pub fn new(tokenizer: Tokenizer, add_special_tokens: bool) -> Self {
        Self {
            tokenizer,
            add_special_tokens,
            skip_special_tokens: false,
        }
    }

    /// Decode without special tokens (for text shown or returned to users)
    pub fn skipping_special_tokens(mut self) -> Self {
        self.skip_special_tokens = true;
        self
    }

    /// Load the cl100k_base vocabulary shared by hosted backends.
    pub fn hosted(repo_id: &str, cache_dir: Option<PathBuf>) -> Result<Self> {
        let mut builder = ApiBuilder::new().with_progress(false);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }
        let api = builder.build().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .with_context(|| format!("Failed to get tokenizer.json from {}", repo_id))?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(MedRagError::tokenizer)?;
        Ok(Self::new(tokenizer, true))
    }
}

impl TextEncoder for TokenizerEncoder {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, self.add_special_tokens)
            .map_err(MedRagError::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self
            .tokenizer
            .decode(ids, self.skip_special_tokens)
            .map_err(MedRagError::tokenizer)?)
    }
}

/// Token budget for retrieved text.
#[derive(Debug, Clone, Copy)]
pub struct ContextWindow {
    /// Maximum number of tokens kept from the joined snippets
    pub context_length: usize,
}

impl ContextWindow {
    pub fn new(context_length: usize) -> Self {
        Self { context_length }
    }

    /// Keep the first `context_length` tokens of `text`.
    pub fn truncate(&self, encoder: &dyn TextEncoder, text: &str) -> Result<String> {
        let ids = encoder.encode(text)?;
        let end = ids.len().min(self.context_length);
        encoder.decode(&ids[..end])
    }
}
