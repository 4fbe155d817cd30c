//! Typed errors for failures callers may want to match on.
//!
//! Everything else travels as `anyhow::Error` with context attached; these
//! variants are wrapped into it and can be recovered with `downcast_ref`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum MedRagError {
    #[error("missing API key for {backend}: set {env_var} or add it to the config file")]
    MissingCredential {
        backend: &'static str,
        env_var: &'static str,
    },

    #[error("chat template asset not found: {0:?}")]
    TemplateAsset(PathBuf),

    #[error("no token budget known for hosted model '{0}'")]
    UnsupportedHostedModel(String),

    #[error("unsupported local model architecture '{0}' (supported: llama, mistral, qwen2)")]
    UnsupportedArchitecture(String),

    #[error("rag is enabled but no retrieval system was supplied")]
    RetrievalRequired,

    #[error("{backend} API error ({status}): {body}")]
    Api {
        backend: &'static str,
        status: u16,
        body: String,
    },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

impl MedRagError {
    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}
