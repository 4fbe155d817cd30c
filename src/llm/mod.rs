//! LLM Layer: backends that turn a prompt into an answer
//!
//! This module handles all interactions with Large Language Models, including:
//! - Backend profiles resolved from the model name (budgets, encoding, template)
//! - Provider abstractions (OpenAI/Azure, Gemini, local Candle models)
//! - Context budgets measured in the backend's own tokens
//! - Local decoding controls (stop phrases, end tokens, decode sessions)

pub mod types;
pub mod provider;
pub mod profile;
pub mod context;
pub mod chat_template;
pub mod stopping;
pub mod session;
pub mod openai;
pub mod gemini;
pub mod candle;
pub mod dispatch;

// Re-export key types
pub use types::{Message, Role, CompletionResponse};
pub use provider::LLMProvider;
pub use profile::{BackendKind, BackendProfile};
pub use context::{ContextWindow, TextEncoder, TokenizerEncoder};
pub use dispatch::GenerationDispatcher;
