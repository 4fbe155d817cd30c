//! MedRAG - retrieval-augmented medical question answering
//!
//! Answers multiple-choice medical questions by retrieving supporting
//! snippets and asking a hosted (OpenAI/Azure, Gemini) or local (Candle)
//! language model, with per-backend token budgets, prompt templates and
//! decoding controls.

pub mod config;
pub mod error;
pub mod llm;
pub mod medrag;
pub mod prompt;
pub mod retrieval;

pub use config::{Config, DevicePreference};
pub use error::MedRagError;
pub use llm::{BackendKind, BackendProfile, GenerationDispatcher};
pub use medrag::{Answer, AnswerOptions, MedRag, MedRagOutput};
pub use prompt::{PromptFlavor, PromptTemplate, PromptTemplateSet};
pub use retrieval::{HttpRetriever, RetrievalSystem, RetrievedSnippet};
