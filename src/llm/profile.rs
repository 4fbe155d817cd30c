//! Backend profile resolution.
//!
//! Maps a backend identifier (`"<provider>/<model>"`) onto one of a closed set
//! of backend kinds together with its token budgets, encoding, chat-template
//! asset and prompt flavour. Resolution is a pure function of the lowercased
//! identifier.

use crate::error::MedRagError;
use crate::prompt::PromptFlavor;
use serde::Serialize;

/// Every backend the dispatcher knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hosted chat completion (public OpenAI or Azure deployment)
    OpenAi,
    /// Hosted Gemini content generation
    Gemini,
    /// Local model, greedy decoding on the tokenizer EOS
    LocalGeneric,
    /// Local mistral, sampled + streamed with a persistent decode session
    LocalMistral,
    /// Local llama-3, greedy with `<|eot_id|>` as a second end token
    LocalLlama3,
    /// Local meditron, greedy with a stop-phrase criterion
    LocalMeditron,
    /// Local PMC_LLaMA, generic decoding through its own chat template
    LocalPmcLlama,
}

impl BackendKind {
    pub fn is_hosted(&self) -> bool {
        matches!(self, Self::OpenAi | Self::Gemini)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::LocalGeneric => "local",
            Self::LocalMistral => "local-mistral",
            Self::LocalLlama3 => "local-llama-3",
            Self::LocalMeditron => "local-meditron",
            Self::LocalPmcLlama => "local-pmc_llama",
        }
    }
}

/// Which tokenizer measures context budgets for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    /// General-purpose BPE shared by all hosted backends
    Cl100kBase,
    /// The local model's own tokenizer
    ModelTokenizer,
}

impl EncodingKind {
    /// Hosted encodings count special tokens, local ones do not.
    pub fn add_special_tokens(&self) -> bool {
        matches!(self, Self::Cl100kBase)
    }
}

/// Chat-template files shipped for model families whose tokenizer template
/// is replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplateAsset {
    MistralInstruct,
    Meditron,
    PmcLlama,
}

impl ChatTemplateAsset {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::MistralInstruct => "mistral-instruct.tmpl",
            Self::Meditron => "meditron.tmpl",
            Self::PmcLlama => "pmc_llama.tmpl",
        }
    }
}

/// Immutable per-backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendProfile {
    /// Identifier as given by the caller
    pub name: String,
    /// Model handed to the backend: last path segment for hosted APIs,
    /// the full repo id (or directory) for local models
    pub model: String,
    pub kind: BackendKind,
    /// Total token budget
    pub max_length: usize,
    /// Token budget reserved for retrieved text
    pub context_length: usize,
    pub encoding: EncodingKind,
    pub chat_template: Option<ChatTemplateAsset>,
    pub prompt_flavor: PromptFlavor,
}

impl BackendProfile {
    pub fn resolve(name: &str) -> Result<Self, MedRagError> {
        let lower = name.to_lowercase();
        let provider = lower.split('/').next().unwrap_or_default();
        let last_segment = name.rsplit('/').next().unwrap_or(name).to_string();

        if provider == "openai" {
            let model_lower = last_segment.to_lowercase();
            let (max_length, context_length) =
                if model_lower.contains("gpt-3.5") || model_lower.contains("gpt-35") {
                    (16384, 15000)
                } else if model_lower.contains("gpt-4") {
                    (32768, 30000)
                } else {
                    return Err(MedRagError::UnsupportedHostedModel(name.to_string()));
                };

            return Ok(Self::hosted(name, last_segment, BackendKind::OpenAi, max_length, context_length));
        }

        if lower.contains("gemini") {
            let (max_length, context_length) = if lower.contains("1.5") {
                (1_048_576, 1_040_384)
            } else {
                (30720, 28672)
            };
            return Ok(Self::hosted(name, last_segment, BackendKind::Gemini, max_length, context_length));
        }

        Ok(Self::local(name, &lower))
    }

    fn hosted(
        name: &str,
        model: String,
        kind: BackendKind,
        max_length: usize,
        context_length: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            model,
            kind,
            max_length,
            context_length,
            encoding: EncodingKind::Cl100kBase,
            chat_template: None,
            prompt_flavor: PromptFlavor::General,
        }
    }

    fn local(name: &str, lower: &str) -> Self {
        let mut max_length = 2048;
        let mut context_length = 1024;
        let mut chat_template = None;
        let mut prompt_flavor = PromptFlavor::General;

        // Budgets and assets: first matching family wins
        if lower.contains("mistral") {
            chat_template = Some(ChatTemplateAsset::MistralInstruct);
            max_length = 32768;
            context_length = 30000;
        } else if lower.contains("llama-2") {
            max_length = 4096;
            context_length = 3072;
        } else if lower.contains("llama-3") {
            max_length = 8192;
            context_length = 7168;
        } else if lower.contains("meditron-70b") {
            chat_template = Some(ChatTemplateAsset::Meditron);
            max_length = 4096;
            context_length = 3072;
            prompt_flavor = PromptFlavor::Meditron;
        } else if lower.contains("pmc_llama") {
            chat_template = Some(ChatTemplateAsset::PmcLlama);
            max_length = 2048;
            context_length = 1024;
        }

        // Invocation strategy is chosen by its own chain; any meditron (not
        // only the 70b) gets the stop-phrase criterion
        let kind = if lower.contains("mistral") {
            BackendKind::LocalMistral
        } else if lower.contains("meditron") {
            BackendKind::LocalMeditron
        } else if lower.contains("llama-3") {
            BackendKind::LocalLlama3
        } else if lower.contains("pmc_llama") {
            BackendKind::LocalPmcLlama
        } else {
            BackendKind::LocalGeneric
        };

        Self {
            name: name.to_string(),
            model: name.to_string(),
            kind,
            max_length,
            context_length,
            encoding: EncodingKind::ModelTokenizer,
            chat_template,
            prompt_flavor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budgets(name: &str) -> (usize, usize) {
        let profile = BackendProfile::resolve(name).unwrap();
        (profile.max_length, profile.context_length)
    }

    #[test]
    fn test_openai_budgets() {
        assert_eq!(budgets("OpenAI/gpt-3.5-turbo-16k"), (16384, 15000));
        assert_eq!(budgets("openai/gpt-35-turbo-16k"), (16384, 15000));
        assert_eq!(budgets("OpenAI/gpt-4-32k"), (32768, 30000));

        let profile = BackendProfile::resolve("OpenAI/gpt-4-32k").unwrap();
        assert_eq!(profile.kind, BackendKind::OpenAi);
        assert_eq!(profile.model, "gpt-4-32k");
        assert_eq!(profile.encoding, EncodingKind::Cl100kBase);
        assert!(profile.chat_template.is_none());
    }

    #[test]
    fn test_openai_unknown_model_is_error() {
        let err = BackendProfile::resolve("OpenAI/davinci-002").unwrap_err();
        assert!(matches!(err, MedRagError::UnsupportedHostedModel(_)));
    }

    #[test]
    fn test_gemini_budgets() {
        let profile = BackendProfile::resolve("Google/gemini-1.5-pro").unwrap();
        assert_eq!(profile.kind, BackendKind::Gemini);
        assert_eq!(profile.model, "gemini-1.5-pro");
        assert_eq!((profile.max_length, profile.context_length), (1_048_576, 1_040_384));

        assert_eq!(budgets("Google/gemini-pro"), (30720, 28672));
    }

    #[test]
    fn test_local_families() {
        let mistral = BackendProfile::resolve("mistralai/Mistral-7B-Instruct-v0.1").unwrap();
        assert_eq!(mistral.kind, BackendKind::LocalMistral);
        assert_eq!(mistral.chat_template, Some(ChatTemplateAsset::MistralInstruct));
        assert_eq!((mistral.max_length, mistral.context_length), (32768, 30000));

        let llama2 = BackendProfile::resolve("meta-llama/Llama-2-70b-chat-hf").unwrap();
        assert_eq!(llama2.kind, BackendKind::LocalGeneric);
        assert_eq!((llama2.max_length, llama2.context_length), (4096, 3072));

        let llama3 = BackendProfile::resolve("meta-llama/Meta-Llama-3-70B-Instruct").unwrap();
        assert_eq!(llama3.kind, BackendKind::LocalLlama3);
        assert_eq!((llama3.max_length, llama3.context_length), (8192, 7168));

        let meditron = BackendProfile::resolve("epfl-llm/meditron-70b").unwrap();
        assert_eq!(meditron.kind, BackendKind::LocalMeditron);
        assert_eq!(meditron.chat_template, Some(ChatTemplateAsset::Meditron));
        assert_eq!(meditron.prompt_flavor, PromptFlavor::Meditron);
        assert_eq!((meditron.max_length, meditron.context_length), (4096, 3072));

        let pmc = BackendProfile::resolve("axiong/PMC_LLaMA_13B").unwrap();
        assert_eq!(pmc.kind, BackendKind::LocalPmcLlama);
        assert_eq!(pmc.chat_template, Some(ChatTemplateAsset::PmcLlama));
        assert_eq!((pmc.max_length, pmc.context_length), (2048, 1024));
    }

    #[test]
    fn test_small_meditron_uses_stop_criterion_but_defaults() {
        let profile = BackendProfile::resolve("epfl-llm/meditron-7b").unwrap();
        assert_eq!(profile.kind, BackendKind::LocalMeditron);
        assert_eq!((profile.max_length, profile.context_length), (2048, 1024));
        assert!(profile.chat_template.is_none());
        assert_eq!(profile.prompt_flavor, PromptFlavor::General);
    }

    #[test]
    fn test_unknown_name_falls_through_to_generic() {
        let profile = BackendProfile::resolve("someone/some-model").unwrap();
        assert_eq!(profile.kind, BackendKind::LocalGeneric);
        assert_eq!(profile.model, "someone/some-model");
        assert_eq!(profile.encoding, EncodingKind::ModelTokenizer);
        assert_eq!((profile.max_length, profile.context_length), (2048, 1024));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        for name in ["OpenAI/gpt-4", "Google/gemini-1.0-pro", "meta-llama/Llama-2-7b-hf", "x/y"] {
            assert_eq!(BackendProfile::resolve(name).unwrap(), BackendProfile::resolve(name).unwrap());
        }
    }

    #[test]
    fn test_context_always_below_max() {
        let names = [
            "OpenAI/gpt-3.5-turbo",
            "OpenAI/gpt-4",
            "Google/gemini-1.5-flash",
            "Google/gemini-pro",
            "mistralai/Mistral-7B-Instruct-v0.2",
            "meta-llama/Llama-2-7b-chat-hf",
            "meta-llama/Meta-Llama-3-8B-Instruct",
            "epfl-llm/meditron-70b",
            "axiong/PMC_LLaMA_13B",
            "gpt2",
        ];
        for name in names {
            let profile = BackendProfile::resolve(name).unwrap();
            assert!(profile.context_length < profile.max_length, "{name}");
        }
    }

    #[test]
    fn test_special_token_asymmetry() {
        assert!(EncodingKind::Cl100kBase.add_special_tokens());
        assert!(!EncodingKind::ModelTokenizer.add_special_tokens());
    }
}
