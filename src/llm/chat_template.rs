//! Chat templates for local models.
//!
//! A template turns the system + user conversation into the single prompt
//! string a local model is fed, ending with the generation prompt for the
//! assistant turn. Templates use `{system}` and `{user}` placeholders.
//!
//! Asset files are written for readability: raw newlines and 4-space
//! indentation are layout only and get stripped, and the two-character escape
//! `\n` stands for a real newline.

use super::profile::{BackendKind, BackendProfile, ChatTemplateAsset};
use super::types::{split_conversation, Message};
use crate::error::MedRagError;
use crate::prompt::render_placeholders;
use anyhow::{Context, Result};
use std::path::Path;

const LLAMA2_TEMPLATE: &str = "[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{user} [/INST]";

const LLAMA3_TEMPLATE: &str = concat!(
    "<|start_header_id|>system<|end_header_id|>\n\n{system}<|eot_id|>",
    "<|start_header_id|>user<|end_header_id|>\n\n{user}<|eot_id|>",
    "<|start_header_id|>assistant<|end_header_id|>\n\n"
);

const GENERIC_TEMPLATE: &str = "{system}\n\nUser: {user}\n\nAssistant:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTemplate {
    source: String,
}

impl ChatTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Load an asset file. A missing file is a construction error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MedRagError::TemplateAsset(path.to_path_buf()).into());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chat template {:?}", path))?;
        Ok(Self::new(normalize_asset(&raw)))
    }

    /// Template for a local profile: its asset when it has one, otherwise
    /// the built-in format of the model family.
    pub fn for_profile(profile: &BackendProfile, template_dir: &Path) -> Result<Self> {
        if let Some(asset) = profile.chat_template {
            return Self::load(&asset_path(template_dir, asset));
        }
        Ok(Self::builtin(profile))
    }

    pub fn builtin(profile: &BackendProfile) -> Self {
        let lower = profile.name.to_lowercase();
        let source = if profile.kind == BackendKind::LocalLlama3 {
            LLAMA3_TEMPLATE
        } else if lower.contains("llama-2") {
            LLAMA2_TEMPLATE
        } else {
            GENERIC_TEMPLATE
        };
        Self::new(source)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render the conversation followed by the generation prompt.
    pub fn apply(&self, messages: &[Message]) -> String {
        let (system, user) = split_conversation(messages);
        render_placeholders(&self.source, &[("system", system), ("user", user)])
    }
}

/// Strip layout whitespace from an asset and expand `\n` escapes.
fn normalize_asset(raw: &str) -> String {
    raw.replace("    ", "")
        .replace(['\n', '\r'], "")
        .replace("\\n", "\n")
}

/// Location of an asset inside the template directory
pub fn asset_path(template_dir: &Path, asset: ChatTemplateAsset) -> std::path::PathBuf {
    template_dir.join(asset.file_name())
}
