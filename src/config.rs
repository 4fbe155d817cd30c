//! Configuration management for MedRAG
//!
//! Handles backend credentials, device selection and asset locations.
//! Values come from ~/.medrag/config.toml and are overlaid by environment
//! variables, so a bare environment with `OPENAI_API_KEY` set is enough to
//! talk to the hosted backends.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_API_TYPE_ENV: &str = "OPENAI_API_TYPE";
pub const OPENAI_API_BASE_ENV: &str = "OPENAI_API_BASE";
pub const OPENAI_API_VERSION_ENV: &str = "OPENAI_API_VERSION";
pub const GOOGLE_API_KEY_ENV: &str = "GOOGLE_API_KEY";

/// Device preference for compute
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub enum DevicePreference {
    /// Automatically detect best available device (GPU if available, else CPU)
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// Force Metal GPU (macOS Apple Silicon)
    Metal,
    /// Force CUDA GPU (NVIDIA)
    Cuda,
}

impl DevicePreference {
    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Metal => "metal",
            Self::Cuda => "cuda",
        }
    }

    /// Parse a display name back into a preference
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().into_iter().find(|d| d.name() == name.to_lowercase())
    }

    /// Get all available options
    pub fn all() -> Vec<Self> {
        vec![Self::Auto, Self::Cpu, Self::Metal, Self::Cuda]
    }
}

/// Flavour of the OpenAI-compatible endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    /// Public api.openai.com style endpoint, model named in the request body
    #[default]
    OpenAi,
    /// Azure deployment endpoint, model named by deployment in the URL
    Azure,
}

impl ApiType {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "open_ai" | "openai" => Some(Self::OpenAi),
            "azure" | "azure_ad" | "azuread" => Some(Self::Azure),
            _ => None,
        }
    }
}

/// OpenAI / Azure OpenAI settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenAiSettings {
    #[serde(default)]
    pub api_type: ApiType,
    /// Endpoint base; defaults to https://api.openai.com/v1 for the public API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base: Option<String>,
    /// Required by Azure deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Google Gemini settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GeminiSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// MedRAG configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device preference (auto, cpu, metal, cuda)
    #[serde(default)]
    pub device: DevicePreference,
    /// HuggingFace cache directory for local models (hf-hub default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Directory holding chat-template assets (*.tmpl)
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    /// Hub repo providing the cl100k_base vocabulary used for hosted backends
    #[serde(default = "default_hosted_tokenizer")]
    pub hosted_tokenizer: String,
    /// Seed for sampled decoding
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default)]
    pub gemini: GeminiSettings,
    /// Version of config schema (for future migrations)
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("templates")
}

fn default_hosted_tokenizer() -> String {
    "Xenova/gpt-4".to_string()
}

fn default_seed() -> u64 {
    299792458
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DevicePreference::default(),
            cache_dir: None,
            template_dir: default_template_dir(),
            hosted_tokenizer: default_hosted_tokenizer(),
            seed: default_seed(),
            openai: OpenAiSettings::default(),
            gemini: GeminiSettings::default(),
            version: 1,
        }
    }
}

impl Config {
    /// Get the config file path (~/.medrag/config.toml)
    pub fn path() -> Result<PathBuf> {
        Ok(medrag_dir()?.join("config.toml"))
    }

    /// Check if a config file exists
    pub fn exists() -> bool {
        Self::path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Load config from disk, or return None if it doesn't exist
    pub fn load() -> Result<Option<Self>> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .context("Failed to read config file")?;
        let config: Self = toml::from_str(&content)
            .context("Failed to parse config file")?;
        Ok(Some(config))
    }

    /// Load the config file (or defaults) and apply environment overrides
    pub fn resolve() -> Result<Self> {
        let mut config = Self::load()?.unwrap_or_default();
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay values found through `lookup` (normally the process environment)
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty(OPENAI_API_KEY_ENV) {
            self.openai.api_key = Some(key);
        }
        if let Some(api_type) = non_empty(OPENAI_API_TYPE_ENV).and_then(|v| ApiType::parse(&v)) {
            self.openai.api_type = api_type;
        }
        if let Some(base) = non_empty(OPENAI_API_BASE_ENV) {
            self.openai.api_base = Some(base);
        }
        if let Some(version) = non_empty(OPENAI_API_VERSION_ENV) {
            self.openai.api_version = Some(version);
        }
        if let Some(key) = non_empty(GOOGLE_API_KEY_ENV) {
            self.gemini.api_key = Some(key);
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;

        // Ensure directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        std::fs::write(&path, content)
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// Get the base medrag directory path (~/.medrag)
pub fn medrag_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".medrag"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.device, DevicePreference::Auto);
        assert_eq!(config.template_dir, PathBuf::from("templates"));
        assert_eq!(config.hosted_tokenizer, "Xenova/gpt-4");
        assert_eq!(config.openai.api_type, ApiType::OpenAi);
        assert!(config.openai.api_key.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.openai.api_type = ApiType::Azure;
        config.openai.api_base = Some("https://example.openai.azure.com".to_string());
        config.gemini.api_key = Some("g-key".to_string());

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.openai, config.openai);
        assert_eq!(parsed.gemini, config.gemini);
        assert_eq!(parsed.seed, config.seed);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: Config = toml::from_str("[openai]\napi_type = \"azure\"\n").unwrap();
        assert_eq!(parsed.openai.api_type, ApiType::Azure);
        assert_eq!(parsed.template_dir, PathBuf::from("templates"));
        assert_eq!(parsed.version, 1);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config::default();
        config.openai.api_key = Some("from-file".to_string());

        let env: HashMap<&str, &str> = [
            (OPENAI_API_KEY_ENV, "from-env"),
            (OPENAI_API_TYPE_ENV, "azure"),
            (OPENAI_API_VERSION_ENV, "2024-02-01"),
            (GOOGLE_API_KEY_ENV, "google"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.openai.api_key.as_deref(), Some("from-env"));
        assert_eq!(config.openai.api_type, ApiType::Azure);
        assert_eq!(config.openai.api_version.as_deref(), Some("2024-02-01"));
        assert_eq!(config.gemini.api_key.as_deref(), Some("google"));
        assert!(config.openai.api_base.is_none());
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.gemini.api_key = Some("kept".to_string());
        config.apply_env(|k| (k == GOOGLE_API_KEY_ENV).then(|| "  ".to_string()));
        assert_eq!(config.gemini.api_key.as_deref(), Some("kept"));
    }

    #[test]
    fn test_device_names() {
        for device in DevicePreference::all() {
            assert_eq!(DevicePreference::from_name(device.name()), Some(device));
        }
        assert_eq!(DevicePreference::from_name("CUDA"), Some(DevicePreference::Cuda));
        assert_eq!(DevicePreference::from_name("tpu"), None);
    }
}
