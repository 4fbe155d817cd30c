//! Candle-based Local LLM Provider.
//!
//! Runs llama-family (llama-2/3, meditron, PMC_LLaMA), mistral and qwen2
//! checkpoints locally using the `candle` crate. Decoding depends on the
//! backend kind:
//! - generic / PMC_LLaMA: greedy, stop on EOS, total length capped at `max_length`
//! - llama-3: generic plus `<|eot_id|>` as a second end token
//! - meditron: generic plus the stop-phrase criterion
//! - mistral: nucleus sampling with a decode session kept across calls,
//!   streamed token by token to the output sink

use super::chat_template::ChatTemplate;
use super::context::{TextEncoder, TokenizerEncoder};
use super::profile::{BackendKind, BackendProfile};
use super::provider::{LLMProvider, ModelMetadata};
use super::session::DecodeSession;
use super::stopping::{EndTokenCriterion, StopCondition, StopPhraseCriterion, StoppingCriterion};
use super::types::{CompletionResponse, Message, Usage};
use crate::config::{Config, DevicePreference};
use crate::error::MedRagError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache as LlamaCache, Config as LlamaRuntimeConfig, Llama, LlamaConfig};
use candle_transformers::models::mistral::{Config as MistralConfig, Model as MistralModel};
use candle_transformers::models::qwen2::{Config as Qwen2Config, ModelForCausalLM as Qwen2Model};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokenizers::Tokenizer;

const LLAMA3_EOT_TOKEN: &str = "<|eot_id|>";
const MISTRAL_MAX_NEW_TOKENS: usize = 512;
const MISTRAL_TEMPERATURE: f64 = 0.9;
const MISTRAL_TOP_P: f64 = 0.9;

/// Stream decoder helper
struct TokenOutputStream<'a> {
    decoder: &'a dyn TextEncoder,
    tokens: Vec<u32>,
    prev_index: usize,
    current_index: usize,
}

impl<'a> TokenOutputStream<'a> {
    fn new(decoder: &'a dyn TextEncoder) -> Self {
        Self {
            decoder,
            tokens: Vec::new(),
            prev_index: 0,
            current_index: 0,
        }
    }

    /// Text completed by `token`, held back while it may be a partial word
    fn next_token(&mut self, token: u32) -> Result<Option<String>> {
        let prev_text = if self.tokens.is_empty() {
            String::new()
        } else {
            self.decoder.decode(&self.tokens[self.prev_index..self.current_index])?
        };

        self.tokens.push(token);
        let text = self.decoder.decode(&self.tokens[self.prev_index..])?;

        if text.len() > prev_text.len() && text.chars().last().is_some_and(char::is_alphanumeric) {
            if let Some(fresh) = text.get(prev_text.len()..) {
                self.prev_index = self.current_index;
                self.current_index = self.tokens.len();
                return Ok(Some(fresh.to_string()));
            }
        }
        Ok(None)
    }

    /// Whatever is still held back
    fn decode_rest(&self) -> Result<Option<String>> {
        let prev_text = self.decoder.decode(&self.tokens[self.prev_index..self.current_index])?;
        let text = self.decoder.decode(&self.tokens[self.prev_index..])?;
        Ok(text
            .get(prev_text.len()..)
            .filter(|rest| !rest.is_empty())
            .map(str::to_string))
    }
}

/// A causal LM that keeps its own KV cache
trait CausalModel: Send {
    /// Logits for the last position of `input`, as a 1-D f32 tensor
    fn forward(&mut self, input: &Tensor, pos: usize) -> Result<Tensor>;

    fn clear_kv_cache(&mut self) -> Result<()>;
}

/// Supported checkpoint architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Architecture {
    Llama,
    Mistral,
    Qwen2,
}

impl Architecture {
    /// Detect from `model_type` (falling back to `architectures[0]`)
    fn detect(model_config: &Value) -> Result<Self, MedRagError> {
        let model_type = model_config["model_type"].as_str().unwrap_or("").to_lowercase();
        let arch = model_config["architectures"]
            .get(0)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_lowercase();

        if model_type == "llama" || arch.starts_with("llama") {
            Ok(Self::Llama)
        } else if model_type == "mistral" || arch.starts_with("mistral") {
            Ok(Self::Mistral)
        } else if model_type == "qwen2" || arch.starts_with("qwen2") {
            Ok(Self::Qwen2)
        } else if !model_type.is_empty() {
            Err(MedRagError::UnsupportedArchitecture(model_type))
        } else {
            Err(MedRagError::UnsupportedArchitecture(arch))
        }
    }
}

/// Loaded model with its KV cache
enum LocalModel {
    Llama {
        model: Llama,
        cache: LlamaCache,
        config: LlamaRuntimeConfig,
        dtype: DType,
        device: Device,
    },
    Mistral(MistralModel),
    Qwen2(Qwen2Model),
}

impl LocalModel {
    fn load(files: &ModelFiles, dtype: DType, device: &Device) -> Result<Self> {
        let config_str = std::fs::read_to_string(&files.config)
            .context("Failed to read model config")?;
        let model_config: Value = serde_json::from_str(&config_str)
            .context("Failed to parse model config")?;
        let arch = Architecture::detect(&model_config)?;

        tracing::info!("Loading {:?} weights from {} file(s)", arch, files.weights.len());

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)
                .context("Failed to load model weights")?
        };

        match arch {
            Architecture::Llama => {
                let config: LlamaConfig = serde_json::from_str(&config_str)
                    .context("Failed to parse llama config")?;
                let config = config.into_config(false);
                let model = Llama::load(vb, &config).context("Failed to create llama model")?;
                let cache = LlamaCache::new(true, dtype, &config, device)?;
                Ok(Self::Llama {
                    model,
                    cache,
                    config,
                    dtype,
                    device: device.clone(),
                })
            }
            Architecture::Mistral => {
                let config: MistralConfig = serde_json::from_str(&config_str)
                    .context("Failed to parse mistral config")?;
                let model = MistralModel::new(&config, vb).context("Failed to create mistral model")?;
                Ok(Self::Mistral(model))
            }
            Architecture::Qwen2 => {
                let config: Qwen2Config = serde_json::from_str(&config_str)
                    .context("Failed to parse qwen2 config")?;
                let model = Qwen2Model::new(&config, vb).context("Failed to create qwen2 model")?;
                Ok(Self::Qwen2(model))
            }
        }
    }
}

impl CausalModel for LocalModel {
    fn forward(&mut self, input: &Tensor, pos: usize) -> Result<Tensor> {
        let logits = match self {
            Self::Llama { model, cache, .. } => model.forward(input, pos, cache)?,
            Self::Mistral(model) => model.forward(input, pos)?,
            Self::Qwen2(model) => model.forward(input, pos)?,
        };

        let mut logits = logits.squeeze(0)?;
        while logits.rank() > 1 {
            logits = logits.get(logits.dim(0)? - 1)?;
        }
        Ok(logits.to_dtype(DType::F32)?)
    }

    fn clear_kv_cache(&mut self) -> Result<()> {
        match self {
            Self::Llama { cache, config, dtype, device, .. } => {
                *cache = LlamaCache::new(true, *dtype, config, device)?;
            }
            Self::Mistral(model) => model.clear_kv_cache(),
            Self::Qwen2(model) => model.clear_kv_cache(),
        }
        Ok(())
    }
}

/// Files making up a local checkpoint
#[derive(Debug, Clone)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    tokenizer_config: Option<PathBuf>,
    weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Local directory if `model_id` is one, otherwise the HuggingFace Hub
    fn locate(model_id: &str, cache_dir: Option<PathBuf>) -> Result<Self> {
        let local = Path::new(model_id);
        if local.is_dir() {
            return Self::from_dir(local);
        }

        let mut builder = ApiBuilder::new().with_progress(true);
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir);
        }
        let api = builder.build().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config = repo.get("config.json").context("Failed to get config.json")?;
        let tokenizer = repo.get("tokenizer.json").context("Failed to get tokenizer.json")?;
        let tokenizer_config = repo.get("tokenizer_config.json").ok();

        let weights = match repo.get("model.safetensors.index.json") {
            Ok(index) => shard_files(&index)?
                .iter()
                .map(|file| repo.get(file).with_context(|| format!("Failed to get {}", file)))
                .collect::<Result<Vec<_>>>()?,
            Err(_) => vec![repo
                .get("model.safetensors")
                .context("Failed to get model.safetensors")?],
        };

        Ok(Self {
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }

    fn from_dir(dir: &Path) -> Result<Self> {
        let require = |name: &str| {
            let path = dir.join(name);
            if path.exists() {
                Ok(path)
            } else {
                Err(anyhow!("{} not found in {:?}", name, dir))
            }
        };

        let config = require("config.json")?;
        let tokenizer = require("tokenizer.json")?;
        let tokenizer_config = Some(dir.join("tokenizer_config.json")).filter(|p| p.exists());

        let index = dir.join("model.safetensors.index.json");
        let weights = if index.exists() {
            shard_files(&index)?.iter().map(|f| dir.join(f)).collect()
        } else {
            vec![require("model.safetensors")?]
        };

        Ok(Self {
            config,
            tokenizer,
            tokenizer_config,
            weights,
        })
    }
}

/// Unique shard file names listed in a safetensors index
fn shard_files(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)
        .with_context(|| format!("Failed to read {:?}", index_path))?;
    let index: Value = serde_json::from_str(&content)
        .context("Failed to parse safetensors index")?;
    let weight_map = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .context("safetensors index has no weight_map")?;

    let mut files: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    files.sort();
    files.dedup();
    Ok(files)
}

/// `eos_token` from tokenizer_config.json (plain string or AddedToken object)
fn eos_from_tokenizer_config(tokenizer_config: &Value) -> Option<String> {
    match tokenizer_config.get("eos_token")? {
        Value::String(token) => Some(token.clone()),
        Value::Object(obj) => obj.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}

/// `eos_token_id` from config.json (number or list)
fn eos_from_model_config(model_config: &Value) -> Option<u32> {
    match model_config.get("eos_token_id")? {
        Value::Array(ids) => ids.first()?.as_u64(),
        other => other.as_u64(),
    }
    .and_then(|id| u32::try_from(id).ok())
}

fn read_json(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

fn resolve_eos_token(tokenizer: &Tokenizer, files: &ModelFiles) -> Result<u32> {
    if let Some(path) = &files.tokenizer_config {
        let from_tokenizer = eos_from_tokenizer_config(&read_json(path)?)
            .and_then(|token| tokenizer.token_to_id(&token));
        if let Some(id) = from_tokenizer {
            return Ok(id);
        }
    }

    eos_from_model_config(&read_json(&files.config)?)
        .context("Could not determine the EOS token for this model")
}

fn select_device(preference: DevicePreference) -> Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::new_cuda(0)?,
        DevicePreference::Metal => Device::new_metal(0)?,
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0)?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0)?
            } else {
                Device::Cpu
            }
        }
    };
    Ok(device)
}

/// End tokens for a backend: the EOS, plus `<|eot_id|>` for llama-3
fn end_tokens_for(kind: BackendKind, eos_token_id: u32, lookup: impl Fn(&str) -> Option<u32>) -> Vec<u32> {
    let mut end = vec![eos_token_id];
    if kind == BackendKind::LocalLlama3 {
        match lookup(LLAMA3_EOT_TOKEN) {
            Some(id) if id != eos_token_id => end.push(id),
            Some(_) => {}
            None => tracing::warn!("{} not in vocabulary, stopping on EOS only", LLAMA3_EOT_TOKEN),
        }
    }
    end
}

/// Limits shared by every step of one call
struct DecodeRun<'a> {
    device: &'a Device,
    end: &'a EndTokenCriterion,
    max_new_tokens: usize,
    stop: Option<&'a dyn StoppingCriterion>,
}

impl DecodeRun<'_> {
    /// Feed `input` at `start_pos` and sample until an end token, the stop
    /// criterion, or the token budget. Returns the sampled tokens.
    fn run(
        &self,
        model: &mut dyn CausalModel,
        sampler: &mut LogitsProcessor,
        start_pos: usize,
        input: &[u32],
        mut stream: Option<(&mut TokenOutputStream<'_>, &mut dyn Write)>,
    ) -> Result<Vec<u32>> {
        let mut tokens = input.to_vec();
        let mut generated = Vec::new();

        for index in 0..self.max_new_tokens {
            let (context, pos) = if index == 0 {
                (&tokens[..], start_pos)
            } else {
                (&tokens[tokens.len() - 1..], start_pos + tokens.len() - 1)
            };

            let input_tensor = Tensor::new(context, self.device)?.unsqueeze(0)?;
            let logits = model.forward(&input_tensor, pos)?;
            let next_token = sampler.sample(&logits)?;

            tokens.push(next_token);
            generated.push(next_token);

            if let Some((decoder, sink)) = stream.as_mut() {
                if let Some(text) = decoder.next_token(next_token)? {
                    write!(sink, "{}", text)?;
                    sink.flush()?;
                }
            }

            if self.end.is_end(next_token) {
                tracing::debug!("Generation stopped: end token");
                break;
            }

            if let Some(criterion) = self.stop {
                if criterion.should_stop(&tokens)? {
                    tracing::debug!("Generation stopped: stop phrase");
                    break;
                }
            }
        }

        if let Some((decoder, sink)) = stream.as_mut() {
            if let Some(rest) = decoder.decode_rest()? {
                write!(sink, "{}", rest)?;
            }
            writeln!(sink)?;
            sink.flush()?;
        }

        Ok(generated)
    }
}

/// Everything a `CandleProvider` is built from
struct LocalParts {
    profile: BackendProfile,
    model: Box<dyn CausalModel>,
    device: Device,
    /// Encodes rendered prompts (special tokens added) and decodes for the
    /// stop-phrase check
    prompt_encoder: Box<dyn TextEncoder>,
    /// Decodes generated text with special tokens skipped
    output_decoder: Box<dyn TextEncoder>,
    chat_template: ChatTemplate,
    end_tokens: Vec<u32>,
    seed: u64,
    stream: Box<dyn Write + Send>,
}

/// Local Provider using Candle
pub struct CandleProvider {
    profile: BackendProfile,
    model: Mutex<Box<dyn CausalModel>>,
    device: Device,
    prompt_encoder: Box<dyn TextEncoder>,
    output_decoder: Box<dyn TextEncoder>,
    chat_template: ChatTemplate,
    end: EndTokenCriterion,
    seed: u64,
    session: Mutex<DecodeSession>,
    /// Sampler for the streaming backend; its RNG runs on across turns
    sampler: Mutex<LogitsProcessor>,
    stream: Mutex<Box<dyn Write + Send>>,
}

impl CandleProvider {
    /// Load the model for `profile`. Streamed tokens go to `stream`.
    ///
    /// Also returns the encoder that measures context budgets for this model.
    pub fn load(
        profile: &BackendProfile,
        config: &Config,
        stream: Box<dyn Write + Send>,
    ) -> Result<(Self, TokenizerEncoder)> {
        let chat_template = ChatTemplate::for_profile(profile, &config.template_dir)?;
        let device = select_device(config.device)?;
        let dtype = if device.is_cpu() { DType::F32 } else { DType::BF16 };

        tracing::info!("Loading local model: {}", profile.model);
        tracing::info!("  Backend: {}", profile.kind.name());
        tracing::info!("  Device: {:?}, dtype: {:?}", device, dtype);

        let files = ModelFiles::locate(&profile.model, config.cache_dir.clone())?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let eos_token_id = resolve_eos_token(&tokenizer, &files)?;
        let end_tokens = end_tokens_for(profile.kind, eos_token_id, |token| tokenizer.token_to_id(token));
        let model = LocalModel::load(&files, dtype, &device)?;

        tracing::info!("Local model loaded (end tokens {:?})", end_tokens);

        let context_encoder = TokenizerEncoder::new(tokenizer.clone(), profile.encoding.add_special_tokens());
        let provider = Self::assemble(LocalParts {
            profile: profile.clone(),
            model: Box::new(model),
            device,
            prompt_encoder: Box::new(TokenizerEncoder::new(tokenizer.clone(), true)),
            output_decoder: Box::new(TokenizerEncoder::new(tokenizer, false).skipping_special_tokens()),
            chat_template,
            end_tokens,
            seed: config.seed,
            stream,
        });

        Ok((provider, context_encoder))
    }

    fn assemble(parts: LocalParts) -> Self {
        Self {
            session: Mutex::new(DecodeSession::new(parts.profile.max_length)),
            sampler: Mutex::new(LogitsProcessor::new(
                parts.seed,
                Some(MISTRAL_TEMPERATURE),
                Some(MISTRAL_TOP_P),
            )),
            profile: parts.profile,
            model: Mutex::new(parts.model),
            device: parts.device,
            prompt_encoder: parts.prompt_encoder,
            output_decoder: parts.output_decoder,
            chat_template: parts.chat_template,
            end: EndTokenCriterion::new(parts.end_tokens),
            seed: parts.seed,
            stream: Mutex::new(parts.stream),
        }
    }

    /// Greedy decoding for every local kind except mistral
    fn generate_greedy(&self, prompt: &str) -> Result<CompletionResponse> {
        let mut prompt_tokens = self.prompt_encoder.encode(prompt)?;
        let input_length = prompt_tokens.len();
        prompt_tokens.truncate(self.profile.max_length);

        let stop_phrases = (self.profile.kind == BackendKind::LocalMeditron).then(|| {
            StopPhraseCriterion::new(StopCondition::meditron(input_length), self.prompt_encoder.as_ref())
        });
        let run = DecodeRun {
            device: &self.device,
            end: &self.end,
            max_new_tokens: self.profile.max_length - prompt_tokens.len(),
            stop: stop_phrases.as_ref().map(|c| c as &dyn StoppingCriterion),
        };
        let mut sampler = LogitsProcessor::new(self.seed, None, None);

        let generated = {
            let mut model = self
                .model
                .lock()
                .map_err(|e| anyhow!("Model lock poisoned: {}", e))?;
            model.clear_kv_cache()?;
            run.run(&mut **model, &mut sampler, 0, &prompt_tokens, None)?
        };

        Ok(CompletionResponse {
            content: self.output_decoder.decode(&generated)?,
            usage: Usage::new(prompt_tokens.len(), generated.len()),
        })
    }

    /// Sampled, streamed decoding that continues the mistral session
    fn generate_streaming(&self, prompt: &str) -> Result<CompletionResponse> {
        let prompt_tokens = self.prompt_encoder.encode(prompt)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow!("Session lock poisoned: {}", e))?;
        let mut model = self
            .model
            .lock()
            .map_err(|e| anyhow!("Model lock poisoned: {}", e))?;
        let mut sampler = self
            .sampler
            .lock()
            .map_err(|e| anyhow!("Sampler lock poisoned: {}", e))?;
        let mut sink_guard = self
            .stream
            .lock()
            .map_err(|e| anyhow!("Stream lock poisoned: {}", e))?;

        let turn = session.begin(&prompt_tokens, MISTRAL_MAX_NEW_TOKENS);
        if turn.fresh {
            model.clear_kv_cache()?;
        }

        let run = DecodeRun {
            device: &self.device,
            end: &self.end,
            max_new_tokens: MISTRAL_MAX_NEW_TOKENS,
            stop: None,
        };
        let mut decoder = TokenOutputStream::new(self.output_decoder.as_ref());
        let sink: &mut dyn Write = &mut **sink_guard;

        let generated = match run.run(
            &mut **model,
            &mut *sampler,
            turn.start_pos,
            &turn.input,
            Some((&mut decoder, sink)),
        ) {
            Ok(generated) => generated,
            Err(e) => {
                // The cache may hold a half-fed turn
                session.reset();
                return Err(e);
            }
        };

        session.advance(&turn, &generated);
        tracing::debug!("Decode session now holds {} tokens", session.offset());

        Ok(CompletionResponse {
            content: self.output_decoder.decode(&generated)?,
            usage: Usage::new(prompt_tokens.len(), generated.len()),
        })
    }
}

#[async_trait]
impl LLMProvider for CandleProvider {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            id: self.profile.model.clone(),
            context_window: self.profile.max_length,
        }
    }

    async fn completion(&self, messages: &[Message]) -> Result<CompletionResponse> {
        let prompt = self.chat_template.apply(messages);
        tracing::debug!("Local generation ({}), prompt {} chars", self.profile.kind.name(), prompt.len());

        match self.profile.kind {
            BackendKind::LocalMistral => self.generate_streaming(&prompt),
            _ => self.generate_greedy(&prompt),
        }
    }

    fn reset_session(&self) -> Result<()> {
        self.session
            .lock()
            .map_err(|e| anyhow!("Session lock poisoned: {}", e))?
            .reset();
        Ok(())
    }
}
