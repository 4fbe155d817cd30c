//! MedRAG CLI
//!
//! Commands:
//!   answer  - Answer one question (COT or RAG)
//!   profile - Show the backend profile a model name resolves to
//!   config  - Show or initialize ~/.medrag/config.toml

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use colored::*;
use medrag::{
    AnswerOptions, BackendProfile, Config, DevicePreference, HttpRetriever, MedRag, RetrievalSystem,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "medrag")]
#[command(about = "Retrieval-augmented medical question answering")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a multiple-choice medical question
    Answer {
        /// Backend as "<provider>/<model>", e.g. OpenAI/gpt-4 or mistralai/Mistral-7B-Instruct-v0.2
        #[arg(short, long, default_value = "OpenAI/gpt-3.5-turbo-16k")]
        llm: String,

        /// Question text
        question: String,

        /// Answer option as KEY=TEXT (repeatable)
        #[arg(short, long = "option", value_parser = parse_option)]
        options: Vec<(String, String)>,

        /// Skip retrieval and answer with chain-of-thought only
        #[arg(long)]
        no_rag: bool,

        /// Retrieval service endpoint
        #[arg(long, default_value = "http://127.0.0.1:8000/retrieve")]
        retriever_url: String,

        /// Retriever name passed to the service
        #[arg(long, default_value = medrag::retrieval::DEFAULT_RETRIEVER)]
        retriever: String,

        /// Corpus name passed to the service
        #[arg(long, default_value = medrag::retrieval::DEFAULT_CORPUS)]
        corpus: String,

        /// Number of snippets to retrieve
        #[arg(short, long, default_value = "32")]
        k: usize,

        /// Reciprocal-rank-fusion constant
        #[arg(long, default_value = "100")]
        rrf_k: usize,

        /// Directory for snippets.json and response.json
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Override device (auto, cpu, metal, cuda)
        #[arg(long)]
        device: Option<String>,

        /// Override the HuggingFace cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Do not echo streamed tokens from local models
        #[arg(long)]
        no_stream: bool,
    },

    /// Show the resolved backend profile as JSON
    Profile {
        /// Backend as "<provider>/<model>"
        llm: String,
    },

    /// Show the effective configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

fn parse_option(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, text)) if !key.trim().is_empty() => Ok((key.trim().to_string(), text.to_string())),
        _ => Err(format!("expected KEY=TEXT, got '{}'", raw)),
    }
}

fn mask(secret: &Option<String>) -> String {
    match secret {
        Some(s) if !s.is_empty() => "set".green().to_string(),
        _ => "not set".dimmed().to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medrag=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Answer {
            llm,
            question,
            options,
            no_rag,
            retriever_url,
            retriever,
            corpus,
            k,
            rrf_k,
            save_dir,
            device,
            cache_dir,
            no_stream,
        } => {
            let mut config = Config::resolve()?;
            if let Some(name) = device {
                match DevicePreference::from_name(&name) {
                    Some(pref) => config.device = pref,
                    None => bail!(
                        "Unknown device '{}'. Expected one of: {}",
                        name,
                        DevicePreference::all().iter().map(|d| d.name()).collect::<Vec<_>>().join(", ")
                    ),
                }
            }
            if cache_dir.is_some() {
                config.cache_dir = cache_dir;
            }

            let rag = !no_rag;
            let retrieval: Option<Arc<dyn RetrievalSystem>> = rag.then(|| {
                Arc::new(
                    HttpRetriever::new(retriever_url)
                        .with_retriever(retriever)
                        .with_corpus(corpus),
                ) as Arc<dyn RetrievalSystem>
            });

            println!("Loading backend {}...", llm.cyan());
            let stream: Box<dyn Write + Send> = if no_stream {
                Box::new(std::io::sink())
            } else {
                Box::new(std::io::stdout())
            };
            let medrag = MedRag::new_with_stream(&llm, rag, retrieval, &config, stream)?;

            let options: BTreeMap<String, String> = options.into_iter().collect();
            let opts = AnswerOptions { k, rrf_k, save_dir };

            let output = medrag
                .answer(&question, (!options.is_empty()).then_some(&options), &opts)
                .await?;

            println!();
            for (index, answer) in output.answer.all().iter().enumerate() {
                println!("{} {}", format!("[{}]", index).dimmed(), answer);
            }
            println!();
            if rag {
                println!("{} {} snippets retrieved", "✓".green(), output.snippets.len());
            }
            if let Some(dir) = &opts.save_dir {
                println!("{} Saved to {}", "✓".green(), dir.display());
            }
        }

        Commands::Profile { llm } => {
            let profile = BackendProfile::resolve(&llm)?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }

        Commands::Config { init } => {
            let path = Config::path()?;
            if init && !Config::exists() {
                Config::default().save()?;
                println!("{} Wrote {}", "✓".green(), path.display());
            }

            let config = Config::resolve()?;
            println!("{} {}", "Config:".bold(), path.display());
            println!("  device:           {}", config.device.name());
            println!(
                "  cache_dir:        {}",
                config
                    .cache_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "hf-hub default".to_string())
            );
            println!("  template_dir:     {}", config.template_dir.display());
            println!("  hosted_tokenizer: {}", config.hosted_tokenizer);
            println!("  seed:             {}", config.seed);
            println!("  openai.api_type:  {:?}", config.openai.api_type);
            println!("  openai.api_key:   {}", mask(&config.openai.api_key));
            println!("  gemini.api_key:   {}", mask(&config.gemini.api_key));
        }
    }

    Ok(())
}
