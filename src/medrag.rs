//! The question-answering orchestrator.
//!
//! `MedRag::answer` formats the options, retrieves supporting snippets,
//! squeezes them into the backend's context budget, renders the COT or RAG
//! prompts and asks the backend once per context.

use crate::config::Config;
use crate::error::MedRagError;
use crate::llm::{BackendProfile, ContextWindow, GenerationDispatcher, Message};
use crate::prompt::PromptTemplateSet;
use crate::retrieval::{RetrievalSystem, RetrievedSnippet};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SNIPPETS_FILE: &str = "snippets.json";
pub const RESPONSE_FILE: &str = "response.json";

/// Per-question knobs
#[derive(Debug, Clone)]
pub struct AnswerOptions {
    /// Snippets to retrieve
    pub k: usize,
    /// Reciprocal-rank-fusion constant passed to the retriever
    pub rrf_k: usize,
    /// Write snippets.json / response.json here
    pub save_dir: Option<PathBuf>,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        Self {
            k: 32,
            rrf_k: 100,
            save_dir: None,
        }
    }
}

/// One answer per context; a lone answer is unwrapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Answer {
    Single(String),
    Multiple(Vec<String>),
}

impl Answer {
    fn from_answers(mut answers: Vec<String>) -> Self {
        if answers.len() == 1 {
            Self::Single(answers.remove(0))
        } else {
            Self::Multiple(answers)
        }
    }

    pub fn as_single(&self) -> Option<&str> {
        match self {
            Self::Single(answer) => Some(answer),
            Self::Multiple(_) => None,
        }
    }

    /// Every answer in context order
    pub fn all(&self) -> Vec<&str> {
        match self {
            Self::Single(answer) => vec![answer.as_str()],
            Self::Multiple(answers) => answers.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MedRagOutput {
    pub answer: Answer,
    pub snippets: Vec<RetrievedSnippet>,
    pub scores: Vec<f32>,
}

pub struct MedRag {
    dispatcher: GenerationDispatcher,
    templates: PromptTemplateSet,
    retrieval: Option<Arc<dyn RetrievalSystem>>,
    rag: bool,
    window: ContextWindow,
    whitespace: Regex,
}

impl MedRag {
    /// Resolve `llm_name` and construct its backend.
    ///
    /// With `rag` on, a retrieval system is required.
    pub fn new(
        llm_name: &str,
        rag: bool,
        retrieval: Option<Arc<dyn RetrievalSystem>>,
        config: &Config,
    ) -> Result<Self> {
        Self::new_with_stream(llm_name, rag, retrieval, config, Box::new(std::io::stdout()))
    }

    /// Like `new`, with streamed generation written to `stream`
    pub fn new_with_stream(
        llm_name: &str,
        rag: bool,
        retrieval: Option<Arc<dyn RetrievalSystem>>,
        config: &Config,
        stream: Box<dyn Write + Send>,
    ) -> Result<Self> {
        if rag && retrieval.is_none() {
            return Err(MedRagError::RetrievalRequired.into());
        }

        let profile = BackendProfile::resolve(llm_name)?;
        tracing::info!(
            "Backend {} -> {} (max_length={}, context_length={})",
            profile.name,
            profile.kind.name(),
            profile.max_length,
            profile.context_length
        );

        let dispatcher = GenerationDispatcher::connect_with_stream(profile, config, stream)?;
        Self::with_dispatcher(dispatcher, rag, retrieval)
    }

    pub fn with_dispatcher(
        dispatcher: GenerationDispatcher,
        rag: bool,
        retrieval: Option<Arc<dyn RetrievalSystem>>,
    ) -> Result<Self> {
        if rag && retrieval.is_none() {
            return Err(MedRagError::RetrievalRequired.into());
        }

        let templates = PromptTemplateSet::for_flavor(dispatcher.profile().prompt_flavor);
        let window = ContextWindow::new(dispatcher.profile().context_length);
        Ok(Self {
            dispatcher,
            templates,
            window,
            retrieval,
            rag,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    pub fn profile(&self) -> &BackendProfile {
        self.dispatcher.profile()
    }

    pub fn templates(&self) -> &PromptTemplateSet {
        &self.templates
    }

    /// Start the next answer from a clean decode state
    pub fn reset_session(&self) -> Result<()> {
        self.dispatcher.reset_session()
    }

    pub async fn answer(
        &self,
        question: &str,
        options: Option<&BTreeMap<String, String>>,
        opts: &AnswerOptions,
    ) -> Result<MedRagOutput> {
        let options = format_options(options);

        let (snippets, scores, contexts) = match (&self.retrieval, self.rag) {
            (Some(retrieval), true) => {
                let (snippets, scores) = retrieval.retrieve(question, opts.k, opts.rrf_k).await?;
                let context = self.build_context(&snippets)?;
                (snippets, scores, vec![context])
            }
            (None, true) => return Err(MedRagError::RetrievalRequired.into()),
            (_, false) => (Vec::new(), Vec::new(), Vec::new()),
        };

        if let Some(dir) = &opts.save_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create save dir {:?}", dir))?;
        }

        let mut answers = Vec::new();
        if self.rag {
            for (index, context) in contexts.iter().enumerate() {
                tracing::debug!("RAG generation for context {}/{}", index + 1, contexts.len());
                let prompt = self.templates.medrag_prompt.render(&[
                    ("context", context.as_str()),
                    ("question", question),
                    ("options", options.as_str()),
                ]);
                let messages = [
                    Message::system(self.templates.medrag_system.source()),
                    Message::user(prompt),
                ];
                let raw = self.dispatcher.generate(&messages).await?;
                answers.push(self.collapse_whitespace(&raw));
            }
        } else {
            tracing::debug!("COT generation");
            let prompt = self
                .templates
                .cot_prompt
                .render(&[("question", question), ("options", options.as_str())]);
            let messages = [
                Message::system(self.templates.cot_system.source()),
                Message::user(prompt),
            ];
            let raw = self.dispatcher.generate(&messages).await?;
            answers.push(self.collapse_whitespace(&raw));
        }

        if let Some(dir) = &opts.save_dir {
            write_pretty(&dir.join(SNIPPETS_FILE), &snippets)?;
            write_pretty(&dir.join(RESPONSE_FILE), &answers)?;
            tracing::info!("Saved {} and {} to {:?}", SNIPPETS_FILE, RESPONSE_FILE, dir);
        }

        Ok(MedRagOutput {
            answer: Answer::from_answers(answers),
            snippets,
            scores,
        })
    }

    /// Join formatted snippets and cut to the context budget
    fn build_context(&self, snippets: &[RetrievedSnippet]) -> Result<String> {
        if snippets.is_empty() {
            return Ok(String::new());
        }

        let joined = snippets
            .iter()
            .enumerate()
            .map(|(rank, s)| format!("Document [{}] (Title: {}) {}", rank, s.title, s.content))
            .collect::<Vec<_>>()
            .join("\n");

        self.window.truncate(self.dispatcher.encoder(), &joined)
    }

    fn collapse_whitespace(&self, text: &str) -> String {
        self.whitespace.replace_all(text, " ").into_owned()
    }
}

/// `"A. ...\nB. ..."` in key order, empty when there are no options
pub fn format_options(options: Option<&BTreeMap<String, String>>) -> String {
    options
        .map(|opts| {
            opts.iter()
                .map(|(key, value)| format!("{}. {}", key, value))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn write_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut serializer)
        .with_context(|| format!("Failed to serialize {:?}", path))?;
    std::fs::write(path, buf).with_context(|| format!("Failed to write {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::context::tests::CharEncoder;
    use crate::llm::provider::{LLMProvider, ModelMetadata};
    use crate::llm::types::{CompletionResponse, Usage};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Replays a fixed reply and records every conversation it was sent
    struct StubProvider {
        reply: Result<String, String>,
        seen: Arc<Mutex<Vec<Vec<Message>>>>,
    }

    #[async_trait]
    impl LLMProvider for StubProvider {
        fn metadata(&self) -> ModelMetadata {
            ModelMetadata {
                id: "stub".to_string(),
                context_window: 2048,
            }
        }

        async fn completion(&self, messages: &[Message]) -> Result<CompletionResponse> {
            self.seen.lock().unwrap().push(messages.to_vec());
            match &self.reply {
                Ok(text) => Ok(CompletionResponse {
                    content: text.clone(),
                    usage: Usage::default(),
                }),
                Err(e) => bail!("{}", e),
            }
        }
    }

    struct StubRetriever {
        snippets: Vec<RetrievedSnippet>,
        scores: Vec<f32>,
        calls: AtomicUsize,
    }

    impl StubRetriever {
        fn new(snippets: Vec<RetrievedSnippet>, scores: Vec<f32>) -> Arc<Self> {
            Arc::new(Self {
                snippets,
                scores,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RetrievalSystem for StubRetriever {
        async fn retrieve(&self, _query: &str, _k: usize, _rrf_k: usize) -> Result<(Vec<RetrievedSnippet>, Vec<f32>)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.snippets.clone(), self.scores.clone()))
        }
    }

    type Seen = Arc<Mutex<Vec<Vec<Message>>>>;

    fn build(
        llm: &str,
        reply: Result<&str, &str>,
        rag: bool,
        retrieval: Option<Arc<dyn RetrievalSystem>>,
    ) -> (MedRag, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let provider = StubProvider {
            reply: reply.map(str::to_string).map_err(str::to_string),
            seen: seen.clone(),
        };
        let dispatcher = GenerationDispatcher::from_parts(
            BackendProfile::resolve(llm).unwrap(),
            Box::new(provider),
            Box::new(CharEncoder),
        );
        (MedRag::with_dispatcher(dispatcher, rag, retrieval).unwrap(), seen)
    }

    fn abc_options() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("B".to_string(), "Beta".to_string()),
            ("A".to_string(), "Alpha".to_string()),
        ])
    }

    #[test]
    fn test_format_options() {
        assert_eq!(format_options(Some(&abc_options())), "A. Alpha\nB. Beta");
        assert_eq!(format_options(None), "");
    }

    #[test]
    fn test_rag_without_retrieval_is_rejected() {
        let err = MedRag::new("OpenAI/gpt-4", true, None, &Config::default())
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<MedRagError>(),
            Some(MedRagError::RetrievalRequired)
        ));
    }

    #[tokio::test]
    async fn test_cot_answer_without_rag() {
        let retriever = StubRetriever::new(vec![RetrievedSnippet::new("T", "C")], vec![0.9]);
        let (medrag, seen) = build(
            "OpenAI/gpt-4",
            Ok("The answer is A."),
            false,
            Some(retriever.clone() as Arc<dyn RetrievalSystem>),
        );

        let output = medrag
            .answer("Which?", Some(&abc_options()), &AnswerOptions::default())
            .await
            .unwrap();

        assert_eq!(output.answer, Answer::Single("The answer is A.".to_string()));
        assert!(output.snippets.is_empty());
        assert!(output.scores.is_empty());
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0][0].content, medrag.templates().cot_system.source());
        assert!(seen[0][1].content.contains("Which?"));
        assert!(seen[0][1].content.contains("A. Alpha\nB. Beta"));
    }

    #[tokio::test]
    async fn test_rag_context_lists_documents() {
        let retriever = StubRetriever::new(vec![RetrievedSnippet::new("T", "C")], vec![0.9]);
        let (medrag, seen) = build(
            "OpenAI/gpt-4",
            Ok("{\"answer_choice\": \"A\"}"),
            true,
            Some(retriever.clone() as Arc<dyn RetrievalSystem>),
        );

        let output = medrag
            .answer("Which?", Some(&abc_options()), &AnswerOptions::default())
            .await
            .unwrap();

        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
        assert_eq!(output.scores, vec![0.9]);
        assert_eq!(output.snippets[0].title, "T");
        assert_eq!(output.answer.as_single(), Some("{\"answer_choice\": \"A\"}"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0][0].content, medrag.templates().medrag_system.source());
        assert!(seen[0][1].content.contains("Document [0] (Title: T) C"));
    }

    #[tokio::test]
    async fn test_zero_snippets_single_empty_context() {
        let retriever = StubRetriever::new(Vec::new(), Vec::new());
        let (medrag, seen) = build("OpenAI/gpt-4", Ok("B"), true, Some(retriever as Arc<dyn RetrievalSystem>));

        let output = medrag.answer("Which?", None, &AnswerOptions::default()).await.unwrap();
        assert_eq!(output.answer, Answer::Single("B".to_string()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let expected = medrag
            .templates()
            .medrag_prompt
            .render(&[("context", ""), ("question", "Which?"), ("options", "")]);
        assert_eq!(seen[0][1].content, expected);
    }

    #[test]
    fn test_context_truncated_to_budget() {
        // pmc_llama reserves 1024 tokens; CharEncoder counts chars
        let retriever = StubRetriever::new(Vec::new(), Vec::new());
        let (medrag, _) = build("axiong/PMC_LLaMA_13B", Ok("A"), true, Some(retriever as Arc<dyn RetrievalSystem>));

        let context = medrag.build_context(&[RetrievedSnippet::new("T", "x".repeat(5000))]).unwrap();
        assert_eq!(context.chars().count(), 1024);
        assert!(context.starts_with("Document [0] (Title: T) x"));
    }

    #[tokio::test]
    async fn test_whitespace_collapsed() {
        let (medrag, _) = build("OpenAI/gpt-4", Ok("A  is\n\ncorrect"), false, None);
        let output = medrag.answer("Q", None, &AnswerOptions::default()).await.unwrap();
        assert_eq!(output.answer.as_single(), Some("A is correct"));

        let (medrag, _) = build("OpenAI/gpt-4", Ok("\n A\t"), false, None);
        let output = medrag.answer("Q", None, &AnswerOptions::default()).await.unwrap();
        assert_eq!(output.answer.as_single(), Some(" A "));
    }

    #[tokio::test]
    async fn test_saves_snippets_and_answers() {
        let dir = tempdir().unwrap();
        let save_dir = dir.path().join("run");
        let mut snippet = RetrievedSnippet::new("T", "C");
        snippet.extra.insert("id".to_string(), serde_json::json!("doc-1"));
        let retriever = StubRetriever::new(vec![snippet], vec![0.5]);
        let (medrag, _) = build("OpenAI/gpt-4", Ok("A"), true, Some(retriever as Arc<dyn RetrievalSystem>));

        let opts = AnswerOptions {
            save_dir: Some(save_dir.clone()),
            ..AnswerOptions::default()
        };
        medrag.answer("Q", None, &opts).await.unwrap();

        let snippets: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(save_dir.join(SNIPPETS_FILE)).unwrap()).unwrap();
        assert_eq!(snippets[0]["id"], "doc-1");
        assert_eq!(snippets[0]["title"], "T");

        let raw = std::fs::read_to_string(save_dir.join(RESPONSE_FILE)).unwrap();
        assert_eq!(raw, "[\n    \"A\"\n]");
    }

    #[tokio::test]
    async fn test_failed_generation_writes_nothing() {
        let dir = tempdir().unwrap();
        let (medrag, _) = build("OpenAI/gpt-4", Err("backend down"), false, None);

        let opts = AnswerOptions {
            save_dir: Some(dir.path().to_path_buf()),
            ..AnswerOptions::default()
        };
        let err = medrag.answer("Q", None, &opts).await.unwrap_err();
        assert!(err.to_string().contains("backend down"));
        assert!(!dir.path().join(SNIPPETS_FILE).exists());
        assert!(!dir.path().join(RESPONSE_FILE).exists());
    }

    #[test]
    fn test_answer_serializes_untagged() {
        assert_eq!(serde_json::to_value(Answer::Single("A".into())).unwrap(), serde_json::json!("A"));
        assert_eq!(
            serde_json::to_value(Answer::Multiple(vec!["A".into(), "B".into()])).unwrap(),
            serde_json::json!(["A", "B"])
        );
    }
}
