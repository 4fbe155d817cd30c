//! Retrieval collaborator.
//!
//! The orchestrator only needs ranked snippets and their scores; how they are
//! found is somebody else's job. `HttpRetriever` talks to a retrieval service
//! over JSON.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub const DEFAULT_RETRIEVER: &str = "RRF-4";
pub const DEFAULT_CORPUS: &str = "MedCorp";

/// One retrieved document. Fields beyond title/content are kept as returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedSnippet {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RetrievedSnippet {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            extra: serde_json::Map::new(),
        }
    }
}

#[async_trait]
pub trait RetrievalSystem: Send + Sync {
    /// Top `k` snippets for `query`, best first, with parallel scores.
    async fn retrieve(&self, query: &str, k: usize, rrf_k: usize) -> Result<(Vec<RetrievedSnippet>, Vec<f32>)>;
}

/// Retrieval service reached over HTTP
pub struct HttpRetriever {
    client: Client,
    url: String,
    retriever_name: String,
    corpus_name: String,
}

impl HttpRetriever {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            retriever_name: DEFAULT_RETRIEVER.to_string(),
            corpus_name: DEFAULT_CORPUS.to_string(),
        }
    }

    pub fn with_retriever(mut self, name: impl Into<String>) -> Self {
        self.retriever_name = name.into();
        self
    }

    pub fn with_corpus(mut self, name: impl Into<String>) -> Self {
        self.corpus_name = name.into();
        self
    }

    fn request_body<'a>(&'a self, query: &'a str, k: usize, rrf_k: usize) -> RetrieveRequest<'a> {
        RetrieveRequest {
            query,
            k,
            rrf_k,
            retriever_name: &self.retriever_name,
            corpus_name: &self.corpus_name,
        }
    }
}

#[async_trait]
impl RetrievalSystem for HttpRetriever {
    async fn retrieve(&self, query: &str, k: usize, rrf_k: usize) -> Result<(Vec<RetrievedSnippet>, Vec<f32>)> {
        tracing::debug!("Retrieving k={} rrf_k={} from {} ({})", k, rrf_k, self.corpus_name, self.retriever_name);

        let response = self
            .client
            .post(&self.url)
            .json(&self.request_body(query, k, rrf_k))
            .send()
            .await
            .with_context(|| format!("Failed to reach retrieval service at {}", self.url))?
            .error_for_status()
            .context("Retrieval service returned an error")?;

        let parsed: RetrieveResponse = response
            .json()
            .await
            .context("Failed to parse retrieval response")?;

        tracing::debug!("Retrieved {} snippets", parsed.snippets.len());
        Ok((parsed.snippets, parsed.scores))
    }
}

#[derive(Serialize)]
struct RetrieveRequest<'a> {
    query: &'a str,
    k: usize,
    rrf_k: usize,
    retriever_name: &'a str,
    corpus_name: &'a str,
}

#[derive(Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    snippets: Vec<RetrievedSnippet>,
    #[serde(default)]
    scores: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let retriever = HttpRetriever::new("http://localhost:8000/retrieve");
        let body = serde_json::to_value(retriever.request_body("chest pain", 32, 100)).unwrap();
        assert_eq!(
            body,
            json!({
                "query": "chest pain",
                "k": 32,
                "rrf_k": 100,
                "retriever_name": "RRF-4",
                "corpus_name": "MedCorp"
            })
        );
    }

    #[test]
    fn test_request_overrides() {
        let retriever = HttpRetriever::new("http://x")
            .with_retriever("MedCPT")
            .with_corpus("PubMed");
        let body = serde_json::to_value(retriever.request_body("q", 8, 60)).unwrap();
        assert_eq!(body["retriever_name"], "MedCPT");
        assert_eq!(body["corpus_name"], "PubMed");
    }

    #[test]
    fn test_snippet_keeps_unknown_fields() {
        let raw = json!({
            "snippets": [{"id": "pubmed23n0001_0", "title": "T", "content": "C", "contents": "T. C"}],
            "scores": [0.9]
        });
        let parsed: RetrieveResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.scores, vec![0.9]);

        let snippet = &parsed.snippets[0];
        assert_eq!(snippet.title, "T");
        assert_eq!(snippet.extra["id"], "pubmed23n0001_0");

        let written = serde_json::to_value(snippet).unwrap();
        assert_eq!(written["contents"], "T. C");
        assert_eq!(written["content"], "C");
    }

    #[test]
    fn test_empty_response() {
        let parsed: RetrieveResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.snippets.is_empty());
        assert!(parsed.scores.is_empty());
    }
}
