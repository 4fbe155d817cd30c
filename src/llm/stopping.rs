//! Early stopping for local generation.
//!
//! A criterion is consulted once per generated token with the full token
//! sequence (prompt included) and decides whether decoding should end.

use super::context::TextEncoder;
use anyhow::Result;

/// Phrases that end meditron generations
pub const MEDITRON_STOP_PHRASES: [&str; 3] = ["###", "User:", "\n\n\n"];

pub trait StoppingCriterion: Send + Sync {
    fn should_stop(&self, tokens: &[u32]) -> Result<bool>;
}

/// Stop phrases plus the prompt offset they are scanned from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopCondition {
    pub stop_phrases: Vec<String>,
    /// Token length of the rendered prompt
    pub input_length: usize,
}

impl StopCondition {
    pub fn new<I, S>(stop_phrases: I, input_length: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stop_phrases: stop_phrases.into_iter().map(Into::into).collect(),
            input_length,
        }
    }

    pub fn meditron(input_length: usize) -> Self {
        Self::new(MEDITRON_STOP_PHRASES, input_length)
    }
}

/// Stops as soon as any phrase appears in the text generated after the prompt.
///
/// Only the tokens past `input_length` are decoded, so phrases inside the
/// prompt never trigger a stop.
pub struct StopPhraseCriterion<'a> {
    condition: StopCondition,
    decoder: &'a dyn TextEncoder,
}

impl<'a> StopPhraseCriterion<'a> {
    pub fn new(condition: StopCondition, decoder: &'a dyn TextEncoder) -> Self {
        Self { condition, decoder }
    }

    /// Check an already decoded post-prompt span.
    pub fn matches(&self, generated: &str) -> bool {
        self.condition
            .stop_phrases
            .iter()
            .any(|phrase| generated.contains(phrase.as_str()))
    }
}

impl StoppingCriterion for StopPhraseCriterion<'_> {
    fn should_stop(&self, tokens: &[u32]) -> Result<bool> {
        let start = self.condition.input_length.min(tokens.len());
        let generated = self.decoder.decode(&tokens[start..])?;
        Ok(self.matches(&generated))
    }
}

/// Stops when the last token is one of several end tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndTokenCriterion {
    pub end_tokens: Vec<u32>,
}

impl EndTokenCriterion {
    pub fn new(end_tokens: Vec<u32>) -> Self {
        Self { end_tokens }
    }

    pub fn is_end(&self, token: u32) -> bool {
        self.end_tokens.contains(&token)
    }
}

impl StoppingCriterion for EndTokenCriterion {
    fn should_stop(&self, tokens: &[u32]) -> Result<bool> {
        Ok(tokens.last().is_some_and(|t| self.is_end(*t)))
    }
}
