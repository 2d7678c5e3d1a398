//! Worthiness classifiers for the ingestion gate.

use crate::error::CapabilityError;
use crate::models::Classification;
use crate::traits::{Generator, WorthinessClassifier};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

const BUG_MARKERS: &[&str] = &["bug", "error", "crash", "fix", "broken"];
const IDEA_MARKERS: &[&str] = &["idea", "feature", "suggest", "could we", "what if"];
const FEEDBACK_MARKERS: &[&str] = &["feedback", "review", "opinion", "think"];

/// Word count above which unmarked text counts as a document.
const DOCUMENT_MIN_WORDS: usize = 20;

pub const CURATOR_PROMPT: &str = "You are a Knowledge Curator. Classify the input into exactly one word: NOISE, DOCUMENT, BUG, IDEA, or FEEDBACK.
NOISE: casual chatter, greetings, short acks, scheduling, vague thoughts.
DOCUMENT: technical facts, specs, fixes, how-to guides.
BUG: bug reports with repro steps or errors.
IDEA: feature requests or product suggestions.
FEEDBACK: constructive user feedback.
Output ONLY the single label word.";

/// Keyword heuristics. Needs no model.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn classify_sync(&self, text: &str) -> Classification {
        let lowered = text.to_lowercase();
        let mentions = |markers: &[&str]| markers.iter().any(|marker| lowered.contains(marker));

        if mentions(BUG_MARKERS) {
            Classification::Bug
        } else if mentions(IDEA_MARKERS) {
            Classification::Idea
        } else if mentions(FEEDBACK_MARKERS) {
            Classification::Feedback
        } else if text.split_whitespace().count() > DOCUMENT_MIN_WORDS {
            Classification::Document
        } else {
            Classification::Noise
        }
    }
}

#[async_trait]
impl WorthinessClassifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, CapabilityError> {
        Ok(self.classify_sync(text))
    }
}

/// Asks a language model for a label from the fixed vocabulary.
pub struct LlmClassifier {
    generator: Arc<dyn Generator>,
}

impl LlmClassifier {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }
}

/// First label of the vocabulary that appears in a model reply. Replies
/// without one are treated as noise.
pub fn parse_label(reply: &str) -> Classification {
    let cleaned = reply.trim().to_uppercase();
    Classification::ALL
        .into_iter()
        .find(|label| cleaned.contains(label.as_str()))
        .unwrap_or_else(|| {
            let preview = cleaned.chars().take(50).collect::<String>();
            warn!(reply = %preview, "could not parse classification");
            Classification::Noise
        })
}

#[async_trait]
impl WorthinessClassifier for LlmClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, CapabilityError> {
        let prompt = format!("{CURATOR_PROMPT}\n\nInput: {text}");
        let reply = self.generator.generate(&prompt, &[]).await?;
        let label = parse_label(&reply);
        debug!(label = label.as_str(), "classified content");
        Ok(label)
    }
}
