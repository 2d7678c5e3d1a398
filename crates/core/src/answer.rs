//! Turns a retrieval result into a cited answer.

use crate::models::{Citation, RetrievalResult, ScoredChunk};
use crate::traits::{Capability, Generator};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const NO_RELEVANT_DOCUMENTS: &str = "No relevant documents found.";

const FALLBACK_CONTEXTS: usize = 3;
const FALLBACK_MAX_CHARS: usize = 1_500;
const CONTEXT_MAX_CHARS: usize = 800;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

impl Answer {
    pub fn no_relevant_documents() -> Self {
        Self {
            answer: NO_RELEVANT_DOCUMENTS.to_string(),
            citations: Vec::new(),
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Context passages with source-of-truth chunks first. Authoritative
/// passages are labelled so the model does not let other passages override
/// them.
pub fn ordered_contexts(chunks: &[ScoredChunk]) -> Vec<String> {
    let (authoritative, supporting): (Vec<&ScoredChunk>, Vec<&ScoredChunk>) =
        chunks.iter().partition(|item| item.chunk.source_of_truth);

    authoritative
        .into_iter()
        .map(|item| {
            format!(
                "[authoritative] {}",
                truncate_chars(&item.chunk.text, CONTEXT_MAX_CHARS)
            )
        })
        .chain(
            supporting
                .into_iter()
                .map(|item| truncate_chars(&item.chunk.text, CONTEXT_MAX_CHARS)),
        )
        .collect()
}

/// Prompt asking a model to answer `question` from numbered passages.
pub fn grounded_prompt(question: &str, contexts: &[String]) -> String {
    let documents = contexts
        .iter()
        .enumerate()
        .map(|(index, text)| format!("[Document {}]\n{text}", index + 1))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "You are a knowledgeable assistant. Use the documents below to answer the question.\n\
         Documents marked [authoritative] are final; prefer them when documents disagree.\n\n\
         ---DOCUMENTS---\n{documents}\n---END DOCUMENTS---\n\n\
         Question: {question}\n\nAnswer:"
    )
}

fn fallback_answer(contexts: &[String]) -> String {
    let combined = contexts
        .iter()
        .take(FALLBACK_CONTEXTS)
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Based on the available knowledge:\n\n{}",
        truncate_chars(&combined, FALLBACK_MAX_CHARS)
    )
}

pub struct AnswerComposer {
    generator: Capability<dyn Generator>,
}

impl AnswerComposer {
    pub fn new(generator: Capability<dyn Generator>) -> Self {
        Self { generator }
    }

    pub async fn compose(&self, result: &RetrievalResult) -> Answer {
        if result.citations.is_empty() {
            info!(query = %result.query, reason = ?result.empty_reason, "no citable chunks");
            return Answer::no_relevant_documents();
        }

        let contexts = ordered_contexts(&result.chunks);
        let answer = match self.generator.get() {
            Some(generator) => match generator.generate(&result.query, &contexts).await {
                Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
                Ok(_) => {
                    warn!("generator returned an empty answer; using context summary");
                    fallback_answer(&contexts)
                }
                Err(error) => {
                    warn!(%error, "generation failed; using context summary");
                    fallback_answer(&contexts)
                }
            },
            None => fallback_answer(&contexts),
        };

        Answer {
            answer,
            citations: result.citations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::embeddings::Embedder;
    use crate::error::CapabilityError;
    use crate::models::{Classification, StageReport};
    use crate::orchestrator::KnowledgeBase;
    use crate::store::tests::chunk_at;
    use crate::store::InMemoryContentStore;
    use crate::traits::WorthinessClassifier;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl WorthinessClassifier for AcceptAll {
        async fn classify(&self, _text: &str) -> Result<Classification, CapabilityError> {
            Ok(Classification::Document)
        }
    }

    #[derive(Default)]
    struct RecordingGenerator {
        contexts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Generator for RecordingGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            context: &[String],
        ) -> Result<String, CapabilityError> {
            if let Ok(mut seen) = self.contexts.lock() {
                *seen = context.to_vec();
            }
            Ok(" Rotate keys from the admin console. ".to_string())
        }
    }

    struct OfflineGenerator;

    #[async_trait]
    impl Generator for OfflineGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            _context: &[String],
        ) -> Result<String, CapabilityError> {
            Err(CapabilityError::Unavailable("model offline".to_string()))
        }
    }

    fn scored(id: &str, text: &str, source_of_truth: bool) -> ScoredChunk {
        let mut chunk = chunk_at(id, text, Utc::now());
        chunk.source_of_truth = source_of_truth;
        ScoredChunk {
            chunk,
            vector_score: 0.9,
            lexical_score: 0.0,
            bm25_score: None,
            rerank_score: None,
            composite_score: 0.9,
        }
    }

    fn result_with(chunks: Vec<ScoredChunk>) -> RetrievalResult {
        RetrievalResult {
            query: "how do I rotate keys".to_string(),
            mode: crate::models::AudienceMode::Internal,
            citations: crate::citation::citations_for(&chunks),
            chunks,
            documents: None,
            empty_reason: None,
            stages: StageReport::default(),
        }
    }

    #[tokio::test]
    async fn customer_query_with_only_private_chunks_gets_canonical_answer() {
        let mut private = chunk_at("c", "internal escalation notes", Utc::now());
        private.public = false;
        private.source = "eng-chat".to_string();
        private.embedding = vec![0.8, 0.6];
        let base = KnowledgeBase::new(
            Arc::new(InMemoryContentStore::from_chunks(vec![private]).unwrap()),
            Arc::new(AxisEmbedder),
            Arc::new(AcceptAll),
            RetrievalConfig::default(),
        );

        let result = base
            .retrieve_text("escalation", "customer", None, Some(0.45))
            .await
            .unwrap();
        let generator = Arc::new(RecordingGenerator::default());
        let composer = AnswerComposer::new(Capability::Available(generator));
        let answer = composer.compose(&result).await;

        assert_eq!(answer, Answer::no_relevant_documents());
        assert_eq!(
            serde_json::to_value(&answer).unwrap(),
            serde_json::json!({"answer": "No relevant documents found.", "citations": []})
        );
    }

    #[tokio::test]
    async fn source_of_truth_context_goes_first() {
        let generator = Arc::new(RecordingGenerator::default());
        let composer = AnswerComposer::new(Capability::Available(generator.clone()));
        let result = result_with(vec![
            scored("chat", "someone said keys rotate weekly", false),
            scored("policy", "keys rotate every 90 days", true),
        ]);

        let answer = composer.compose(&result).await;
        assert_eq!(answer.answer, "Rotate keys from the admin console.");
        assert_eq!(answer.citations.len(), 2);

        let contexts = generator.contexts.lock().unwrap().clone();
        assert_eq!(contexts[0], "[authoritative] keys rotate every 90 days");
        assert_eq!(contexts[1], "someone said keys rotate weekly");
    }

    #[tokio::test]
    async fn falls_back_to_context_summary() {
        let result = result_with(vec![
            scored("a", "first passage", false),
            scored("b", "second passage", false),
        ]);
        let offline = AnswerComposer::new(Capability::Available(Arc::new(OfflineGenerator)));
        let answer = offline.compose(&result).await;
        assert_eq!(
            answer.answer,
            "Based on the available knowledge:\n\nfirst passage\n\nsecond passage"
        );

        let long = "x".repeat(2_000);
        let result = result_with(vec![
            scored("a", &long, false),
            scored("b", &long, false),
            scored("c", &long, false),
            scored("d", &long, false),
        ]);
        let unconfigured = AnswerComposer::new(Capability::NotConfigured);
        let answer = unconfigured.compose(&result).await;
        let summary = answer.answer.trim_start_matches("Based on the available knowledge:\n\n");
        assert_eq!(summary.chars().count(), FALLBACK_MAX_CHARS);
    }
}
