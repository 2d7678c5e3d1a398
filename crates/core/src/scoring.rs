//! Multi-signal relevance scoring.
//!
//! Stage A is cosine similarity clamped to `[0, 1]`. Stage B is query token
//! overlap with a capped exact-phrase boost. Stage C is an optional BM25
//! score normalized by the best candidate. The composite is the weighted sum
//! of the stages that actually ran, renormalized so their weights sum to 1.
//! Stage D optionally reranks the top composite candidates; the remaining
//! candidates keep their composite score and always follow the reranked ones.

use crate::chunking::normalize_whitespace;
use crate::config::ScoringConfig;
use crate::embeddings::cosine_similarity;
use crate::lexical::{token_set, tokenize};
use crate::models::{Chunk, ScoredChunk, StageReport};
use crate::traits::{Capability, LexicalIndex, Reranker};
use std::cmp::Ordering;
use std::time::Duration;
use tracing::{debug, warn};

/// Descending final score, then source-of-truth first, then most recently
/// updated, then id.
pub fn compare_ranked(left: &ScoredChunk, right: &ScoredChunk) -> Ordering {
    right
        .final_score()
        .total_cmp(&left.final_score())
        .then_with(|| right.chunk.source_of_truth.cmp(&left.chunk.source_of_truth))
        .then_with(|| right.chunk.updated_at.cmp(&left.chunk.updated_at))
        .then_with(|| left.chunk.id.cmp(&right.chunk.id))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ranking {
    pub chunks: Vec<ScoredChunk>,
    pub stages: StageReport,
    pub below_threshold: usize,
}

pub struct ScorerPipeline {
    config: ScoringConfig,
    lexical: Capability<dyn LexicalIndex>,
    reranker: Capability<dyn Reranker>,
    rerank_timeout: Option<Duration>,
}

impl ScorerPipeline {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            lexical: Capability::NotConfigured,
            reranker: Capability::NotConfigured,
            rerank_timeout: None,
        }
    }

    pub fn with_lexical_index(mut self, lexical: Capability<dyn LexicalIndex>) -> Self {
        self.lexical = lexical;
        self
    }

    pub fn with_reranker(
        mut self,
        reranker: Capability<dyn Reranker>,
        timeout: Option<Duration>,
    ) -> Self {
        self.reranker = reranker;
        self.rerank_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn vector_score(query_embedding: &[f32], chunk: &Chunk) -> f64 {
        cosine_similarity(query_embedding, &chunk.embedding).clamp(0.0, 1.0)
    }

    pub fn keyword_overlap(&self, query: &str, text: &str) -> f64 {
        let query_terms = token_set(query);
        if query_terms.is_empty() {
            return 0.0;
        }
        let text_terms = token_set(text);
        let shared = query_terms.intersection(&text_terms).count();
        let overlap = shared as f64 / query_terms.len() as f64;

        let phrase = normalize_whitespace(query).to_lowercase();
        let contains_phrase =
            !phrase.is_empty() && normalize_whitespace(text).to_lowercase().contains(&phrase);
        let boost = if contains_phrase {
            self.config.phrase_boost
        } else {
            0.0
        };

        (overlap + boost).min(self.config.max_lexical_score)
    }

    /// Weighted sum over the signals that were computed.
    pub fn combine(&self, vector: f64, keyword: f64, bm25: Option<f64>) -> f64 {
        let weights = self.config.weights;
        let mut total_weight = weights.vector + weights.keyword;
        let mut sum = weights.vector * vector + weights.keyword * keyword;
        if let Some(bm25) = bm25 {
            total_weight += weights.bm25;
            sum += weights.bm25 * bm25;
        }
        if total_weight <= 0.0 {
            0.0
        } else {
            sum / total_weight
        }
    }

    /// BM25 scores normalized by the best candidate, or `None` when the
    /// index is not configured or fails for any candidate.
    fn bm25_scores(&self, query: &str, candidates: &[Chunk]) -> Option<Vec<f64>> {
        let index = self.lexical.get()?;
        if tokenize(query).is_empty() {
            return None;
        }

        let ids = candidates
            .iter()
            .map(|chunk| chunk.id.clone())
            .collect::<Vec<_>>();
        let raw = match index.scores(query, &ids) {
            Ok(raw) => raw,
            Err(error) => {
                warn!(%error, "lexical index unavailable; skipping bm25 stage");
                return None;
            }
        };
        if raw.len() != candidates.len() || raw.iter().any(|score| !score.is_finite()) {
            warn!(
                expected = candidates.len(),
                returned = raw.len(),
                "lexical index returned unusable scores; skipping bm25 stage"
            );
            return None;
        }
        let raw = raw.into_iter().map(|score| score.max(0.0)).collect::<Vec<_>>();

        let best = raw.iter().copied().fold(0.0f64, f64::max);
        Some(
            raw.into_iter()
                .map(|score| if best > 0.0 { score / best } else { 0.0 })
                .collect(),
        )
    }

    /// Rescores the head of `ranked` in place. Returns whether it ran.
    async fn rerank(&self, query: &str, head: &mut [ScoredChunk]) -> bool {
        let Some(reranker) = self.reranker.get() else {
            return false;
        };
        if head.is_empty() {
            return false;
        }

        let scoring = async {
            let mut scores = Vec::with_capacity(head.len());
            for item in head.iter() {
                scores.push(reranker.score(query, &item.chunk.text).await?);
            }
            Ok::<_, crate::error::CapabilityError>(scores)
        };

        let outcome = match self.rerank_timeout {
            Some(limit) => match tokio::time::timeout(limit, scoring).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        timeout_ms = limit.as_millis() as u64,
                        "reranker timed out; keeping composite order"
                    );
                    return false;
                }
            },
            None => scoring.await,
        };

        match outcome {
            Ok(scores) => {
                for (item, score) in head.iter_mut().zip(scores) {
                    let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
                    item.rerank_score = Some(score);
                }
                true
            }
            Err(error) => {
                warn!(%error, "reranker unavailable; keeping composite order");
                false
            }
        }
    }

    pub async fn rank(
        &self,
        query: &str,
        query_embedding: &[f32],
        candidates: Vec<Chunk>,
        min_relevance: f64,
        limit: Option<usize>,
    ) -> Ranking {
        let bm25 = self.bm25_scores(query, &candidates);
        let mut stages = StageReport {
            bm25: bm25.is_some(),
            rerank: false,
        };

        let mut scored = candidates
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let vector_score = Self::vector_score(query_embedding, &chunk);
                let lexical_score = self.keyword_overlap(query, &chunk.text);
                let bm25_score = bm25.as_ref().map(|scores| scores[index]);
                let composite_score = self.combine(vector_score, lexical_score, bm25_score);
                ScoredChunk {
                    chunk,
                    vector_score,
                    lexical_score,
                    bm25_score,
                    rerank_score: None,
                    composite_score,
                }
            })
            .collect::<Vec<_>>();
        scored.sort_by(compare_ranked);

        let depth = self.config.rerank_depth.min(scored.len());
        let mut tail = scored.split_off(depth);
        let mut head = scored;
        if self.rerank(query, &mut head).await {
            stages.rerank = true;
            head.sort_by(compare_ranked);
        }
        head.append(&mut tail);
        let mut ranked = head;

        if let Some(top) = ranked.first() {
            debug!(
                top_score = top.final_score(),
                top_id = %top.chunk.id,
                candidates = ranked.len(),
                "scored candidates"
            );
        }

        let before = ranked.len();
        ranked.retain(|item| item.final_score() >= min_relevance);
        let below_threshold = before - ranked.len();

        if let Some(limit) = limit {
            ranked.truncate(limit);
        }

        Ranking {
            chunks: ranked,
            stages,
            below_threshold,
        }
    }
}
