//! Tunable constants for chunking, scoring and retrieval.
//!
//! Every field has a default, so a config file only needs the values it
//! overrides.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MIN_RELEVANCE: f64 = 0.45;
pub const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Upper bound on a chunk's own message or section text.
    pub max_chars: usize,
    /// Upper bound on the thread context prepended to a reply.
    pub context_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1_200,
            context_chars: 800,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chars == 0 {
            return Err(ConfigError::Invalid(
                "chunking.max_chars must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringWeights {
    pub vector: f64,
    pub keyword: f64,
    pub bm25: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            keyword: 0.25,
            bm25: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    /// Added to the keyword overlap when the whole query appears verbatim.
    pub phrase_boost: f64,
    /// Cap applied to overlap plus boost.
    pub max_lexical_score: f64,
    /// How many top composite candidates the reranker rescores.
    pub rerank_depth: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            phrase_boost: 0.2,
            max_lexical_score: 1.0,
            rerank_depth: 20,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = self.weights;
        for (name, value) in [
            ("vector", weights.vector),
            ("keyword", weights.keyword),
            ("bm25", weights.bm25),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "scoring.weights.{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if weights.vector + weights.keyword <= 0.0 {
            return Err(ConfigError::Invalid(
                "scoring.weights.vector + scoring.weights.keyword must be positive".to_string(),
            ));
        }
        if !self.phrase_boost.is_finite() || self.phrase_boost < 0.0 {
            return Err(ConfigError::Invalid(
                "scoring.phrase_boost must be non-negative".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_lexical_score) {
            return Err(ConfigError::Invalid(
                "scoring.max_lexical_score must be within [0, 1]".to_string(),
            ));
        }
        if self.rerank_depth == 0 {
            return Err(ConfigError::Invalid(
                "scoring.rerank_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_relevance: f64,
    /// Candidates fetched from the store before scoring.
    pub candidate_limit: usize,
    pub embed_timeout_ms: u64,
    pub rerank_timeout_ms: u64,
    /// Sources citable in customer mode regardless of the public flag.
    pub customer_sources: Vec<String>,
    pub scoring: ScoringConfig,
    pub chunking: ChunkingConfig,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_relevance: DEFAULT_MIN_RELEVANCE,
            candidate_limit: 200,
            embed_timeout_ms: 30_000,
            rerank_timeout_ms: 10_000,
            customer_sources: vec!["docs".to_string(), "tickets".to_string()],
            scoring: ScoringConfig::default(),
            chunking: ChunkingConfig::default(),
        }
    }
}

impl RetrievalConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: RetrievalConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError::Invalid("top_k must be positive".to_string()));
        }
        if self.candidate_limit == 0 {
            return Err(ConfigError::Invalid(
                "candidate_limit must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_relevance) {
            return Err(ConfigError::Invalid(format!(
                "min_relevance must be within [0, 1], got {}",
                self.min_relevance
            )));
        }
        self.scoring.validate()?;
        self.chunking.validate()
    }
}
