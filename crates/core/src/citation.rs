//! Audience filtering of ranked chunks and citation assembly.

use crate::config::RetrievalConfig;
use crate::models::{AudienceMode, Chunk, Citation, ScoredChunk};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Decides which chunks may be cited for an audience.
///
/// Internal queries may cite anything. Customer queries may cite a chunk only
/// when it is public or its source is one of the customer-safe sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitationPolicy {
    customer_sources: BTreeSet<String>,
}

impl Default for CitationPolicy {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

impl CitationPolicy {
    pub fn new<I, S>(customer_sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            customer_sources: customer_sources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self::new(config.customer_sources.iter().cloned())
    }

    pub fn customer_sources(&self) -> impl Iterator<Item = &str> {
        self.customer_sources.iter().map(String::as_str)
    }

    pub fn is_citable(&self, chunk: &Chunk, mode: AudienceMode) -> bool {
        match mode {
            AudienceMode::Internal => true,
            AudienceMode::Customer => {
                chunk.public || self.customer_sources.contains(&chunk.source)
            }
        }
    }

    /// Drops uncitable chunks, keeping the ranked order of the rest.
    pub fn filter(&self, ranked: Vec<ScoredChunk>, mode: AudienceMode) -> Vec<ScoredChunk> {
        let before = ranked.len();
        let kept = ranked
            .into_iter()
            .filter(|item| self.is_citable(&item.chunk, mode))
            .collect::<Vec<_>>();
        if kept.len() < before {
            debug!(%mode, withheld = before - kept.len(), "citation policy withheld chunks");
        }
        kept
    }
}

/// One citation per distinct (source, identifier), in ranked order.
pub fn citations_for(chunks: &[ScoredChunk]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .map(|item| Citation::from(&item.chunk))
        .filter(|citation| seen.insert((citation.source.clone(), citation.identifier.clone())))
        .collect()
}
