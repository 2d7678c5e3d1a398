use crate::error::CapabilityError;
use crate::models::{Chunk, Classification};
use async_trait::async_trait;
use std::sync::Arc;

/// Result of an upsert-by-identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// A newer revision of the same id is already stored.
    Stale,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn upsert(&self, chunk: Chunk) -> Result<UpsertOutcome, CapabilityError>;

    async fn delete(&self, id: &str) -> Result<bool, CapabilityError>;

    async fn get(&self, id: &str) -> Result<Option<Chunk>, CapabilityError>;

    async fn find_candidates(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<Chunk>, CapabilityError>;

    async fn find_by_fingerprint(&self, fingerprint: &str)
        -> Result<Option<Chunk>, CapabilityError>;

    /// The chunk that holds `alias` as a duplicate of its content.
    async fn find_by_alias(&self, alias: &str) -> Result<Option<Chunk>, CapabilityError>;

    /// Chunks whose thread context, or an alias's thread context, names `id`.
    async fn find_referencing(&self, id: &str) -> Result<Vec<Chunk>, CapabilityError>;
}

/// Term-frequency index scoring stored chunks against a query.
pub trait LexicalIndex: Send + Sync {
    /// One raw score per id in `chunk_ids`, in the same order.
    fn scores(&self, query: &str, chunk_ids: &[String]) -> Result<Vec<f64>, CapabilityError>;
}

/// Pairwise (query, text) relevance in `[0, 1]`.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn score(&self, query: &str, chunk_text: &str) -> Result<f64, CapabilityError>;
}

#[async_trait]
pub trait WorthinessClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, CapabilityError>;
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, context: &[String]) -> Result<String, CapabilityError>;
}

/// An optional capability. `NotConfigured` contributes nothing and is never
/// an error.
pub enum Capability<T: ?Sized> {
    Available(Arc<T>),
    NotConfigured,
}

impl<T: ?Sized> Capability<T> {
    pub fn get(&self) -> Option<&T> {
        match self {
            Capability::Available(inner) => Some(inner.as_ref()),
            Capability::NotConfigured => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available(_))
    }
}

impl<T: ?Sized> Clone for Capability<T> {
    fn clone(&self) -> Self {
        match self {
            Capability::Available(inner) => Capability::Available(Arc::clone(inner)),
            Capability::NotConfigured => Capability::NotConfigured,
        }
    }
}

impl<T: ?Sized> Default for Capability<T> {
    fn default() -> Self {
        Capability::NotConfigured
    }
}

impl<T: ?Sized> From<Option<Arc<T>>> for Capability<T> {
    fn from(value: Option<Arc<T>>) -> Self {
        value.map_or(Capability::NotConfigured, Capability::Available)
    }
}
