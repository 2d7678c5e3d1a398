//! In-memory [`ContentStore`] that also serves BM25 lexical scores.
//!
//! One `RwLock` guards chunks, the fingerprint and alias indexes, and the
//! BM25 index together, so readers never observe them out of step. An id is
//! either a live chunk or an alias of one, never both.

use crate::embeddings::cosine_similarity;
use crate::error::CapabilityError;
use crate::lexical::Bm25Index;
use crate::models::Chunk;
use crate::traits::{ContentStore, LexicalIndex, UpsertOutcome};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

struct StoreState {
    chunks: HashMap<String, Chunk>,
    fingerprints: HashMap<String, BTreeSet<String>>,
    /// Alias id to the id of the chunk holding it.
    aliases: HashMap<String, String>,
    lexical: Bm25Index,
}

impl StoreState {
    fn new() -> Result<Self, CapabilityError> {
        Ok(Self {
            chunks: HashMap::new(),
            fingerprints: HashMap::new(),
            aliases: HashMap::new(),
            lexical: Bm25Index::new()?,
        })
    }

    fn link(&mut self, chunk: &Chunk) {
        self.fingerprints
            .entry(chunk.fingerprint.clone())
            .or_default()
            .insert(chunk.id.clone());
        for alias in &chunk.aliases {
            self.aliases.insert(alias.id.clone(), chunk.id.clone());
        }
    }

    fn unlink(&mut self, chunk: &Chunk) {
        if let Some(ids) = self.fingerprints.get_mut(&chunk.fingerprint) {
            ids.remove(&chunk.id);
            if ids.is_empty() {
                self.fingerprints.remove(&chunk.fingerprint);
            }
        }
        for alias in &chunk.aliases {
            if self.aliases.get(&alias.id) == Some(&chunk.id) {
                self.aliases.remove(&alias.id);
            }
        }
    }

    /// Takes `id` away from whichever other chunk lists it as an alias.
    fn release_alias(&mut self, id: &str, claimant: &str) {
        let Some(owner) = self.aliases.remove(id) else {
            return;
        };
        if owner != claimant {
            if let Some(chunk) = self.chunks.get_mut(&owner) {
                chunk.forget_alias(id);
            }
        }
    }

    fn put(&mut self, chunk: Chunk) -> Option<Chunk> {
        let previous = self.chunks.remove(&chunk.id);
        if let Some(previous) = &previous {
            self.unlink(previous);
        }
        self.release_alias(&chunk.id, &chunk.id);
        for alias in &chunk.aliases {
            self.release_alias(&alias.id, &chunk.id);
        }
        self.link(&chunk);
        self.chunks.insert(chunk.id.clone(), chunk);
        previous
    }
}

pub struct InMemoryContentStore {
    state: RwLock<StoreState>,
}

/// Last write wins by `updated_at`; equal timestamps resolve to the larger
/// fingerprint so competing writers converge on the same chunk.
fn supersedes(incoming: &Chunk, existing: &Chunk) -> bool {
    incoming.updated_at > existing.updated_at
        || (incoming.updated_at == existing.updated_at
            && incoming.fingerprint >= existing.fingerprint)
}

impl InMemoryContentStore {
    pub fn new() -> Result<Self, CapabilityError> {
        Self::from_chunks(Vec::new())
    }

    pub fn from_chunks(chunks: impl IntoIterator<Item = Chunk>) -> Result<Self, CapabilityError> {
        let mut state = StoreState::new()?;
        for chunk in chunks {
            state.lexical.insert(&chunk.id, &chunk.text)?;
            state.put(chunk);
        }
        state.lexical.commit()?;
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// All live chunks ordered by id.
    pub fn snapshot(&self) -> Result<Vec<Chunk>, CapabilityError> {
        let state = self.read()?;
        let mut chunks = state.chunks.values().cloned().collect::<Vec<_>>();
        chunks.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(chunks)
    }

    pub fn len(&self) -> Result<usize, CapabilityError> {
        Ok(self.read()?.chunks.len())
    }

    pub fn is_empty(&self) -> Result<bool, CapabilityError> {
        Ok(self.len()? == 0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>, CapabilityError> {
        self.state
            .read()
            .map_err(|_| CapabilityError::Unavailable("content store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>, CapabilityError> {
        self.state
            .write()
            .map_err(|_| CapabilityError::Unavailable("content store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn upsert(&self, chunk: Chunk) -> Result<UpsertOutcome, CapabilityError> {
        let mut state = self.write()?;
        if let Some(existing) = state.chunks.get(&chunk.id) {
            if !supersedes(&chunk, existing) {
                return Ok(UpsertOutcome::Stale);
            }
        }

        state.lexical.insert(&chunk.id, &chunk.text)?;
        state.lexical.commit()?;

        Ok(match state.put(chunk) {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn delete(&self, id: &str) -> Result<bool, CapabilityError> {
        let mut state = self.write()?;
        if !state.chunks.contains_key(id) {
            return Ok(false);
        }
        state.lexical.remove(id);
        state.lexical.commit()?;

        if let Some(removed) = state.chunks.remove(id) {
            state.unlink(&removed);
        }
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<Chunk>, CapabilityError> {
        Ok(self.read()?.chunks.get(id).cloned())
    }

    async fn find_candidates(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<Chunk>, CapabilityError> {
        let state = self.read()?;
        let mut scored = state
            .chunks
            .values()
            .map(|chunk| (cosine_similarity(query_embedding, &chunk.embedding), chunk))
            .collect::<Vec<_>>();
        scored.sort_by(|(left_score, left), (right_score, right)| {
            right_score
                .total_cmp(left_score)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(_, chunk)| chunk.clone())
            .collect())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<Chunk>, CapabilityError> {
        let state = self.read()?;
        Ok(state
            .fingerprints
            .get(fingerprint)
            .and_then(|ids| ids.iter().next())
            .and_then(|id| state.chunks.get(id))
            .cloned())
    }

    async fn find_by_alias(&self, alias: &str) -> Result<Option<Chunk>, CapabilityError> {
        let state = self.read()?;
        Ok(state
            .aliases
            .get(alias)
            .and_then(|owner| state.chunks.get(owner))
            .cloned())
    }

    async fn find_referencing(&self, id: &str) -> Result<Vec<Chunk>, CapabilityError> {
        let state = self.read()?;
        let names = |context: &[String]| context.iter().any(|context_id| context_id == id);
        let mut dependents = state
            .chunks
            .values()
            .filter(|chunk| {
                names(&chunk.thread_context)
                    || chunk.aliases.iter().any(|alias| names(&alias.thread_context))
            })
            .cloned()
            .collect::<Vec<_>>();
        dependents.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(dependents)
    }
}

impl LexicalIndex for InMemoryContentStore {
    fn scores(&self, query: &str, chunk_ids: &[String]) -> Result<Vec<f64>, CapabilityError> {
        self.read()?.lexical.scores(query, chunk_ids)
    }
}
