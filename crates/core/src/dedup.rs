//! Two-layer duplicate suppression plus the worthiness gate.
//!
//! Layer 1 remembers content fingerprints seen during one ingestion batch.
//! Layer 2 asks the store for an existing chunk with the same id, which turns
//! the write into an overwrite of that chunk, or with the same fingerprint,
//! which records the message as an alias of the chunk holding that content.

use crate::chunking::normalize_whitespace;
use crate::error::{IngestError, Result};
use crate::models::{Chunk, ChunkDraft, Classification};
use crate::traits::{ContentStore, WorthinessClassifier};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, warn};

/// SHA-256 of the lowercased, whitespace-normalized text.
pub fn fingerprint(text: &str) -> String {
    let normalized = normalize_whitespace(text).to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Insert {
        classification: Option<Classification>,
    },
    /// Overwrite `existing`, keeping its id.
    Update {
        existing: Box<Chunk>,
        classification: Option<Classification>,
    },
    /// Identical content is stored under another id; `owner` keeps its
    /// identity and gains the draft as an alias.
    Alias {
        owner: Box<Chunk>,
    },
    DuplicateInBatch,
    Noise,
}

#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fingerprint; `false` when it was already seen in this batch.
    pub fn first_sighting(&mut self, fingerprint: &str) -> bool {
        self.seen.insert(fingerprint.to_string())
    }

    /// Decides how a draft reaches the store. `force` bypasses the
    /// worthiness gate but never the duplicate checks.
    pub async fn admit<S, C>(
        &mut self,
        draft: &ChunkDraft,
        fingerprint: &str,
        store: &S,
        classifier: &C,
        force: bool,
    ) -> Result<Admission>
    where
        S: ContentStore + ?Sized,
        C: WorthinessClassifier + ?Sized,
    {
        if !self.first_sighting(fingerprint) {
            debug!(chunk_id = %draft.id, "dropping repeat fingerprint within batch");
            return Ok(Admission::DuplicateInBatch);
        }

        let classification = if draft.gated && !force {
            match classifier.classify(&draft.body).await {
                Ok(label) if label.is_noise() => {
                    debug!(chunk_id = %draft.id, "worthiness gate classified content as noise");
                    return Ok(Admission::Noise);
                }
                Ok(label) => Some(label),
                Err(error) => {
                    warn!(
                        chunk_id = %draft.id,
                        %error,
                        "worthiness classifier failed; admitting content"
                    );
                    None
                }
            }
        } else {
            None
        };

        if let Some(existing) = store.get(&draft.id).await.map_err(IngestError::Store)? {
            return Ok(Admission::Update {
                existing: Box::new(existing),
                classification,
            });
        }

        if let Some(owner) = store
            .find_by_fingerprint(fingerprint)
            .await
            .map_err(IngestError::Store)?
        {
            debug!(
                chunk_id = %draft.id,
                owner_id = %owner.id,
                "identical content already stored; recording alias"
            );
            return Ok(Admission::Alias {
                owner: Box::new(owner),
            });
        }

        Ok(Admission::Insert { classification })
    }
}
