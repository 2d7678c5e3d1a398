use crate::error::RetrievalError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Worthiness label assigned to incoming content before indexing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Document,
    Bug,
    Idea,
    Feedback,
    Noise,
}

impl Classification {
    pub const ALL: [Classification; 5] = [
        Classification::Noise,
        Classification::Document,
        Classification::Bug,
        Classification::Idea,
        Classification::Feedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Document => "DOCUMENT",
            Classification::Bug => "BUG",
            Classification::Idea => "IDEA",
            Classification::Feedback => "FEEDBACK",
            Classification::Noise => "NOISE",
        }
    }

    pub fn is_noise(&self) -> bool {
        matches!(self, Classification::Noise)
    }
}

/// The retrievable unit stored in the content store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    /// Normalized text that was embedded, including any thread context.
    pub text: String,
    /// The chunk's own message or section text without thread context.
    pub body: String,
    pub embedding: Vec<f32>,
    pub source: String,
    pub identifier: Option<String>,
    pub author: Option<String>,
    pub public: bool,
    pub source_of_truth: bool,
    /// Ids of the thread root and prior replies, resolved by lookup.
    pub thread_context: Vec<String>,
    pub fingerprint: String,
    pub classification: Option<Classification>,
    /// Other messages whose identical content is held by this chunk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<ChunkAlias>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    pub fn citation_identifier(&self) -> &str {
        self.identifier.as_deref().unwrap_or(&self.id)
    }

    pub fn alias(&self, id: &str) -> Option<&ChunkAlias> {
        self.aliases.iter().find(|alias| alias.id == id)
    }

    /// Adds `alias`, replacing an earlier entry with the same id.
    pub fn record_alias(&mut self, alias: ChunkAlias) {
        match self.aliases.iter_mut().find(|entry| entry.id == alias.id) {
            Some(entry) => *entry = alias,
            None => self.aliases.push(alias),
        }
    }

    pub fn forget_alias(&mut self, id: &str) -> bool {
        let before = self.aliases.len();
        self.aliases.retain(|alias| alias.id != id);
        self.aliases.len() != before
    }
}

/// Identity and visibility of a message stored as a duplicate of another
/// chunk's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkAlias {
    pub id: String,
    pub source: String,
    pub identifier: Option<String>,
    pub author: Option<String>,
    pub public: bool,
    pub source_of_truth: bool,
    pub thread_context: Vec<String>,
}

impl From<&ChunkDraft> for ChunkAlias {
    fn from(draft: &ChunkDraft) -> Self {
        Self {
            id: draft.id.clone(),
            source: draft.source.clone(),
            identifier: draft.identifier.clone(),
            author: draft.author.clone(),
            public: draft.public,
            source_of_truth: draft.source_of_truth,
            thread_context: draft.thread_context.clone(),
        }
    }
}

impl ChunkAlias {
    /// A standalone chunk for this message carrying `owner`'s content.
    pub fn detach(&self, owner: &Chunk, updated_at: DateTime<Utc>) -> Chunk {
        Chunk {
            id: self.id.clone(),
            text: owner.text.clone(),
            body: owner.body.clone(),
            embedding: owner.embedding.clone(),
            source: self.source.clone(),
            identifier: self.identifier.clone(),
            author: self.author.clone(),
            public: self.public,
            source_of_truth: self.source_of_truth,
            thread_context: self.thread_context.clone(),
            fingerprint: owner.fingerprint.clone(),
            classification: owner.classification,
            aliases: Vec::new(),
            created_at: updated_at,
            updated_at,
        }
    }
}

/// An unsaved chunk produced by the chunker, before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkDraft {
    pub id: String,
    pub text: String,
    pub body: String,
    pub source: String,
    pub identifier: Option<String>,
    pub author: Option<String>,
    pub public: bool,
    pub source_of_truth: bool,
    pub thread_context: Vec<String>,
    /// Whether the worthiness gate applies to this draft.
    pub gated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub text: String,
}

/// A conversational thread: the first message is the root, the rest are
/// replies in posting order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawThread {
    pub source: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub source_of_truth: bool,
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub source_of_truth: bool,
    #[serde(default)]
    pub sections: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawContent {
    Thread(RawThread),
    Document(RawDocument),
}

impl RawContent {
    pub fn label(&self) -> String {
        match self {
            RawContent::Thread(thread) => format!(
                "thread {}",
                thread
                    .messages
                    .first()
                    .map(|message| message.id.as_str())
                    .unwrap_or("<empty>")
            ),
            RawContent::Document(document) => format!("document {}", document.id),
        }
    }
}

/// Audience a query is answered for. Parsing never falls back to a default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AudienceMode {
    Internal,
    Customer,
}

impl FromStr for AudienceMode {
    type Err = RetrievalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "internal" => Ok(AudienceMode::Internal),
            "customer" => Ok(AudienceMode::Customer),
            _ => Err(RetrievalError::InvalidMode(value.to_string())),
        }
    }
}

impl fmt::Display for AudienceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudienceMode::Internal => f.write_str("internal"),
            AudienceMode::Customer => f.write_str("customer"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalQuery {
    pub text: String,
    pub mode: AudienceMode,
    pub top_k: Option<usize>,
    pub min_relevance: Option<f64>,
    /// Attach the text of every cited chunk to the result.
    pub include_documents: bool,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, mode: AudienceMode) -> Self {
        Self {
            text: text.into(),
            mode,
            top_k: None,
            min_relevance: None,
            include_documents: false,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_min_relevance(mut self, min_relevance: f64) -> Self {
        self.min_relevance = Some(min_relevance);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub vector_score: f64,
    pub lexical_score: f64,
    pub bm25_score: Option<f64>,
    pub rerank_score: Option<f64>,
    pub composite_score: f64,
}

impl ScoredChunk {
    /// Ordering key: the rerank score when the chunk was reranked.
    pub fn final_score(&self) -> f64 {
        self.rerank_score.unwrap_or(self.composite_score)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Citation {
    pub source: String,
    #[serde(rename = "filename_or_identifier")]
    pub identifier: String,
    pub public: bool,
}

impl From<&Chunk> for Citation {
    fn from(chunk: &Chunk) -> Self {
        Self {
            source: chunk.source.clone(),
            identifier: chunk.citation_identifier().to_string(),
            public: chunk.public,
        }
    }
}

/// Why a retrieval produced no chunks. The payload is the same empty list
/// in every case.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyReason {
    EmptyStore,
    BelowThreshold,
    FilteredByPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub query: String,
    pub mode: AudienceMode,
    pub chunks: Vec<ScoredChunk>,
    pub citations: Vec<Citation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_reason: Option<EmptyReason>,
    pub stages: StageReport,
}

/// Which optional scoring stages contributed to a ranking.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageReport {
    pub bm25: bool,
    pub rerank: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped_as_noise: usize,
    pub duplicates: usize,
}

impl IngestReport {
    pub fn merge(&mut self, other: IngestReport) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped_as_noise += other.skipped_as_noise;
        self.duplicates += other.duplicates;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedItem {
    pub label: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub totals: IngestReport,
    pub skipped: Vec<SkippedItem>,
}

/// Outcome of an edit or delete sync event.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub updated: usize,
    pub removed: usize,
    pub rebuilt_dependents: usize,
}
