pub mod answer;
pub mod chunking;
pub mod citation;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod lexical;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod scoring;
pub mod store;
pub mod traits;

pub use answer::{Answer, AnswerComposer, NO_RELEVANT_DOCUMENTS};
pub use chunking::{chunk_content, chunk_document, chunk_thread, normalize_whitespace};
pub use citation::{citations_for, CitationPolicy};
pub use classifier::{KeywordClassifier, LlmClassifier};
pub use config::{ChunkingConfig, RetrievalConfig, ScoringConfig, ScoringWeights};
pub use dedup::{fingerprint, Deduplicator};
pub use embeddings::{
    cosine_similarity, CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{CapabilityError, ConfigError, IngestError, RetrievalError};
pub use ingest::{
    discover_text_files, load_document, load_documents_best_effort, DocumentLoadReport,
    DocumentOptions, SkippedFile,
};
pub use lexical::Bm25Index;
pub use models::{
    AudienceMode, BatchReport, Chunk, ChunkAlias, Citation, Classification, EmptyReason,
    IngestReport, RawContent, RawDocument, RawMessage, RawThread, RetrievalQuery, RetrievalResult,
    ScoredChunk, StageReport, SyncReport,
};
pub use orchestrator::KnowledgeBase;
pub use providers::{HttpReranker, OllamaEmbedder, OllamaGenerator};
pub use scoring::ScorerPipeline;
pub use store::InMemoryContentStore;
pub use traits::{
    Capability, ContentStore, Generator, LexicalIndex, Reranker, UpsertOutcome,
    WorthinessClassifier,
};
