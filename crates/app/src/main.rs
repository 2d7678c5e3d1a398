use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use recall_core::{
    load_documents_best_effort, AnswerComposer, AudienceMode, Capability, CharacterNgramEmbedder,
    Chunk, DocumentOptions, Embedder, Generator, HttpReranker, InMemoryContentStore,
    KeywordClassifier, KnowledgeBase, LexicalIndex, LlmClassifier, OllamaEmbedder,
    OllamaGenerator, RawContent, RawThread, Reranker, RetrievalConfig, RetrievalQuery,
    RetrievalResult, WorthinessClassifier,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "recall", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON snapshot holding the content store between runs
    #[arg(long, env = "RECALL_STORE", default_value = "recall-store.json")]
    store: PathBuf,

    /// Retrieval config file (JSON); built-in defaults when omitted
    #[arg(long, env = "RECALL_CONFIG")]
    config: Option<PathBuf>,

    /// Ollama base URL; the local trigram embedder is used when omitted
    #[arg(long, env = "OLLAMA_URL")]
    ollama_url: Option<String>,

    /// Ollama embedding model
    #[arg(long, env = "RECALL_EMBED_MODEL", default_value = "nomic-embed-text")]
    embed_model: String,

    /// Dimensionality of the embedding model
    #[arg(long, env = "RECALL_EMBED_DIMENSIONS", default_value = "768")]
    embed_dimensions: usize,

    /// Ollama generation model, used for answers and worthiness classification
    #[arg(long, env = "RECALL_GENERATE_MODEL")]
    generate_model: Option<String>,

    /// Reranker base URL serving `/rerank`
    #[arg(long, env = "RECALL_RERANKER_URL")]
    reranker_url: Option<String>,

    /// Disable the BM25 scoring stage.
    #[arg(long, default_value_t = false)]
    no_bm25: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a folder of markdown and text files as documents.
    IngestDocs {
        /// Folder that contains documents recursively.
        #[arg(long)]
        folder: PathBuf,
        /// Source tag for citations.
        #[arg(long, default_value = "docs")]
        source: String,
        /// Mark documents as visible to customers.
        #[arg(long, default_value_t = false)]
        public: bool,
        /// Mark documents as authoritative.
        #[arg(long, default_value_t = false)]
        source_of_truth: bool,
    },
    /// Ingest one conversation thread from a JSON file.
    IngestThread {
        #[arg(long)]
        file: PathBuf,
        /// Store messages the worthiness gate would reject.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Replace the text of a stored message.
    Edit {
        #[arg(long)]
        id: String,
        #[arg(long)]
        text: String,
    },
    /// Remove a stored message.
    Delete {
        #[arg(long)]
        id: String,
    },
    /// Answer a question with citations.
    Ask {
        #[arg(long)]
        query: String,
        /// Audience: internal or customer.
        #[arg(long, default_value = "internal")]
        mode: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        min_relevance: Option<f64>,
        /// Include the text of every cited chunk.
        #[arg(long, default_value_t = false)]
        documents: bool,
        /// Print the answer as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Print per-chunk scores.
        #[arg(long, default_value_t = false)]
        explain: bool,
    },
}

async fn load_store(path: &Path) -> anyhow::Result<InMemoryContentStore> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(InMemoryContentStore::new()?);
    }
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading store snapshot {}", path.display()))?;
    let chunks: Vec<Chunk> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing store snapshot {}", path.display()))?;
    Ok(InMemoryContentStore::from_chunks(chunks)?)
}

async fn save_store(path: &Path, store: &InMemoryContentStore) -> anyhow::Result<()> {
    let snapshot = serde_json::to_string_pretty(&store.snapshot()?)?;
    tokio::fs::write(path, snapshot)
        .await
        .with_context(|| format!("writing store snapshot {}", path.display()))?;
    Ok(())
}

fn print_explain(result: &RetrievalResult) {
    println!(
        "explain: mode={} bm25={} rerank={} empty_reason={:?}",
        result.mode, result.stages.bm25, result.stages.rerank, result.empty_reason
    );
    for item in &result.chunks {
        println!(
            "explain: chunk={} final={:.4} composite={:.4} vector={:.4} keyword={:.4} bm25={} rerank={}",
            item.chunk.id,
            item.final_score(),
            item.composite_score,
            item.vector_score,
            item.lexical_score,
            item.bm25_score.map_or("-".to_string(), |score| format!("{score:.4}")),
            item.rerank_score.map_or("-".to_string(), |score| format!("{score:.4}")),
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RetrievalConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RetrievalConfig::default(),
    };

    let embedder: Arc<dyn Embedder> = match &cli.ollama_url {
        Some(url) => Arc::new(OllamaEmbedder::new(url, &cli.embed_model, cli.embed_dimensions)?),
        None => Arc::new(CharacterNgramEmbedder::default()),
    };
    let generator: Capability<dyn Generator> = match (&cli.ollama_url, &cli.generate_model) {
        (Some(url), Some(model)) => {
            Capability::Available(Arc::new(OllamaGenerator::new(url, model.as_str())?))
        }
        _ => Capability::NotConfigured,
    };
    let classifier: Arc<dyn WorthinessClassifier> = match &generator {
        Capability::Available(generator) => Arc::new(LlmClassifier::new(Arc::clone(generator))),
        Capability::NotConfigured => Arc::new(KeywordClassifier),
    };
    let reranker: Capability<dyn Reranker> = match &cli.reranker_url {
        Some(url) => Capability::Available(Arc::new(HttpReranker::new(url)?)),
        None => Capability::NotConfigured,
    };

    let store = Arc::new(load_store(&cli.store).await?);
    let lexical: Capability<dyn LexicalIndex> = if cli.no_bm25 {
        Capability::NotConfigured
    } else {
        Capability::Available(store.clone())
    };

    let base = KnowledgeBase::new(store.clone(), embedder, classifier, config)
        .with_lexical_index(lexical)
        .with_reranker(reranker);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        chunks = store.len()?,
        "recall boot"
    );

    match cli.command {
        Command::IngestDocs {
            folder,
            source,
            public,
            source_of_truth,
        } => {
            let options = DocumentOptions {
                source,
                public,
                source_of_truth,
            };
            let loaded = load_documents_best_effort(&folder, &options)?;
            for skipped in &loaded.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
            }

            let items = loaded
                .documents
                .into_iter()
                .map(RawContent::Document)
                .collect::<Vec<_>>();
            let report = base.ingest_batch(items, false).await;
            for skipped in &report.skipped {
                warn!(item = %skipped.label, reason = %skipped.reason, "skipped document");
            }
            save_store(&cli.store, &store).await?;

            println!(
                "inserted={} updated={} duplicates={} skipped_files={} failed={}",
                report.totals.inserted,
                report.totals.updated,
                report.totals.duplicates,
                loaded.skipped_files.len(),
                report.skipped.len()
            );
        }
        Command::IngestThread { file, force } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading thread {}", file.display()))?;
            let thread: RawThread = serde_json::from_str(&raw)
                .with_context(|| format!("parsing thread {}", file.display()))?;

            let report = base.ingest(RawContent::Thread(thread), force).await?;
            save_store(&cli.store, &store).await?;

            println!(
                "inserted={} updated={} skipped_as_noise={} duplicates={}",
                report.inserted, report.updated, report.skipped_as_noise, report.duplicates
            );
        }
        Command::Edit { id, text } => {
            let report = base.on_edit(&id, &text).await?;
            save_store(&cli.store, &store).await?;
            println!(
                "updated={} removed={} rebuilt_dependents={}",
                report.updated, report.removed, report.rebuilt_dependents
            );
        }
        Command::Delete { id } => {
            let report = base.on_delete(&id).await?;
            save_store(&cli.store, &store).await?;
            println!(
                "removed={} rebuilt_dependents={}",
                report.removed, report.rebuilt_dependents
            );
        }
        Command::Ask {
            query,
            mode,
            top_k,
            min_relevance,
            documents,
            json,
            explain,
        } => {
            let mode = mode.parse::<AudienceMode>()?;
            let request = RetrievalQuery {
                text: query,
                mode,
                top_k,
                min_relevance,
                include_documents: documents,
            };
            let result = base.retrieve(&request).await?;
            let answer = AnswerComposer::new(generator).compose(&result).await;

            if json {
                let mut payload = serde_json::to_value(&answer)?;
                if let Some(texts) = &result.documents {
                    payload["documents"] = json!(texts);
                }
                if explain {
                    payload["explain"] = json!({
                        "stages": result.stages,
                        "empty_reason": result.empty_reason,
                        "chunks": result.chunks,
                    });
                }
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("{}", answer.answer);
                for citation in &answer.citations {
                    let visibility = if citation.public { "public" } else { "internal" };
                    println!("  [{}] {} ({visibility})", citation.source, citation.identifier);
                }
                if let Some(texts) = &result.documents {
                    for (index, text) in texts.iter().enumerate() {
                        println!("document {}:\n{text}", index + 1);
                    }
                }
                if explain {
                    print_explain(&result);
                }
            }
        }
    }

    Ok(())
}
