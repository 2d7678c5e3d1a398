use crate::chunking::{
    chunk_content, draft_message, normalize_whitespace, piece_id, ContextEntry, PIECE_SEPARATOR,
};
use crate::citation::{citations_for, CitationPolicy};
use crate::config::RetrievalConfig;
use crate::dedup::{fingerprint, Admission, Deduplicator};
use crate::embeddings::Embedder;
use crate::error::{CapabilityError, IngestError, RetrievalError};
use crate::models::{
    AudienceMode, BatchReport, Chunk, ChunkAlias, ChunkDraft, Classification, EmptyReason,
    IngestReport, RawContent, RetrievalQuery, RetrievalResult, SkippedItem, StageReport,
    SyncReport,
};
use crate::scoring::ScorerPipeline;
use crate::traits::{
    Capability, ContentStore, LexicalIndex, Reranker, UpsertOutcome, WorthinessClassifier,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A fresh `updated_at` that is strictly later than `previous`.
pub fn next_revision(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(previous) if now <= previous => previous + ChronoDuration::microseconds(1),
        _ => now,
    }
}

/// Message id a chunk id belongs to, without a `~N` piece suffix.
fn message_id(chunk_id: &str) -> &str {
    match chunk_id.rsplit_once(PIECE_SEPARATOR) {
        Some((head, number)) if number.parse::<usize>().is_ok_and(|n| n >= 2) => head,
        _ => chunk_id,
    }
}

/// Where a message id lives: as a chunk, or as an alias on another chunk.
enum Located {
    Stored(Chunk),
    Alias { owner: Chunk, alias: ChunkAlias },
}

/// Ingestion and retrieval over one content store.
pub struct KnowledgeBase<S>
where
    S: ContentStore,
{
    store: Arc<S>,
    embedder: Arc<dyn Embedder>,
    classifier: Arc<dyn WorthinessClassifier>,
    scorer: ScorerPipeline,
    policy: CitationPolicy,
    config: RetrievalConfig,
}

impl<S> KnowledgeBase<S>
where
    S: ContentStore,
{
    pub fn new(
        store: Arc<S>,
        embedder: Arc<dyn Embedder>,
        classifier: Arc<dyn WorthinessClassifier>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            classifier,
            scorer: ScorerPipeline::new(config.scoring),
            policy: CitationPolicy::from_config(&config),
            config,
        }
    }

    pub fn with_lexical_index(mut self, lexical: Capability<dyn LexicalIndex>) -> Self {
        self.scorer = self.scorer.with_lexical_index(lexical);
        self
    }

    pub fn with_reranker(mut self, reranker: Capability<dyn Reranker>) -> Self {
        let timeout = Duration::from_millis(self.config.rerank_timeout_ms);
        self.scorer = self.scorer.with_reranker(reranker, Some(timeout));
        self
    }

    pub fn with_policy(mut self, policy: CitationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let millis = self.config.embed_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(millis), self.embedder.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout {
                stage: "embedding",
                millis,
            }),
        }
    }

    /// Parses `mode` strictly before running [`KnowledgeBase::retrieve`].
    pub async fn retrieve_text(
        &self,
        query_text: &str,
        mode: &str,
        top_k: Option<usize>,
        min_relevance: Option<f64>,
    ) -> Result<RetrievalResult, RetrievalError> {
        let mode = mode.parse::<AudienceMode>()?;
        let mut query = RetrievalQuery::new(query_text, mode);
        query.top_k = top_k;
        query.min_relevance = min_relevance;
        self.retrieve(&query).await
    }

    pub async fn retrieve(
        &self,
        query: &RetrievalQuery,
    ) -> Result<RetrievalResult, RetrievalError> {
        let text = query.text.trim();
        if text.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }

        let top_k = query.top_k.unwrap_or(self.config.top_k);
        if top_k == 0 {
            return Err(RetrievalError::InvalidArgument("top_k must be positive".to_string()));
        }
        let min_relevance = query.min_relevance.unwrap_or(self.config.min_relevance);
        if !(0.0..=1.0).contains(&min_relevance) {
            return Err(RetrievalError::InvalidArgument(format!(
                "min_relevance must be within [0, 1], got {min_relevance}"
            )));
        }

        let query_embedding = self.embed(text).await.map_err(RetrievalError::Embedding)?;
        let candidates = self
            .store
            .find_candidates(&query_embedding, self.config.candidate_limit)
            .await
            .map_err(RetrievalError::Store)?;

        let mut result = RetrievalResult {
            query: text.to_string(),
            mode: query.mode,
            chunks: Vec::new(),
            citations: Vec::new(),
            documents: None,
            empty_reason: None,
            stages: StageReport::default(),
        };

        if candidates.is_empty() {
            info!(mode = %query.mode, "content store is empty");
            result.empty_reason = Some(EmptyReason::EmptyStore);
            if query.include_documents {
                result.documents = Some(Vec::new());
            }
            return Ok(result);
        }

        let candidate_count = candidates.len();
        let ranking = self
            .scorer
            .rank(text, &query_embedding, candidates, min_relevance, None)
            .await;
        let relevant = ranking.chunks.len();

        let mut chunks = self.policy.filter(ranking.chunks, query.mode);
        chunks.truncate(top_k);

        if chunks.is_empty() {
            result.empty_reason = Some(if relevant == 0 {
                EmptyReason::BelowThreshold
            } else {
                EmptyReason::FilteredByPolicy
            });
        }

        info!(
            mode = %query.mode,
            candidates = candidate_count,
            below_threshold = ranking.below_threshold,
            kept = chunks.len(),
            bm25 = ranking.stages.bm25,
            rerank = ranking.stages.rerank,
            "retrieval complete"
        );

        result.citations = citations_for(&chunks);
        if query.include_documents {
            result.documents = Some(chunks.iter().map(|item| item.chunk.text.clone()).collect());
        }
        result.stages = ranking.stages;
        result.chunks = chunks;
        Ok(result)
    }

    pub async fn ingest(
        &self,
        content: RawContent,
        force: bool,
    ) -> Result<IngestReport, IngestError> {
        let mut dedup = Deduplicator::new();
        self.ingest_with(&content, force, &mut dedup).await
    }

    /// Ingests every item, recording failures instead of aborting. The
    /// in-batch fingerprint set spans all items.
    pub async fn ingest_batch(&self, items: Vec<RawContent>, force: bool) -> BatchReport {
        let mut dedup = Deduplicator::new();
        let mut report = BatchReport::default();
        for item in items {
            match self.ingest_with(&item, force, &mut dedup).await {
                Ok(totals) => report.totals.merge(totals),
                Err(error) => {
                    warn!(item = %item.label(), %error, "skipping item");
                    report.skipped.push(SkippedItem {
                        label: item.label(),
                        reason: error.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn ingest_with(
        &self,
        content: &RawContent,
        force: bool,
        dedup: &mut Deduplicator,
    ) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport::default();
        let drafts = chunk_content(content, self.config.chunking);
        if drafts.is_empty() {
            info!(item = %content.label(), "no chunks produced; skipping");
            return Ok(report);
        }

        for draft in drafts {
            let print = fingerprint(&draft.text);
            let admission = dedup
                .admit(&draft, &print, self.store.as_ref(), self.classifier.as_ref(), force)
                .await?;
            let (classification, existing) = match admission {
                Admission::DuplicateInBatch => {
                    report.duplicates += 1;
                    continue;
                }
                Admission::Noise => {
                    report.skipped_as_noise += 1;
                    continue;
                }
                Admission::Alias { owner } => {
                    if self.record_alias(*owner, &draft).await? != UpsertOutcome::Stale {
                        report.updated += 1;
                    }
                    continue;
                }
                Admission::Insert { classification } => (classification, None),
                Admission::Update {
                    existing,
                    classification,
                } => (classification, Some(*existing)),
            };

            if let Some(existing) = &existing {
                if existing.fingerprint != print {
                    self.promote_aliases(existing).await?;
                }
            }
            let chunk = self
                .materialize(draft, print, classification, existing.as_ref())
                .await?;
            match self.store.upsert(chunk).await.map_err(IngestError::Store)? {
                UpsertOutcome::Inserted => report.inserted += 1,
                UpsertOutcome::Updated => report.updated += 1,
                UpsertOutcome::Stale => debug!("store kept a newer revision"),
            }
        }

        info!(
            item = %content.label(),
            inserted = report.inserted,
            updated = report.updated,
            skipped_as_noise = report.skipped_as_noise,
            duplicates = report.duplicates,
            "ingested content"
        );
        Ok(report)
    }

    /// Embeds a draft into a chunk. An `existing` chunk keeps its id and
    /// creation time, and its aliases while the content is unchanged.
    async fn materialize(
        &self,
        draft: ChunkDraft,
        fingerprint: String,
        classification: Option<Classification>,
        existing: Option<&Chunk>,
    ) -> Result<Chunk, IngestError> {
        let embedding = self.embed(&draft.text).await.map_err(IngestError::Embedding)?;
        let updated_at = next_revision(existing.map(|chunk| chunk.updated_at));
        let aliases = existing
            .filter(|chunk| chunk.fingerprint == fingerprint)
            .map_or_else(Vec::new, |chunk| chunk.aliases.clone());
        Ok(Chunk {
            id: existing.map_or(draft.id, |chunk| chunk.id.clone()),
            text: draft.text,
            body: draft.body,
            embedding,
            source: draft.source,
            identifier: draft.identifier,
            author: draft.author,
            public: draft.public,
            source_of_truth: draft.source_of_truth,
            thread_context: draft.thread_context,
            fingerprint,
            classification,
            aliases,
            created_at: existing.map_or(updated_at, |chunk| chunk.created_at),
            updated_at,
        })
    }

    /// Records `draft` as an alias of `owner`. The owner's identity and
    /// visibility are left as they are.
    async fn record_alias(
        &self,
        mut owner: Chunk,
        draft: &ChunkDraft,
    ) -> Result<UpsertOutcome, IngestError> {
        owner.record_alias(ChunkAlias::from(draft));
        owner.updated_at = next_revision(Some(owner.updated_at));
        self.store.upsert(owner).await.map_err(IngestError::Store)
    }

    /// Hands `owner`'s content to its first alias before the owner changes or
    /// goes away. Any further aliases move with it.
    async fn promote_aliases(&self, owner: &Chunk) -> Result<(), IngestError> {
        let Some((first, rest)) = owner.aliases.split_first() else {
            return Ok(());
        };
        let mut promoted = first.detach(owner, next_revision(Some(owner.updated_at)));
        promoted.aliases = rest.to_vec();
        debug!(chunk_id = %owner.id, promoted_id = %promoted.id, "promoting alias");
        self.store.upsert(promoted).await.map_err(IngestError::Store)?;
        Ok(())
    }

    /// Stores an alias as a chunk of its own, still carrying the owner's
    /// content.
    async fn detach(&self, owner: &Chunk, alias: &ChunkAlias) -> Result<Chunk, IngestError> {
        let detached = alias.detach(owner, next_revision(Some(owner.updated_at)));
        self.store
            .upsert(detached.clone())
            .await
            .map_err(IngestError::Store)?;
        Ok(detached)
    }

    async fn locate(&self, id: &str) -> Result<Option<Located>, IngestError> {
        if let Some(chunk) = self.store.get(id).await.map_err(IngestError::Store)? {
            return Ok(Some(Located::Stored(chunk)));
        }
        let Some(owner) = self.store.find_by_alias(id).await.map_err(IngestError::Store)? else {
            return Ok(None);
        };
        let alias = owner.alias(id).cloned();
        Ok(alias.map(|alias| Located::Alias { owner, alias }))
    }

    /// Removes one chunk or alias. A removed chunk hands its content to its
    /// aliases first.
    async fn remove_id(&self, id: &str) -> Result<bool, IngestError> {
        match self.locate(id).await? {
            Some(Located::Stored(chunk)) => {
                self.promote_aliases(&chunk).await?;
                self.store.delete(id).await.map_err(IngestError::Store)
            }
            Some(Located::Alias { mut owner, .. }) => {
                owner.forget_alias(id);
                owner.updated_at = next_revision(Some(owner.updated_at));
                self.store.upsert(owner).await.map_err(IngestError::Store)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replaces a stored message's text, then rebuilds every chunk whose
    /// thread context includes it. Classified chunks are classified again
    /// and removed when the new text is noise. Editing an alias gives it a
    /// chunk of its own.
    pub async fn on_edit(&self, id: &str, new_text: &str) -> Result<SyncReport, IngestError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(IngestError::InvalidArgument("edit needs a chunk id".to_string()));
        }
        let Some(located) = self.locate(id).await? else {
            debug!(chunk_id = %id, "edit for unknown chunk ignored");
            return Ok(SyncReport::default());
        };

        let body = normalize_whitespace(new_text);
        if body.is_empty() {
            debug!(chunk_id = %id, "edit emptied the message; deleting");
            return self.on_delete(id).await;
        }

        let previous_label = match &located {
            Located::Stored(chunk) => chunk.classification,
            Located::Alias { owner, .. } => owner.classification,
        };
        let classification = match previous_label {
            Some(previous) => match self.classifier.classify(&body).await {
                Ok(label) if label.is_noise() => {
                    info!(chunk_id = %id, "edited content classified as noise; deleting");
                    return self.on_delete(id).await;
                }
                Ok(label) => Some(label),
                Err(error) => {
                    warn!(chunk_id = %id, %error, "worthiness classifier failed; keeping label");
                    Some(previous)
                }
            },
            None => None,
        };

        let existing = match located {
            Located::Stored(chunk) => chunk,
            Located::Alias { owner, alias } => self.detach(&owner, &alias).await?,
        };
        let mut report = self.rewrite_message(&existing, &body, classification).await?;
        report.rebuilt_dependents = self.rebuild_dependents(id).await?;
        info!(
            chunk_id = %id,
            updated = report.updated,
            removed = report.removed,
            rebuilt_dependents = report.rebuilt_dependents,
            "applied edit"
        );
        Ok(report)
    }

    /// Removes a message and its pieces. Replies that referenced it are
    /// rebuilt without it; they are never deleted. Content the message
    /// shared with aliases stays stored under the first alias.
    pub async fn on_delete(&self, id: &str) -> Result<SyncReport, IngestError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(IngestError::InvalidArgument("delete needs a chunk id".to_string()));
        }

        let mut report = SyncReport::default();
        let pieces = self.existing_pieces(id).await?;
        if self.remove_id(id).await? {
            report.removed += 1;
        }
        for piece in pieces {
            if self.remove_id(&piece).await? {
                report.removed += 1;
            }
        }
        if report.removed == 0 {
            debug!(chunk_id = %id, "delete for unknown chunk ignored");
            return Ok(report);
        }

        report.rebuilt_dependents = self.rebuild_dependents(id).await?;
        info!(
            chunk_id = %id,
            removed = report.removed,
            rebuilt_dependents = report.rebuilt_dependents,
            "applied delete"
        );
        Ok(report)
    }

    /// Ids of continuation pieces `{id}~2`, `{id}~3`, ... that are stored,
    /// directly or as aliases.
    async fn existing_pieces(&self, id: &str) -> Result<Vec<String>, IngestError> {
        let mut pieces = Vec::new();
        for number in 2.. {
            let candidate = piece_id(id, number);
            if self.locate(&candidate).await?.is_none() {
                break;
            }
            pieces.push(candidate);
        }
        Ok(pieces)
    }

    /// The full body of message `id`, whose first piece reads `first`.
    async fn message_body(&self, id: &str, first: &str) -> Result<String, IngestError> {
        let mut parts = vec![first.to_string()];
        for piece in self.existing_pieces(id).await? {
            match self.locate(&piece).await? {
                Some(Located::Stored(chunk)) => parts.push(chunk.body),
                Some(Located::Alias { owner, .. }) => parts.push(owner.body),
                None => {}
            }
        }
        Ok(parts.join(" "))
    }

    /// Looks up thread context ids. Ids that no longer resolve are dropped.
    async fn resolve_context(
        &self,
        ids: &[String],
    ) -> Result<(Vec<String>, Vec<ContextEntry>), IngestError> {
        let mut resolved = Vec::with_capacity(ids.len());
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let (author, body) = match self.locate(id).await? {
                Some(Located::Stored(chunk)) => {
                    let body = self.message_body(id, &chunk.body).await?;
                    (chunk.author, body)
                }
                Some(Located::Alias { owner, alias }) => {
                    (alias.author, self.message_body(id, &owner.body).await?)
                }
                None => continue,
            };
            entries.push(ContextEntry {
                id: id.clone(),
                author,
                body,
            });
            resolved.push(id.clone());
        }
        Ok((resolved, entries))
    }

    /// Re-chunks one message against the current state of its thread.
    async fn rewrite_message(
        &self,
        head: &Chunk,
        body: &str,
        classification: Option<Classification>,
    ) -> Result<SyncReport, IngestError> {
        let (context_ids, context) = self.resolve_context(&head.thread_context).await?;
        let template = ChunkDraft {
            id: head.id.clone(),
            text: String::new(),
            body: String::new(),
            source: head.source.clone(),
            identifier: head.identifier.clone(),
            author: head.author.clone(),
            public: head.public,
            source_of_truth: head.source_of_truth,
            thread_context: context_ids,
            gated: false,
        };
        let stale_pieces = self.existing_pieces(&head.id).await?;
        let drafts = draft_message(&template, &context, body, self.config.chunking);
        let kept = drafts.len();

        let mut report = SyncReport::default();
        for draft in drafts {
            let previous = if draft.id == head.id {
                Some(head.clone())
            } else {
                self.store.get(&draft.id).await.map_err(IngestError::Store)?
            };
            let print = fingerprint(&draft.text);
            if let Some(previous) = &previous {
                if previous.fingerprint != print {
                    self.promote_aliases(previous).await?;
                }
            }
            let chunk = self
                .materialize(draft, print, classification, previous.as_ref())
                .await?;
            if self.store.upsert(chunk).await.map_err(IngestError::Store)? != UpsertOutcome::Stale {
                report.updated += 1;
            }
        }

        for piece in stale_pieces.into_iter().skip(kept.saturating_sub(1)) {
            if self.remove_id(&piece).await? {
                report.removed += 1;
            }
        }
        Ok(report)
    }

    async fn rebuild_dependents(&self, id: &str) -> Result<usize, IngestError> {
        let dependents = self
            .store
            .find_referencing(id)
            .await
            .map_err(IngestError::Store)?;
        let names = |context: &[String]| context.iter().any(|context_id| context_id == id);
        let mut heads = BTreeSet::new();
        for chunk in &dependents {
            if names(&chunk.thread_context) {
                heads.insert(message_id(&chunk.id).to_string());
            }
            for alias in &chunk.aliases {
                if names(&alias.thread_context) {
                    heads.insert(message_id(&alias.id).to_string());
                }
            }
        }

        let mut rebuilt = 0;
        for head_id in heads {
            let head = match self.locate(&head_id).await? {
                Some(Located::Stored(head)) => head,
                Some(Located::Alias { owner, alias }) => self.detach(&owner, &alias).await?,
                None => continue,
            };
            let body = self.message_body(&head.id, &head.body).await?;
            self.rewrite_message(&head, &body, head.classification).await?;
            rebuilt += 1;
        }
        if rebuilt > 0 {
            debug!(chunk_id = %id, rebuilt, "rebuilt dependent chunks");
        }
        Ok(rebuilt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{RawDocument, RawMessage, RawThread};
    use crate::store::tests::chunk_at;
    use crate::store::InMemoryContentStore;
    use async_trait::async_trait;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn dimensions(&self) -> usize {
            self.0.len()
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
            Ok(self.0.clone())
        }
    }

    /// Local trigram embedding that refuses any text containing "poison".
    struct PoisonedEmbedder;

    #[async_trait]
    impl Embedder for PoisonedEmbedder {
        fn dimensions(&self) -> usize {
            CharacterNgramEmbedder::default().dimensions
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
            if text.contains("poison") {
                return Err(CapabilityError::Unavailable("embedding model offline".to_string()));
            }
            Ok(CharacterNgramEmbedder::default().embed_sync(text))
        }
    }

    struct FixedClassifier(Classification);

    #[async_trait]
    impl WorthinessClassifier for FixedClassifier {
        async fn classify(&self, _text: &str) -> Result<Classification, CapabilityError> {
            Ok(self.0)
        }
    }

    /// Labels text containing "lol" as noise, everything else as a bug.
    struct LolClassifier;

    #[async_trait]
    impl WorthinessClassifier for LolClassifier {
        async fn classify(&self, text: &str) -> Result<Classification, CapabilityError> {
            Ok(if text.contains("lol") {
                Classification::Noise
            } else {
                Classification::Bug
            })
        }
    }

    fn unit(similarity: f32) -> Vec<f32> {
        vec![similarity, (1.0 - similarity * similarity).max(0.0).sqrt()]
    }

    fn stored(id: &str, source: &str, public: bool, similarity: f32) -> Chunk {
        let written = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut chunk = chunk_at(id, &format!("{id} content"), written);
        chunk.source = source.to_string();
        chunk.public = public;
        chunk.embedding = unit(similarity);
        chunk
    }

    fn fixed_base(chunks: Vec<Chunk>) -> KnowledgeBase<InMemoryContentStore> {
        let store = Arc::new(InMemoryContentStore::from_chunks(chunks).unwrap());
        KnowledgeBase::new(
            store,
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            Arc::new(FixedClassifier(Classification::Document)),
            RetrievalConfig::default(),
        )
    }

    fn local_base(
        classifier: Arc<dyn WorthinessClassifier>,
    ) -> KnowledgeBase<InMemoryContentStore> {
        KnowledgeBase::new(
            Arc::new(InMemoryContentStore::new().unwrap()),
            Arc::new(CharacterNgramEmbedder::default()),
            classifier,
            RetrievalConfig::default(),
        )
    }

    fn thread(source: &str, messages: &[(&str, &str, &str)]) -> RawContent {
        thread_with(source, false, messages)
    }

    fn thread_with(source: &str, public: bool, messages: &[(&str, &str, &str)]) -> RawContent {
        RawContent::Thread(RawThread {
            source: source.to_string(),
            public,
            source_of_truth: false,
            messages: messages
                .iter()
                .map(|(id, author, text)| RawMessage {
                    id: id.to_string(),
                    author: Some(author.to_string()),
                    text: text.to_string(),
                })
                .collect(),
        })
    }

    fn document(id: &str, text: &str) -> RawContent {
        RawContent::Document(RawDocument {
            id: id.to_string(),
            source: "docs".to_string(),
            filename: Some(format!("{id}.md")),
            public: true,
            source_of_truth: false,
            sections: vec![text.to_string()],
        })
    }

    fn ids(result: &RetrievalResult) -> Vec<&str> {
        result.chunks.iter().map(|item| item.chunk.id.as_str()).collect()
    }

    #[tokio::test]
    async fn audience_mode_controls_which_chunks_are_returned() {
        let base = fixed_base(vec![
            stored("a", "docs", true, 0.9),
            stored("b", "eng-chat", false, 0.95),
        ]);

        let internal = base
            .retrieve_text("how do I rotate keys", "internal", None, None)
            .await
            .unwrap();
        assert_eq!(ids(&internal), vec!["b", "a"]);
        assert_eq!(internal.citations.len(), 2);

        let customer = base
            .retrieve_text("how do I rotate keys", "customer", None, None)
            .await
            .unwrap();
        assert_eq!(ids(&customer), vec!["a"]);
        assert_eq!(customer.citations.len(), 1);
        assert_eq!(customer.citations[0].source, "docs");
        assert!(customer.documents.is_none());
    }

    #[tokio::test]
    async fn empty_results_carry_a_reason() {
        let base = fixed_base(Vec::new());
        let result = base.retrieve_text("anything", "internal", None, None).await.unwrap();
        assert!(result.chunks.is_empty());
        assert_eq!(result.empty_reason, Some(EmptyReason::EmptyStore));

        let base = fixed_base(vec![stored("c", "eng-chat", false, 0.8)]);
        let filtered = base.retrieve_text("anything", "customer", None, None).await.unwrap();
        assert!(filtered.citations.is_empty());
        assert_eq!(filtered.empty_reason, Some(EmptyReason::FilteredByPolicy));

        let strict = base.retrieve_text("anything", "internal", None, Some(0.99)).await.unwrap();
        assert!(strict.chunks.is_empty());
        assert_eq!(strict.empty_reason, Some(EmptyReason::BelowThreshold));
    }

    #[tokio::test]
    async fn invalid_requests_fail_fast() {
        let base = fixed_base(vec![stored("a", "docs", true, 0.9)]);
        assert!(matches!(
            base.retrieve_text("q", "public", None, None).await,
            Err(RetrievalError::InvalidMode(_))
        ));
        assert!(matches!(
            base.retrieve_text("   ", "internal", None, None).await,
            Err(RetrievalError::EmptyQuery)
        ));
        assert!(matches!(
            base.retrieve_text("q", "internal", Some(0), None).await,
            Err(RetrievalError::InvalidArgument(_))
        ));
        assert!(matches!(
            base.retrieve_text("q", "internal", None, Some(1.5)).await,
            Err(RetrievalError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn embedding_failure_is_a_retrieval_error() {
        let base = KnowledgeBase::new(
            Arc::new(
                InMemoryContentStore::from_chunks(vec![stored("a", "docs", true, 0.9)]).unwrap(),
            ),
            Arc::new(PoisonedEmbedder),
            Arc::new(FixedClassifier(Classification::Document)),
            RetrievalConfig::default(),
        );
        assert!(matches!(
            base.retrieve_text("poison pill", "internal", None, None).await,
            Err(RetrievalError::Embedding(_))
        ));
    }

    #[tokio::test]
    async fn retrieval_is_idempotent_and_bounded_by_top_k() {
        let base = fixed_base(vec![
            stored("a", "docs", true, 0.9),
            stored("b", "docs", true, 0.9),
            stored("c", "docs", true, 0.85),
        ]);
        let query = RetrievalQuery::new("rotate keys", AudienceMode::Internal).with_top_k(2);

        let first = base.retrieve(&query).await.unwrap();
        let second = base.retrieve(&query).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ids(&first), vec!["a", "b"]);

        let mut with_documents = query.clone();
        with_documents.include_documents = true;
        let expanded = base.retrieve(&with_documents).await.unwrap();
        assert_eq!(
            expanded.documents,
            Some(vec!["a content".to_string(), "b content".to_string()])
        );
    }

    #[tokio::test]
    async fn ingesting_twice_updates_in_place() {
        let base = local_base(Arc::new(FixedClassifier(Classification::Bug)));
        let content = thread(
            "eng-chat",
            &[
                ("m1", "ana", "The nightly export crashes on large reports."),
                ("m2", "raj", "Raising the worker memory limit fixes the export crash."),
            ],
        );

        let first = base.ingest(content.clone(), false).await.unwrap();
        assert_eq!(first.inserted, 2);
        let before = base.store().get("m2").await.unwrap().unwrap();
        assert_eq!(before.thread_context, vec!["m1".to_string()]);
        assert_eq!(before.classification, Some(Classification::Bug));

        let second = base.ingest(content, false).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(base.store().len().unwrap(), 2);
        let after = base.store().get("m2").await.unwrap().unwrap();
        assert!(after.updated_at > before.updated_at);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn noise_is_gated_unless_forced() {
        let base = local_base(Arc::new(LolClassifier));
        let content = thread(
            "eng-chat",
            &[
                ("m1", "ana", "Checkout fails with a 500 after the last deploy."),
                ("m2", "raj", "lol"),
            ],
        );

        let report = base.ingest(content.clone(), false).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_as_noise, 1);
        assert!(base.store().get("m2").await.unwrap().is_none());

        let forced = base.ingest(content, true).await.unwrap();
        assert_eq!(forced.inserted, 1);
        assert_eq!(forced.updated, 1);
        let pushed = base.store().get("m2").await.unwrap().unwrap();
        assert_eq!(pushed.classification, None);
    }

    #[tokio::test]
    async fn batch_drops_repeats_and_skips_failures() {
        let base = KnowledgeBase::new(
            Arc::new(InMemoryContentStore::new().unwrap()),
            Arc::new(PoisonedEmbedder),
            Arc::new(FixedClassifier(Classification::Document)),
            RetrievalConfig::default(),
        );
        let report = base
            .ingest_batch(
                vec![
                    document("guide", "Rotate API keys from the admin console."),
                    document("copy", "Rotate API keys from the admin console."),
                    document("bad", "This section contains poison."),
                    document("faq", "Exports are limited to ten thousand rows."),
                ],
                false,
            )
            .await;

        assert_eq!(report.totals.inserted, 2);
        assert_eq!(report.totals.duplicates, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].label, "document bad");
        assert!(base.store().get("guide#0").await.unwrap().is_some());
        assert!(base.store().get("faq#0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn edit_reembeds_in_place_and_rebuilds_replies() {
        let base = local_base(Arc::new(FixedClassifier(Classification::Bug)));
        base.ingest(
            thread(
                "eng-chat",
                &[
                    ("m1", "ana", "The nightly export crashes on large reports."),
                    ("m2", "raj", "Raising the worker memory limit fixes it."),
                ],
            ),
            false,
        )
        .await
        .unwrap();
        let original = base.store().get("m1").await.unwrap().unwrap();

        let report = base
            .on_edit("m1", "The nightly export times out on reports over ten megabytes.")
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.rebuilt_dependents, 1);

        let edited = base.store().get("m1").await.unwrap().unwrap();
        assert_eq!(edited.id, "m1");
        assert_ne!(edited.embedding, original.embedding);
        assert!(edited.updated_at > original.updated_at);
        assert!(edited.text.contains("ten megabytes"));

        let reply = base.store().get("m2").await.unwrap().unwrap();
        assert!(reply.text.contains("ten megabytes"));
        assert!(!reply.text.contains("crashes"));
    }

    #[tokio::test]
    async fn edit_to_noise_removes_classified_chunk() {
        let base = local_base(Arc::new(LolClassifier));
        base.ingest(
            thread("eng-chat", &[("m1", "ana", "Search returns stale results after reindex.")]),
            false,
        )
        .await
        .unwrap();

        let report = base.on_edit("m1", "lol never mind").await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(base.store().get("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_candidate_but_keeps_replies() {
        let base = local_base(Arc::new(FixedClassifier(Classification::Bug)));
        base.ingest(
            thread(
                "eng-chat",
                &[
                    ("m1", "ana", "The nightly export crashes on large reports."),
                    ("m2", "raj", "Raising the worker memory limit fixes it."),
                ],
            ),
            false,
        )
        .await
        .unwrap();

        let report = base.on_delete("m1").await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.rebuilt_dependents, 1);

        let query = CharacterNgramEmbedder::default().embed_sync("nightly export crashes");
        let candidates = base.store().find_candidates(&query, 10).await.unwrap();
        assert!(candidates.iter().all(|chunk| chunk.id != "m1"));

        let reply = base.store().get("m2").await.unwrap().unwrap();
        assert!(reply.thread_context.is_empty());
        assert!(!reply.text.contains("crashes"));

        assert_eq!(base.on_delete("m1").await.unwrap(), SyncReport::default());
    }

    #[tokio::test]
    async fn oversized_edit_grows_and_shrinks_pieces() {
        let mut config = RetrievalConfig::default();
        config.chunking.max_chars = 40;
        let base = KnowledgeBase::new(
            Arc::new(InMemoryContentStore::new().unwrap()),
            Arc::new(CharacterNgramEmbedder::default()),
            Arc::new(FixedClassifier(Classification::Idea)),
            config,
        );
        base.ingest(thread("ideas", &[("m1", "ana", "Add dark mode.")]), false)
            .await
            .unwrap();

        base.on_edit(
            "m1",
            "Add dark mode to the dashboard. Also add it to the settings page. And the reports.",
        )
        .await
        .unwrap();
        assert!(base.store().get("m1~2").await.unwrap().is_some());

        let report = base.on_edit("m1", "Add dark mode.").await.unwrap();
        assert!(report.removed >= 1);
        assert!(base.store().get("m1~2").await.unwrap().is_none());
        assert_eq!(base.store().len().unwrap(), 1);
    }

    #[test]
    fn revisions_strictly_increase() {
        let future = Utc::now() + ChronoDuration::hours(1);
        assert!(next_revision(Some(future)) > future);
        assert!(next_revision(None) <= Utc::now());
        assert_eq!(message_id("m1~3"), "m1");
        assert_eq!(message_id("doc#0"), "doc#0");
    }

    #[test]
    fn message_id_strips_only_piece_numbers() {
        assert_eq!(message_id("a~b"), "a~b");
        assert_eq!(message_id("a~b~2"), "a~b");
        assert_eq!(message_id("m1~1"), "m1~1");
        assert_eq!(message_id("m1~"), "m1~");
        assert_eq!(message_id("release~v2~12"), "release~v2");
    }

    async fn ingest_shared_root(base: &KnowledgeBase<InMemoryContentStore>) -> IngestReport {
        let text = "Rotate the signing key every Monday before the deploy.";
        base.ingest(thread_with("support", true, &[("m1", "ana", text)]), false)
            .await
            .unwrap();
        base.ingest(
            thread_with(
                "eng-chat",
                false,
                &[
                    ("m9", "ana", text),
                    ("r9", "raj", "Monday deploys moved to Tuesday this quarter."),
                ],
            ),
            false,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn same_content_under_another_id_keeps_owner_identity() {
        let base = local_base(Arc::new(FixedClassifier(Classification::Bug)));
        let report = ingest_shared_root(&base).await;
        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(base.store().len().unwrap(), 2);
        assert!(base.store().get("m9").await.unwrap().is_none());

        let owner = base.store().get("m1").await.unwrap().unwrap();
        assert_eq!(owner.source, "support");
        assert!(owner.public);
        assert_eq!(owner.citation_identifier(), "m1");
        let alias = owner.alias("m9").unwrap();
        assert_eq!(alias.source, "eng-chat");
        assert!(!alias.public);

        let customer = base
            .retrieve_text("rotate the signing key", "customer", None, Some(0.0))
            .await
            .unwrap();
        assert_eq!(customer.citations.len(), 1);
        assert_eq!(customer.citations[0].source, "support");
        assert_eq!(customer.citations[0].identifier, "m1");

        let reply = base.store().get("r9").await.unwrap().unwrap();
        assert_eq!(reply.thread_context, vec!["m9".to_string()]);
        assert!(reply.text.contains("signing key"));
    }

    #[tokio::test]
    async fn deleting_an_alias_leaves_the_owner() {
        let base = local_base(Arc::new(FixedClassifier(Classification::Bug)));
        ingest_shared_root(&base).await;

        let report = base.on_delete("m9").await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.rebuilt_dependents, 1);

        let owner = base.store().get("m1").await.unwrap().unwrap();
        assert!(owner.aliases.is_empty());
        assert!(base.store().find_by_alias("m9").await.unwrap().is_none());
        let reply = base.store().get("r9").await.unwrap().unwrap();
        assert!(reply.thread_context.is_empty());
        assert!(!reply.text.contains("signing key"));

        assert_eq!(base.on_delete("m9").await.unwrap(), SyncReport::default());
    }

    #[tokio::test]
    async fn editing_an_alias_gives_it_its_own_chunk() {
        let base = local_base(Arc::new(FixedClassifier(Classification::Bug)));
        ingest_shared_root(&base).await;
        let before = base.store().get("m1").await.unwrap().unwrap();

        let report = base
            .on_edit("m9", "Rotate the signing key every Friday after the freeze.")
            .await
            .unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.rebuilt_dependents, 1);

        let edited = base.store().get("m9").await.unwrap().unwrap();
        assert_eq!(edited.source, "eng-chat");
        assert!(!edited.public);
        assert!(edited.text.contains("Friday"));

        let owner = base.store().get("m1").await.unwrap().unwrap();
        assert_eq!(owner.text, before.text);
        assert!(owner.aliases.is_empty());

        let reply = base.store().get("r9").await.unwrap().unwrap();
        assert!(reply.text.contains("Friday"));
    }

    #[tokio::test]
    async fn deleting_the_owner_promotes_its_alias() {
        let base = local_base(Arc::new(FixedClassifier(Classification::Bug)));
        ingest_shared_root(&base).await;
        let owner = base.store().get("m1").await.unwrap().unwrap();

        let report = base.on_delete("m1").await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(base.store().get("m1").await.unwrap().is_none());

        let promoted = base.store().get("m9").await.unwrap().unwrap();
        assert_eq!(promoted.source, "eng-chat");
        assert!(!promoted.public);
        assert_eq!(promoted.text, owner.text);
        assert_eq!(promoted.fingerprint, owner.fingerprint);

        let customer = base
            .retrieve_text("rotate the signing key", "customer", None, Some(0.0))
            .await
            .unwrap();
        assert!(customer.citations.is_empty());
    }
}
