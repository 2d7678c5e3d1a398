//! Okapi BM25 over stored chunk texts, served by an in-RAM tantivy index.

use crate::error::CapabilityError;
use std::collections::{BTreeSet, HashMap};
use tantivy::collector::TopDocs;
use tantivy::query::BooleanQuery;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::tokenizer::{LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer, TokenStream};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Same pipeline as tantivy's `default` tokenizer, which indexes `content`.
fn analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .build()
}

/// Lowercased alphanumeric tokens in text order.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut analyzer = analyzer();
    let mut stream = analyzer.token_stream(text);
    let mut tokens = Vec::new();
    while stream.advance() {
        tokens.push(stream.token().text.clone());
    }
    tokens
}

/// Distinct tokens, sorted.
pub fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

pub struct Bm25Index {
    writer: IndexWriter,
    reader: IndexReader,
    chunk_id: Field,
    content: Field,
}

impl Bm25Index {
    pub fn new() -> Result<Self, CapabilityError> {
        let mut schema_builder = Schema::builder();
        let chunk_id = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let content = schema_builder.add_text_field("content", TEXT);
        let index = Index::create_in_ram(schema_builder.build());

        let writer = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            writer,
            reader,
            chunk_id,
            content,
        })
    }

    /// Stages `text` under `id`, replacing any earlier text for it. Searches
    /// see the change after [`Bm25Index::commit`].
    pub fn insert(&mut self, id: &str, text: &str) -> Result<(), CapabilityError> {
        self.writer.delete_term(Term::from_field_text(self.chunk_id, id));
        self.writer.add_document(doc!(
            self.chunk_id => id.to_string(),
            self.content => text.to_string(),
        ))?;
        Ok(())
    }

    pub fn remove(&mut self, id: &str) {
        self.writer.delete_term(Term::from_field_text(self.chunk_id, id));
    }

    pub fn commit(&mut self) -> Result<(), CapabilityError> {
        self.writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Raw BM25 score of `query` for each of `chunk_ids`, in order. Ids that
    /// are not indexed or share no term with the query score `0.0`.
    pub fn scores(&self, query: &str, chunk_ids: &[String]) -> Result<Vec<f64>, CapabilityError> {
        let terms = token_set(query)
            .iter()
            .map(|term| Term::from_field_text(self.content, term))
            .collect::<Vec<_>>();
        let searcher = self.reader.searcher();
        let indexed = searcher.num_docs() as usize;
        if terms.is_empty() || chunk_ids.is_empty() || indexed == 0 {
            return Ok(vec![0.0; chunk_ids.len()]);
        }

        let term_query = BooleanQuery::new_multiterms_query(terms);
        let top_docs = searcher.search(&term_query, &TopDocs::with_limit(indexed))?;

        let mut by_id = HashMap::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let document: TantivyDocument = searcher.doc(address)?;
            let id = document
                .get_first(self.chunk_id)
                .and_then(|value| value.as_str());
            if let Some(id) = id {
                by_id.insert(id.to_string(), f64::from(score));
            }
        }

        Ok(chunk_ids
            .iter()
            .map(|id| by_id.get(id).copied().unwrap_or(0.0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn tokenize_lowercases_and_drops_punctuation() {
        assert_eq!(
            tokenize("Reset the API-key, then retry!"),
            vec!["reset", "the", "api", "key", "then", "retry"]
        );
    }

    #[test]
    fn rarer_terms_score_higher() {
        let mut index = Bm25Index::new().unwrap();
        index.insert("a", "export csv report for finance").unwrap();
        index.insert("b", "export pdf report").unwrap();
        index.insert("c", "export settings page").unwrap();
        index.commit().unwrap();

        let csv = index.scores("csv", &ids(&["a", "b", "missing"])).unwrap();
        let export = index.scores("export", &ids(&["a"])).unwrap();
        assert!(csv[0] > export[0]);
        assert_eq!(csv[1], 0.0);
        assert_eq!(csv[2], 0.0);
    }

    #[test]
    fn reinsert_and_remove_replace_indexed_text() {
        let mut index = Bm25Index::new().unwrap();
        index.insert("a", "alpha beta").unwrap();
        index.commit().unwrap();
        index.insert("a", "gamma").unwrap();
        index.commit().unwrap();

        assert_eq!(index.num_docs(), 1);
        assert_eq!(index.scores("alpha", &ids(&["a"])).unwrap(), vec![0.0]);
        assert!(index.scores("gamma", &ids(&["a"])).unwrap()[0] > 0.0);

        index.remove("a");
        index.commit().unwrap();
        assert_eq!(index.num_docs(), 0);
        assert_eq!(index.scores("gamma", &ids(&["a"])).unwrap(), vec![0.0]);
    }

    #[test]
    fn uncommitted_changes_are_not_searched() {
        let mut index = Bm25Index::new().unwrap();
        index.insert("a", "pump pressure").unwrap();
        assert_eq!(index.scores("pump", &ids(&["a"])).unwrap(), vec![0.0]);

        index.commit().unwrap();
        assert!(index.scores("pump", &ids(&["a"])).unwrap()[0] > 0.0);
    }
}
