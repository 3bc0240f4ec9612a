//! BM25 keyword scoring over the example corpus.
//!
//! The index is an immutable in-memory tantivy snapshot of the whole
//! store. [`LexicalIndex::snapshot`] compares the snapshot's version with
//! the store's version counter and rebuilds wholesale when they differ, so
//! readers never see a half-updated index.

use std::sync::{Arc, RwLock};

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    ReloadPolicy,
    TantivyDocument,
    Term,
    collector::TopDocs,
    doc,
    query::{BooleanQuery, Occur, Query, TermQuery},
    schema::*,
    tokenizer::{LowerCaser, TextAnalyzer, WhitespaceTokenizer},
};
use tracing::debug;

use crate::{
    error::Result,
    example::Example,
    example_store::ExampleStore,
    text_util,
};

/// Field names used in the schema.
pub mod fields {
    pub const ID: &str = "id";
    pub const BODY: &str = "body";
}

const TERMS_TOKENIZER: &str = "rebate_terms";

/// Writer memory budget for one snapshot build.
const WRITER_MEMORY: usize = 15_000_000;

/// A lexical match: example id plus raw BM25 score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LexicalHit {
    pub id: u64,
    pub score: f32,
}

#[derive(Clone, Copy)]
struct SchemaFields {
    id: Field,
    body: Field,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();
    let id = builder.add_u64_field(fields::ID, STORED | FAST);
    let body_opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(TERMS_TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqs),
    );
    let body = builder.add_text_field(fields::BODY, body_opts);
    (builder.build(), SchemaFields { id, body })
}

/// Body text as the index sees it: pre-split terms joined by spaces.
fn index_terms(text: &str) -> Vec<String> {
    text_util::tokenize(&text_util::normalize(text))
}

/// A frozen BM25 index over one version of the store.
pub struct LexicalSnapshot {
    version: u64,
    num_docs: u64,
    reader: IndexReader,
    fields: SchemaFields,
}

impl LexicalSnapshot {
    /// Build a snapshot from `examples`, tagging it with `version`.
    pub fn build(version: u64, examples: &[Example]) -> Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        index.tokenizers().register(
            TERMS_TOKENIZER,
            TextAnalyzer::builder(WhitespaceTokenizer::default())
                .filter(LowerCaser)
                .build(),
        );

        let mut writer: IndexWriter =
            index.writer_with_num_threads(1, WRITER_MEMORY)?;
        for example in examples {
            writer.add_document(doc!(
                fields.id => example.id,
                fields.body => index_terms(&example.source_text).join(" "),
            ))?;
        }
        writer.commit()?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        debug!(version, docs = examples.len(), "built lexical snapshot");

        Ok(Self {
            version,
            num_docs: examples.len() as u64,
            reader,
            fields,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    /// BM25 scores of the best `top_k` examples for `query_text`.
    ///
    /// Only examples sharing at least one term with the query are
    /// returned, ordered by score descending and then id ascending.
    pub fn score(&self, query_text: &str, top_k: usize) -> Result<Vec<LexicalHit>> {
        if top_k == 0 || self.num_docs == 0 {
            return Ok(Vec::new());
        }

        let mut terms = index_terms(query_text);
        terms.sort();
        terms.dedup();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .map(|t| {
                let term = Term::from_field_text(self.fields.body, t);
                let query: Box<dyn Query> =
                    Box::new(TermQuery::new(term, IndexRecordOption::WithFreqs));
                (Occur::Should, query)
            })
            .collect();
        let query = BooleanQuery::new(clauses);

        let searcher = self.reader.searcher();
        let top_docs = searcher.search(&query, &TopDocs::with_limit(top_k))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let Some(id) = doc.get_first(self.fields.id).and_then(|v| v.as_u64())
            else {
                continue;
            };
            hits.push(LexicalHit { id, score });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        Ok(hits)
    }
}

impl std::fmt::Debug for LexicalSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalSnapshot")
            .field("version", &self.version)
            .field("num_docs", &self.num_docs)
            .finish_non_exhaustive()
    }
}

/// Lazily built, version-checked lexical index.
#[derive(Default)]
pub struct LexicalIndex {
    cache: RwLock<Option<Arc<LexicalSnapshot>>>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot for `store`, rebuilding it if the store moved on.
    pub fn snapshot(&self, store: &ExampleStore) -> Result<Arc<LexicalSnapshot>> {
        let current = store.version()?;
        if let Some(snapshot) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            && snapshot.version == current
        {
            return Ok(Arc::clone(snapshot));
        }

        let (version, examples) = store.get_all_versioned()?;
        let snapshot = Arc::new(LexicalSnapshot::build(version, &examples)?);
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Score `query_text` against the current snapshot of `store`.
    pub fn score(
        &self,
        store: &ExampleStore,
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<LexicalHit>> {
        self.snapshot(store)?.score(query_text, top_k)
    }
}

impl std::fmt::Debug for LexicalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LexicalIndex").finish_non_exhaustive()
    }
}
