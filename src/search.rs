//! Query-time retrieval: dense, hybrid and reranked search.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    example::Example,
    example_store::{DenseHit, ExampleStore},
    lexical_index::LexicalIndex,
    reranker::Reranker,
    text_util,
};

/// Hybrid mode fetches this many times `top_k` from each retriever.
pub const CANDIDATE_MULTIPLIER: usize = 3;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Dense nearest neighbours only.
    DenseOnly,
    /// Dense and BM25 candidates fused by a weighted sum.
    #[default]
    Hybrid,
    /// Dense shortlist re-ordered by the reranker.
    Rerank,
}

impl std::str::FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.replace('-', "_").as_str() {
            "dense_only" | "dense" | "vector" => Ok(Self::DenseOnly),
            "hybrid" => Ok(Self::Hybrid),
            "rerank" => Ok(Self::Rerank),
            other => Err(Error::Config(format!("unknown search mode '{other}'"))),
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::DenseOnly => "dense_only",
            Self::Hybrid => "hybrid",
            Self::Rerank => "rerank",
        })
    }
}

/// Typed retrieval settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub mode: SearchMode,
    pub top_k: usize,
    /// Dense similarity floor in `[0, 1]`.
    pub min_similarity: f32,
    /// Weight of the dense signal in hybrid mode; BM25 gets `1 - alpha`.
    pub hybrid_alpha: f32,
    /// Shortlist size handed to the reranker.
    pub rerank_top_n: usize,
    /// Retry once with `top_k = 1` and no floor when nothing qualifies.
    pub fallback_to_nearest: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::default(),
            top_k: 3,
            min_similarity: 0.7,
            hybrid_alpha: 0.5,
            rerank_top_n: 10,
            fallback_to_nearest: false,
        }
    }
}

impl SearchConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_similarity) {
            return Err(Error::Config(format!(
                "min_similarity must be within [0, 1], got {}",
                self.min_similarity
            )));
        }
        if !(0.0..=1.0).contains(&self.hybrid_alpha) {
            return Err(Error::Config(format!(
                "hybrid_alpha must be within [0, 1], got {}",
                self.hybrid_alpha
            )));
        }
        Ok(())
    }
}

/// One ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredExample {
    pub rank: usize,
    pub example: Example,
    /// Dense similarity; 0 when the example was found lexically only.
    pub similarity: f32,
    /// Min-max normalized BM25; `None` when BM25 did not return the example.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hybrid_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl ScoredExample {
    fn dense(hit: DenseHit) -> Self {
        Self {
            rank: 0,
            example: hit.example,
            similarity: hit.similarity,
            lexical_score: None,
            hybrid_score: None,
            rerank_score: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Quality {
    Full,
    /// A signal was unavailable; results come from what remained.
    Degraded { reason: String },
}

/// Outcome of one `retrieve` call.
#[derive(Debug, Clone, Serialize)]
pub struct Retrieval {
    pub mode: SearchMode,
    pub results: Vec<ScoredExample>,
    pub quality: Quality,
    /// Results come from the relaxed nearest-match pass.
    pub used_fallback: bool,
}

impl Retrieval {
    fn new(mode: SearchMode, mut results: Vec<ScoredExample>) -> Self {
        for (i, r) in results.iter_mut().enumerate() {
            r.rank = i + 1;
        }
        Self {
            mode,
            results,
            quality: Quality::Full,
            used_fallback: false,
        }
    }

    fn degraded(mut self, reason: Option<String>) -> Self {
        if let Some(reason) = reason {
            self.quality = Quality::Degraded { reason };
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Combines the store, the lexical index and an optional reranker.
///
/// Holds only borrows; the caller owns every service.
pub struct Retriever<'a> {
    store: &'a ExampleStore,
    lexical: &'a LexicalIndex,
    reranker: Option<&'a dyn Reranker>,
}

impl<'a> Retriever<'a> {
    pub fn new(store: &'a ExampleStore, lexical: &'a LexicalIndex) -> Self {
        Self {
            store,
            lexical,
            reranker: None,
        }
    }

    pub fn with_reranker(mut self, reranker: &'a dyn Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Rank stored examples against `query_text`.
    ///
    /// An empty store or a query with no content yields an empty result
    /// without touching the embedder.
    pub fn retrieve(
        &self,
        query_text: &str,
        config: &SearchConfig,
    ) -> Result<Retrieval> {
        config.validate()?;
        let mode = config.mode;
        if config.top_k == 0
            || text_util::normalize(query_text).is_empty()
            || self.store.count()? == 0
        {
            return Ok(Retrieval::new(mode, Vec::new()));
        }

        let retrieval = match mode {
            SearchMode::DenseOnly => {
                let hits = self.store.search_dense(
                    query_text,
                    config.top_k,
                    config.min_similarity,
                )?;
                Retrieval::new(
                    mode,
                    hits.into_iter().map(ScoredExample::dense).collect(),
                )
            }
            SearchMode::Hybrid => {
                let (results, degraded) = self.hybrid(
                    query_text,
                    config.top_k,
                    config.min_similarity,
                    config.hybrid_alpha,
                )?;
                Retrieval::new(mode, results).degraded(degraded)
            }
            SearchMode::Rerank => return self.rerank(query_text, config),
        };

        if retrieval.is_empty() && config.fallback_to_nearest {
            debug!(%mode, "no result above threshold, relaxing");
            let relaxed = SearchConfig {
                top_k: 1,
                min_similarity: 0.0,
                fallback_to_nearest: false,
                ..config.clone()
            };
            let mut fallback = self.retrieve(query_text, &relaxed)?;
            fallback.used_fallback = true;
            return Ok(fallback);
        }
        Ok(retrieval)
    }

    /// Weighted fusion of dense similarity and min-max normalized BM25.
    ///
    /// Returns the ranked results and, when the dense signal could not be
    /// computed, the reason it is missing.
    fn hybrid(
        &self,
        query_text: &str,
        top_k: usize,
        min_similarity: f32,
        alpha: f32,
    ) -> Result<(Vec<ScoredExample>, Option<String>)> {
        let fetch = top_k.saturating_mul(CANDIDATE_MULTIPLIER);

        let (dense, degraded) = match self.store.embed_query(query_text) {
            Ok(query) => (self.store.search_vector(&query, fetch, 0.0)?, None),
            Err(e @ Error::EmbeddingBackend(_)) => {
                warn!(error = %e, "dense signal unavailable, using BM25 only");
                (Vec::new(), Some(e.to_string()))
            }
            Err(e) => return Err(e),
        };
        let lexical = self.lexical.score(self.store, query_text, fetch)?;

        let mut pool: BTreeMap<u64, Candidate> = BTreeMap::new();
        for hit in dense {
            pool.insert(
                hit.example.id,
                Candidate {
                    example: hit.example,
                    dense: Some(hit.similarity),
                    lexical: None,
                },
            );
        }
        for hit in &lexical {
            if let Some(candidate) = pool.get_mut(&hit.id) {
                candidate.lexical = Some(hit.score);
            } else if let Some(example) = self.store.get(hit.id)? {
                pool.insert(
                    hit.id,
                    Candidate {
                        example,
                        dense: None,
                        lexical: Some(hit.score),
                    },
                );
            }
        }

        let (min, max) = pool
            .values()
            .filter_map(|c| c.lexical)
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(s), hi.max(s))
            });

        let mut results: Vec<ScoredExample> = pool
            .into_values()
            .filter(|c| {
                c.lexical.is_some() || c.dense.unwrap_or(0.0) >= min_similarity
            })
            .map(|c| {
                let similarity = c.dense.unwrap_or(0.0);
                let lexical = c
                    .lexical
                    .map(|s| normalize_lexical(s, min, max))
                    .unwrap_or(0.0);
                ScoredExample {
                    rank: 0,
                    example: c.example,
                    similarity,
                    lexical_score: c.lexical.map(|_| lexical),
                    hybrid_score: Some(
                        alpha * similarity + (1.0 - alpha) * lexical,
                    ),
                    rerank_score: None,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.hybrid_score
                .unwrap_or(0.0)
                .total_cmp(&a.hybrid_score.unwrap_or(0.0))
                .then(a.example.id.cmp(&b.example.id))
        });
        results.truncate(top_k);
        Ok((results, degraded))
    }

    fn rerank(
        &self,
        query_text: &str,
        config: &SearchConfig,
    ) -> Result<Retrieval> {
        let shortlist = self.store.search_dense(
            query_text,
            config.rerank_top_n.max(config.top_k),
            config.min_similarity,
        )?;
        if shortlist.is_empty() {
            return Ok(Retrieval::new(SearchMode::Rerank, Vec::new()));
        }

        let dense_order = |shortlist: Vec<DenseHit>| -> Vec<ScoredExample> {
            shortlist
                .into_iter()
                .take(config.top_k)
                .map(ScoredExample::dense)
                .collect()
        };

        let Some(reranker) = self.reranker else {
            return Ok(Retrieval::new(SearchMode::Rerank, dense_order(shortlist))
                .degraded(Some("no reranker configured".to_string())));
        };

        let candidates: Vec<Example> =
            shortlist.iter().map(|h| h.example.clone()).collect();
        match reranker.rerank(query_text, &candidates, config.top_k) {
            Ok(ranked) => {
                let mut by_id: BTreeMap<u64, DenseHit> = shortlist
                    .into_iter()
                    .map(|h| (h.example.id, h))
                    .collect();
                let mut results: Vec<ScoredExample> = ranked
                    .into_iter()
                    .filter_map(|r| {
                        by_id.remove(&r.id).map(|hit| ScoredExample {
                            rerank_score: Some(r.score),
                            ..ScoredExample::dense(hit)
                        })
                    })
                    .collect();
                results.sort_by(|a, b| {
                    b.rerank_score
                        .unwrap_or(0.0)
                        .total_cmp(&a.rerank_score.unwrap_or(0.0))
                        .then(a.example.id.cmp(&b.example.id))
                });
                results.truncate(config.top_k);
                Ok(Retrieval::new(SearchMode::Rerank, results))
            }
            Err(e) => {
                warn!(error = %e, "reranker failed, keeping dense order");
                Ok(Retrieval::new(SearchMode::Rerank, dense_order(shortlist))
                    .degraded(Some(e.to_string())))
            }
        }
    }
}

struct Candidate {
    example: Example,
    dense: Option<f32>,
    lexical: Option<f32>,
}

/// Min-max normalization of a raw BM25 score over the candidate pool.
///
/// When every candidate scored the same, a positive score maps to 1.0 and
/// anything else to 0.0.
fn normalize_lexical(score: f32, min: f32, max: f32) -> f32 {
    if max > min {
        (score - min) / (max - min)
    } else if max > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Format results for human-readable terminal output.
pub fn format_human(retrieval: &Retrieval) {
    if retrieval.results.is_empty() {
        println!("No results found.");
        return;
    }

    for r in &retrieval.results {
        let score = r
            .rerank_score
            .or(r.hybrid_score)
            .unwrap_or(r.similarity);
        println!(
            "{:>3}. [{:.3}] {} p{} ({}) #{}",
            r.rank,
            score,
            r.example.metadata.document,
            r.example.metadata.page,
            r.example.answer.page_role,
            r.example.id,
        );
        println!(
            "     {}",
            text_util::snippet(
                &r.example.source_text,
                text_util::DEFAULT_SNIPPET_MAX_CHARS
            )
        );
    }
    if retrieval.used_fallback {
        println!("\n(no result met the similarity floor; showing nearest)");
    }
    if let Quality::Degraded { reason } = &retrieval.quality {
        println!("\n(degraded: {reason})");
    }
    println!("\n{} result(s)", retrieval.results.len());
}

/// Format results as JSON output.
pub fn format_json(retrieval: &Retrieval, query: &str) -> Result<()> {
    let out = serde_json::json!({
        "query": query,
        "result_count": retrieval.results.len(),
        "retrieval": retrieval,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
