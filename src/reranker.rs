use std::sync::Arc;

use candle_core::Tensor;
use rayon::prelude::*;

use crate::{
    error::{Error, Result},
    example::Example,
    model_manager::ModelManager,
};

/// A reranked example with its joint relevance score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedExample {
    pub id: u64,
    pub score: f32,
}

/// Jointly scores (query, candidate) pairs and re-orders a shortlist.
pub trait Reranker: Send + Sync {
    /// Return at most `top_n` candidates, best first.
    ///
    /// Candidates with equal scores keep their input order.
    fn rerank(
        &self,
        query_text: &str,
        candidates: &[Example],
        top_n: usize,
    ) -> Result<Vec<RankedExample>>;
}

/// Late-interaction reranker backed by the ColBERT model.
///
/// Query and candidate texts are encoded token by token; each candidate's
/// score is the MaxSim of the two matrices.
#[derive(Debug, Clone)]
pub struct ColbertReranker {
    model: Arc<ModelManager>,
}

impl ColbertReranker {
    pub fn new(model: Arc<ModelManager>) -> Self {
        Self { model }
    }
}

impl Reranker for ColbertReranker {
    fn rerank(
        &self,
        query_text: &str,
        candidates: &[Example],
        top_n: usize,
    ) -> Result<Vec<RankedExample>> {
        if candidates.is_empty() || top_n == 0 {
            return Ok(Vec::new());
        }
        let unavailable = |e: Error| Error::RerankUnavailable(e.to_string());

        let query = self.model.encode_query(query_text).map_err(unavailable)?;
        let texts: Vec<String> =
            candidates.iter().map(|c| c.source_text.clone()).collect();
        let docs = self.model.encode(&texts, false).map_err(unavailable)?;

        let matrices = (0..candidates.len())
            .map(|i| docs.get(i).map_err(map_candle_err))
            .collect::<Result<Vec<Tensor>>>()?;

        let scores = matrices
            .par_iter()
            .map(|doc| maxsim(&query, doc))
            .collect::<Result<Vec<f32>>>()?;

        Ok(rank(candidates, &scores, top_n))
    }
}

/// Order candidates by score descending; equal scores go to the earlier
/// inserted example (lower id).
pub fn rank(
    candidates: &[Example],
    scores: &[f32],
    top_n: usize,
) -> Vec<RankedExample> {
    let mut ranked: Vec<RankedExample> = candidates
        .iter()
        .zip(scores)
        .map(|(c, &score)| RankedExample { id: c.id, score })
        .collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    ranked.truncate(top_n);
    ranked
}

/// Compute the MaxSim score between a query embedding and a document embedding.
///
/// query_embedding: [Q, D] where Q = query tokens, D = embedding dimension
/// doc_embedding: [T, D] where T = document tokens, D = embedding dimension
///
/// MaxSim = sum over query tokens of max(query_token . doc_token for all doc tokens)
fn maxsim(query_embedding: &Tensor, doc_embedding: &Tensor) -> Result<f32> {
    let sim_matrix = query_embedding
        .matmul(&doc_embedding.t().map_err(map_candle_err)?)
        .map_err(map_candle_err)?;

    let row_maxes = sim_matrix.max(1).map_err(map_candle_err)?;

    row_maxes
        .sum_all()
        .map_err(map_candle_err)?
        .to_scalar::<f32>()
        .map_err(map_candle_err)
}

fn map_candle_err(e: candle_core::Error) -> Error {
    Error::RerankUnavailable(format!("tensor computation error: {e}"))
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::example::{AnswerPayload, ExampleMetadata};

    fn make_tensor(data: &[f32], shape: (usize, usize)) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn example(id: u64) -> Example {
        Example {
            id,
            source_text: format!("text {id}"),
            answer: AnswerPayload::new("main", vec![]),
            metadata: ExampleMetadata::manual("doc", id as u32, "main"),
        }
    }

    #[test]
    fn maxsim_identical_vectors() {
        let q = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let d = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let score = maxsim(&q, &d).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn maxsim_orthogonal_vectors() {
        let q = make_tensor(&[1.0, 0.0, 0.0], (1, 3));
        let d = make_tensor(&[0.0, 1.0, 0.0], (1, 3));
        let score = maxsim(&q, &d).unwrap();
        assert!(score.abs() < 1e-6);
    }

    #[test]
    fn maxsim_multiple_query_tokens() {
        // row maxes: [1.0, 1.0], sum = 2.0
        let q = make_tensor(&[1.0, 0.0, 0.0, 1.0], (2, 2));
        let d = make_tensor(&[1.0, 0.0, 0.0, 1.0, 0.5, 0.5], (3, 2));
        let score = maxsim(&q, &d).unwrap();
        assert!((score - 2.0).abs() < 1e-6);
    }

    #[test]
    fn rank_orders_and_truncates() {
        let candidates = vec![example(1), example(2), example(3)];
        let ranked = rank(&candidates, &[0.2, 0.9, 0.5], 2);
        let ids: Vec<u64> = ranked.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn rank_breaks_ties_by_insertion_order() {
        let candidates = vec![example(7), example(3), example(5)];
        let ranked = rank(&candidates, &[0.5, 0.5, 0.5], 3);
        let ids: Vec<u64> = ranked.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 5, 7]);
    }
}
