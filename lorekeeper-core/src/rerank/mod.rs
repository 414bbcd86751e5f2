//! Optional neural reranking of the candidate pool.
//!
//! The orchestrator depends only on the [`Reranker`] capability. Two
//! variants ship with the crate:
//! - [`NoOpReranker`]: keeps the search service's order
//! - [`CrossEncoderReranker`]: scores `[CLS] query [SEP] doc [SEP]` pairs
//!   with an ONNX cross-encoder

mod cross_encoder;
mod encoding;

pub use cross_encoder::CrossEncoderReranker;
pub use encoding::{EncodedBatch, EncodedPair, SequenceBudget, SpecialTokens};

use crate::types::RerankScore;
use async_trait::async_trait;
use thiserror::Error;

/// The `RerankFailure` class of errors. At query time the orchestrator
/// recovers by keeping the unranked order.
#[derive(Debug, Error)]
pub enum RerankError {
    #[error("Invalid reranker configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load reranker artifacts: {0}")]
    Load(String),

    #[error("Tokenization failed: {0}")]
    Tokenizer(String),

    #[error("Scoring backend failed: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, RerankError>;

/// Re-scores documents against a query.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Whether scoring would change anything. The orchestrator skips the
    /// reranking stage for inactive rerankers.
    fn is_active(&self) -> bool {
        true
    }

    /// Returns one score per document, in input order.
    ///
    /// Sorting the result by score (see [`rerank_order`]) yields the reorder
    /// permutation.
    async fn score(&self, query: &str, docs: &[String]) -> Result<Vec<RerankScore>>;
}

/// Leaves candidates in the order the search service returned them.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpReranker;

#[async_trait]
impl Reranker for NoOpReranker {
    fn is_active(&self) -> bool {
        false
    }

    async fn score(&self, _query: &str, docs: &[String]) -> Result<Vec<RerankScore>> {
        Ok((0..docs.len())
            .map(|original_index| RerankScore {
                original_index,
                score: 0.0,
            })
            .collect())
    }
}

/// Turns scores into the order candidates should be presented in, best first.
///
/// Ties keep their original relative order and NaN scores rank last. Returns
/// `None` unless the scores cover every index in `0..len` exactly once.
pub fn rerank_order(scores: &[RerankScore], len: usize) -> Option<Vec<usize>> {
    if scores.len() != len {
        return None;
    }

    let mut seen = vec![false; len];
    for score in scores {
        let slot = seen.get_mut(score.original_index)?;
        if *slot {
            return None;
        }
        *slot = true;
    }

    let mut ranked = scores.to_vec();
    ranked.sort_by(|a, b| sort_key(b.score).total_cmp(&sort_key(a.score)));
    Some(ranked.into_iter().map(|s| s.original_index).collect())
}

fn sort_key(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}
