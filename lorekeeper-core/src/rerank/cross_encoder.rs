use super::encoding::{EncodedBatch, SequenceBudget, SpecialTokens};
use super::{RerankError, Reranker, Result};
use crate::types::RerankScore;
use async_trait::async_trait;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use std::sync::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::bert::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::{
    DecoderWrapper, ModelWrapper, NormalizerWrapper, PostProcessorWrapper, PreTokenizerWrapper,
    Tokenizer, TokenizerBuilder,
};
use tracing::{debug, info};

/// Pairs scored per model run.
const BATCH_SIZE: usize = 8;

/// BERT-style names first, then the RoBERTa-style equivalents.
const CLS_TOKENS: [&str; 2] = ["[CLS]", "<s>"];
const SEP_TOKENS: [&str; 2] = ["[SEP]", "</s>"];
const PAD_TOKENS: [&str; 2] = ["[PAD]", "<pad>"];

/// Cross-encoder reranker backed by an ONNX model.
///
/// Each document is encoded together with the query as
/// `[CLS] query [SEP] doc [SEP]` (see [`SequenceBudget`]) and the model's
/// single output logit is the relevance score.
pub struct CrossEncoderReranker {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    special: SpecialTokens,
    budget: SequenceBudget,
}

impl CrossEncoderReranker {
    /// Loads the scoring model and tokenizer.
    ///
    /// `tokenizer_path` may be a `tokenizer.json` or a WordPiece `vocab.txt`
    /// (lower-cased BERT normalization).
    ///
    /// # Errors
    ///
    /// [`RerankError::InvalidConfig`] for a `max_seq_len` below 3 is checked
    /// before any artifact is touched. Missing or unreadable artifacts give
    /// [`RerankError::Load`].
    pub fn load(model_path: &Path, tokenizer_path: &Path, max_seq_len: usize) -> Result<Self> {
        let budget = SequenceBudget::new(max_seq_len)?;

        let tokenizer = load_tokenizer(tokenizer_path)?;
        let special = special_tokens(&tokenizer)?;

        let session = Session::builder()
            .map_err(load_error)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_error)?
            .with_intra_threads(4)
            .map_err(load_error)?
            .commit_from_file(model_path)
            .map_err(load_error)?;

        info!(
            model = %model_path.display(),
            max_seq_len,
            "Cross-encoder reranker initialized"
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            special,
            budget,
        })
    }

    fn token_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| RerankError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Runs the model once for up to [`BATCH_SIZE`] documents.
    fn score_batch(&self, query_ids: &[u32], docs: &[String]) -> Result<Vec<f32>> {
        let pairs = docs
            .iter()
            .map(|doc| {
                let doc_ids = self.token_ids(doc)?;
                Ok(self.budget.encode(query_ids, &doc_ids, self.special))
            })
            .collect::<Result<Vec<_>>>()?;

        let batch = EncodedBatch::from_pairs(pairs, self.budget.max_seq_len());
        let shape = [batch.batch_size, batch.seq_len];

        let input_ids = ort::value::Tensor::from_array((shape, batch.input_ids.into_boxed_slice()))
            .map_err(backend_error)?;
        let attention_mask =
            ort::value::Tensor::from_array((shape, batch.attention_mask.into_boxed_slice()))
                .map_err(backend_error)?;
        let token_type_ids =
            ort::value::Tensor::from_array((shape, batch.token_type_ids.into_boxed_slice()))
                .map_err(backend_error)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| RerankError::Backend(format!("Session lock poisoned: {e}")))?;
        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ])
            .map_err(backend_error)?;

        let (_, logits) = outputs[0].try_extract_tensor::<f32>().map_err(backend_error)?;

        // Output shape is [batch, 1] (or [batch]); take the first logit per row.
        let per_row = logits.len() / batch.batch_size.max(1);
        if per_row == 0 {
            return Err(RerankError::Backend(format!(
                "expected {} logits, got {}",
                batch.batch_size,
                logits.len()
            )));
        }

        Ok((0..batch.batch_size).map(|row| logits[row * per_row]).collect())
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn score(&self, query: &str, docs: &[String]) -> Result<Vec<RerankScore>> {
        run_blocking(|| {
            let query_ids = self.token_ids(query)?;
            score_in_batches(docs, |chunk| self.score_batch(&query_ids, chunk))
        })
    }
}

/// Runs CPU-bound inference without stalling other tasks on a worker thread.
///
/// `block_in_place` is only allowed on the multi-threaded runtime; elsewhere
/// the closure runs inline.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Scores `docs` in chunks of [`BATCH_SIZE`], keeping each score tied to the
/// document's position in `docs`.
fn score_in_batches(
    docs: &[String],
    mut score_batch: impl FnMut(&[String]) -> Result<Vec<f32>>,
) -> Result<Vec<RerankScore>> {
    let mut scores = Vec::with_capacity(docs.len());

    for (batch_idx, chunk) in docs.chunks(BATCH_SIZE).enumerate() {
        let logits = score_batch(chunk)?;
        if logits.len() != chunk.len() {
            return Err(RerankError::Backend(format!(
                "batch {batch_idx}: expected {} scores, got {}",
                chunk.len(),
                logits.len()
            )));
        }
        debug!(batch = batch_idx, size = chunk.len(), "Scored rerank batch");

        scores.extend(logits.into_iter().enumerate().map(|(offset, score)| RerankScore {
            original_index: batch_idx * BATCH_SIZE + offset,
            score,
        }));
    }

    Ok(scores)
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let mut tokenizer = if is_json {
        Tokenizer::from_file(path).map_err(load_error)?
    } else {
        wordpiece_from_vocab(path)?
    };

    // Sequences are assembled by hand, so the file's own limits must not apply.
    tokenizer.with_truncation(None).map_err(load_error)?;
    tokenizer.with_padding(None);

    Ok(tokenizer)
}

fn wordpiece_from_vocab(path: &Path) -> Result<Tokenizer> {
    let vocab = path
        .to_str()
        .ok_or_else(|| RerankError::Load(format!("non UTF-8 vocab path: {}", path.display())))?;
    let model = WordPiece::from_file(vocab).build().map_err(load_error)?;

    let tokenizer = TokenizerBuilder::<
        ModelWrapper,
        NormalizerWrapper,
        PreTokenizerWrapper,
        PostProcessorWrapper,
        DecoderWrapper,
    >::new()
    .with_model(model.into())
    .with_normalizer(Some(BertNormalizer::new(true, true, None, true).into()))
    .with_pre_tokenizer(Some(BertPreTokenizer.into()))
    .build()
    .map_err(load_error)?;

    Ok(tokenizer.into())
}

fn special_tokens(tokenizer: &Tokenizer) -> Result<SpecialTokens> {
    let lookup = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| tokenizer.token_to_id(name))
            .ok_or_else(|| RerankError::Load(format!("vocabulary has none of {names:?}")))
    };

    Ok(SpecialTokens {
        cls: lookup(&CLS_TOKENS)?,
        sep: lookup(&SEP_TOKENS)?,
        pad: lookup(&PAD_TOKENS)?,
    })
}

fn load_error(e: impl std::fmt::Display) -> RerankError {
    RerankError::Load(e.to_string())
}

fn backend_error(e: impl std::fmt::Display) -> RerankError {
    RerankError::Backend(e.to_string())
}
