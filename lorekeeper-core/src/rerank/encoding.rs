//! Cross-encoder input construction.
//!
//! Every pair becomes exactly `max_seq_len` positions:
//!
//! ```text
//! [CLS] query... [SEP] doc... [SEP] [PAD]...
//!   0     0...     0     1...   1     0...    token type ids
//!   1     1...     1     1...   1     0...    attention mask
//! ```
//!
//! Three slots are reserved for the special tokens. The query gets at most a
//! third of the remaining room and the document gets whatever the query
//! leaves over.

use super::{RerankError, Result};

/// Reserved slots: one classification token and two separators.
const RESERVED: usize = 3;

/// Vocabulary ids of the special tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub cls: u32,
    pub sep: u32,
    pub pad: u32,
}

/// A validated maximum sequence length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceBudget {
    max_seq_len: usize,
}

impl SequenceBudget {
    /// Fails for lengths that cannot hold the special tokens.
    pub fn new(max_seq_len: usize) -> Result<Self> {
        if max_seq_len < RESERVED {
            return Err(RerankError::InvalidConfig(format!(
                "max_seq_len must be at least {RESERVED}, got {max_seq_len}"
            )));
        }
        Ok(Self { max_seq_len })
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// How many query and document tokens fit.
    pub fn split(&self, query_len: usize, doc_len: usize) -> (usize, usize) {
        let room = self.max_seq_len - RESERVED;
        let query_take = query_len.min(room / 3);
        let doc_take = doc_len.min(room - query_take);
        (query_take, doc_take)
    }

    /// Assembles one padded `[CLS] query [SEP] doc [SEP]` sequence.
    pub fn encode(&self, query_ids: &[u32], doc_ids: &[u32], special: SpecialTokens) -> EncodedPair {
        let (query_take, doc_take) = self.split(query_ids.len(), doc_ids.len());
        let mut pair = EncodedPair::with_capacity(self.max_seq_len);

        pair.push(special.cls, 0);
        for &id in &query_ids[..query_take] {
            pair.push(id, 0);
        }
        pair.push(special.sep, 0);
        for &id in &doc_ids[..doc_take] {
            pair.push(id, 1);
        }
        pair.push(special.sep, 1);

        while pair.input_ids.len() < self.max_seq_len {
            pair.input_ids.push(i64::from(special.pad));
            pair.token_type_ids.push(0);
            pair.attention_mask.push(0);
        }

        pair
    }
}

/// Model inputs for one query/document pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPair {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub token_type_ids: Vec<i64>,
}

impl EncodedPair {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            input_ids: Vec::with_capacity(capacity),
            attention_mask: Vec::with_capacity(capacity),
            token_type_ids: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, id: u32, token_type: i64) {
        self.input_ids.push(i64::from(id));
        self.token_type_ids.push(token_type);
        self.attention_mask.push(1);
    }

    /// Positions holding real (non-padding) tokens.
    pub fn len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row-major `[batch_size, seq_len]` tensors for one model run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub batch_size: usize,
    pub seq_len: usize,
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub token_type_ids: Vec<i64>,
}

impl EncodedBatch {
    pub fn from_pairs(pairs: Vec<EncodedPair>, seq_len: usize) -> Self {
        let batch_size = pairs.len();
        let mut batch = Self {
            batch_size,
            seq_len,
            input_ids: Vec::with_capacity(batch_size * seq_len),
            attention_mask: Vec::with_capacity(batch_size * seq_len),
            token_type_ids: Vec::with_capacity(batch_size * seq_len),
        };

        for pair in pairs {
            batch.input_ids.extend(pair.input_ids);
            batch.attention_mask.extend(pair.attention_mask);
            batch.token_type_ids.extend(pair.token_type_ids);
        }

        batch
    }
}
