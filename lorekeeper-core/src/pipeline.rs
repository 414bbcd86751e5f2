//! The question answering pipeline.
//!
//! One query moves through these stages, each awaited in turn:
//!
//! ```text
//! Searching -> NoSupport
//!           -> FetchingCandidates -> [Reranking] -> Selecting
//!              -> PromptBuilding -> Generating -> Citing -> Answered
//! ```
//!
//! Only the [`Reranker`] may reorder the candidate pool. Without reranking,
//! articles are used in the order the search service ranked them.

use crate::config::PipelineConfig;
use crate::content::ContentSource;
use crate::generation::{GenerationError, Generator};
use crate::rerank::{rerank_order, NoOpReranker, Reranker};
use crate::search::SearchBackend;
use crate::types::{truncate_chars, Candidate, Hit};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Reply for questions the snapshot has nothing on.
pub const NO_SUPPORT_MESSAGE: &str = "No support found in this offline snapshot.";

/// Upper bound on the pool handed to the reranker.
const RERANK_POOL_SIZE: usize = 20;
/// Per-candidate character cap while reranking.
const RERANK_TEXT_CHARS: usize = 2_000;
/// Per-article character cap inside the prompt.
const PROMPT_TEXT_CHARS: usize = 6_000;

const CONTEXT_HEADER: &str = "Retrieved context (from local Wikipedia):";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Outcome of one query.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// Search returned nothing usable; the model was never asked.
    NoSupport,
    Answered {
        reply: String,
        /// Titles of the articles placed in the prompt, in prompt order
        sources: Vec<String>,
    },
}

impl Answer {
    pub fn sources(&self) -> &[String] {
        match self {
            Answer::NoSupport => &[],
            Answer::Answered { sources, .. } => sources,
        }
    }

    /// The `Sources: A; B` attribution line.
    pub fn citation_line(&self) -> Option<String> {
        match self {
            Answer::NoSupport => None,
            Answer::Answered { sources, .. } => Some(format!("Sources: {}", sources.join("; "))),
        }
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::NoSupport => f.write_str(NO_SUPPORT_MESSAGE),
            Answer::Answered { reply, .. } => match self.citation_line() {
                Some(citation) => write!(f, "{reply}\n\n{citation}"),
                None => f.write_str(reply),
            },
        }
    }
}

/// Composes search, content, reranking and generation into answers.
///
/// All collaborators are shared handles created once at startup (see
/// [`Runtime`](crate::runtime::Runtime)); the orchestrator itself holds no
/// mutable state, so concurrent `answer` calls are independent.
#[derive(Clone)]
pub struct Orchestrator {
    config: PipelineConfig,
    model: String,
    system_prompt: String,
    search: Arc<dyn SearchBackend>,
    content: Arc<dyn ContentSource>,
    reranker: Arc<dyn Reranker>,
    generator: Arc<dyn Generator>,
}

impl Orchestrator {
    /// Creates an orchestrator that keeps the search service's order.
    ///
    /// Use [`with_reranker`](Self::with_reranker) to plug in a reranker.
    pub fn new(
        config: PipelineConfig,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        search: Arc<dyn SearchBackend>,
        content: Arc<dyn ContentSource>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            config,
            model: model.into(),
            system_prompt: system_prompt.into(),
            search,
            content,
            reranker: Arc::new(NoOpReranker),
            generator,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn reranking(&self) -> bool {
        self.config.rerank_enabled && self.reranker.is_active()
    }

    /// Answers `question` from the offline snapshot.
    ///
    /// Failed article fetches and reranker failures degrade the answer
    /// rather than failing it.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Generation`] when the generation service fails. The
    /// orchestrator stays usable for later queries.
    pub async fn answer(&self, question: &str) -> Result<Answer> {
        debug!(k = self.config.k, "Searching");
        let hits = self.search.search(question, self.config.k).await;
        if hits.is_empty() {
            info!("No search hits");
            return Ok(Answer::NoSupport);
        }
        info!(hits = hits.len(), "Search complete");

        let selected = if self.reranking() {
            let pool_size = RERANK_POOL_SIZE.min(hits.len());
            let pool = self
                .fetch_candidates(&hits[..pool_size], RERANK_TEXT_CHARS)
                .await;
            let mut ranked = self.rerank(question, pool).await;
            ranked.truncate(self.config.max_articles);
            ranked
        } else {
            let take = self.config.max_articles.min(hits.len());
            self.fetch_candidates(&hits[..take], PROMPT_TEXT_CHARS).await
        };

        if selected.is_empty() {
            warn!("Every article fetch failed");
            return Ok(Answer::NoSupport);
        }

        let prompt = build_prompt(&self.system_prompt, &selected, question);
        debug!(articles = selected.len(), chars = prompt.len(), "Prompt assembled");

        let reply = self
            .generator
            .complete_once(
                &self.model,
                &prompt,
                self.config.context_tokens,
                self.config.temperature,
            )
            .await?;

        let sources = selected.iter().map(|c| c.title().to_string()).collect();
        Ok(Answer::Answered { reply, sources })
    }

    /// Fetches hits in order, dropping the ones that fail or come back blank.
    async fn fetch_candidates(&self, hits: &[Hit], max_chars: usize) -> Vec<Candidate> {
        let mut candidates = Vec::with_capacity(hits.len());

        for hit in hits {
            match self.content.fetch(&hit.locator).await {
                Ok(text) if text.trim().is_empty() => {
                    debug!(title = %hit.title, "Skipping empty article");
                }
                Ok(text) => candidates.push(Candidate::new(hit, &text, max_chars)),
                Err(e) => {
                    warn!(title = %hit.title, error = %e, "Dropping candidate");
                }
            }
        }

        debug!(fetched = candidates.len(), requested = hits.len(), "Candidates fetched");
        candidates
    }

    /// Reorders the pool by reranker score, or leaves it alone on failure.
    async fn rerank(&self, question: &str, pool: Vec<Candidate>) -> Vec<Candidate> {
        if pool.len() < 2 {
            return pool;
        }

        let docs: Vec<String> = pool.iter().map(|c| c.text().to_string()).collect();
        let scores = match self.reranker.score(question, &docs).await {
            Ok(scores) => scores,
            Err(e) => {
                warn!(error = %e, "Reranking failed, keeping search order");
                return pool;
            }
        };

        let Some(order) = rerank_order(&scores, pool.len()) else {
            warn!("Reranker returned an invalid permutation, keeping search order");
            return pool;
        };
        debug!(?order, "Candidates reranked");

        let mut slots: Vec<Option<Candidate>> = pool.into_iter().map(Some).collect();
        order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect()
    }
}

/// Assembles the generation prompt.
///
/// The system preamble comes first, then one `# <title>` block per selected
/// article (capped at 6,000 characters each, separated by a blank line), then
/// the question.
pub fn build_prompt(system_prompt: &str, selected: &[Candidate], question: &str) -> String {
    let context = selected
        .iter()
        .map(|c| {
            format!(
                "# {}\n{}",
                c.title(),
                truncate_chars(c.text(), PROMPT_TEXT_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!("{system_prompt}\n\n{CONTEXT_HEADER}\n{context}\n\nQuestion: {question}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, text: &str) -> Candidate {
        Candidate::new(&Hit::new(title, format!("/A/{title}")), text, usize::MAX)
    }

    #[test]
    fn test_prompt_layout() {
        let selected = vec![candidate("A", "alpha"), candidate("B", "beta")];
        let prompt = build_prompt("Be brief.", &selected, "What?");
        assert_eq!(
            prompt,
            "Be brief.\n\nRetrieved context (from local Wikipedia):\n# A\nalpha\n\n# B\nbeta\n\nQuestion: What?"
        );
    }

    #[test]
    fn test_prompt_caps_article_text() {
        let selected = vec![candidate("Long", &"y".repeat(9_000))];
        let prompt = build_prompt("", &selected, "q");
        assert_eq!(prompt.matches('y').count(), PROMPT_TEXT_CHARS);
    }

    #[test]
    fn test_answer_display() {
        assert_eq!(Answer::NoSupport.to_string(), NO_SUPPORT_MESSAGE);
        assert!(Answer::NoSupport.sources().is_empty());

        let answer = Answer::Answered {
            reply: "He was a physicist.".to_string(),
            sources: vec!["Albert Einstein".to_string(), "Physics".to_string()],
        };
        assert_eq!(
            answer.to_string(),
            "He was a physicist.\n\nSources: Albert Einstein; Physics"
        );
    }
}
