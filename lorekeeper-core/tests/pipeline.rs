use async_trait::async_trait;
use lorekeeper_core::content::{self, ContentSource, FetchError};
use lorekeeper_core::generation::{self, GenerationError, Generator};
use lorekeeper_core::rerank::{self, RerankError, Reranker};
use lorekeeper_core::{Answer, Hit, Orchestrator, PipelineConfig, PipelineError, RerankScore};
use lorekeeper_core::{SearchBackend, NO_SUPPORT_MESSAGE};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const LETTERS: [&str; 10] = ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"];

struct StubSearch {
    hits: Vec<Hit>,
}

impl StubSearch {
    fn titles(titles: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            hits: titles
                .iter()
                .map(|t| Hit::new(*t, format!("/A/{t}")))
                .collect(),
        })
    }
}

#[async_trait]
impl SearchBackend for StubSearch {
    async fn search(&self, _query: &str, k: usize) -> Vec<Hit> {
        self.hits.iter().take(k).cloned().collect()
    }
}

/// Serves `text of <locator>` and records every request.
#[derive(Default)]
struct StubContent {
    failing: HashSet<String>,
    fetched: Mutex<Vec<String>>,
}

impl StubContent {
    fn failing(locators: &[&str]) -> Self {
        Self {
            failing: locators.iter().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentSource for StubContent {
    async fn fetch(&self, locator: &str) -> content::Result<String> {
        self.fetched.lock().unwrap().push(locator.to_string());
        if self.failing.contains(locator) {
            return Err(FetchError::Status {
                locator: locator.to_string(),
                status: reqwest::StatusCode::NOT_FOUND,
            });
        }
        Ok(format!("text of {locator}"))
    }
}

/// Scores documents so that the input order is reversed.
struct ReversingReranker;

#[async_trait]
impl Reranker for ReversingReranker {
    async fn score(&self, _query: &str, docs: &[String]) -> rerank::Result<Vec<RerankScore>> {
        Ok((0..docs.len())
            .map(|original_index| RerankScore {
                original_index,
                score: original_index as f32,
            })
            .collect())
    }
}

struct FailingReranker;

#[async_trait]
impl Reranker for FailingReranker {
    async fn score(&self, _query: &str, _docs: &[String]) -> rerank::Result<Vec<RerankScore>> {
        Err(RerankError::Backend("session crashed".to_string()))
    }
}

/// Records prompts; fails the first call when `fail_once` is set.
#[derive(Default)]
struct StubGenerator {
    prompts: Mutex<Vec<String>>,
    fail_once: AtomicBool,
}

impl StubGenerator {
    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for StubGenerator {
    async fn complete_once(
        &self,
        _model: &str,
        prompt: &str,
        _context_tokens: u32,
        _temperature: f64,
    ) -> generation::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail_once.swap(false, Ordering::SeqCst) {
            return Err(GenerationError::ModelPullTimeout {
                model: "stub".to_string(),
                attempts: 0,
            });
        }
        Ok("Generated reply.".to_string())
    }
}

fn pipeline_config(rerank_enabled: bool) -> PipelineConfig {
    PipelineConfig {
        k: 40,
        max_articles: 5,
        rerank_enabled,
        context_tokens: 4096,
        temperature: 0.2,
        max_seq_len: 256,
    }
}

fn orchestrator(
    config: PipelineConfig,
    search: Arc<StubSearch>,
    content: Arc<StubContent>,
    generator: Arc<StubGenerator>,
) -> Orchestrator {
    Orchestrator::new(config, "llama3.2:3b", "SYSTEM", search, content, generator)
}

/// Titles of the `# <title>` blocks in prompt order.
fn prompt_blocks(prompt: &str) -> Vec<String> {
    prompt
        .lines()
        .filter_map(|line| line.strip_prefix("# "))
        .map(str::to_string)
        .collect()
}

fn locators(titles: &[&str]) -> Vec<String> {
    titles.iter().map(|t| format!("/A/{t}")).collect()
}

#[tokio::test]
async fn test_zero_hits_never_reach_generation() -> anyhow::Result<()> {
    let content = Arc::new(StubContent::default());
    let generator = Arc::new(StubGenerator::default());
    let orchestrator = orchestrator(
        pipeline_config(false),
        StubSearch::titles(&[]),
        content.clone(),
        generator.clone(),
    );

    let answer = orchestrator.answer("Who was nobody?").await?;
    assert_eq!(answer, Answer::NoSupport);
    assert_eq!(answer.to_string(), NO_SUPPORT_MESSAGE);
    assert!(content.fetched().is_empty());
    assert!(generator.prompts().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unranked_pipeline_uses_top_hits_in_order() -> anyhow::Result<()> {
    let content = Arc::new(StubContent::default());
    let generator = Arc::new(StubGenerator::default());
    let orchestrator = orchestrator(
        pipeline_config(false),
        StubSearch::titles(&LETTERS),
        content.clone(),
        generator.clone(),
    );

    let answer = orchestrator.answer("Albert Einstein").await?;

    assert_eq!(content.fetched(), locators(&["A", "B", "C", "D", "E"]));

    let prompts = generator.prompts();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompt_blocks(&prompts[0]), vec!["A", "B", "C", "D", "E"]);
    assert!(prompts[0].starts_with("SYSTEM\n\n"));
    assert!(prompts[0].ends_with("Question: Albert Einstein"));
    assert!(prompts[0].contains("# C\ntext of /A/C"));

    assert_eq!(answer.citation_line().as_deref(), Some("Sources: A; B; C; D; E"));
    assert_eq!(
        answer.to_string(),
        "Generated reply.\n\nSources: A; B; C; D; E"
    );
    Ok(())
}

#[tokio::test]
async fn test_reranker_reorders_candidate_pool() -> anyhow::Result<()> {
    let content = Arc::new(StubContent::default());
    let generator = Arc::new(StubGenerator::default());
    let orchestrator = orchestrator(
        pipeline_config(true),
        StubSearch::titles(&["A", "B", "C", "D", "E"]),
        content.clone(),
        generator.clone(),
    )
    .with_reranker(Arc::new(ReversingReranker));

    let answer = orchestrator.answer("Albert Einstein").await?;

    assert_eq!(content.fetched(), locators(&["A", "B", "C", "D", "E"]));
    assert_eq!(prompt_blocks(&generator.prompts()[0]), vec!["E", "D", "C", "B", "A"]);
    assert_eq!(answer.sources(), ["E", "D", "C", "B", "A"]);
    assert_eq!(answer.citation_line().as_deref(), Some("Sources: E; D; C; B; A"));
    Ok(())
}

#[tokio::test]
async fn test_rerank_pool_is_bounded_and_selection_capped() -> anyhow::Result<()> {
    let titles: Vec<String> = (0..30).map(|i| format!("T{i:02}")).collect();
    let title_refs: Vec<&str> = titles.iter().map(String::as_str).collect();
    let content = Arc::new(StubContent::default());
    let generator = Arc::new(StubGenerator::default());
    let orchestrator = orchestrator(
        pipeline_config(true),
        StubSearch::titles(&title_refs),
        content.clone(),
        generator.clone(),
    )
    .with_reranker(Arc::new(ReversingReranker));

    let answer = orchestrator.answer("anything").await?;

    assert_eq!(content.fetched().len(), 20);
    assert_eq!(answer.sources(), ["T19", "T18", "T17", "T16", "T15"]);
    Ok(())
}

#[tokio::test]
async fn test_failed_fetches_are_skipped() -> anyhow::Result<()> {
    let content = Arc::new(StubContent::failing(&["/A/B", "/A/D"]));
    let generator = Arc::new(StubGenerator::default());
    let orchestrator = orchestrator(
        pipeline_config(false),
        StubSearch::titles(&LETTERS),
        content.clone(),
        generator.clone(),
    );

    let answer = orchestrator.answer("Albert Einstein").await?;

    assert_eq!(answer.sources(), ["A", "C", "E"]);
    assert_eq!(prompt_blocks(&generator.prompts()[0]), vec!["A", "C", "E"]);
    Ok(())
}

#[tokio::test]
async fn test_all_fetches_failing_is_no_support() -> anyhow::Result<()> {
    let content = Arc::new(StubContent::failing(&["/A/A", "/A/B"]));
    let generator = Arc::new(StubGenerator::default());
    let orchestrator = orchestrator(
        pipeline_config(false),
        StubSearch::titles(&["A", "B"]),
        content,
        generator.clone(),
    );

    assert_eq!(orchestrator.answer("anything").await?, Answer::NoSupport);
    assert!(generator.prompts().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rerank_failure_keeps_search_order() -> anyhow::Result<()> {
    let content = Arc::new(StubContent::default());
    let generator = Arc::new(StubGenerator::default());
    let orchestrator = orchestrator(
        pipeline_config(true),
        StubSearch::titles(&LETTERS),
        content,
        generator.clone(),
    )
    .with_reranker(Arc::new(FailingReranker));

    let answer = orchestrator.answer("Albert Einstein").await?;
    assert_eq!(answer.sources(), ["A", "B", "C", "D", "E"]);
    Ok(())
}

#[tokio::test]
async fn test_generation_failure_ends_only_the_current_query() {
    let generator = Arc::new(StubGenerator::default());
    generator.fail_once.store(true, Ordering::SeqCst);
    let orchestrator = orchestrator(
        pipeline_config(false),
        StubSearch::titles(&LETTERS),
        Arc::new(StubContent::default()),
        generator.clone(),
    );

    let first = orchestrator.answer("first").await;
    assert!(matches!(first, Err(PipelineError::Generation(_))));

    let second = orchestrator.answer("second").await.unwrap();
    assert_eq!(second.sources().len(), 5);
    assert_eq!(generator.prompts().len(), 2);
}
