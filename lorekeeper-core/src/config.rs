use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the whole question-answering runtime.
///
/// Covers the two backing services (content server and LLM server), the
/// retrieval knobs, the optional reranker and the on-disk locations the
/// runtime needs to find executables and models.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub wiki: WikiConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub prompt: PromptConfig,
    pub reranker: RerankerConfig,
    pub paths: PathsConfig,
}

/// Which generation model to ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
}

/// The offline knowledge snapshot and the content server that serves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WikiConfig {
    /// Path to the snapshot archive handed to the content server
    pub zim: PathBuf,
    pub bind: String,
    pub kiwix_port: u16,
}

/// Configuration for the LLM service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub context_tokens: u32,
    pub temperature: f64,
    /// Forwarded as `num_thread` when set
    pub num_threads: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Search breadth
    pub k: usize,
    /// Number of articles placed into the prompt
    pub max_articles: usize,
    pub rerank: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub system: String,
}

/// Cross-encoder artifacts.
///
/// `tokenizer` may point either at a `tokenizer.json` or at a plain
/// WordPiece `vocab.txt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    pub enabled: bool,
    pub onnx_model: PathBuf,
    pub tokenizer: PathBuf,
    pub max_seq_len: usize,
}

/// Install and data locations.
///
/// Unset entries are skipped when resolving executables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: Option<PathBuf>,
    pub kiwix_dir: Option<PathBuf>,
    pub ollama_dir: Option<PathBuf>,
}

/// The per-run knobs the orchestrator reads. Never mutated during a run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub k: usize,
    pub max_articles: usize,
    pub rerank_enabled: bool,
    pub context_tokens: u32,
    pub temperature: f64,
    pub max_seq_len: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "llama3.2:3b".to_string(),
        }
    }
}

impl Default for WikiConfig {
    fn default() -> Self {
        Self {
            zim: PathBuf::from("wikipedia_en_all_nopic.zim"),
            bind: "127.0.0.1".to_string(),
            kiwix_port: 8080,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            context_tokens: 4096,
            temperature: 0.2,
            num_threads: None,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: 40,
            max_articles: 5,
            rerank: false,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system: "Answer the question using only the retrieved context below. \
                     If the context does not contain the answer, say so plainly."
                .to_string(),
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            onnx_model: PathBuf::from("models/reranker/model.onnx"),
            tokenizer: PathBuf::from("models/reranker/tokenizer.json"),
            max_seq_len: 256,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `config.yaml` if it exists, otherwise use defaults.
    pub fn load_or_default() -> Self {
        Self::load("config.yaml").unwrap_or_default()
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.k == 0 {
            return Err(ConfigError::Invalid("retrieval.k must be at least 1".into()));
        }
        if self.retrieval.max_articles == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.max_articles must be at least 1".into(),
            ));
        }
        if self.reranker.enabled && self.reranker.max_seq_len < 3 {
            return Err(ConfigError::Invalid(format!(
                "reranker.max_seq_len must be at least 3, got {}",
                self.reranker.max_seq_len
            )));
        }
        Ok(())
    }

    /// Reranking runs only when both the retrieval switch and the reranker are on.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            k: self.retrieval.k,
            max_articles: self.retrieval.max_articles,
            rerank_enabled: self.retrieval.rerank && self.reranker.enabled,
            context_tokens: self.llm.context_tokens,
            temperature: self.llm.temperature,
            max_seq_len: self.reranker.max_seq_len,
        }
    }
}
