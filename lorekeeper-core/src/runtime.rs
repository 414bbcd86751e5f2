//! Process-scoped startup.
//!
//! [`Runtime::bootstrap`] creates the single shared HTTP client, brings up
//! both backing services, makes sure the generation model is present and
//! wires everything into a ready [`Orchestrator`].

use crate::config::Config;
use crate::generation::{GenerationClient, GenerationError, PullProgress};
use crate::kiwix::KiwixClient;
use crate::pipeline::Orchestrator;
use crate::rerank::{CrossEncoderReranker, NoOpReranker, RerankError, Reranker};
use crate::supervisor::{ServiceDescriptor, ServiceSupervisor, SupervisorError};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to build HTTP client: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Failed to create models directory {path}: {source}")]
    ModelsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Reranker(#[from] RerankError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything a session needs, created once per process.
pub struct Runtime {
    generation: GenerationClient,
    orchestrator: Orchestrator,
}

impl Runtime {
    /// Starts (or attaches to) the services and builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Fails when either service cannot be started, when the model cannot be
    /// made available, or when the reranker configuration is invalid. A
    /// reranker whose artifacts fail to load only logs a warning.
    pub async fn bootstrap(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(RuntimeError::Http)?;
        let supervisor = ServiceSupervisor::new(http.clone());

        let kiwix = ServiceDescriptor::kiwix(config);
        supervisor.ensure_running(&kiwix).await?;

        if let Some(dir) = &config.paths.models_dir {
            std::fs::create_dir_all(dir).map_err(|source| RuntimeError::ModelsDir {
                path: dir.clone(),
                source,
            })?;
        }
        let ollama = ServiceDescriptor::ollama(config)?;
        supervisor.ensure_running(&ollama).await?;

        let generation = GenerationClient::new(http.clone(), &ollama.endpoint)
            .with_num_threads(config.llm.num_threads);
        generation
            .ensure_model_present(&config.model.name, log_pull_progress)
            .await?;

        let reranker = build_reranker(config)?;
        let content = Arc::new(KiwixClient::new(http, &kiwix.endpoint));

        let orchestrator = Orchestrator::new(
            config.pipeline(),
            config.model.name.clone(),
            config.prompt.system.clone(),
            content.clone(),
            content,
            Arc::new(generation.clone()),
        )
        .with_reranker(reranker);

        info!(model = %config.model.name, "Runtime ready");
        Ok(Self {
            generation,
            orchestrator,
        })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn generation(&self) -> &GenerationClient {
        &self.generation
    }
}

/// Picks the reranker variant for `config`.
///
/// An out-of-range `max_seq_len` is an error; missing or broken artifacts
/// fall back to [`NoOpReranker`].
pub fn build_reranker(config: &Config) -> Result<Arc<dyn Reranker>> {
    if !config.pipeline().rerank_enabled {
        return Ok(Arc::new(NoOpReranker));
    }

    match CrossEncoderReranker::load(
        &config.reranker.onnx_model,
        &config.reranker.tokenizer,
        config.reranker.max_seq_len,
    ) {
        Ok(reranker) => Ok(Arc::new(reranker)),
        Err(e @ RerankError::InvalidConfig(_)) => Err(e.into()),
        Err(e) => {
            warn!(error = %e, "Reranker unavailable, using search order");
            Ok(Arc::new(NoOpReranker))
        }
    }
}

fn log_pull_progress(progress: &PullProgress) {
    if let Some(error) = &progress.error {
        warn!(status = %progress.status, error = %error, "Model pull");
        return;
    }
    match progress.percent() {
        Some(percent) => info!(
            status = %progress.status,
            percent = %format!("{percent:.1}"),
            "Model pull"
        ),
        None => info!(status = %progress.status, "Model pull"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Answer;
    use crate::test_support::serve;
    use axum::http::StatusCode;
    use axum::response::Html;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    fn rerank_config(max_seq_len: usize) -> Config {
        let mut config = Config::default();
        config.retrieval.rerank = true;
        config.reranker.enabled = true;
        config.reranker.onnx_model = PathBuf::from("/nonexistent/model.onnx");
        config.reranker.tokenizer = PathBuf::from("/nonexistent/tokenizer.json");
        config.reranker.max_seq_len = max_seq_len;
        config
    }

    #[test]
    fn test_disabled_reranker_is_noop() {
        let reranker = build_reranker(&Config::default()).unwrap();
        assert!(!reranker.is_active());
    }

    #[test]
    fn test_missing_artifacts_degrade_to_noop() {
        let reranker = build_reranker(&rerank_config(256)).unwrap();
        assert!(!reranker.is_active());
    }

    #[test]
    fn test_invalid_sequence_length_is_fatal() {
        let result = build_reranker(&rerank_config(2));
        assert!(matches!(
            result,
            Err(RuntimeError::Reranker(RerankError::InvalidConfig(_)))
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_attaches_to_running_services() {
        let kiwix = serve(
            Router::new()
                .route("/", get(|| async { Html("<h1>Library</h1>") }))
                .route(
                    "/search",
                    get(|| async { Html(r#"<a href="/A/Ada_Lovelace">Ada Lovelace</a>"#) }),
                )
                .route(
                    "/A/Ada_Lovelace",
                    get(|| async { Html("<p>English mathematician.</p>") }),
                ),
        )
        .await;
        let ollama = serve(
            Router::new()
                .route("/api/tags", get(|| async { Json(json!({"models": []})) }))
                .route("/api/show", post(|| async { StatusCode::OK }))
                .route(
                    "/api/chat",
                    post(|| async {
                        Json(json!({"message": {"role": "assistant", "content": "A mathematician."}}))
                    }),
                ),
        )
        .await;

        let mut config = Config::default();
        config.wiki.bind = "127.0.0.1".to_string();
        config.wiki.kiwix_port = kiwix.port();
        config.llm.base_url = format!("http://127.0.0.1:{}", ollama.port());

        let runtime = Runtime::bootstrap(&config).await.unwrap();
        let answer = runtime.orchestrator().answer("Who was Ada Lovelace?").await.unwrap();
        assert_eq!(
            answer,
            Answer::Answered {
                reply: "A mathematician.".to_string(),
                sources: vec!["Ada Lovelace".to_string()],
            }
        );
    }
}
