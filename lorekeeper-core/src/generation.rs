//! Ollama HTTP API client for model management and completions.
//!
//! This module wraps the small part of the Ollama API the answering
//! pipeline needs:
//! - model presence checks and streamed pulls (`/api/show`, `/api/pull`)
//! - one-shot completions through `/api/chat`, falling back to
//!   `/api/generate` on servers that do not expose the chat endpoint
//! - the model inventory (`/api/tags`)

use crate::supervisor::{PollPolicy, ServiceEndpoint};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Fixed system role message sent with every chat completion.
const SYSTEM_ROLE: &str = "You are a concise, citation-first encyclopedia assistant.";

/// Limit for one non-streamed completion.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(300);
/// Limit for inventory and presence queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

const PULL_POLL_ATTEMPTS: u32 = 600;
const PULL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum percentage-point movement that forwards a progress event.
const PROGRESS_STEP: f64 = 1.0;
/// Maximum quiet period between forwarded progress events.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Errors that can occur when interacting with the Ollama API.
///
/// `Request`, `Json` and `Api` together form the `GenerationRequestFailed`
/// class; they end the current query but not the session.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error ({status}): {message}")]
    Api { status: StatusCode, message: String },

    #[error("Model {model} was not available after {attempts} presence checks")]
    ModelPullTimeout { model: String, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, GenerationError>;

/// Produces an answer for an assembled prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Runs a single non-streamed completion and returns the trimmed reply.
    async fn complete_once(
        &self,
        model: &str,
        prompt: &str,
        context_tokens: u32,
        temperature: f64,
    ) -> Result<String>;
}

/// HTTP client for communicating with an Ollama server.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    /// The base URL of the Ollama server (e.g., "http://127.0.0.1:11434")
    base_url: String,
    http_client: reqwest::Client,
    num_threads: Option<u32>,
    pull_poll: PollPolicy,
    completion_timeout: Duration,
}

impl GenerationClient {
    /// Creates a client sharing the process-wide HTTP connection pool.
    pub fn new(http_client: reqwest::Client, endpoint: &ServiceEndpoint) -> Self {
        Self {
            base_url: endpoint.base_url(),
            http_client,
            num_threads: None,
            pull_poll: PollPolicy::new(PULL_POLL_ATTEMPTS, PULL_POLL_INTERVAL),
            completion_timeout: COMPLETION_TIMEOUT,
        }
    }

    /// Overrides the time limit for chat and generate requests.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    /// Forwards `num_thread` with every completion request.
    pub fn with_num_threads(mut self, num_threads: Option<u32>) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Overrides how long to wait for a pulled model to show up.
    pub fn with_pull_poll(mut self, poll: PollPolicy) -> Self {
        self.pull_poll = poll;
        self
    }

    /// Lists the models the server has locally.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;
        let response = check_status(response).await?;
        let tags = response.json::<TagsResponse>().await?;
        Ok(tags.models)
    }

    /// Asks the server whether `model` is available locally.
    ///
    /// A 404 means absent; any other non-success status is an error.
    pub async fn model_exists(&self, model: &str) -> Result<bool> {
        let url = format!("{}/api/show", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&ShowRequest { name: model })
            .timeout(QUERY_TIMEOUT)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }

    /// Makes sure `model` is available, pulling it when absent.
    ///
    /// Pull progress is throttled (see [`ProgressThrottle`]) before reaching
    /// `on_progress`. After the pull stream ends the server is polled until
    /// the model shows up.
    ///
    /// # Errors
    ///
    /// [`GenerationError::ModelPullTimeout`] when the model does not appear
    /// within the poll bound; request errors otherwise.
    pub async fn ensure_model_present(
        &self,
        model: &str,
        mut on_progress: impl FnMut(&PullProgress),
    ) -> Result<()> {
        if model.trim().is_empty() {
            return Ok(());
        }
        if self.model_exists(model).await? {
            debug!(model, "Model already present");
            return Ok(());
        }

        info!(model, "Model missing, pulling");
        self.pull_model(model, &mut on_progress).await?;

        for _ in 0..self.pull_poll.attempts {
            if matches!(self.model_exists(model).await, Ok(true)) {
                info!(model, "Model is ready");
                return Ok(());
            }
            tokio::time::sleep(self.pull_poll.interval).await;
        }

        Err(GenerationError::ModelPullTimeout {
            model: model.to_string(),
            attempts: self.pull_poll.attempts,
        })
    }

    /// Streams `/api/pull`, forwarding throttled progress events.
    ///
    /// Error events are forwarded like any other; they do not stop the stream.
    pub async fn pull_model(
        &self,
        model: &str,
        mut on_progress: impl FnMut(&PullProgress),
    ) -> Result<()> {
        let url = format!("{}/api/pull", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .json(&PullRequest {
                name: model,
                stream: true,
            })
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut throttle = ProgressThrottle::new();
        let mut handle_line = |line: &[u8]| {
            let line_str = String::from_utf8_lossy(line);
            let line_str = line_str.trim();
            if line_str.is_empty() {
                return;
            }

            match serde_json::from_str::<PullProgress>(line_str) {
                Ok(progress) => {
                    if let Some(error) = &progress.error {
                        warn!(model, error = %error, "Pull reported an error");
                    }
                    if throttle.should_forward(&progress, Instant::now()) {
                        on_progress(&progress);
                    }
                }
                Err(e) => debug!(error = %e, "Skipping unparseable pull event"),
            }
        };

        let mut stream = response.bytes_stream();
        let mut buffer = Vec::new();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            buffer.extend_from_slice(&chunk);

            while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                let line = buffer.drain(..=newline_pos).collect::<Vec<_>>();
                handle_line(&line);
            }
        }
        handle_line(&buffer);

        Ok(())
    }

    fn options(&self, context_tokens: u32, temperature: f64) -> RequestOptions {
        RequestOptions {
            num_ctx: context_tokens,
            temperature,
            num_thread: self.num_threads,
        }
    }

    async fn chat(&self, model: &str, prompt: &str, options: RequestOptions) -> Result<String> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model,
            options,
            messages: vec![Message::system(SYSTEM_ROLE), Message::user(prompt)],
            stream: false,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .timeout(self.completion_timeout)
            .send()
            .await?;
        let response = check_status(response).await?;
        let chat = response.json::<ChatResponse>().await?;
        Ok(chat.message.content.trim().to_string())
    }

    async fn generate(&self, model: &str, prompt: &str, options: RequestOptions) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model,
            prompt,
            options,
            stream: false,
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .timeout(self.completion_timeout)
            .send()
            .await?;
        let response = check_status(response).await?;
        let generated = response.json::<GenerateResponse>().await?;
        Ok(generated.response.trim().to_string())
    }
}

#[async_trait]
impl Generator for GenerationClient {
    async fn complete_once(
        &self,
        model: &str,
        prompt: &str,
        context_tokens: u32,
        temperature: f64,
    ) -> Result<String> {
        match self
            .chat(model, prompt, self.options(context_tokens, temperature))
            .await
        {
            Err(GenerationError::Api { status, .. }) if status == StatusCode::NOT_FOUND => {
                debug!("Chat endpoint unavailable, falling back to /api/generate");
                self.generate(model, prompt, self.options(context_tokens, temperature))
                    .await
            }
            other => other,
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(GenerationError::Api { status, message })
}

/// One event of the newline-delimited `/api/pull` stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PullProgress {
    /// Completion in percent, when the event carries byte counts.
    pub fn percent(&self) -> Option<f64> {
        match (self.completed, self.total) {
            (Some(completed), Some(total)) if total > 0 => {
                Some(completed as f64 * 100.0 / total as f64)
            }
            _ => None,
        }
    }
}

/// Decides which pull events reach the caller.
///
/// Within one digest, an event reporting fewer completed bytes than the last
/// forwarded one is never forwarded, not even when it carries an error (the
/// pull loop still logs it). Otherwise an event is forwarded when it is the
/// first one, carries an error, changes status or digest, moves progress by
/// at least one percentage point, or arrives at least two seconds after the
/// last forwarded event.
#[derive(Debug, Default)]
pub struct ProgressThrottle {
    last: Option<Forwarded>,
}

#[derive(Debug)]
struct Forwarded {
    status: String,
    digest: Option<String>,
    completed: Option<u64>,
    percent: Option<f64>,
    at: Instant,
}

impl ProgressThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_forward(&mut self, event: &PullProgress, now: Instant) -> bool {
        let forward = match &self.last {
            None => true,
            Some(last)
                if last.digest == event.digest && regressed(last.completed, event.completed) =>
            {
                false
            }
            Some(_) if event.error.is_some() => true,
            Some(last) if last.status != event.status || last.digest != event.digest => true,
            Some(last) => {
                let moved = match (last.percent, event.percent()) {
                    (Some(before), Some(after)) => (after - before).abs() >= PROGRESS_STEP,
                    (None, Some(_)) => true,
                    _ => false,
                };
                moved || now.duration_since(last.at) >= PROGRESS_INTERVAL
            }
        };

        if forward {
            // events without byte counts keep the digest's high-water mark
            let completed = match &self.last {
                Some(last) if last.digest == event.digest => event.completed.or(last.completed),
                _ => event.completed,
            };
            self.last = Some(Forwarded {
                status: event.status.clone(),
                digest: event.digest.clone(),
                completed,
                percent: event.percent(),
                at: now,
            });
        }
        forward
    }
}

fn regressed(before: Option<u64>, after: Option<u64>) -> bool {
    matches!((before, after), (Some(before), Some(after)) if after < before)
}

/// An entry of the `/api/tags` inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ShowRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RequestOptions {
    num_ctx: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_thread: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    options: RequestOptions,
    messages: Vec<Message>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    options: RequestOptions,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}
