//! lorekeeper-core - Offline question answering over a local encyclopedia
//!
//! Answers natural-language questions using only locally running services:
//! - a kiwix content server for full-text search and article bodies
//! - an Ollama server for generation
//!
//! ## Primary API
//!
//! [`Runtime::bootstrap`] brings both services up and returns a ready
//! [`Orchestrator`]. Every collaborator of the orchestrator sits behind a
//! trait ([`SearchBackend`], [`ContentSource`], [`Reranker`], [`Generator`])
//! so the pipeline can be driven without any service running.

pub mod config;
pub mod content;
pub mod generation;
pub mod kiwix;
pub mod pipeline;
pub mod rerank;
pub mod runtime;
pub mod search;
pub mod supervisor;
pub mod types;

#[cfg(test)]
mod test_support;

// Public exports
pub use config::{Config, ConfigError, PipelineConfig};
pub use content::{ContentSource, FetchError};
pub use generation::{GenerationClient, GenerationError, Generator, ModelInfo, PullProgress};
pub use kiwix::KiwixClient;
pub use pipeline::{Answer, Orchestrator, PipelineError, NO_SUPPORT_MESSAGE};
pub use rerank::{CrossEncoderReranker, NoOpReranker, RerankError, Reranker};
pub use runtime::{Runtime, RuntimeError};
pub use search::SearchBackend;
pub use supervisor::{ServiceDescriptor, ServiceEndpoint, ServiceSupervisor, SupervisorError};
pub use types::{Candidate, Hit, RerankScore};
