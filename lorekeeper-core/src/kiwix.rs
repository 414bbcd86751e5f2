//! HTTP client for the kiwix content server.
//!
//! One client serves both retrieval roles: [`SearchBackend`] for the
//! `/search` endpoint and [`ContentSource`] for article bodies.

use crate::content::{self, html_to_text, locator_path, ContentSource, FetchError};
use crate::search::{parse_hits, SearchBackend};
use crate::supervisor::ServiceEndpoint;
use crate::types::Hit;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-request limit for search and article fetches.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for a running kiwix-serve instance.
#[derive(Debug, Clone)]
pub struct KiwixClient {
    base_url: String,
    http_client: reqwest::Client,
    timeout: Duration,
}

impl KiwixClient {
    /// Creates a client sharing the process-wide HTTP connection pool.
    pub fn new(http_client: reqwest::Client, endpoint: &ServiceEndpoint) -> Self {
        Self {
            base_url: endpoint.base_url(),
            http_client,
            timeout: REQUEST_TIMEOUT,
        }
    }

    /// Overrides the per-request time limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs one search request form. `None` on transport failure, a
    /// non-success status, or a blank body.
    async fn search_body(&self, params: &[(&str, &str)]) -> Option<String> {
        let url = format!("{}/search", self.base_url);

        let response = match self
            .http_client
            .get(&url)
            .query(params)
            .timeout(self.timeout)
            .send()
            .await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Search request failed");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(status = %response.status(), "Search returned non-success status");
            return None;
        }

        match response.text().await {
            Ok(body) if !body.trim().is_empty() => Some(body),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read search response");
                None
            }
        }
    }
}

#[async_trait]
impl SearchBackend for KiwixClient {
    async fn search(&self, query: &str, k: usize) -> Vec<Hit> {
        let variants: [&[(&str, &str)]; 2] = [
            &[("pattern", query), ("content", "html")],
            &[("pattern", query)],
        ];

        for params in variants {
            if let Some(body) = self.search_body(params).await {
                let hits = parse_hits(&body, k);
                debug!(count = hits.len(), "Parsed search hits");
                return hits;
            }
        }

        Vec::new()
    }
}

#[async_trait]
impl ContentSource for KiwixClient {
    async fn fetch(&self, locator: &str) -> content::Result<String> {
        let url = format!("{}{}", self.base_url, locator_path(locator));

        let response = self
            .http_client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                locator: locator.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                locator: locator.to_string(),
                status,
            });
        }

        let html = response.text().await.map_err(|source| FetchError::Transport {
            locator: locator.to_string(),
            source,
        })?;

        Ok(html_to_text(&html))
    }
}
