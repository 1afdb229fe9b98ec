//! Client for a SearXNG meta-search instance.
//!
//! Used by the `discover_urls` tool to find candidate pages for the
//! external crawler. Only the JSON API is used:
//!
//! ```text
//! GET {searxng_url}/search?q=<query>&format=json&categories=general
//! ```

use anyhow::Result;
use serde::Serialize;
use std::time::Duration;

use crate::config::MetaSearchConfig;
use crate::error::RagError;

/// One discovered URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discovered {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Clone)]
pub struct MetaSearchClient {
    base_url: String,
    client: reqwest::Client,
}

impl MetaSearchClient {
    /// Returns `None` when no SearXNG URL is configured.
    pub fn from_config(config: &MetaSearchConfig) -> Result<Option<Self>> {
        let Some(url) = &config.searxng_url else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Some(Self {
            base_url: url.trim_end_matches('/').to_string(),
            client,
        }))
    }

    /// Up to `limit` http(s) result URLs for `query`, in engine order.
    pub async fn discover(&self, query: &str, limit: usize) -> Result<Vec<Discovered>> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .header("Accept", "application/json")
            .query(&[
                ("q", query),
                ("format", "json"),
                ("categories", "general"),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RagError::Timeout(format!("SearXNG request timed out: {}", e))
                } else {
                    RagError::BackendUnreachable(format!(
                        "Cannot connect to SearXNG at {}: {}",
                        self.base_url, e
                    ))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RagError::BackendFailed(format!("SearXNG HTTP error: {}", status)).into());
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RagError::BackendFailed(format!("Invalid JSON response from SearXNG: {}", e)))?;
        Ok(parse_results(&json, limit))
    }
}

fn parse_results(json: &serde_json::Value, limit: usize) -> Vec<Discovered> {
    let Some(results) = json.get("results").and_then(|r| r.as_array()) else {
        return Vec::new();
    };

    let field = |item: &serde_json::Value, name: &str| {
        item.get(name)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string()
    };

    results
        .iter()
        .map(|item| Discovered {
            url: field(item, "url"),
            title: field(item, "title"),
            snippet: field(item, "content"),
        })
        .filter(|d| d.url.starts_with("http://") || d.url.starts_with("https://"))
        .take(limit)
        .collect()
}
