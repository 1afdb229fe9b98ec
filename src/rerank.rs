//! Cross-encoder reranking client.
//!
//! The reranker scores `(query, candidate)` pairs jointly. It is reached
//! over HTTP using the text-embeddings-inference `/rerank` contract:
//!
//! ```text
//! POST {url}/rerank  {"query": "...", "texts": ["...", ...]}
//! -> [{"index": 0, "score": 0.93}, ...]
//! ```
//!
//! Scores come back in input order regardless of the order the service
//! returns them in.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RerankConfig;
use crate::error::RagError;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// One score per document, in input order. Higher is more relevant.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

/// Reranker backed by an HTTP cross-encoder service.
pub struct HttpReranker {
    url: String,
    model: Option<String>,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(url: &str, model: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            model,
            client,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = serde_json::json!({
            "query": query,
            "texts": documents,
            "raw_scores": true,
        });
        if let Some(model) = &self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }

        let response = self
            .client
            .post(format!("{}/rerank", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::BackendUnreachable(format!("rerank request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(RagError::BackendFailed(format!("rerank error {}: {}", status, body_text)).into());
        }

        let json: serde_json::Value = response.json().await?;
        parse_rerank_response(&json, documents.len())
    }
}

fn parse_rerank_response(json: &serde_json::Value, expected: usize) -> Result<Vec<f32>> {
    // Accept both a bare array and {"results": [...]}.
    let items = json
        .as_array()
        .or_else(|| json.get("results").and_then(|r| r.as_array()))
        .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: expected an array"))?;

    let mut scores: Vec<Option<f32>> = vec![None; expected];
    for item in items {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing index"))?
            as usize;
        let score = item
            .get("score")
            .or_else(|| item.get("relevance_score"))
            .and_then(|s| s.as_f64())
            .ok_or_else(|| anyhow::anyhow!("Invalid rerank response: missing score"))?;
        if index >= expected {
            bail!("Invalid rerank response: index {} out of range", index);
        }
        scores[index] = Some(score as f32);
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| anyhow::anyhow!("Invalid rerank response: no score for {}", i)))
        .collect()
}

/// Builds the reranker when reranking is enabled and a service is configured.
pub fn create_reranker(enabled: bool, config: &RerankConfig) -> Result<Option<Arc<dyn Reranker>>> {
    if !enabled {
        return Ok(None);
    }
    match &config.url {
        Some(url) => Ok(Some(Arc::new(HttpReranker::new(url, config.model.clone())?))),
        None => {
            tracing::warn!("use_reranking is on but no reranker url is configured; reranking disabled");
            Ok(None)
        }
    }
}
