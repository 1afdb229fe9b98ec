//! Embedding providers and the retrying embedding client.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls an OpenAI-compatible `POST /embeddings` endpoint.
//! - **`LocalProvider`**: runs a fastembed model in-process (feature `local-embeddings`).
//!
//! Providers make exactly one attempt per call. [`EmbeddingClient`] wraps a
//! provider with batching, retries, and the zero-vector fallback used by
//! ingestion.
//!
//! Also provides vector utilities for the SQLite store:
//! - [`cosine_similarity`]: similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for a BLOB column
//! - [`blob_to_vec`]: decode a BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! - HTTP 429, 5xx, connect errors and timeouts → retry
//! - other HTTP 4xx → fail immediately
//! - backoff doubles from the client's base delay: 1s, 2s, 4s, ...
//! - after `max_attempts` the batch falls back to one attempt per text, and
//!   texts that still fail become zero vectors with a warning

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::RagError;

/// A backend that turns texts into fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embeds a batch in one call. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider {
    dims: usize,
}

impl DisabledProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(RagError::BackendUnreachable("embedding provider is disabled".to_string()).into())
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API (or any compatible server).
///
/// Calls `POST {api_base}/embeddings` with the configured model. The API
/// key comes from `OPENAI_API_KEY` via [`Config`](crate::config::Config).
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if no API key is configured.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = match &config.api_key {
            Some(key) => key.clone(),
            None => bail!("OPENAI_API_KEY environment variable not set"),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            dims: config.dims,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RagError::Timeout(format!("embedding request timed out: {}", e))
                } else {
                    RagError::BackendUnreachable(format!("embedding request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response.json().await?;
            return parse_openai_response(&json);
        }

        let body_text = response.text().await.unwrap_or_default();
        // Rate limited or server error: worth another attempt
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RagError::BackendUnreachable(format!(
                "OpenAI API error {}: {}",
                status, body_text
            ))
            .into());
        }
        Err(RagError::BackendFailed(format!("OpenAI API error {}: {}", status, body_text)).into())
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts `data[].embedding`, ordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Local Provider (fastembed) ============

/// Embedding provider running a fastembed model locally.
///
/// Models are downloaded on first use from Hugging Face and cached.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let fastembed_model = config_to_fastembed_model(&config.model)?;
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name: config.model.clone(),
            dims: config.dims,
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| anyhow::anyhow!("local embedding model lock poisoned"))?;
            model
                .embed(texts, None)
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))
        })
        .await?
    }
}

/// Create the [`EmbeddingProvider`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"local"` | `LocalProvider` (feature `local-embeddings`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Client ============

/// Batching, retrying front of an [`EmbeddingProvider`].
///
/// One instance is created at startup and shared by ingestion and search.
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    dims: usize,
    batch_size: usize,
    max_attempts: u32,
    base_delay: Duration,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_secs(1),
        }
    }

    /// Overrides the first backoff delay (doubles on each retry).
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embeds `texts` with retries, failing if every attempt fails.
    pub async fn try_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_err = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = self.base_delay * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.attempt(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    let transient = e
                        .downcast_ref::<RagError>()
                        .map(RagError::is_transient)
                        .unwrap_or(true);
                    tracing::debug!(attempt, error = %e, "embedding attempt failed");
                    last_err = Some(e);
                    if !transient {
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }

    async fn attempt(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.provider.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(RagError::BackendFailed(format!(
                "embedding provider returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            ))
            .into());
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(RagError::BackendFailed(format!(
                "embedding provider returned dimension {}, expected {}",
                bad.len(),
                self.dims
            ))
            .into());
        }
        Ok(vectors)
    }

    /// Embeds `texts` in batches, never failing.
    ///
    /// Blank inputs and inputs whose embedding keeps failing get a zero
    /// vector of the configured dimension; a warning is logged for each
    /// fallback so degraded rows can be traced.
    pub async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_batch_with_fallback(batch).await);
        }
        out
    }

    async fn embed_batch_with_fallback(&self, batch: &[String]) -> Vec<Vec<f32>> {
        let mut out = vec![Vec::new(); batch.len()];
        let positions: Vec<usize> = (0..batch.len())
            .filter(|&i| !batch[i].trim().is_empty())
            .collect();
        for (i, slot) in out.iter_mut().enumerate() {
            if !positions.contains(&i) {
                *slot = vec![0.0; self.dims];
            }
        }
        if positions.is_empty() {
            return out;
        }

        let inputs: Vec<String> = positions.iter().map(|&i| batch[i].clone()).collect();
        match self.try_embed(&inputs).await {
            Ok(vectors) => {
                for (&i, v) in positions.iter().zip(vectors) {
                    out[i] = v;
                }
            }
            Err(batch_err) => {
                tracing::warn!(
                    batch_len = inputs.len(),
                    error = %batch_err,
                    "batch embedding failed; retrying texts individually"
                );
                let mut zero_filled = 0usize;
                for (&i, text) in positions.iter().zip(inputs.iter()) {
                    match self.attempt(std::slice::from_ref(text)).await {
                        Ok(mut vectors) => out[i] = vectors.remove(0),
                        Err(_) => {
                            out[i] = vec![0.0; self.dims];
                            zero_filled += 1;
                        }
                    }
                }
                if zero_filled > 0 {
                    tracing::warn!(
                        zero_filled,
                        dims = self.dims,
                        "embedding unavailable; stored zero vectors"
                    );
                }
            }
        }
        out
    }

    /// Embeds a single query. Errors are surfaced, not zero-filled.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.try_embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use crawl_rag::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors
/// of different lengths, and zero vectors.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then returns `[len, 1, 0, ...]` vectors.
    struct FlakyProvider {
        failures: usize,
        calls: AtomicUsize,
        transient: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.transient {
                    RagError::BackendUnreachable("down".into()).into()
                } else {
                    RagError::BackendFailed("bad request".into()).into()
                });
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 0.0, 0.0])
                .collect())
        }
    }

    /// Fails any batch containing the text "poison".
    struct PoisonProvider;

    #[async_trait]
    impl EmbeddingProvider for PoisonProvider {
        fn model_name(&self) -> &str {
            "poison"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t == "poison") {
                return Err(RagError::BackendFailed("rejected".into()).into());
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    fn client(provider: Arc<dyn EmbeddingProvider>) -> EmbeddingClient {
        let config = EmbeddingConfig {
            dims: 4,
            batch_size: 2,
            ..EmbeddingConfig::default()
        };
        EmbeddingClient::new(provider, &config).with_base_delay(Duration::ZERO)
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let provider = Arc::new(FlakyProvider {
            failures: 2,
            calls: AtomicUsize::new(0),
            transient: true,
        });
        let client = client(provider.clone());
        let vectors = client.try_embed(&texts(&["abc"])).await.unwrap();
        assert_eq!(vectors[0][0], 3.0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let provider = Arc::new(FlakyProvider {
            failures: 10,
            calls: AtomicUsize::new(0),
            transient: false,
        });
        let client = client(provider.clone());
        assert!(client.try_embed(&texts(&["abc"])).await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fall_back_to_zero_vectors() {
        let provider = Arc::new(FlakyProvider {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
            transient: true,
        });
        let client = client(provider);
        let vectors = client.embed(&texts(&["a", "b", "c"])).await;
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v == &vec![0.0; 4]));
    }

    #[tokio::test]
    async fn test_order_and_length_preserved_across_batches() {
        let provider = Arc::new(FlakyProvider {
            failures: 0,
            calls: AtomicUsize::new(0),
            transient: true,
        });
        let client = client(provider.clone());
        let vectors = client.embed(&texts(&["a", "bb", "ccc", "dddd", "eeeee"])).await;
        let lens: Vec<f32> = vectors.iter().map(|v| v[0]).collect();
        assert_eq!(lens, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        // batch_size 2 → 3 provider calls
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_blank_inputs_get_zero_vectors_without_a_call() {
        let provider = Arc::new(FlakyProvider {
            failures: 0,
            calls: AtomicUsize::new(0),
            transient: true,
        });
        let client = client(provider.clone());
        let vectors = client.embed(&texts(&["  ", ""])).await;
        assert!(vectors.iter().all(|v| v == &vec![0.0; 4]));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_per_item_fallback_isolates_bad_text() {
        let client = client(Arc::new(PoisonProvider));
        let vectors = client.embed(&texts(&["good", "poison"])).await;
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0; 4]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let provider = Arc::new(FlakyProvider {
            failures: 0,
            calls: AtomicUsize::new(0),
            transient: true,
        });
        let config = EmbeddingConfig {
            dims: 8,
            ..EmbeddingConfig::default()
        };
        let client = EmbeddingClient::new(provider, &config).with_base_delay(Duration::ZERO);
        assert!(client.embed_query("hello").await.is_err());
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let parsed = parse_openai_response(&json).unwrap();
        assert_eq!(parsed, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        let sim = cosine_similarity(&a, &b);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        let sim = cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]);
        assert_eq!(sim, 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        let a = vec![1.0, 2.0];
        let b = vec![1.0];
        let sim = cosine_similarity(&a, &b);
        assert_eq!(sim, 0.0);
    }
}
