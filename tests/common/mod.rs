//! Deterministic collaborators and request helpers shared by the
//! integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crawl_rag::config::Config;
use crawl_rag::context::AppContext;
use crawl_rag::embedding::{EmbeddingClient, EmbeddingProvider};
use crawl_rag::ingest::{ingest_pages, IngestReport};
use crawl_rag::llm::LlmProvider;
use crawl_rag::models::{ChunkRow, Corpus, CrawledPage, ScoredChunk, SourceRecord, StoredChunk};
use crawl_rag::rerank::Reranker;
use crawl_rag::server::build_router;
use crawl_rag::store::memory::InMemoryStore;
use crawl_rag::store::Store;
use crawl_rag::tools::ToolRegistry;

pub const DIMS: usize = 64;

// ============ Fakes ============

/// Bag-of-words hashing embedder: texts sharing words get similar vectors.
pub struct HashEmbedder {
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let mut h: u64 = 0xcbf29ce484222325;
        for b in word.to_lowercase().bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        v[(h % DIMS as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

/// Embedder whose every call fails.
pub struct BrokenEmbedder;

#[async_trait]
impl EmbeddingProvider for BrokenEmbedder {
    fn model_name(&self) -> &str {
        "broken"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("connection refused")
    }
}

/// Answers every prompt with a fixed reply and counts the calls.
pub struct ScriptedLlm {
    pub reply: String,
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _system: &str, _prompt: &str, _max_tokens: u32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

/// Fails every completion.
pub struct FailingLlm;

#[async_trait]
impl LlmProvider for FailingLlm {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _system: &str, _prompt: &str, _max_tokens: u32) -> Result<String> {
        bail!("model overloaded")
    }
}

/// Scores documents by how often they mention `favourite`.
pub struct KeywordReranker {
    pub favourite: String,
}

#[async_trait]
impl Reranker for KeywordReranker {
    async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
        Ok(documents
            .iter()
            .map(|d| d.to_lowercase().matches(&self.favourite).count() as f32 * 4.0 - 2.0)
            .collect())
    }
}

pub struct BrokenReranker;

#[async_trait]
impl Reranker for BrokenReranker {
    async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>> {
        bail!("reranker down")
    }
}

/// In-memory store whose code example table rejects every write.
pub struct CodeWriteFailingStore {
    pub inner: InMemoryStore,
}

impl CodeWriteFailingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
        }
    }
}

#[async_trait]
impl Store for CodeWriteFailingStore {
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn ensure_source(&self, source_id: &str, placeholder: &str) -> Result<()> {
        self.inner.ensure_source(source_id, placeholder).await
    }

    async fn upsert_source(&self, source_id: &str, summary: &str, total_words: i64) -> Result<()> {
        self.inner.upsert_source(source_id, summary, total_words).await
    }

    async fn upsert_page_chunks(&self, rows: &[ChunkRow]) -> Result<()> {
        self.inner.upsert_page_chunks(rows).await
    }

    async fn replace_code_examples(&self, _url: &str, _rows: &[ChunkRow]) -> Result<()> {
        bail!("disk I/O error")
    }

    async fn delete_url(&self, url: &str) -> Result<()> {
        self.inner.delete_url(url).await
    }

    async fn list_sources(&self) -> Result<Vec<SourceRecord>> {
        self.inner.list_sources().await
    }

    async fn source_word_count(&self, source_id: &str) -> Result<i64> {
        self.inner.source_word_count(source_id).await
    }

    async fn chunks_for_url(&self, corpus: Corpus, url: &str) -> Result<Vec<StoredChunk>> {
        self.inner.chunks_for_url(corpus, url).await
    }

    async fn vector_search(
        &self,
        corpus: Corpus,
        query_vec: &[f32],
        k: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        self.inner.vector_search(corpus, query_vec, k, source).await
    }

    async fn keyword_search(
        &self,
        corpus: Corpus,
        query: &str,
        k: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        self.inner.keyword_search(corpus, query, k, source).await
    }
}

// ============ Context ============

/// Small chunks, fast retries, and no rate limiting.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.embedding.dims = DIMS;
    config.chunking.target_chars = 200;
    config.chunking.min_chars = 50;
    config.ingest.workers = 4;
    config.ingest.code_min_chars = 40;
    config.ingest.code_context_chars = 100;
    config.api.rate_limit_enabled = false;
    config
}

pub fn context(config: Config) -> (AppContext, Arc<InMemoryStore>) {
    context_with(config, Arc::new(ScriptedLlm::new("A site about testing.")))
}

pub fn context_with(config: Config, llm: Arc<dyn LlmProvider>) -> (AppContext, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let ctx = context_on(config, store.clone(), Arc::new(HashEmbedder::new()), llm);
    (ctx, store)
}

pub fn context_on(
    config: Config,
    store: Arc<dyn Store>,
    embedding: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmProvider>,
) -> AppContext {
    let embedder = EmbeddingClient::new(embedding.clone(), &config.embedding)
        .with_base_delay(Duration::from_millis(1));
    AppContext::new(config, store, embedding, llm).with_embedder(embedder)
}

pub fn router(ctx: &AppContext) -> Router {
    build_router(ctx.clone(), Arc::new(ToolRegistry::with_builtins(ctx)))
}

// ============ Pages ============

/// A paragraph of exactly 120 characters mentioning `topic`. Pages built
/// from these split into one chunk per paragraph under [`test_config`].
pub fn paragraph(topic: &str, n: usize) -> String {
    let mut text = format!("Section {} covers {} in depth.", n, topic);
    while text.chars().count() < 120 {
        text.push_str(&format!(" More about {}.", topic));
    }
    text.chars().take(119).collect::<String>().trim_end().to_string() + "."
}

pub fn page(url: &str, paragraphs: &[String]) -> CrawledPage {
    CrawledPage {
        url: url.to_string(),
        markdown: paragraphs.join("\n\n"),
    }
}

pub fn page_about(url: &str, topic: &str, chunks: usize) -> CrawledPage {
    let paragraphs: Vec<String> = (0..chunks).map(|i| paragraph(topic, i)).collect();
    page(url, &paragraphs)
}

pub async fn ingest(ctx: &AppContext, pages: Vec<CrawledPage>) -> IngestReport {
    ingest_pages(ctx, pages, &CancellationToken::new())
        .await
        .expect("ingest")
}

// ============ HTTP ============

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn get_from(uri: &str, client: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", client)
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, String) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, String::from_utf8(bytes.to_vec()).unwrap())
}

pub async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let (status, headers, body) = send(app, request).await;
    let json = serde_json::from_str(&body).unwrap_or_else(|e| panic!("invalid JSON {:?}: {}", body, e));
    (status, headers, json)
}
