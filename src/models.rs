//! Core data models shared by ingestion, the store backends, and search.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A crawled page handed over by the external crawler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawledPage {
    pub url: String,
    pub markdown: String,
}

/// Which table a row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Corpus {
    Pages,
    CodeExamples,
}

impl Corpus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Corpus::Pages => "crawled_pages",
            Corpus::CodeExamples => "code_examples",
        }
    }
}

/// A row bound for `crawled_pages` or `code_examples`.
///
/// `summary` is set only for code examples.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub url: String,
    pub chunk_number: i64,
    pub content: String,
    pub metadata: serde_json::Value,
    pub source_id: String,
    pub embedding: Vec<f32>,
    pub summary: Option<String>,
}

/// A stored row as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct StoredChunk {
    pub id: String,
    pub url: String,
    pub chunk_number: i64,
    pub content: String,
    pub metadata: serde_json::Value,
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// A candidate returned by vector, lexical, or fused search.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: StoredChunk,
    /// Cosine similarity, BM25-derived score, or fused RRF score.
    pub score: f64,
    /// Cosine similarity when the candidate came through the vector path.
    pub vector_score: Option<f64>,
}

/// One row of the `sources` table plus its chunk count.
#[derive(Debug, Clone, Serialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub summary: String,
    pub total_words: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub document_count: i64,
}

/// Splits stored text into whitespace-separated words.
pub fn word_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}

/// Derives the source identifier (host, plus port when present) of a URL.
///
/// Falls back to the trimmed input for strings that do not parse as URLs,
/// so a bare domain such as `example.com` maps to itself.
pub fn source_id_for_url(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => match parsed.port() {
                Some(port) => format!("{}:{}", host.to_lowercase(), port),
                None => host.to_lowercase(),
            },
            None => url.trim().to_string(),
        },
        Err(_) => url
            .trim()
            .trim_start_matches("//")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_lowercase(),
    }
}
