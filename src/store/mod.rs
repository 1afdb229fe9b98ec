//! Storage abstraction for crawled pages, code examples, and sources.
//!
//! The [`Store`] trait is the only write path to persistent state. Two
//! backends implement it:
//!
//! - [`sqlite::SqliteStore`]: the production backend (sqlx + FTS5).
//! - [`memory::InMemoryStore`]: process-local, used by tests and demos.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert_source`](Store::upsert_source) | Insert or refresh a source row |
//! | [`upsert_page_chunks`](Store::upsert_page_chunks) | Replace the chunks of every URL in the batch |
//! | [`replace_code_examples`](Store::replace_code_examples) | Replace the code examples of one URL |
//! | [`list_sources`](Store::list_sources) | Sources with their chunk counts |
//! | [`vector_search`](Store::vector_search) | Top-k by cosine similarity |
//! | [`keyword_search`](Store::keyword_search) | Top-k by full-text relevance |
//! | [`hybrid_search`](Store::hybrid_search) | Both, fused by reciprocal rank |
//!
//! Reads are non-transactional; each write batch is one transaction.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{ChunkRow, Corpus, ScoredChunk, SourceRecord, StoredChunk};

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap round trip proving the backend answers.
    async fn ping(&self) -> Result<()>;

    /// Inserts a source row with `placeholder` as its summary if none exists.
    /// An existing row is left untouched.
    async fn ensure_source(&self, source_id: &str, placeholder: &str) -> Result<()>;

    /// Inserts or updates a source row. Always bumps `updated_at`.
    async fn upsert_source(&self, source_id: &str, summary: &str, total_words: i64) -> Result<()>;

    /// Deletes every existing chunk of each URL present in `rows`, then
    /// inserts `rows`, in a single transaction.
    async fn upsert_page_chunks(&self, rows: &[ChunkRow]) -> Result<()>;

    /// Deletes every code example of `url`, then inserts `rows`, in a
    /// single transaction. An empty `rows` still clears the URL.
    async fn replace_code_examples(&self, url: &str, rows: &[ChunkRow]) -> Result<()>;

    /// Removes all page chunks and code examples of `url`.
    async fn delete_url(&self, url: &str) -> Result<()>;

    async fn list_sources(&self) -> Result<Vec<SourceRecord>>;

    /// Sum of word counts over the stored page chunks of a source.
    async fn source_word_count(&self, source_id: &str) -> Result<i64>;

    /// Stored rows of one URL ordered by `chunk_number`.
    async fn chunks_for_url(&self, corpus: Corpus, url: &str) -> Result<Vec<StoredChunk>>;

    /// Top-k rows by cosine similarity, descending, optionally restricted
    /// to one source. Equal scores order by `(url, chunk_number)`.
    async fn vector_search(
        &self,
        corpus: Corpus,
        query_vec: &[f32],
        k: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Top-k rows by full-text relevance. Fails when the backend has no
    /// full-text index.
    async fn keyword_search(
        &self,
        corpus: Corpus,
        query: &str,
        k: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredChunk>>;

    /// Runs vector and keyword search concurrently and fuses them with
    /// reciprocal-rank fusion. A failing keyword leg degrades to the vector
    /// results alone, reported with [`ScoreScale::Cosine`].
    #[allow(clippy::too_many_arguments)]
    async fn hybrid_search(
        &self,
        corpus: Corpus,
        query: &str,
        query_vec: &[f32],
        k: usize,
        source: Option<&str>,
        rrf_k: f64,
    ) -> Result<Ranked> {
        let (dense, lexical) = tokio::join!(
            self.vector_search(corpus, query_vec, k, source),
            self.keyword_search(corpus, query, k, source)
        );
        let dense = dense?;
        let lexical = match lexical {
            Ok(hits) => hits,
            Err(e) => {
                tracing::debug!(error = %e, "keyword leg failed; using vector results only");
                return Ok(Ranked {
                    hits: dense,
                    scale: ScoreScale::Cosine,
                });
            }
        };

        let mut fused = reciprocal_rank_fusion(dense, lexical, rrf_k);
        fused.truncate(k);
        Ok(Ranked {
            hits: fused,
            scale: ScoreScale::Rrf { k: rrf_k.max(1.0) },
        })
    }
}

/// What the `score` of a ranked list measures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreScale {
    /// Cosine similarity in `[-1, 1]`.
    Cosine,
    /// Reciprocal-rank fusion of two lists with constant `k`.
    Rrf { k: f64 },
}

impl ScoreScale {
    /// Maps a score onto `[0, 1]`, preserving order.
    pub fn normalize(self, score: f64) -> f64 {
        let value = match self {
            ScoreScale::Cosine => score,
            // rank 1 in both lists is the best a row can do
            ScoreScale::Rrf { k } => score / (2.0 / (k + 1.0)),
        };
        value.clamp(0.0, 1.0)
    }
}

/// Hits plus the scale their scores are on.
#[derive(Debug, Clone)]
pub struct Ranked {
    pub hits: Vec<ScoredChunk>,
    pub scale: ScoreScale,
}

/// RRF contribution of a 1-based rank.
pub fn rrf_contribution(k: f64, rank: usize) -> f64 {
    1.0 / (k + rank as f64)
}

/// Merges two ranked lists keyed on `(url, chunk_number)`.
///
/// Each list contributes `1 / (k + rank)` per row. The result is ordered by
/// fused score, then vector similarity, then `(url, chunk_number)`.
pub fn reciprocal_rank_fusion(
    dense: Vec<ScoredChunk>,
    lexical: Vec<ScoredChunk>,
    rrf_k: f64,
) -> Vec<ScoredChunk> {
    let k = rrf_k.max(1.0);
    let mut map: HashMap<(String, i64), ScoredChunk> = HashMap::new();

    for (idx, hit) in dense.into_iter().enumerate() {
        let key = (hit.chunk.url.clone(), hit.chunk.chunk_number);
        let vector_score = hit.vector_score.or(Some(hit.score));
        let entry = map.entry(key).or_insert_with(|| ScoredChunk {
            chunk: hit.chunk,
            score: 0.0,
            vector_score: None,
        });
        entry.vector_score = vector_score;
        entry.score += rrf_contribution(k, idx + 1);
    }
    for (idx, hit) in lexical.into_iter().enumerate() {
        let key = (hit.chunk.url.clone(), hit.chunk.chunk_number);
        let entry = map.entry(key).or_insert_with(|| ScoredChunk {
            chunk: hit.chunk,
            score: 0.0,
            vector_score: None,
        });
        entry.score += rrf_contribution(k, idx + 1);
    }

    let mut fused: Vec<ScoredChunk> = map.into_values().collect();
    fused.sort_by(compare_hits);
    fused
}

/// Descending score, then descending vector score, then `(url, chunk_number)` ascending.
pub fn compare_hits(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            let av = a.vector_score.unwrap_or(f64::NEG_INFINITY);
            let bv = b.vector_score.unwrap_or(f64::NEG_INFINITY);
            bv.partial_cmp(&av).unwrap_or(Ordering::Equal)
        })
        .then_with(|| a.chunk.url.cmp(&b.chunk.url))
        .then_with(|| a.chunk.chunk_number.cmp(&b.chunk.chunk_number))
}

/// Lowercased alphanumeric query terms, deduplicated in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for token in query.split(|c: char| !c.is_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        let token = token.to_lowercase();
        if !terms.contains(&token) {
            terms.push(token);
        }
    }
    terms
}
