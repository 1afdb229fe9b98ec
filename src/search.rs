//! Retrieval over crawled pages and code examples.
//!
//! A request moves through `INIT → EMBEDDING → SEARCHING → [RERANKING] → DONE`.
//! Any stage can end the request with a [`RagError`]; reranking is the
//! exception and degrades to the unreranked candidates on failure.
//!
//! # Scoring
//!
//! | Path | `relevance_score` |
//! |------|-------------------|
//! | vector only | cosine similarity, clamped to `[0, 1]` |
//! | hybrid | RRF score divided by its maximum `2 / (k + 1)` |
//! | reranked | logistic of the cross-encoder score |
//!
//! Results are sorted by relevance descending, then vector similarity,
//! then `(url, chunk_number)` ascending.

use anyhow::Result;
use serde::Serialize;
use std::cmp::Ordering;

use crate::context::AppContext;
use crate::error::RagError;
use crate::llm::truncate_chars;
use crate::models::{Corpus, ScoredChunk};
use crate::store::{compare_hits, query_terms, Ranked, ScoreScale};

pub const MAX_QUERY_CHARS: usize = 1000;
pub const MAX_SOURCE_CHARS: usize = 200;
pub const MAX_MATCH_COUNT: i64 = 50;
pub const DEFAULT_MATCH_COUNT: i64 = 5;
const MAX_CONTENT_CHARS: usize = 5000;
const MAX_TITLE_CHARS: usize = 500;
const SNIPPET_CHARS: usize = 240;
const SNIPPET_LEAD_CHARS: usize = 60;

/// A validated search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub query: String,
    pub source: Option<String>,
    pub match_count: usize,
}

impl SearchQuery {
    /// Checks and normalizes raw parameters.
    ///
    /// The query is trimmed and must hold 1..=1000 characters. A blank
    /// source counts as absent. `match_count` defaults to 5 and must be in
    /// 1..=50.
    pub fn parse(
        query: &str,
        source: Option<&str>,
        match_count: Option<i64>,
    ) -> std::result::Result<Self, RagError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RagError::validation("Query cannot be empty"));
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(RagError::validation(format!(
                "Query too long (max {} characters)",
                MAX_QUERY_CHARS
            )));
        }

        let source = source.map(str::trim).filter(|s| !s.is_empty());
        if let Some(s) = source {
            if s.chars().count() > MAX_SOURCE_CHARS {
                return Err(RagError::validation(format!(
                    "Source filter too long (max {} characters)",
                    MAX_SOURCE_CHARS
                )));
            }
        }

        let match_count = match_count.unwrap_or(DEFAULT_MATCH_COUNT);
        if !(1..=MAX_MATCH_COUNT).contains(&match_count) {
            return Err(RagError::validation(format!(
                "match_count must be between 1 and {}",
                MAX_MATCH_COUNT
            )));
        }

        Ok(Self {
            query: query.to_string(),
            source: source.map(str::to_string),
            match_count: match_count as usize,
        })
    }
}

/// One search hit as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub content: String,
    pub url: String,
    pub source_id: String,
    pub relevance_score: f64,
    pub metadata: serde_json::Value,
    pub snippet_start: usize,
    pub snippet_end: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Runs a search against `corpus`. An empty result is not an error.
pub async fn search(ctx: &AppContext, corpus: Corpus, q: &SearchQuery) -> Result<Vec<SearchResult>> {
    let features = &ctx.config.features;
    tracing::debug!(stage = "INIT", corpus = corpus.as_str(), query = %q.query, "search");

    if corpus == Corpus::CodeExamples && !features.use_agentic_rag {
        return Err(RagError::validation(
            "Code example search is disabled. Set USE_AGENTIC_RAG=true to enable it.",
        )
        .into());
    }

    tracing::debug!(stage = "EMBEDDING", "search");
    let query_vec = ctx.embedder.embed_query(&q.query).await.map_err(|e| {
        tracing::debug!(stage = "FAILED", error = %e, "search");
        match RagError::classify(e) {
            RagError::Timeout(m) => RagError::Timeout(m),
            other => RagError::BackendUnreachable(format!("Query embedding failed: {}", other.message())),
        }
    })?;

    tracing::debug!(stage = "SEARCHING", hybrid = features.use_hybrid_search, "search");
    let candidates = q
        .match_count
        .max(ctx.config.retrieval.rerank_candidates);
    let source = q.source.as_deref();
    let ranked = if features.use_hybrid_search {
        ctx.store
            .hybrid_search(
                corpus,
                &q.query,
                &query_vec,
                candidates,
                source,
                ctx.config.retrieval.rrf_k,
            )
            .await?
    } else {
        Ranked {
            hits: ctx
                .store
                .vector_search(corpus, &query_vec, candidates, source)
                .await?,
            scale: ScoreScale::Cosine,
        }
    };

    let mut scored: Vec<(ScoredChunk, f64)> = ranked
        .hits
        .into_iter()
        .map(|hit| {
            let relevance = ranked.scale.normalize(hit.score);
            (hit, relevance)
        })
        .collect();

    if let Some(reranker) = &ctx.reranker {
        if !scored.is_empty() {
            tracing::debug!(stage = "RERANKING", candidates = scored.len(), "search");
            let documents: Vec<String> = scored.iter().map(|(h, _)| h.chunk.content.clone()).collect();
            match reranker.score(&q.query, &documents).await {
                Ok(scores) if scores.len() == scored.len() => {
                    for ((_, relevance), s) in scored.iter_mut().zip(scores) {
                        *relevance = sigmoid(s as f64);
                    }
                }
                Ok(scores) => tracing::warn!(
                    expected = scored.len(),
                    got = scores.len(),
                    "reranker returned wrong number of scores; keeping original order"
                ),
                Err(e) => tracing::warn!(error = %e, "rerank failed; keeping original order"),
            }
        }
    }

    scored.sort_by(|(a, ra), (b, rb)| {
        rb.partial_cmp(ra)
            .unwrap_or(Ordering::Equal)
            .then_with(|| compare_hits(a, b))
    });
    scored.truncate(q.match_count);

    let terms = query_terms(&q.query);
    let results: Vec<SearchResult> = scored
        .into_iter()
        .map(|(hit, relevance)| to_result(corpus, hit, relevance, &terms))
        .collect();

    tracing::debug!(stage = "DONE", results = results.len(), "search");
    Ok(results)
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn to_result(corpus: Corpus, hit: ScoredChunk, relevance: f64, terms: &[String]) -> SearchResult {
    let chunk = hit.chunk;
    let content = truncate_chars(&chunk.content, MAX_CONTENT_CHARS).to_string();
    let (snippet_start, snippet_end) = snippet_window(&content, terms);
    let title = match corpus {
        Corpus::Pages => title_of(&content, &chunk.url),
        Corpus::CodeExamples => chunk
            .summary
            .as_deref()
            .map(|s| truncate_chars(s, 100).to_string())
            .unwrap_or_else(|| chunk.url.clone()),
    };

    SearchResult {
        id: chunk.id,
        title,
        content,
        url: chunk.url,
        source_id: chunk.source_id,
        relevance_score: relevance,
        metadata: chunk.metadata,
        snippet_start,
        snippet_end,
        summary: chunk.summary,
    }
}

/// First markdown heading of the chunk, else the URL.
fn title_of(content: &str, url: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with('#'))
        .map(|l| l.trim_start_matches('#').trim())
        .filter(|l| !l.is_empty())
        .map(|l| truncate_chars(l, MAX_TITLE_CHARS).to_string())
        .unwrap_or_else(|| url.to_string())
}

/// Character window around the first query-term match, or the head of the
/// content when no term matches.
fn snippet_window(content: &str, terms: &[String]) -> (usize, usize) {
    let chars: Vec<char> = content.chars().map(fold_char).collect();
    let len = chars.len();

    let first_match = terms
        .iter()
        .filter_map(|term| {
            let needle: Vec<char> = term.chars().map(fold_char).collect();
            if needle.is_empty() || needle.len() > len {
                return None;
            }
            (0..=len - needle.len()).find(|&i| chars[i..i + needle.len()] == needle[..])
        })
        .min();

    match first_match {
        Some(pos) => {
            let start = pos.saturating_sub(SNIPPET_LEAD_CHARS);
            (start, (start + SNIPPET_CHARS).min(len))
        }
        None => (0, SNIPPET_CHARS.min(len)),
    }
}

/// Unicode lowercase that keeps one char per input char, so positions in
/// the folded text are positions in the original.
fn fold_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}
