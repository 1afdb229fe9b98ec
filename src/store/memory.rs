//! In-memory [`Store`] implementation for tests and demos.
//!
//! Uses `BTreeMap` and `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity; keyword search scores rows by how often
//! the query terms occur in them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{compare_hits, query_terms, Store};
use crate::embedding::cosine_similarity;
use crate::error::RagError;
use crate::models::{word_count, ChunkRow, Corpus, ScoredChunk, SourceRecord, StoredChunk};

struct SourceRow {
    summary: String,
    total_words: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

struct Row {
    chunk: StoredChunk,
    embedding: Vec<f32>,
}

/// Process-local store.
pub struct InMemoryStore {
    sources: RwLock<BTreeMap<String, SourceRow>>,
    pages: RwLock<Vec<Row>>,
    code: RwLock<Vec<Row>>,
    full_text: bool,
    offline: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(BTreeMap::new()),
            pages: RwLock::new(Vec::new()),
            code: RwLock::new(Vec::new()),
            full_text: true,
            offline: AtomicBool::new(false),
        }
    }

    /// A store whose keyword search always fails, as a backend without a
    /// full-text index would.
    pub fn without_full_text() -> Self {
        Self {
            full_text: false,
            ..Self::new()
        }
    }

    /// Makes every subsequent call fail as if the backend were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RagError::BackendUnreachable("store is offline".to_string()).into());
        }
        Ok(())
    }

    fn table(&self, corpus: Corpus) -> &RwLock<Vec<Row>> {
        match corpus {
            Corpus::Pages => &self.pages,
            Corpus::CodeExamples => &self.code,
        }
    }

    fn replace_rows(&self, corpus: Corpus, urls: &[&str], rows: &[ChunkRow]) -> Result<()> {
        self.check_online()?;
        {
            let sources = read(&self.sources)?;
            for row in rows {
                if !sources.contains_key(&row.source_id) {
                    bail!(
                        "FOREIGN KEY constraint failed: source '{}' does not exist",
                        row.source_id
                    );
                }
            }
        }

        let mut table = write(self.table(corpus))?;
        table.retain(|r| !urls.contains(&r.chunk.url.as_str()));
        for row in rows {
            table.push(Row {
                chunk: StoredChunk {
                    id: uuid::Uuid::new_v4().to_string(),
                    url: row.url.clone(),
                    chunk_number: row.chunk_number,
                    content: row.content.clone(),
                    metadata: row.metadata.clone(),
                    source_id: row.source_id.clone(),
                    summary: row.summary.clone(),
                },
                embedding: row.embedding.clone(),
            });
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn matches_source(chunk: &StoredChunk, source: Option<&str>) -> bool {
    source.map(|s| chunk.source_id == s).unwrap_or(true)
}

fn term_score(terms: &[String], chunk: &StoredChunk) -> f64 {
    let mut haystack = chunk.content.to_lowercase();
    if let Some(summary) = &chunk.summary {
        haystack.push('\n');
        haystack.push_str(&summary.to_lowercase());
    }
    terms
        .iter()
        .map(|t| haystack.matches(t.as_str()).count() as f64)
        .sum()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn ensure_source(&self, source_id: &str, placeholder: &str) -> Result<()> {
        self.check_online()?;
        let mut sources = write(&self.sources)?;
        let now = Utc::now();
        sources.entry(source_id.to_string()).or_insert_with(|| SourceRow {
            summary: placeholder.to_string(),
            total_words: 0,
            created_at: now,
            updated_at: now,
        });
        Ok(())
    }

    async fn upsert_source(&self, source_id: &str, summary: &str, total_words: i64) -> Result<()> {
        self.check_online()?;
        let mut sources = write(&self.sources)?;
        let now = Utc::now();
        let row = sources.entry(source_id.to_string()).or_insert_with(|| SourceRow {
            summary: String::new(),
            total_words: 0,
            created_at: now,
            updated_at: now,
        });
        row.summary = summary.to_string();
        row.total_words = total_words;
        row.updated_at = now;
        Ok(())
    }

    async fn upsert_page_chunks(&self, rows: &[ChunkRow]) -> Result<()> {
        let urls: Vec<&str> = rows.iter().map(|r| r.url.as_str()).collect();
        self.replace_rows(Corpus::Pages, &urls, rows)
    }

    async fn replace_code_examples(&self, url: &str, rows: &[ChunkRow]) -> Result<()> {
        self.replace_rows(Corpus::CodeExamples, &[url], rows)
    }

    async fn delete_url(&self, url: &str) -> Result<()> {
        self.check_online()?;
        write(&self.pages)?.retain(|r| r.chunk.url != url);
        write(&self.code)?.retain(|r| r.chunk.url != url);
        Ok(())
    }

    async fn list_sources(&self) -> Result<Vec<SourceRecord>> {
        self.check_online()?;
        let sources = read(&self.sources)?;
        let pages = read(&self.pages)?;
        Ok(sources
            .iter()
            .map(|(id, row)| SourceRecord {
                source_id: id.clone(),
                summary: row.summary.clone(),
                total_words: row.total_words,
                created_at: row.created_at,
                updated_at: row.updated_at,
                document_count: pages.iter().filter(|r| &r.chunk.source_id == id).count() as i64,
            })
            .collect())
    }

    async fn source_word_count(&self, source_id: &str) -> Result<i64> {
        self.check_online()?;
        let pages = read(&self.pages)?;
        Ok(pages
            .iter()
            .filter(|r| r.chunk.source_id == source_id)
            .map(|r| word_count(&r.chunk.content))
            .sum())
    }

    async fn chunks_for_url(&self, corpus: Corpus, url: &str) -> Result<Vec<StoredChunk>> {
        self.check_online()?;
        let table = read(self.table(corpus))?;
        let mut chunks: Vec<StoredChunk> = table
            .iter()
            .filter(|r| r.chunk.url == url)
            .map(|r| r.chunk.clone())
            .collect();
        chunks.sort_by_key(|c| c.chunk_number);
        Ok(chunks)
    }

    async fn vector_search(
        &self,
        corpus: Corpus,
        query_vec: &[f32],
        k: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        self.check_online()?;
        let table = read(self.table(corpus))?;
        let mut hits: Vec<ScoredChunk> = table
            .iter()
            .filter(|r| matches_source(&r.chunk, source))
            .map(|r| {
                let similarity = cosine_similarity(query_vec, &r.embedding) as f64;
                ScoredChunk {
                    chunk: r.chunk.clone(),
                    score: similarity,
                    vector_score: Some(similarity),
                }
            })
            .collect();

        hits.sort_by(compare_hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn keyword_search(
        &self,
        corpus: Corpus,
        query: &str,
        k: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        self.check_online()?;
        if !self.full_text {
            bail!("no such table: {}_fts", corpus.as_str());
        }
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let table = read(self.table(corpus))?;
        let mut hits: Vec<ScoredChunk> = table
            .iter()
            .filter(|r| matches_source(&r.chunk, source))
            .filter_map(|r| {
                let score = term_score(&terms, &r.chunk);
                (score > 0.0).then(|| ScoredChunk {
                    chunk: r.chunk.clone(),
                    score,
                    vector_score: None,
                })
            })
            .collect();

        hits.sort_by(compare_hits);
        hits.truncate(k);
        Ok(hits)
    }
}
