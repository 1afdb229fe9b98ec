//! SQLite-backed [`Store`] implementation.
//!
//! Rows live in `crawled_pages` and `code_examples`, each with an
//! embedding BLOB (little-endian `f32`s) and a companion FTS5 table
//! (`crawled_pages_fts`, `code_examples_fts`) kept in step inside the same
//! transaction. Vector search is brute-force cosine similarity over the
//! candidate rows; keyword search ranks by `bm25`.
//!
//! The FTS tables are probed once at [`SqliteStore::open`]. When they are
//! missing a single warning is logged and [`Store::keyword_search`] fails,
//! which makes hybrid search fall back to vector results silently.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{compare_hits, query_terms, Store};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::migrate::table_exists;
use crate::models::{word_count, ChunkRow, Corpus, ScoredChunk, SourceRecord, StoredChunk};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    full_text: bool,
}

impl SqliteStore {
    /// Wraps a migrated pool and probes for the full-text tables.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        let full_text = table_exists(&pool, "crawled_pages_fts").await?
            && table_exists(&pool, "code_examples_fts").await?;
        if !full_text {
            tracing::warn!("full-text tables are missing; hybrid search will use vector results only");
        }
        Ok(Self { pool, full_text })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Deletes the rows of every URL in `urls`, then inserts `rows`.
    async fn replace_rows(
        &self,
        corpus: Corpus,
        mut urls: Vec<&str>,
        rows: &[ChunkRow],
    ) -> Result<()> {
        urls.sort_unstable();
        urls.dedup();
        if urls.is_empty() && rows.is_empty() {
            return Ok(());
        }
        let table = corpus.as_str();
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        for url in urls {
            if self.full_text {
                sqlx::query(&format!(
                    "DELETE FROM {table}_fts WHERE row_id IN (SELECT id FROM {table} WHERE url = ?)"
                ))
                .bind(url)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(&format!("DELETE FROM {table} WHERE url = ?"))
                .bind(url)
                .execute(&mut *tx)
                .await?;
        }

        for row in rows {
            let id = uuid::Uuid::new_v4().to_string();
            let metadata = serde_json::to_string(&row.metadata)?;
            let blob = vec_to_blob(&row.embedding);

            match corpus {
                Corpus::Pages => {
                    sqlx::query(
                        r#"
                        INSERT INTO crawled_pages (id, url, chunk_number, content, metadata,
                                                   source_id, embedding, created_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&id)
                    .bind(&row.url)
                    .bind(row.chunk_number)
                    .bind(&row.content)
                    .bind(&metadata)
                    .bind(&row.source_id)
                    .bind(&blob)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                    if self.full_text {
                        sqlx::query("INSERT INTO crawled_pages_fts (row_id, content) VALUES (?, ?)")
                            .bind(&id)
                            .bind(&row.content)
                            .execute(&mut *tx)
                            .await?;
                    }
                }
                Corpus::CodeExamples => {
                    let summary = row.summary.clone().unwrap_or_default();
                    sqlx::query(
                        r#"
                        INSERT INTO code_examples (id, url, chunk_number, content, summary,
                                                   metadata, source_id, embedding, created_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&id)
                    .bind(&row.url)
                    .bind(row.chunk_number)
                    .bind(&row.content)
                    .bind(&summary)
                    .bind(&metadata)
                    .bind(&row.source_id)
                    .bind(&blob)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                    if self.full_text {
                        sqlx::query(
                            "INSERT INTO code_examples_fts (row_id, content, summary) VALUES (?, ?, ?)",
                        )
                        .bind(&id)
                        .bind(&row.content)
                        .bind(&summary)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn summary_column(corpus: Corpus) -> &'static str {
    match corpus {
        Corpus::Pages => "NULL",
        Corpus::CodeExamples => "t.summary",
    }
}

fn stored_chunk(row: &SqliteRow) -> StoredChunk {
    let metadata: String = row.get("metadata");
    StoredChunk {
        id: row.get("id"),
        url: row.get("url"),
        chunk_number: row.get("chunk_number"),
        content: row.get("content"),
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::json!({})),
        source_id: row.get("source_id"),
        summary: row.get("summary"),
    }
}

/// FTS5 query matching any of the query terms. Terms are quoted so that
/// operator characters in user input are taken literally.
fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_source(&self, source_id: &str, placeholder: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sources (source_id, summary, total_words, created_at, updated_at)
            VALUES (?, ?, 0, ?, ?)
            ON CONFLICT(source_id) DO NOTHING
            "#,
        )
        .bind(source_id)
        .bind(placeholder)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_source(&self, source_id: &str, summary: &str, total_words: i64) -> Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO sources (source_id, summary, total_words, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                summary = excluded.summary,
                total_words = excluded.total_words,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source_id)
        .bind(summary)
        .bind(total_words)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_page_chunks(&self, rows: &[ChunkRow]) -> Result<()> {
        let urls = rows.iter().map(|r| r.url.as_str()).collect();
        self.replace_rows(Corpus::Pages, urls, rows).await
    }

    async fn replace_code_examples(&self, url: &str, rows: &[ChunkRow]) -> Result<()> {
        self.replace_rows(Corpus::CodeExamples, vec![url], rows).await
    }

    async fn delete_url(&self, url: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for corpus in [Corpus::Pages, Corpus::CodeExamples] {
            let table = corpus.as_str();
            if self.full_text {
                sqlx::query(&format!(
                    "DELETE FROM {table}_fts WHERE row_id IN (SELECT id FROM {table} WHERE url = ?)"
                ))
                .bind(url)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(&format!("DELETE FROM {table} WHERE url = ?"))
                .bind(url)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_sources(&self) -> Result<Vec<SourceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT s.source_id, s.summary, s.total_words, s.created_at, s.updated_at,
                   (SELECT COUNT(*) FROM crawled_pages p WHERE p.source_id = s.source_id)
                       AS document_count
            FROM sources s
            ORDER BY s.source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SourceRecord {
                source_id: row.get("source_id"),
                summary: row.get("summary"),
                total_words: row.get("total_words"),
                created_at: from_ts(row.get("created_at")),
                updated_at: from_ts(row.get("updated_at")),
                document_count: row.get("document_count"),
            })
            .collect())
    }

    async fn source_word_count(&self, source_id: &str) -> Result<i64> {
        let contents: Vec<String> =
            sqlx::query_scalar("SELECT content FROM crawled_pages WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(contents.iter().map(|c| word_count(c)).sum())
    }

    async fn chunks_for_url(&self, corpus: Corpus, url: &str) -> Result<Vec<StoredChunk>> {
        let sql = format!(
            "SELECT t.id, t.url, t.chunk_number, t.content, t.metadata, t.source_id, {} AS summary \
             FROM {} t WHERE t.url = ? ORDER BY t.chunk_number ASC",
            summary_column(corpus),
            corpus.as_str()
        );
        let rows = sqlx::query(&sql).bind(url).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(stored_chunk).collect())
    }

    async fn vector_search(
        &self,
        corpus: Corpus,
        query_vec: &[f32],
        k: usize,
        source: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        let sql = format!(
            "SELECT t.id, t.url, t.chunk_number, t.content, t.metadata, t.source_id, \
                    {} AS summary, t.embedding \
             FROM {} t WHERE (? IS NULL OR t.source_id = ?)",
            summary_column(corpus),
            corpus.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .bind(source)
            .fetch_all(&self.pool)
            .await?;

        let mut hits: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                ScoredChunk {
                    chunk: stored_chunk(row),
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
        if !self.full_text {
            bail!("full-text index unavailable for {}", corpus.as_str());
        }
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let table = corpus.as_str();
        let sql = format!(
            "SELECT t.id, t.url, t.chunk_number, t.content, t.metadata, t.source_id, \
                    {summary} AS summary, bm25({table}_fts) AS bm25_score \
             FROM {table}_fts JOIN {table} t ON t.id = {table}_fts.row_id \
             WHERE {table}_fts MATCH ? AND (? IS NULL OR t.source_id = ?) \
             ORDER BY bm25_score LIMIT ?",
            summary = summary_column(corpus),
        );
        let rows = sqlx::query(&sql)
            .bind(&match_expr)
            .bind(source)
            .bind(source)
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut hits: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let bm25_score: f64 = row.get("bm25_score");
                ScoredChunk {
                    chunk: stored_chunk(row),
                    score: -bm25_score,
                    vector_score: None,
                }
            })
            .collect();
        hits.sort_by(compare_hits);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::migrate::run_migrations;

    async fn store() -> SqliteStore {
        let pool = connect_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteStore::open(pool).await.unwrap()
    }

    fn row(url: &str, n: i64, content: &str, embedding: Vec<f32>) -> ChunkRow {
        ChunkRow {
            url: url.to_string(),
            chunk_number: n,
            content: content.to_string(),
            metadata: serde_json::json!({ "chunk_index": n, "url": url }),
            source_id: "ex.com".to_string(),
            embedding,
            summary: None,
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = connect_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_key_enforced() {
        let store = store().await;
        let result = store
            .upsert_page_chunks(&[row("https://ex.com/a", 0, "hello", vec![1.0, 0.0])])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reingest_replaces_chunks() {
        let store = store().await;
        store.ensure_source("ex.com", "Summary pending for ex.com").await.unwrap();
        let url = "https://ex.com/a";
        store
            .upsert_page_chunks(&[
                row(url, 0, "alpha", vec![1.0, 0.0]),
                row(url, 1, "beta", vec![0.0, 1.0]),
                row(url, 2, "gamma", vec![1.0, 1.0]),
            ])
            .await
            .unwrap();
        store
            .upsert_page_chunks(&[
                row(url, 0, "delta", vec![1.0, 0.0]),
                row(url, 1, "epsilon", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let chunks = store.chunks_for_url(Corpus::Pages, url).await.unwrap();
        let numbers: Vec<i64> = chunks.iter().map(|c| c.chunk_number).collect();
        assert_eq!(numbers, vec![0, 1]);
        assert_eq!(chunks[0].content, "delta");
        assert_eq!(chunks[0].metadata["url"], url);

        // stale FTS rows are gone too
        let hits = store.keyword_search(Corpus::Pages, "gamma", 10, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_vector_and_keyword_search() {
        let store = store().await;
        store.ensure_source("ex.com", "").await.unwrap();
        store
            .upsert_page_chunks(&[
                row("https://ex.com/a", 0, "tokio runtime internals", vec![1.0, 0.0]),
                row("https://ex.com/b", 0, "sqlite full text search", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let dense = store
            .vector_search(Corpus::Pages, &[0.9, 0.1], 1, None)
            .await
            .unwrap();
        assert_eq!(dense[0].chunk.url, "https://ex.com/a");
        assert!(dense[0].score > 0.9);

        let lexical = store
            .keyword_search(Corpus::Pages, "SQLite search", 5, Some("ex.com"))
            .await
            .unwrap();
        assert_eq!(lexical.len(), 1);
        assert_eq!(lexical[0].chunk.url, "https://ex.com/b");

        let other = store
            .keyword_search(Corpus::Pages, "sqlite", 5, Some("other.com"))
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_code_examples_keep_summary() {
        let store = store().await;
        store.ensure_source("ex.com", "").await.unwrap();
        let mut example = row("https://ex.com/a", 0, "fn main() {}", vec![1.0, 0.0]);
        example.summary = Some("An empty entry point.".to_string());
        store
            .replace_code_examples("https://ex.com/a", &[example])
            .await
            .unwrap();

        let hits = store
            .keyword_search(Corpus::CodeExamples, "entry point", 5, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.summary.as_deref(), Some("An empty entry point."));
    }

    #[tokio::test]
    async fn test_empty_code_example_batch_clears_url() {
        let store = store().await;
        store.ensure_source("ex.com", "").await.unwrap();
        let url = "https://ex.com/a";
        let mut example = row(url, 0, "fn main() {}", vec![1.0, 0.0]);
        example.summary = Some("An empty entry point.".to_string());
        store.replace_code_examples(url, &[example]).await.unwrap();

        store.replace_code_examples(url, &[]).await.unwrap();
        assert!(store
            .chunks_for_url(Corpus::CodeExamples, url)
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .keyword_search(Corpus::CodeExamples, "entry point", 5, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sources_and_word_counts() {
        let store = store().await;
        store.ensure_source("ex.com", "Summary pending for ex.com").await.unwrap();
        store
            .upsert_page_chunks(&[
                row("https://ex.com/a", 0, "one two three", vec![1.0]),
                row("https://ex.com/a", 1, "four", vec![1.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.source_word_count("ex.com").await.unwrap(), 4);

        store.upsert_source("ex.com", "Docs about numbers.", 4).await.unwrap();
        let sources = store.list_sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].summary, "Docs about numbers.");
        assert_eq!(sources[0].document_count, 2);
    }

    #[tokio::test]
    async fn test_delete_url() {
        let store = store().await;
        store.ensure_source("ex.com", "").await.unwrap();
        store
            .upsert_page_chunks(&[row("https://ex.com/a", 0, "alpha", vec![1.0])])
            .await
            .unwrap();
        store.delete_url("https://ex.com/a").await.unwrap();
        assert!(store
            .chunks_for_url(Corpus::Pages, "https://ex.com/a")
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(fts_query("foo AND bar*").as_deref(), Some("\"foo\" OR \"and\" OR \"bar\""));
        assert!(fts_query("!!").is_none());
    }
}
