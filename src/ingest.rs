//! Ingestion pipeline orchestration.
//!
//! Drives crawled pages through chunk → (augment) → embed → store, and in
//! the same per-URL task extracts and stores code examples. URLs run on a
//! bounded worker pool of `ingest.workers` tasks.
//!
//! Ordering: every source row is created (with a placeholder summary)
//! before any chunk that references it is written; source summaries and
//! word counts are refreshed after all URLs of the batch are done.
//!
//! A failing URL is logged and reported; the batch carries on. Code example
//! failures are only logged, since the URL's page chunks are already stored.
//! Cancellation is honoured between URLs, never in the middle of one.

use anyhow::{bail, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tokio_util::sync::CancellationToken;

use crate::augment::ContextAugmenter;
use crate::chunk::{chunk_markdown, section_info};
use crate::code_extract::{embedding_text, example_metadata, extract_code_blocks, summarize};
use crate::context::AppContext;
use crate::llm::truncate_chars;
use crate::models::{source_id_for_url, ChunkRow, CrawledPage};

/// Characters of sampled page content fed to the source summary prompt.
const SUMMARY_INPUT_CHARS: usize = 5000;

/// Outcome of one ingestion batch.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestReport {
    pub sources: Vec<String>,
    pub pages_ingested: usize,
    pub chunks_stored: usize,
    pub code_examples_stored: usize,
    pub failures: Vec<IngestFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub url: String,
    pub error: String,
}

struct UrlOutcome {
    chunks: usize,
    code_examples: usize,
}

pub fn source_placeholder(source_id: &str) -> String {
    format!("Summary pending for {}", source_id)
}

pub fn source_fallback_summary(source_id: &str) -> String {
    format!("Content from {}", source_id)
}

/// Ingests `pages`. Only the store being unreachable for every source
/// fails the call; everything else is reported per URL.
pub async fn ingest_pages(
    ctx: &AppContext,
    pages: Vec<CrawledPage>,
    cancel: &CancellationToken,
) -> Result<IngestReport> {
    let mut report = IngestReport::default();

    // Later duplicates of a URL replace earlier ones.
    let mut ordered: Vec<CrawledPage> = Vec::with_capacity(pages.len());
    let mut seen: HashMap<String, usize> = HashMap::new();
    for page in pages {
        let url = page.url.trim().to_string();
        if url.is_empty() {
            report.failures.push(IngestFailure {
                url,
                error: "URL cannot be empty".to_string(),
            });
            continue;
        }
        let page = CrawledPage {
            url: url.clone(),
            markdown: page.markdown,
        };
        match seen.get(&url) {
            Some(&i) => ordered[i] = page,
            None => {
                seen.insert(url, ordered.len());
                ordered.push(page);
            }
        }
    }

    // Step 1: group by source and make sure every source row exists.
    let mut by_source: BTreeMap<String, Vec<CrawledPage>> = BTreeMap::new();
    for page in ordered {
        by_source
            .entry(source_id_for_url(&page.url))
            .or_default()
            .push(page);
    }

    let mut work: Vec<(String, CrawledPage)> = Vec::new();
    let mut register_error = None;
    for (source_id, pages) in &by_source {
        match ctx
            .store
            .ensure_source(source_id, &source_placeholder(source_id))
            .await
        {
            Ok(()) => work.extend(pages.iter().map(|p| (source_id.clone(), p.clone()))),
            Err(e) => {
                tracing::warn!(source_id = %source_id, error = %e, "could not register source");
                for page in pages {
                    report.failures.push(IngestFailure {
                        url: page.url.clone(),
                        error: format!("{:#}", e),
                    });
                }
                register_error = Some(e);
            }
        }
    }
    if work.is_empty() {
        if let Some(e) = register_error {
            return Err(e);
        }
    }

    // Step 2: per-URL work on the bounded pool.
    let workers = ctx.config.ingest.workers.max(1);
    let results: Vec<(String, CrawledPage, Option<Result<UrlOutcome>>)> = stream::iter(work)
        .map(|(source_id, page)| async move {
            if cancel.is_cancelled() {
                return (source_id, page, None);
            }
            let outcome = process_url(ctx, &source_id, &page).await;
            (source_id, page, Some(outcome))
        })
        .buffer_unordered(workers)
        .collect()
        .await;

    let mut ingested: BTreeMap<String, Vec<CrawledPage>> = BTreeMap::new();
    for (source_id, page, outcome) in results {
        match outcome {
            Some(Ok(outcome)) => {
                tracing::info!(
                    url = %page.url,
                    source_id = %source_id,
                    chunks = outcome.chunks,
                    code_examples = outcome.code_examples,
                    "ingested page"
                );
                report.pages_ingested += 1;
                report.chunks_stored += outcome.chunks;
                report.code_examples_stored += outcome.code_examples;
                ingested.entry(source_id).or_default().push(page);
            }
            Some(Err(e)) => {
                tracing::warn!(url = %page.url, source_id = %source_id, error = %e, "page ingestion failed");
                report.failures.push(IngestFailure {
                    url: page.url,
                    error: format!("{:#}", e),
                });
            }
            None => report.failures.push(IngestFailure {
                url: page.url,
                error: "ingestion cancelled".to_string(),
            }),
        }
    }

    // Step 3: refresh word counts and summaries of the touched sources.
    for (source_id, mut pages) in ingested {
        pages.sort_by(|a, b| a.url.cmp(&b.url));
        if let Err(e) = refresh_source(ctx, &source_id, &pages).await {
            tracing::warn!(source_id = %source_id, error = %e, "source summary update failed");
        }
        report.sources.push(source_id);
    }

    report.failures.sort_by(|a, b| a.url.cmp(&b.url));
    Ok(report)
}

async fn process_url(ctx: &AppContext, source_id: &str, page: &CrawledPage) -> Result<UrlOutcome> {
    let config = &ctx.config;
    let chunks = chunk_markdown(
        &page.markdown,
        config.chunking.target_chars,
        config.chunking.min_chars,
    );
    if chunks.is_empty() {
        bail!("No content to chunk");
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let inputs = if config.features.use_contextual_embeddings {
        ContextAugmenter::new(ctx.llm.clone(), config.ingest.workers)
            .augment(&page.url, &page.markdown, &texts)
            .await
    } else {
        texts.clone()
    };
    let vectors = ctx.embedder.embed(&inputs).await;

    let rows: Vec<ChunkRow> = chunks
        .iter()
        .zip(vectors)
        .map(|(chunk, embedding)| {
            let mut metadata = section_info(&chunk.text);
            metadata["chunk_index"] = chunk.index.into();
            metadata["url"] = page.url.clone().into();
            metadata["source"] = source_id.into();
            metadata["crawl_type"] = "webpage".into();
            ChunkRow {
                url: page.url.clone(),
                chunk_number: chunk.index,
                content: chunk.text.clone(),
                metadata,
                source_id: source_id.to_string(),
                embedding,
                summary: None,
            }
        })
        .collect();
    ctx.store.upsert_page_chunks(&rows).await?;

    // Page chunks are committed; the URL still counts as ingested.
    let code_examples = if config.features.use_agentic_rag {
        match store_code_examples(ctx, source_id, page).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(url = %page.url, source_id, error = %e, "code example ingestion failed");
                0
            }
        }
    } else {
        0
    };

    Ok(UrlOutcome {
        chunks: rows.len(),
        code_examples,
    })
}

async fn store_code_examples(ctx: &AppContext, source_id: &str, page: &CrawledPage) -> Result<usize> {
    let config = &ctx.config.ingest;
    let blocks = extract_code_blocks(&page.markdown, config.code_min_chars, config.code_context_chars);
    if blocks.is_empty() {
        // Clears examples left over from an earlier crawl of the page.
        ctx.store.replace_code_examples(&page.url, &[]).await?;
        return Ok(0);
    }

    let calls: Vec<_> = blocks
        .iter()
        .map(|block| summarize(ctx.llm.as_ref(), block))
        .collect();
    let summaries: Vec<String> = stream::iter(calls)
        .buffered(config.workers.max(1))
        .collect()
        .await;

    let inputs: Vec<String> = blocks
        .iter()
        .zip(&summaries)
        .map(|(block, summary)| embedding_text(&block.code, summary))
        .collect();
    let vectors = ctx.embedder.embed(&inputs).await;

    let rows: Vec<ChunkRow> = blocks
        .iter()
        .zip(summaries)
        .zip(vectors)
        .enumerate()
        .map(|(i, ((block, summary), embedding))| ChunkRow {
            url: page.url.clone(),
            chunk_number: i as i64,
            content: block.code.clone(),
            metadata: example_metadata(block, i, &page.url, source_id),
            source_id: source_id.to_string(),
            embedding,
            summary: Some(summary),
        })
        .collect();
    ctx.store.replace_code_examples(&page.url, &rows).await?;
    Ok(rows.len())
}

async fn refresh_source(ctx: &AppContext, source_id: &str, pages: &[CrawledPage]) -> Result<()> {
    let total_words = ctx.store.source_word_count(source_id).await?;

    let sample = pages
        .iter()
        .take(ctx.config.ingest.summary_sample_pages.max(1))
        .map(|p| p.markdown.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let summary = summarize_source(ctx, source_id, truncate_chars(&sample, SUMMARY_INPUT_CHARS)).await;

    ctx.store.upsert_source(source_id, &summary, total_words).await
}

async fn summarize_source(ctx: &AppContext, source_id: &str, content: &str) -> String {
    if content.trim().is_empty() {
        return source_fallback_summary(source_id);
    }
    let prompt = format!(
        "<source_content>\n{content}\n</source_content>\n\n\
         The above content is from the documentation for '{source_id}'. \
         Provide a concise summary (3-5 sentences) that describes what this library, tool, \
         or framework is about and what it is used for."
    );
    match ctx
        .llm
        .complete(
            "You are a helpful assistant that provides concise library/tool/framework summaries.",
            &prompt,
            150,
        )
        .await
    {
        Ok(summary) => summary,
        Err(e) => {
            tracing::debug!(source_id, error = %e, "source summary failed; using fallback");
            source_fallback_summary(source_id)
        }
    }
}

/// Parses crawler output: a JSON array of `{url, markdown}` objects, or one
/// such object per line.
pub fn parse_pages(text: &str) -> Result<Vec<CrawledPage>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    let mut pages = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let page: CrawledPage = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("line {}: {}", i + 1, e))?;
        pages.push(page);
    }
    Ok(pages)
}
