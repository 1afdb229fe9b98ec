//! Ingestion and retrieval properties, checked against both store
//! backends where the property concerns storage.

mod common;

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::*;
use crawl_rag::code_extract::FALLBACK_SUMMARY;
use crawl_rag::embedding::cosine_similarity;
use crawl_rag::ingest::ingest_pages;
use crawl_rag::llm::{DisabledLlm, LlmProvider};
use crawl_rag::models::{word_count, ChunkRow, Corpus, CrawledPage};
use crawl_rag::search::{search, SearchQuery};
use crawl_rag::store::memory::InMemoryStore;
use crawl_rag::store::sqlite::SqliteStore;
use crawl_rag::store::Store;
use crawl_rag::{db, migrate};

async fn sqlite_store() -> Arc<dyn Store> {
    let pool = db::connect_in_memory().await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    Arc::new(SqliteStore::open(pool).await.unwrap())
}

async fn stores() -> Vec<(&'static str, Arc<dyn Store>)> {
    vec![
        ("memory", Arc::new(InMemoryStore::new()) as Arc<dyn Store>),
        ("sqlite", sqlite_store().await),
    ]
}

fn scripted() -> Arc<dyn LlmProvider> {
    Arc::new(ScriptedLlm::new("A site about testing."))
}

/// Minimal linear congruential generator so the property inputs are
/// reproducible.
struct Lcg(u64);

impl Lcg {
    fn next_f32(&mut self) -> f32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0
    }

    fn vector(&mut self) -> Vec<f32> {
        (0..DIMS).map(|_| self.next_f32()).collect()
    }
}

// ============ Chunk storage ============

#[tokio::test]
async fn test_chunk_numbers_are_dense() {
    for (name, store) in stores().await {
        let ctx = context_on(test_config(), store.clone(), Arc::new(HashEmbedder::new()), scripted());
        let report = ingest(
            &ctx,
            vec![
                page_about("https://ex.com/a", "compilers", 5),
                page_about("https://ex.com/b", "linkers", 1),
            ],
        )
        .await;
        assert_eq!(report.pages_ingested, 2, "{}", name);
        assert_eq!(report.chunks_stored, 6, "{}", name);
        assert!(report.failures.is_empty(), "{}", name);

        for (url, expected) in [("https://ex.com/a", 5), ("https://ex.com/b", 1)] {
            let chunks = store.chunks_for_url(Corpus::Pages, url).await.unwrap();
            let numbers: Vec<i64> = chunks.iter().map(|c| c.chunk_number).collect();
            assert_eq!(numbers, (0..expected).collect::<Vec<i64>>(), "{} {}", name, url);
        }
    }
}

#[tokio::test]
async fn test_reingest_replaces_previous_chunks() {
    for (name, store) in stores().await {
        let ctx = context_on(test_config(), store.clone(), Arc::new(HashEmbedder::new()), scripted());
        let url = "https://ex.com/guide";

        ingest(&ctx, vec![page_about(url, "networking", 4)]).await;
        let first = store.chunks_for_url(Corpus::Pages, url).await.unwrap();
        ingest(&ctx, vec![page_about(url, "networking", 4)]).await;
        let second = store.chunks_for_url(Corpus::Pages, url).await.unwrap();
        let contents = |chunks: &[crawl_rag::models::StoredChunk]| {
            chunks.iter().map(|c| c.content.clone()).collect::<Vec<_>>()
        };
        assert_eq!(contents(&first), contents(&second), "{}", name);

        // A shorter page leaves no orphans behind.
        ingest(&ctx, vec![page_about(url, "storage", 2)]).await;
        let third = store.chunks_for_url(Corpus::Pages, url).await.unwrap();
        assert_eq!(third.len(), 2, "{}", name);
        assert!(third.iter().all(|c| c.content.contains("storage")), "{}", name);

        let sources = store.list_sources().await.unwrap();
        assert_eq!(sources.len(), 1, "{}", name);
        assert_eq!(sources[0].document_count, 2, "{}", name);
    }
}

#[tokio::test]
async fn test_source_word_totals_match_chunks() {
    for (name, store) in stores().await {
        let ctx = context_on(test_config(), store.clone(), Arc::new(HashEmbedder::new()), scripted());
        ingest(
            &ctx,
            vec![
                page_about("https://docs.ex.com/one", "allocators", 3),
                page_about("https://docs.ex.com/two", "schedulers", 2),
                page_about("https://other.org/x", "filesystems", 2),
            ],
        )
        .await;

        let sources = store.list_sources().await.unwrap();
        assert_eq!(sources.len(), 2, "{}", name);
        for source in sources {
            let mut expected = 0;
            for url in ["https://docs.ex.com/one", "https://docs.ex.com/two", "https://other.org/x"] {
                for chunk in store.chunks_for_url(Corpus::Pages, url).await.unwrap() {
                    if chunk.source_id == source.source_id {
                        expected += word_count(&chunk.content);
                    }
                }
            }
            assert!(expected > 0);
            assert_eq!(source.total_words, expected, "{} {}", name, source.source_id);
            assert_eq!(source.summary, "A site about testing.");
        }
    }
}

#[tokio::test]
async fn test_duplicate_and_empty_urls_in_one_batch() {
    let (ctx, store) = context(test_config());
    let report = ingest(
        &ctx,
        vec![
            page_about("https://ex.com/p", "first draft", 3),
            CrawledPage {
                url: "   ".to_string(),
                markdown: "ignored".to_string(),
            },
            page_about("https://ex.com/p", "final copy", 2),
            CrawledPage {
                url: "https://ex.com/blank".to_string(),
                markdown: "  \n\n ".to_string(),
            },
        ],
    )
    .await;

    assert_eq!(report.pages_ingested, 1);
    assert_eq!(report.chunks_stored, 2);
    let errors: Vec<&str> = report.failures.iter().map(|f| f.error.as_str()).collect();
    assert_eq!(errors, vec!["URL cannot be empty", "No content to chunk"]);

    let chunks = store.chunks_for_url(Corpus::Pages, "https://ex.com/p").await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.content.contains("final copy")));
}

#[tokio::test]
async fn test_cancelled_ingest_stores_nothing() {
    let (ctx, store) = context(test_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = ingest_pages(
        &ctx,
        vec![
            page_about("https://ex.com/a", "queues", 2),
            page_about("https://ex.com/b", "stacks", 2),
        ],
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(report.pages_ingested, 0);
    assert_eq!(report.failures.len(), 2);
    assert!(report.failures.iter().all(|f| f.error == "ingestion cancelled"));
    assert!(store
        .chunks_for_url(Corpus::Pages, "https://ex.com/a")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_offline_store_fails_the_batch() {
    let (ctx, store) = context(test_config());
    store.set_offline(true);
    let result = ingest_pages(
        &ctx,
        vec![page_about("https://ex.com/a", "queues", 2)],
        &CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
}

// ============ Degraded collaborators ============

#[tokio::test]
async fn test_embedding_failure_stores_zero_vectors() {
    let store = Arc::new(InMemoryStore::new());
    let ctx = context_on(test_config(), store.clone(), Arc::new(BrokenEmbedder), Arc::new(DisabledLlm));
    let report = ingest(&ctx, vec![page_about("https://ex.com/a", "parsers", 3)]).await;
    assert_eq!(report.pages_ingested, 1);
    assert_eq!(report.chunks_stored, 3);

    let hits = store
        .vector_search(Corpus::Pages, &hash_embed("parsers"), 10, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert!(hits.iter().all(|h| h.score == 0.0));

    let sources = store.list_sources().await.unwrap();
    assert_eq!(sources[0].summary, "Content from ex.com");
}

#[tokio::test]
async fn test_contextual_embeddings_keep_stored_content() {
    let mut config = test_config();
    config.features.use_contextual_embeddings = true;
    let llm = Arc::new(ScriptedLlm::new("This chunk belongs to the lexer chapter."));
    let store = Arc::new(InMemoryStore::new());
    let ctx = context_on(config, store.clone(), Arc::new(HashEmbedder::new()), llm.clone());

    let page = page_about("https://ex.com/lexer", "lexers", 3);
    let paragraphs: Vec<String> = page.markdown.split("\n\n").map(str::to_string).collect();
    ingest(&ctx, vec![page]).await;

    // One call per chunk plus the source summary.
    assert_eq!(llm.calls.load(Ordering::SeqCst), 4);
    let stored = store
        .chunks_for_url(Corpus::Pages, "https://ex.com/lexer")
        .await
        .unwrap();
    let contents: Vec<String> = stored.into_iter().map(|c| c.content).collect();
    assert_eq!(contents, paragraphs);
}

#[tokio::test]
async fn test_failed_augmentation_still_ingests() {
    let mut config = test_config();
    config.features.use_contextual_embeddings = true;
    let (ctx, store) = context_with(config, Arc::new(FailingLlm));
    let report = ingest(&ctx, vec![page_about("https://ex.com/a", "tokens", 2)]).await;
    assert_eq!(report.chunks_stored, 2);
    assert!(report.failures.is_empty());
    let sources = store.list_sources().await.unwrap();
    assert_eq!(sources[0].summary, "Content from ex.com");
}

#[tokio::test]
async fn test_code_examples_extracted_with_agentic_rag() {
    let mut config = test_config();
    config.features.use_agentic_rag = true;
    let (ctx, store) = context_with(config, Arc::new(FailingLlm));
    let markdown = "Reading a file:\n\n```rust\nlet text = std::fs::read_to_string(\"notes.txt\")?;\nprintln!(\"{}\", text);\n```\n\n\
                    Tiny block:\n\n```\nx\n```\n\nDone.";
    let report = ingest(
        &ctx,
        vec![CrawledPage {
            url: "https://ex.com/io".to_string(),
            markdown: markdown.to_string(),
        }],
    )
    .await;
    assert_eq!(report.code_examples_stored, 1);

    let examples = store
        .chunks_for_url(Corpus::CodeExamples, "https://ex.com/io")
        .await
        .unwrap();
    assert_eq!(examples.len(), 1);
    assert!(examples[0].content.starts_with("let text"));
    assert_eq!(examples[0].summary.as_deref(), Some(FALLBACK_SUMMARY));
    assert_eq!(examples[0].chunk_number, 0);
}

const CODE_PAGE: &str = "Reading a file:\n\n```rust\nlet text = std::fs::read_to_string(\"notes.txt\")?;\nprintln!(\"{}\", text);\n```\n\nDone.";

#[tokio::test]
async fn test_recrawl_without_code_clears_code_examples() {
    for (name, store) in stores().await {
        let mut config = test_config();
        config.features.use_agentic_rag = true;
        let ctx = context_on(config, store.clone(), Arc::new(HashEmbedder::new()), scripted());
        let url = "https://ex.com/io";

        let first = ingest(
            &ctx,
            vec![CrawledPage {
                url: url.to_string(),
                markdown: CODE_PAGE.to_string(),
            }],
        )
        .await;
        assert_eq!(first.code_examples_stored, 1, "{}", name);
        assert_eq!(
            store.chunks_for_url(Corpus::CodeExamples, url).await.unwrap().len(),
            1,
            "{}",
            name
        );

        let second = ingest(&ctx, vec![page_about(url, "file reading", 2)]).await;
        assert_eq!(second.pages_ingested, 1, "{}", name);
        assert_eq!(second.code_examples_stored, 0, "{}", name);
        assert!(second.failures.is_empty(), "{}", name);
        assert!(
            store
                .chunks_for_url(Corpus::CodeExamples, url)
                .await
                .unwrap()
                .is_empty(),
            "{}: stale code examples survived the re-crawl",
            name
        );
    }
}

#[tokio::test]
async fn test_code_example_write_failure_keeps_page_and_refreshes_source() {
    let mut config = test_config();
    config.features.use_agentic_rag = true;
    let store = Arc::new(CodeWriteFailingStore::new());
    let ctx = context_on(config, store.clone(), Arc::new(HashEmbedder::new()), scripted());
    let url = "https://solo.com/io";

    let report = ingest(
        &ctx,
        vec![CrawledPage {
            url: url.to_string(),
            markdown: CODE_PAGE.to_string(),
        }],
    )
    .await;
    assert_eq!(report.pages_ingested, 1);
    assert_eq!(report.code_examples_stored, 0);
    assert!(report.failures.is_empty());
    assert_eq!(report.sources, vec!["solo.com".to_string()]);

    let chunks = store.chunks_for_url(Corpus::Pages, url).await.unwrap();
    assert!(!chunks.is_empty());
    let expected: i64 = chunks.iter().map(|c| word_count(&c.content)).sum();

    let sources = store.list_sources().await.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].summary, "A site about testing.");
    assert_eq!(sources[0].total_words, expected);
    assert!(expected > 0);
}

#[tokio::test]
async fn test_code_examples_skipped_without_agentic_rag() {
    let (ctx, store) = context(test_config());
    let markdown = "```rust\nfn main() { println!(\"a reasonably long code example\"); }\n```";
    let report = ingest(
        &ctx,
        vec![CrawledPage {
            url: "https://ex.com/main".to_string(),
            markdown: markdown.to_string(),
        }],
    )
    .await;
    assert_eq!(report.code_examples_stored, 0);
    assert!(store
        .chunks_for_url(Corpus::CodeExamples, "https://ex.com/main")
        .await
        .unwrap()
        .is_empty());
}

// ============ Retrieval ============

#[tokio::test]
async fn test_search_result_invariants() {
    let topics = ["rust traits", "python decorators", "sql joins", "http caching"];
    for hybrid in [false, true] {
        let mut config = test_config();
        config.features.use_hybrid_search = hybrid;
        let (ctx, _store) = context(config);
        let mut pages = Vec::new();
        for (i, topic) in topics.iter().enumerate() {
            let host = if i % 2 == 0 { "even.dev" } else { "odd.dev" };
            pages.push(page_about(&format!("https://{}/{}", host, i), topic, 3 + i));
        }
        ingest(&ctx, pages).await;

        for query in ["rust", "decorators joins", "caching in depth", "unrelated words"] {
            for k in [1i64, 3, 10, 50] {
                for source in [None, Some("even.dev"), Some("odd.dev")] {
                    let q = SearchQuery::parse(query, source, Some(k)).unwrap();
                    let results = search(&ctx, Corpus::Pages, &q).await.unwrap();
                    assert!(results.len() <= k as usize);
                    let scores: Vec<f64> = results.iter().map(|r| r.relevance_score).collect();
                    assert!(
                        scores.windows(2).all(|w| w[0] >= w[1]),
                        "hybrid={} query={} scores={:?}",
                        hybrid,
                        query,
                        scores
                    );
                    assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
                    if let Some(source) = source {
                        assert!(results.iter().all(|r| r.source_id == source));
                    }
                    for r in &results {
                        assert!(r.snippet_start <= r.snippet_end);
                        assert!(r.snippet_end <= r.content.chars().count());
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn test_vector_search_matches_brute_force() {
    for (name, store) in stores().await {
        let mut rng = Lcg(42);
        store.ensure_source("prop.test", "pending").await.unwrap();

        let mut rows = Vec::new();
        for page in 0..6 {
            for n in 0..5 {
                rows.push(ChunkRow {
                    url: format!("https://prop.test/{}", page),
                    chunk_number: n,
                    content: format!("page {} chunk {}", page, n),
                    metadata: json!({}),
                    source_id: "prop.test".to_string(),
                    embedding: rng.vector(),
                    summary: None,
                });
            }
        }
        store.upsert_page_chunks(&rows).await.unwrap();

        for _ in 0..5 {
            let query = rng.vector();
            let mut expected: Vec<(f32, String, i64)> = rows
                .iter()
                .map(|r| (cosine_similarity(&query, &r.embedding), r.url.clone(), r.chunk_number))
                .collect();
            expected.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

            for k in [1usize, 4, 10, 30] {
                let hits = store
                    .vector_search(Corpus::Pages, &query, k, None)
                    .await
                    .unwrap();
                let got: Vec<(String, i64)> = hits
                    .iter()
                    .map(|h| (h.chunk.url.clone(), h.chunk.chunk_number))
                    .collect();
                let want: Vec<(String, i64)> = expected
                    .iter()
                    .take(k)
                    .map(|(_, url, n)| (url.clone(), *n))
                    .collect();
                assert_eq!(got, want, "{} k={}", name, k);
                for (hit, (score, _, _)) in hits.iter().zip(&expected) {
                    assert!((hit.score - *score as f64).abs() < 1e-4, "{}", name);
                }
            }
        }
    }
}

#[tokio::test]
async fn test_hybrid_top_hit_scores_one() {
    for (name, store) in stores().await {
        let mut config = test_config();
        config.features.use_hybrid_search = true;
        let ctx = context_on(config, store, Arc::new(HashEmbedder::new()), scripted());
        let quasar = CrawledPage {
            url: "https://space.ex/quasar".to_string(),
            markdown: "A quasar outshines its galaxy. Every quasar is powered by accretion onto a black hole."
                .to_string(),
        };
        ingest(
            &ctx,
            vec![
                quasar,
                page_about("https://space.ex/planets", "orbits", 3),
                page_about("https://space.ex/moons", "orbits", 2),
            ],
        )
        .await;

        let q = SearchQuery::parse("quasar", None, Some(3)).unwrap();
        let results = search(&ctx, Corpus::Pages, &q).await.unwrap();
        assert!(!results.is_empty(), "{}", name);
        assert!(results[0].content.contains("quasar"), "{}", name);
        assert!((results[0].relevance_score - 1.0).abs() < 1e-9, "{}", name);
    }
}

#[tokio::test]
async fn test_hybrid_without_full_text_uses_vector_scores() {
    let mut config = test_config();
    config.features.use_hybrid_search = true;
    let store = Arc::new(InMemoryStore::without_full_text());
    let ctx = context_on(config, store, Arc::new(HashEmbedder::new()), scripted());
    ingest(&ctx, vec![page_about("https://ex.com/a", "ownership", 3)]).await;

    let q = SearchQuery::parse("ownership", None, Some(3)).unwrap();
    let results = search(&ctx, Corpus::Pages, &q).await.unwrap();
    assert_eq!(results.len(), 3);
    let expected = cosine_similarity(&hash_embed("ownership"), &hash_embed(&results[0].content)) as f64;
    assert!((results[0].relevance_score - expected.clamp(0.0, 1.0)).abs() < 1e-4);
}

#[tokio::test]
async fn test_reranker_reorders_candidates() {
    let (ctx, _store) = context(test_config());
    let ctx = ctx.with_reranker(Arc::new(KeywordReranker {
        favourite: "pears".to_string(),
    }));
    ingest(
        &ctx,
        vec![
            page_about("https://fruit.ex/apples", "apples", 4),
            page_about("https://fruit.ex/pears", "apples and pears", 1),
        ],
    )
    .await;

    let q = SearchQuery::parse("apples", None, Some(2)).unwrap();
    let results = search(&ctx, Corpus::Pages, &q).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].url, "https://fruit.ex/pears");
    assert!(results[0].relevance_score > 0.5);
    assert!(results[1].relevance_score < 0.5);
}

#[tokio::test]
async fn test_reranker_failure_keeps_original_order() {
    let (plain, _) = context(test_config());
    let pages = vec![
        page_about("https://fruit.ex/apples", "apples", 4),
        page_about("https://fruit.ex/pears", "apples and pears", 1),
    ];
    ingest(&plain, pages.clone()).await;
    let (broken, _) = context(test_config());
    let broken = broken.with_reranker(Arc::new(BrokenReranker));
    ingest(&broken, pages).await;

    let q = SearchQuery::parse("apples", None, Some(3)).unwrap();
    let expected = search(&plain, Corpus::Pages, &q).await.unwrap();
    let got = search(&broken, Corpus::Pages, &q).await.unwrap();
    let key = |r: &crawl_rag::search::SearchResult| (r.url.clone(), r.relevance_score);
    assert_eq!(
        got.iter().map(key).collect::<Vec<_>>(),
        expected.iter().map(key).collect::<Vec<_>>()
    );
}

// ============ Persistence ============

#[tokio::test]
async fn test_sqlite_file_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.db.path = dir.path().join("data").join("crawl.db");

    {
        let pool = db::connect(&config).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(pool.clone()).await.unwrap());
        let ctx = context_on(config.clone(), store, Arc::new(HashEmbedder::new()), scripted());
        ingest(&ctx, vec![page_about("https://ex.com/keep", "durability", 3)]).await;
        pool.close().await;
    }

    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store = SqliteStore::open(pool).await.unwrap();
    let sources = store.list_sources().await.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].document_count, 3);

    let urls: BTreeSet<String> = store
        .vector_search(Corpus::Pages, &hash_embed("durability"), 10, Some("ex.com"))
        .await
        .unwrap()
        .into_iter()
        .map(|h| h.chunk.url)
        .collect();
    assert_eq!(urls, BTreeSet::from(["https://ex.com/keep".to_string()]));
}
