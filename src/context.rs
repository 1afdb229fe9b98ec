//! Application context shared by the HTTP facade, the MCP bridge, and the CLI.
//!
//! Holds the long-lived clients created once at startup. Handlers receive it
//! explicitly; nothing reads process-wide state.

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::embedding::{create_provider, DisabledProvider, EmbeddingClient, EmbeddingProvider};
use crate::llm::{create_llm, DisabledLlm, LlmProvider};
use crate::metasearch::MetaSearchClient;
use crate::rerank::{create_reranker, Reranker};
use crate::store::sqlite::SqliteStore;
use crate::store::Store;
use crate::{db, migrate};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub embedder: EmbeddingClient,
    pub llm: Arc<dyn LlmProvider>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub metasearch: Option<MetaSearchClient>,
    pub started_at: Instant,
    /// Cancelled on shutdown; running ingestions stop between URLs.
    pub shutdown: CancellationToken,
}

impl AppContext {
    /// Context over explicit collaborators, without reranker or meta-search.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        embedding: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        let embedder = EmbeddingClient::new(embedding, &config.embedding);
        Self {
            config: Arc::new(config),
            store,
            embedder,
            llm,
            reranker: None,
            metasearch: None,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_metasearch(mut self, client: MetaSearchClient) -> Self {
        self.metasearch = Some(client);
        self
    }

    pub fn with_embedder(mut self, embedder: EmbeddingClient) -> Self {
        self.embedder = embedder;
        self
    }

    /// Opens and migrates the SQLite store and builds every client named by
    /// `config`. Missing credentials degrade the affected client instead of
    /// failing startup.
    pub async fn from_config(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(pool).await?);

        let embedding: Arc<dyn EmbeddingProvider> = match create_provider(&config.embedding) {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(error = %e, "embedding provider unavailable; queries will fail and ingested chunks get zero vectors");
                Arc::new(DisabledProvider::new(config.embedding.dims))
            }
        };
        let llm: Arc<dyn LlmProvider> = match create_llm(&config.llm) {
            Ok(llm) => llm,
            Err(e) => {
                tracing::warn!(error = %e, "language model unavailable; summaries use fallbacks");
                Arc::new(DisabledLlm)
            }
        };
        let reranker = create_reranker(config.features.use_reranking, &config.rerank)?;
        let metasearch = MetaSearchClient::from_config(&config.metasearch)?;

        tracing::info!(
            db = %config.db.path.display(),
            embedding_model = embedding.model_name(),
            llm_model = llm.model_name(),
            hybrid = config.features.use_hybrid_search,
            rerank = reranker.is_some(),
            "application context ready"
        );

        let mut ctx = Self::new(config, store, embedding, llm);
        ctx.reranker = reranker;
        ctx.metasearch = metasearch;
        Ok(ctx)
    }
}
