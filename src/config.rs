//! Typed configuration.
//!
//! Resolved once at startup from built-in defaults, an optional TOML file,
//! and environment variables (later sources win). Everything downstream
//! reads fields of [`Config`]; nothing else consults the environment.
//!
//! ```toml
//! log_level = "info"
//!
//! [server]
//! transport = "http"
//! host = "0.0.0.0"
//! port = 8051
//!
//! [features]
//! use_hybrid_search = true
//! use_reranking = false
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_EMBEDDING_DIMS: usize = 1536;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub metasearch: MetaSearchConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            api: ApiConfig::default(),
            db: DbConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            rerank: RerankConfig::default(),
            features: FeatureFlags::default(),
            retrieval: RetrievalConfig::default(),
            chunking: ChunkingConfig::default(),
            ingest: IngestConfig::default(),
            metasearch: MetaSearchConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

// ============ [server] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// `http` serves `/api` and `/mcp`; `stdio` serves the tool protocol on stdin/stdout.
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// `development` or `production`. Wildcard CORS is only accepted in development.
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }
}

fn default_transport() -> String {
    "http".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8051
}
fn default_environment() -> String {
    "development".to_string()
}

// ============ [api] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enable_http_api: bool,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_true")]
    pub rate_limit_enabled: bool,
    /// Requests per client per minute.
    #[serde(default = "default_rate_limit")]
    pub api_rate_limit: u32,
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_sources_timeout")]
    pub sources_timeout_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,
    /// Soft capacity of each endpoint's response cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enable_http_api: true,
            cors_origins: default_cors_origins(),
            rate_limit_enabled: true,
            api_rate_limit: default_rate_limit(),
            search_timeout_secs: default_search_timeout(),
            sources_timeout_secs: default_sources_timeout(),
            health_timeout_secs: default_health_timeout(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl ApiConfig {
    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.iter().any(|o| o.trim() == "*")
    }
}

fn default_true() -> bool {
    true
}
fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3741".to_string(),
        "http://localhost:3000".to_string(),
        "http://localhost:8051".to_string(),
    ]
}
fn default_rate_limit() -> u32 {
    60
}
fn default_search_timeout() -> u64 {
    60
}
fn default_sources_timeout() -> u64 {
    30
}
fn default_health_timeout() -> u64 {
    5
}
fn default_cache_capacity() -> usize {
    1024
}

// ============ [db] ============

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/crawl-rag.sqlite")
}

// ============ [embedding] ============

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `openai`, `local`, or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
    /// Read from `OPENAI_API_KEY`, never from the file.
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Texts per provider call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: DEFAULT_EMBEDDING_DIMS,
            api_base: default_openai_base(),
            api_key: None,
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    DEFAULT_EMBEDDING_DIMS
}
fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_batch_size() -> usize {
    20
}
fn default_max_attempts() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

// ============ [llm] ============

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `openai` or `disabled`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_base: default_openai_base(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-4.1-nano".to_string()
}

// ============ [rerank] ============

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RerankConfig {
    /// Base URL of a cross-encoder service exposing `POST /rerank`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

// ============ [features] ============

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FeatureFlags {
    #[serde(default)]
    pub use_contextual_embeddings: bool,
    #[serde(default)]
    pub use_hybrid_search: bool,
    /// Enables code example extraction and search.
    #[serde(default)]
    pub use_agentic_rag: bool,
    #[serde(default)]
    pub use_reranking: bool,
}

// ============ [retrieval] ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Reciprocal-rank fusion constant.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Minimum candidate pool fetched before reranking and truncation.
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            rerank_candidates: default_rerank_candidates(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_rerank_candidates() -> usize {
    20
}

// ============ [chunking] ============

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_chars")]
    pub target_chars: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chars: default_target_chars(),
            min_chars: default_min_chars(),
        }
    }
}

fn default_target_chars() -> usize {
    5000
}
fn default_min_chars() -> usize {
    500
}

// ============ [ingest] ============

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Concurrent per-URL workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pages sampled per source for its summary.
    #[serde(default = "default_summary_sample_pages")]
    pub summary_sample_pages: usize,
    #[serde(default = "default_code_min_chars")]
    pub code_min_chars: usize,
    #[serde(default = "default_code_context_chars")]
    pub code_context_chars: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            summary_sample_pages: default_summary_sample_pages(),
            code_min_chars: default_code_min_chars(),
            code_context_chars: default_code_context_chars(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_summary_sample_pages() -> usize {
    5
}
fn default_code_min_chars() -> usize {
    1000
}
fn default_code_context_chars() -> usize {
    1000
}

// ============ [metasearch] ============

#[derive(Debug, Deserialize, Clone)]
pub struct MetaSearchConfig {
    #[serde(default)]
    pub searxng_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for MetaSearchConfig {
    fn default() -> Self {
        Self {
            searxng_url: None,
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("crawl-rag/{}", env!("CARGO_PKG_VERSION"))
}

// ============ Loading ============

/// Loads the configuration: defaults, then `path` if given, then the
/// process environment. Fails if the result does not validate.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str::<Config>(&content).with_context(|| "Failed to parse config file")?
        }
        None => Config::default(),
    };

    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("{} must be a boolean, got '{}'", key, other),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("{} must be a number, got '{}'", key, value))
}

fn db_path_from_url(url: &str) -> PathBuf {
    let trimmed = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    PathBuf::from(trimmed)
}

impl Config {
    /// Applies environment overrides through `lookup` (injectable for tests).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("TRANSPORT") {
            self.server.transport = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = get("HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("PORT") {
            self.server.port = parse_num("PORT", &v)?;
        }
        if let Some(v) = get("ENVIRONMENT") {
            self.server.environment = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.embedding.api_key = Some(v.clone());
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("MODEL_CHOICE") {
            self.llm.model = v;
        }
        if let Some(v) = get("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = get("DATABASE_URL") {
            self.db.path = db_path_from_url(&v);
        }
        if let Some(v) = get("USE_CONTEXTUAL_EMBEDDINGS") {
            self.features.use_contextual_embeddings = parse_bool("USE_CONTEXTUAL_EMBEDDINGS", &v)?;
        }
        if let Some(v) = get("USE_HYBRID_SEARCH") {
            self.features.use_hybrid_search = parse_bool("USE_HYBRID_SEARCH", &v)?;
        }
        if let Some(v) = get("USE_AGENTIC_RAG") {
            self.features.use_agentic_rag = parse_bool("USE_AGENTIC_RAG", &v)?;
        }
        if let Some(v) = get("USE_RERANKING") {
            self.features.use_reranking = parse_bool("USE_RERANKING", &v)?;
        }
        if let Some(v) = get("ENABLE_HTTP_API") {
            self.api.enable_http_api = parse_bool("ENABLE_HTTP_API", &v)?;
        }
        if let Some(v) = get("CORS_ORIGINS") {
            self.api.cors_origins = v
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        if let Some(v) = get("API_RATE_LIMIT") {
            self.api.api_rate_limit = parse_num("API_RATE_LIMIT", &v)?;
        }
        if let Some(v) = get("RATE_LIMIT_ENABLED") {
            self.api.rate_limit_enabled = parse_bool("RATE_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = get("SEARXNG_URL") {
            self.metasearch.searxng_url = Some(v.trim().trim_end_matches('/').to_string());
        }
        if let Some(v) = get("RERANKER_URL") {
            self.rerank.url = Some(v.trim().trim_end_matches('/').to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match self.server.transport.as_str() {
            "http" | "stdio" => {}
            other => bail!("server.transport must be 'http' or 'stdio', got '{}'", other),
        }
        if self.server.port == 0 {
            bail!("server.port must be between 1 and 65535");
        }
        match self.server.environment.as_str() {
            "development" | "production" => {}
            other => bail!(
                "server.environment must be 'development' or 'production', got '{}'",
                other
            ),
        }
        if self.api.allows_any_origin() && !self.server.is_development() {
            bail!("api.cors_origins may only contain '*' in development");
        }
        if self.api.rate_limit_enabled && self.api.api_rate_limit == 0 {
            bail!("api.api_rate_limit must be >= 1 when rate limiting is enabled");
        }
        if self.api.cache_capacity == 0 {
            bail!("api.cache_capacity must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "openai" | "local" | "disabled" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be openai, local, or disabled.",
                other
            ),
        }
        if self.embedding.dims == 0 {
            bail!("embedding.dims must be > 0");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.max_attempts == 0 {
            bail!("embedding.max_attempts must be >= 1");
        }
        match self.llm.provider.as_str() {
            "openai" | "disabled" => {}
            other => bail!(
                "Unknown llm provider: '{}'. Must be openai or disabled.",
                other
            ),
        }

        if self.retrieval.rrf_k <= 0.0 {
            bail!("retrieval.rrf_k must be > 0");
        }
        if self.retrieval.rerank_candidates < 20 {
            bail!("retrieval.rerank_candidates must be >= 20");
        }
        if self.chunking.target_chars == 0 {
            bail!("chunking.target_chars must be > 0");
        }
        if self.chunking.min_chars >= self.chunking.target_chars {
            bail!("chunking.min_chars must be smaller than chunking.target_chars");
        }
        if self.ingest.workers == 0 {
            bail!("ingest.workers must be >= 1");
        }

        match self.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "warning" | "error" | "critical" => {}
            other => bail!(
                "log_level must be one of trace, debug, info, warning, error, critical; got '{}'",
                other
            ),
        }
        Ok(())
    }

    /// `tracing` filter directive for the configured log level.
    pub fn filter_directive(&self) -> &str {
        match self.log_level.as_str() {
            "warning" => "warn",
            "critical" => "error",
            other => other,
        }
    }
}
