//! Tool registry shared by the HTTP facade and the MCP bridge.
//!
//! Every operation a caller can reach is a [`Tool`] registered once at
//! startup. The `/api` routes and MCP `call_tool` both dispatch through
//! [`ToolRegistry::call`], which runs the tool and passes its output through
//! [`Envelope::from_tool_output`], so the two surfaces cannot drift apart.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │  /api routes │   │  MCP bridge  │
//! └──────┬───────┘   └──────┬───────┘
//!        └────────┬─────────┘
//!                 ▼
//!        ToolRegistry::call()
//!                 ▼
//!   Tool::execute() → Envelope adapter
//! ```
//!
//! # Built-in tools
//!
//! | Name | Parameters |
//! |------|------------|
//! | `health_check` | - |
//! | `get_available_sources` | - |
//! | `perform_rag_query` | `query`, `source`, `match_count` |
//! | `search_code_examples` | `query`, `source_id`, `match_count` |
//! | `ingest_pages` | `pages: [{url, markdown}]` |
//! | `discover_urls` | `query`, `num_results` (only with a meta-search URL) |

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::context::AppContext;
use crate::envelope::Envelope;
use crate::error::RagError;
use crate::ingest::ingest_pages;
use crate::models::{Corpus, CrawledPage};
use crate::search::{search, SearchQuery};
use crate::stats;

pub const HEALTH_CHECK: &str = "health_check";
pub const GET_AVAILABLE_SOURCES: &str = "get_available_sources";
pub const PERFORM_RAG_QUERY: &str = "perform_rag_query";
pub const SEARCH_CODE_EXAMPLES: &str = "search_code_examples";
pub const INGEST_PAGES: &str = "ingest_pages";
pub const DISCOVER_URLS: &str = "discover_urls";

const DEFAULT_DISCOVER_RESULTS: i64 = 6;
const MAX_DISCOVER_RESULTS: i64 = 20;

/// A named operation that agents and HTTP routes can call.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use serde_json::{json, Value};
/// use crawl_rag::context::AppContext;
/// use crawl_rag::tools::Tool;
///
/// pub struct PingTool;
///
/// #[async_trait]
/// impl Tool for PingTool {
///     fn name(&self) -> &str { "ping" }
///     fn description(&self) -> &str { "Answer pong" }
///
///     fn parameters_schema(&self) -> Value {
///         json!({ "type": "object", "properties": {}, "required": [] })
///     }
///
///     async fn execute(&self, _params: Value, _ctx: &AppContext) -> Result<Value> {
///         Ok(json!({ "success": true, "data": "pong", "message": null }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores, e.g. `"perform_rag_query"`.
    fn name(&self) -> &str;

    /// One-line description for agent discovery.
    fn description(&self) -> &str;

    /// JSON Schema of the argument object (`type: "object"`).
    fn parameters_schema(&self) -> Value;

    /// Runs the tool.
    ///
    /// The output may be any JSON value; it is normalized into an
    /// [`Envelope`] by the registry. Errors carrying a [`RagError`] keep
    /// their kind; anything else surfaces as `internal`.
    async fn execute(&self, params: Value, ctx: &AppContext) -> Result<Value>;
}

/// The tools available to both surfaces.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with every built-in tool that `ctx` can serve.
    /// `discover_urls` is only present when a meta-search URL is configured.
    pub fn with_builtins(ctx: &AppContext) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(HealthCheckTool));
        registry.register(Box::new(SourcesTool));
        registry.register(Box::new(RagQueryTool));
        registry.register(Box::new(CodeExamplesTool));
        registry.register(Box::new(IngestPagesTool));
        if ctx.metasearch.is_some() {
            registry.register(Box::new(DiscoverUrlsTool));
        }
        registry
    }

    /// A tool registered later under an existing name replaces the earlier one.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Runs tool `name` and normalizes its output.
    pub async fn call(&self, name: &str, params: Value, ctx: &AppContext) -> Result<Envelope, RagError> {
        let tool = self
            .find(name)
            .ok_or_else(|| RagError::NotFound(format!("no tool registered with name: {}", name)))?;

        let params = match params {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            _ => return Err(RagError::validation("tool arguments must be a JSON object")),
        };

        match tool.execute(params, ctx).await {
            Ok(output) => Ok(Envelope::from_tool_output(output)),
            Err(e) => {
                let err = RagError::classify(e);
                tracing::debug!(tool = name, code = err.kind().code(), error = %err.message(), "tool call failed");
                Err(err)
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Parameter helpers ============

/// Reads an optional string argument. Numbers are accepted and stringified
/// so that query-string values and JSON bodies read the same way.
pub fn string_param(params: &Value, key: &str) -> Result<Option<String>, RagError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(RagError::validation(format!("{} must be a string", key))),
    }
}

/// Reads an optional integer argument, accepting numeric strings.
pub fn int_param(params: &Value, key: &str) -> Result<Option<i64>, RagError> {
    let invalid = || RagError::validation(format!("{} must be an integer", key));
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(invalid),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse::<i64>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

fn search_schema(source_key: &str, source_description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "Search query (1 to 1000 characters)"
            },
            source_key: {
                "type": "string",
                "description": source_description
            },
            "match_count": {
                "type": "integer",
                "description": "Maximum number of results (1 to 50, default 5)",
                "minimum": 1,
                "maximum": 50
            }
        },
        "required": ["query"]
    })
}

async fn run_search(params: &Value, ctx: &AppContext, corpus: Corpus, source_key: &str) -> Result<Value> {
    let query = string_param(params, "query")?.unwrap_or_default();
    let source = string_param(params, source_key)?;
    let match_count = int_param(params, "match_count")?;
    let q = SearchQuery::parse(&query, source.as_deref(), match_count)?;

    let results = search(ctx, corpus, &q).await?;
    let total = results.len();
    tracing::info!(corpus = corpus.as_str(), query = %q.query, results = total, "search completed");
    Ok(serde_json::to_value(Envelope::search(
        &q.query,
        serde_json::to_value(results)?,
        total,
        format!("Search completed successfully. Found {} results.", total),
    ))?)
}

// ============ Built-in tools ============

/// Reports store connectivity, uptime, and memory use.
pub struct HealthCheckTool;

#[async_trait]
impl Tool for HealthCheckTool {
    fn name(&self) -> &str {
        HEALTH_CHECK
    }

    fn description(&self) -> &str {
        "Report service health, store connectivity, uptime, and memory use"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn execute(&self, _params: Value, ctx: &AppContext) -> Result<Value> {
        let connected = match ctx.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "store ping failed");
                false
            }
        };
        let (status, message) = if connected {
            ("healthy", "Service is healthy")
        } else {
            ("unhealthy", "Service is unhealthy")
        };

        Ok(json!({
            "success": connected,
            "data": {
                "status": status,
                "version": env!("CARGO_PKG_VERSION"),
                "mcp_connected": connected,
                "uptime_seconds": stats::round2(stats::uptime_seconds(ctx.started_at)),
                "memory_usage_mb": stats::memory_usage_mb(),
            },
            "message": message,
        }))
    }
}

/// Lists every source with its summary and chunk count.
pub struct SourcesTool;

#[async_trait]
impl Tool for SourcesTool {
    fn name(&self) -> &str {
        GET_AVAILABLE_SOURCES
    }

    fn description(&self) -> &str {
        "List the crawled sources (domains) available for filtering searches"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn execute(&self, _params: Value, ctx: &AppContext) -> Result<Value> {
        let sources = ctx.store.list_sources().await?;
        let data: Vec<Value> = sources
            .iter()
            .map(|s| {
                json!({
                    "source_id": s.source_id,
                    "name": s.source_id,
                    "url": format!("https://{}", s.source_id),
                    "document_count": s.document_count,
                    "last_updated": s.updated_at.to_rfc3339(),
                    "metadata": {
                        "summary": s.summary,
                        "total_words": s.total_words,
                        "created_at": s.created_at.to_rfc3339(),
                    },
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "data": data,
            "message": format!("Retrieved {} sources", data.len()),
        }))
    }
}

/// Retrieval over crawled page chunks.
pub struct RagQueryTool;

#[async_trait]
impl Tool for RagQueryTool {
    fn name(&self) -> &str {
        PERFORM_RAG_QUERY
    }

    fn description(&self) -> &str {
        "Search crawled pages for chunks relevant to a query, optionally within one source"
    }

    fn parameters_schema(&self) -> Value {
        search_schema("source", "Only return chunks from this source_id (domain)")
    }

    async fn execute(&self, params: Value, ctx: &AppContext) -> Result<Value> {
        run_search(&params, ctx, Corpus::Pages, "source").await
    }
}

/// Retrieval over extracted code examples.
pub struct CodeExamplesTool;

#[async_trait]
impl Tool for CodeExamplesTool {
    fn name(&self) -> &str {
        SEARCH_CODE_EXAMPLES
    }

    fn description(&self) -> &str {
        "Search code examples extracted from crawled pages (requires USE_AGENTIC_RAG)"
    }

    fn parameters_schema(&self) -> Value {
        search_schema("source_id", "Only return examples from this source_id (domain)")
    }

    async fn execute(&self, params: Value, ctx: &AppContext) -> Result<Value> {
        run_search(&params, ctx, Corpus::CodeExamples, "source_id").await
    }
}

/// Feeds crawled markdown through the ingestion pipeline.
pub struct IngestPagesTool;

#[async_trait]
impl Tool for IngestPagesTool {
    fn name(&self) -> &str {
        INGEST_PAGES
    }

    fn description(&self) -> &str {
        "Chunk, embed, and store crawled pages given as {url, markdown} objects"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pages": {
                    "type": "array",
                    "description": "Crawled pages to ingest",
                    "items": {
                        "type": "object",
                        "properties": {
                            "url": { "type": "string" },
                            "markdown": { "type": "string" }
                        },
                        "required": ["url", "markdown"]
                    }
                }
            },
            "required": ["pages"]
        })
    }

    async fn execute(&self, params: Value, ctx: &AppContext) -> Result<Value> {
        let pages = params
            .get("pages")
            .cloned()
            .ok_or_else(|| RagError::validation("pages is required"))?;
        let pages: Vec<CrawledPage> = serde_json::from_value(pages)
            .map_err(|e| RagError::validation(format!("pages must be a list of {{url, markdown}} objects: {}", e)))?;
        if pages.is_empty() {
            return Err(RagError::validation("pages cannot be empty").into());
        }

        let report = ingest_pages(ctx, pages, &ctx.shutdown).await?;
        let message = format!(
            "Ingested {} pages ({} chunks, {} code examples, {} failures)",
            report.pages_ingested,
            report.chunks_stored,
            report.code_examples_stored,
            report.failures.len()
        );
        Ok(json!({
            "success": true,
            "data": report,
            "message": message,
        }))
    }
}

/// Finds candidate URLs through the meta-search engine.
pub struct DiscoverUrlsTool;

#[async_trait]
impl Tool for DiscoverUrlsTool {
    fn name(&self) -> &str {
        DISCOVER_URLS
    }

    fn description(&self) -> &str {
        "Find URLs worth crawling for a topic using the configured SearXNG instance"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Topic to search the web for" },
                "num_results": {
                    "type": "integer",
                    "description": "Number of URLs to return (1 to 20, default 6)",
                    "minimum": 1,
                    "maximum": 20
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &AppContext) -> Result<Value> {
        let client = ctx
            .metasearch
            .as_ref()
            .ok_or_else(|| RagError::validation("URL discovery needs SEARXNG_URL to be set"))?;

        let query = string_param(&params, "query")?.unwrap_or_default();
        let query = query.trim();
        if query.is_empty() {
            return Err(RagError::validation("Query cannot be empty").into());
        }
        let limit = int_param(&params, "num_results")?.unwrap_or(DEFAULT_DISCOVER_RESULTS);
        if !(1..=MAX_DISCOVER_RESULTS).contains(&limit) {
            return Err(RagError::validation(format!(
                "num_results must be between 1 and {}",
                MAX_DISCOVER_RESULTS
            ))
            .into());
        }

        let found = client.discover(query, limit as usize).await?;
        Ok(json!({
            "success": true,
            "data": found,
            "message": format!("Found {} URLs", found.len()),
        }))
    }
}
