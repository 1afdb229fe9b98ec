//! # crawl-rag CLI
//!
//! Runs the retrieval service and its maintenance tasks.
//!
//! ## Usage
//!
//! ```bash
//! crawl-rag [--config ./crawl-rag.toml] <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `crawl-rag init` | Create the SQLite database and run schema migrations |
//! | `crawl-rag serve` | Serve `/api` and `/mcp` over HTTP, or MCP over stdio |
//! | `crawl-rag ingest <file>` | Ingest crawled pages from a JSON or JSON-lines file |
//! | `crawl-rag search "<query>"` | Search crawled pages (or code examples with `--code`) |
//! | `crawl-rag sources` | List ingested sources |
//!
//! Configuration comes from built-in defaults, the optional TOML file, and
//! then environment variables (`OPENAI_API_KEY`, `USE_HYBRID_SEARCH`, ...).
//! Logs go to stderr so that the stdio transport owns stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crawl_rag::config::{self, Config};
use crawl_rag::context::AppContext;
use crawl_rag::envelope::Envelope;
use crawl_rag::ingest::{ingest_pages, parse_pages};
use crawl_rag::mcp::{serve_stdio, McpBridge};
use crawl_rag::tools::{self, ToolRegistry};
use crawl_rag::{db, migrate, server};

/// Retrieval-augmented search over crawled web pages.
#[derive(Parser)]
#[command(
    name = "crawl-rag",
    about = "Retrieval-augmented search over crawled web pages, served over HTTP and MCP",
    version
)]
struct Cli {
    /// Path to a TOML configuration file. Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database file and schema. Safe to run repeatedly.
    Init,

    /// Start the service on the configured transport.
    ///
    /// With `transport = "http"` the `/api` routes and the MCP endpoint at
    /// `/mcp` share one listener. With `transport = "stdio"` only the MCP
    /// tools are served, over stdin/stdout.
    Serve,

    /// Ingest crawled pages.
    ///
    /// The file holds either a JSON array or JSON lines of
    /// `{"url": ..., "markdown": ...}` objects. Use `-` for stdin.
    Ingest {
        file: PathBuf,
    },

    /// Search the index and print the response envelope.
    Search {
        query: String,

        /// Only return results from this source (domain).
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of results (1 to 50).
        #[arg(long)]
        match_count: Option<i64>,

        /// Search extracted code examples instead of page chunks.
        #[arg(long)]
        code: bool,
    },

    /// List ingested sources with their summaries and chunk counts.
    Sources,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let ctx = AppContext::from_config(cfg).await?;
            if ctx.config.server.transport == "stdio" {
                let tools = Arc::new(ToolRegistry::with_builtins(&ctx));
                serve_stdio(McpBridge::new(ctx, tools)).await?;
            } else {
                server::run_server(ctx).await?;
            }
        }
        Commands::Ingest { file } => {
            let text = read_input(&file)?;
            let pages = parse_pages(&text)?;
            let ctx = AppContext::from_config(cfg).await?;

            let cancel = ctx.shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted; stopping after the URLs in progress");
                    cancel.cancel();
                }
            });

            let report = ingest_pages(&ctx, pages, &ctx.shutdown).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Search {
            query,
            source,
            match_count,
            code,
        } => {
            let (tool, source_key) = if code {
                (tools::SEARCH_CODE_EXAMPLES, "source_id")
            } else {
                (tools::PERFORM_RAG_QUERY, "source")
            };
            let params = json!({
                "query": query,
                source_key: source,
                "match_count": match_count,
            });
            run_tool(cfg, tool, params).await?;
        }
        Commands::Sources => {
            run_tool(cfg, tools::GET_AVAILABLE_SOURCES, json!({})).await?;
        }
    }

    Ok(())
}

/// Runs one registered tool and prints its envelope, exactly as the HTTP
/// facade would return it.
async fn run_tool(cfg: Config, name: &str, params: serde_json::Value) -> Result<()> {
    let ctx = AppContext::from_config(cfg).await?;
    let tools = ToolRegistry::with_builtins(&ctx);
    match tools.call(name, params, &ctx).await {
        Ok(envelope) => {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            Ok(())
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&Envelope::failure(&err))?);
            Err(err.into())
        }
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read pages from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pages file: {}", path.display()))
}
