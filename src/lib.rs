//! # crawl-rag
//!
//! Retrieval-augmented search over crawled web pages.
//!
//! An external crawler hands over `{url, markdown}` pages; the ingestion
//! pipeline chunks them, optionally prefixes each chunk with LLM-written
//! context, embeds them, and stores them in SQLite together with the code
//! examples it finds in fenced blocks. Queries run vector or hybrid
//! (vector + FTS5, fused with reciprocal rank fusion) retrieval, optionally
//! reranked, and are served over an HTTP API and as MCP tools.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────┐   ┌───────────────┐
//! │ crawled  │──▶│ ingest: chunk → augment  │──▶│    SQLite     │
//! │  pages   │   │   → embed → store        │   │ pages / code  │
//! └──────────┘   └──────────────────────────┘   │ sources / FTS │
//!                                               └───────┬───────┘
//!                                                       ▼
//!                          ┌──────────────┐    ┌────────────────┐
//!                          │ ToolRegistry │◀───│ hybrid search  │
//!                          └──────┬───────┘    └────────────────┘
//!                        ┌────────┴────────┐
//!                        ▼                 ▼
//!                  ┌───────────┐     ┌───────────┐
//!                  │ /api HTTP │     │    MCP    │
//!                  │  (axum)   │     │ http/stdio│
//!                  └───────────┘     └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Typed configuration from defaults, TOML, and environment |
//! | [`error`] | Error kinds with their HTTP status and log prefix |
//! | [`models`] | Shared row and request types |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`store`] | Storage trait with SQLite and in-memory backends |
//! | [`embedding`] | Embedding providers and the retrying client |
//! | [`llm`] | Completion client for augmentation and summaries |
//! | [`rerank`] | Cross-encoder reranking client |
//! | [`chunk`] | Markdown chunking |
//! | [`augment`] | Contextual chunk augmentation |
//! | [`code_extract`] | Fenced code block extraction and summaries |
//! | [`ingest`] | Ingestion pipeline |
//! | [`search`] | Vector, hybrid, and reranked retrieval |
//! | [`cache`] | Per-endpoint response cache |
//! | [`rate_limit`] | Fixed-window rate limiter |
//! | [`envelope`] | Response envelope and output normalization |
//! | [`tools`] | Tool registry shared by HTTP and MCP |
//! | [`mcp`] | MCP protocol bridge |
//! | [`server`] | HTTP facade |
//! | [`metasearch`] | SearXNG client for URL discovery |
//! | [`context`] | Application context |
//! | [`stats`] | Process statistics for the health check |

pub mod augment;
pub mod cache;
pub mod chunk;
pub mod code_extract;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod envelope;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod mcp;
pub mod metasearch;
pub mod migrate;
pub mod models;
pub mod rate_limit;
pub mod rerank;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod tools;
