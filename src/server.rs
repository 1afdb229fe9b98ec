//! HTTP facade over the tool registry.
//!
//! Every `/api` route that touches the core dispatches a registered tool
//! through [`ToolRegistry::call`], the same path the MCP bridge takes, and
//! answers with the [`Envelope`] it produced. The MCP streamable HTTP
//! endpoint is mounted at `/mcp` on the same listener.
//!
//! # Endpoints
//!
//! | Method | Path | Tool | Cache TTL | Deadline |
//! |--------|------|------|-----------|----------|
//! | `GET` | `/api/health` | `health_check` | 60 s | 5 s |
//! | `GET` | `/api/sources` | `get_available_sources` | 300 s | 30 s |
//! | `GET`/`POST` | `/api/search` | `perform_rag_query` | 180 s | 60 s |
//! | `GET` | `/api/code-examples` | `search_code_examples` | 180 s | 60 s |
//! | `GET` | `/api/status` | - | - | - |
//! | `GET` | `/api/cache-stats` | - | - | - |
//! | `POST` | `/api/cache-clear` | - | - | - |
//!
//! # Error contract
//!
//! Failures use the envelope with `success: false`, `data: null`, and an
//! `error` string carrying the canonical prefix:
//!
//! ```json
//! { "success": false, "data": null, "message": null, "error": "VALIDATION_ERROR: Query cannot be empty" }
//! ```
//!
//! Status codes: 400 validation, 404 not found, 429 rate limited, 500
//! backend failure or internal, 503 backend unreachable, 504 timeout.
//!
//! # Middleware
//!
//! Every `/api` route is rate limited per client and answers with
//! `X-RateLimit-*` headers. All responses carry `X-Process-Time` and the
//! security headers, and pass through the configured CORS policy.

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, ConnectInfo, OriginalUri, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::cache::{cache_key, CachedEndpoint, ResponseCache};
use crate::config::ApiConfig;
use crate::context::AppContext;
use crate::envelope::Envelope;
use crate::error::RagError;
use crate::mcp::McpBridge;
use crate::rate_limit::RateLimiter;
use crate::tools::{self, ToolRegistry};

const API_VERSION: &str = "1.0.0";

const ENDPOINTS: [&str; 7] = [
    "/api/health",
    "/api/sources",
    "/api/search",
    "/api/code-examples",
    "/api/status",
    "/api/cache-stats",
    "/api/cache-clear",
];

const X_PROCESS_TIME: HeaderName = HeaderName::from_static("x-process-time");
const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_REQUESTED_WITH: HeaderName = HeaderName::from_static("x-requested-with");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Shared state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    ctx: AppContext,
    tools: Arc<ToolRegistry>,
    cache: Arc<ResponseCache>,
    limiter: Arc<RateLimiter>,
}

/// Builds the full router: `/api` (when enabled), `/mcp`, and the 404
/// fallback, with all middleware applied.
pub fn build_router(ctx: AppContext, tools: Arc<ToolRegistry>) -> Router {
    let api_config = ctx.config.api.clone();
    let state = AppState {
        cache: Arc::new(ResponseCache::new(api_config.cache_capacity)),
        limiter: Arc::new(RateLimiter::new(
            api_config.api_rate_limit,
            api_config.rate_limit_enabled,
        )),
        ctx: ctx.clone(),
        tools: tools.clone(),
    };

    let bridge = McpBridge::new(ctx, tools);
    let mcp_service = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let mut app = Router::new();
    if api_config.enable_http_api {
        let api = Router::new()
            .route("/health", get(handle_health))
            .route("/sources", get(handle_sources))
            .route("/search", get(handle_search_get).post(handle_search_post))
            .route("/code-examples", get(handle_code_examples))
            .route("/status", get(handle_status))
            .route("/cache-stats", get(handle_cache_stats))
            .route("/cache-clear", post(handle_cache_clear))
            .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));
        app = app.nest("/api", api);
    }

    app.nest_service("/mcp", mcp_service)
        .fallback(handle_not_found)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(cors_layer(&api_config))
        .layer(middleware::from_fn(track_requests))
        .with_state(state)
}

/// Serves the router on `[server].host:port` until Ctrl-C or SIGTERM, then
/// drains in-flight requests and cancels running ingestions.
pub async fn run_server(ctx: AppContext) -> anyhow::Result<()> {
    let tools = Arc::new(ToolRegistry::with_builtins(&ctx));
    let bind_addr = ctx.config.server.bind_addr();
    let shutdown = ctx.shutdown.clone();

    let names: Vec<&str> = tools.tools().iter().map(|t| t.name()).collect();
    tracing::info!(tools = ?names, "registered tools");

    let app = build_router(ctx, tools);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    tracing::info!("listening on http://{} (API at /api, MCP at /mcp)", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown.cancel();
    })
    .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

fn cors_layer(api: &ApiConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            X_REQUESTED_WITH.clone(),
        ])
        .expose_headers([
            X_PROCESS_TIME.clone(),
            X_RATELIMIT_LIMIT.clone(),
            X_RATELIMIT_REMAINING.clone(),
            X_RATELIMIT_RESET.clone(),
        ]);

    // wildcard only passes config validation in development
    if api.allows_any_origin() {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = api
            .cors_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o.trim()).ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

// ============ Error response ============

/// A [`RagError`] rendered as an envelope with the matching status.
struct AppError(RagError);

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        tracing::warn!(code = err.kind().code(), "{}", err.message());
        let mut response = json_response(err.status(), Envelope::failure(&err).to_json_string());
        if let RagError::RateLimited { retry_after_secs } = err {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response()
}

// ============ Middleware ============

/// Client identity for rate limiting: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the peer address, then `"unknown"`.
fn client_id(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let header_value = |name: &HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header_value(&X_FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    if let Some(real_ip) = header_value(&X_REAL_IP) {
        return real_ip.to_string();
    }
    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn set_rate_headers(headers: &mut HeaderMap, limit: u32, remaining: u32, reset_at: u64) {
    headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(limit));
    headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(remaining));
    headers.insert(X_RATELIMIT_RESET.clone(), HeaderValue::from(reset_at));
}

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.limiter.is_enabled() {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let client = client_id(request.headers(), peer);

    match state.limiter.check(&client) {
        Ok(admission) => {
            let mut response = next.run(request).await;
            set_rate_headers(
                response.headers_mut(),
                admission.limit,
                admission.remaining,
                admission.reset_at,
            );
            response
        }
        Err(err) => {
            let reset_at = match &err {
                RagError::RateLimited { retry_after_secs } => {
                    chrono::Utc::now().timestamp().max(0) as u64 + retry_after_secs
                }
                _ => 0,
            };
            let limit = state.limiter.limit();
            let mut response = AppError(err).into_response();
            set_rate_headers(response.headers_mut(), limit, 0, reset_at);
            response
        }
    }
}

async fn track_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(request).await;

    let elapsed = started.elapsed();
    if let Ok(value) = HeaderValue::from_str(&format!("{:.6}", elapsed.as_secs_f64())) {
        response.headers_mut().insert(X_PROCESS_TIME.clone(), value);
    }
    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "request"
    );
    response
}

// ============ Tool dispatch ============

/// Cache key value of a parameter; strings are used as-is so that query
/// strings and JSON bodies with the same values share entries.
fn key_value(params: &Value, key: &str) -> Option<String> {
    match params.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

/// Serves a cached endpoint: answer from the cache, or run `tool` under
/// the deadline and cache a successful envelope.
async fn cached_call(
    state: &AppState,
    endpoint: CachedEndpoint,
    key_params: &[&str],
    tool: &str,
    params: Value,
    deadline_secs: u64,
) -> Response {
    let key = cache_key(
        endpoint,
        &key_params
            .iter()
            .map(|k| (*k, key_value(&params, k)))
            .collect::<Vec<_>>(),
    );
    if let Some(body) = state.cache.get(endpoint, &key) {
        tracing::debug!(key = %key, "cache hit");
        return json_response(StatusCode::OK, body);
    }

    match call_with_deadline(state, tool, params, deadline_secs).await {
        Ok(envelope) => {
            let body = envelope.to_json_string();
            if envelope.success {
                state.cache.put(endpoint, key, body.clone());
            }
            json_response(StatusCode::OK, body)
        }
        Err(err) => AppError(err).into_response(),
    }
}

async fn call_with_deadline(
    state: &AppState,
    tool: &str,
    params: Value,
    deadline_secs: u64,
) -> Result<Envelope, RagError> {
    let deadline = Duration::from_secs(deadline_secs);
    match tokio::time::timeout(deadline, state.tools.call(tool, params, &state.ctx)).await {
        Ok(result) => result,
        Err(_) => Err(RagError::Timeout(format!(
            "{} did not finish within {} seconds",
            tool, deadline_secs
        ))),
    }
}

fn query_params(query: Result<Query<HashMap<String, String>>, QueryRejection>) -> Result<Value, AppError> {
    let Query(params) = query.map_err(|e| RagError::validation(format!("Invalid query string: {}", e)))?;
    Ok(Value::Object(
        params
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect::<Map<String, Value>>(),
    ))
}

// ============ GET /api/health ============

async fn handle_health(State(state): State<AppState>) -> Response {
    let deadline = state.ctx.config.api.health_timeout_secs;
    cached_call(
        &state,
        CachedEndpoint::Health,
        &[],
        tools::HEALTH_CHECK,
        Value::Null,
        deadline,
    )
    .await
}

// ============ GET /api/sources ============

async fn handle_sources(State(state): State<AppState>) -> Response {
    let deadline = state.ctx.config.api.sources_timeout_secs;
    cached_call(
        &state,
        CachedEndpoint::Sources,
        &[],
        tools::GET_AVAILABLE_SOURCES,
        Value::Null,
        deadline,
    )
    .await
}

// ============ GET|POST /api/search ============

async fn search_pages(state: &AppState, params: Value) -> Response {
    let deadline = state.ctx.config.api.search_timeout_secs;
    cached_call(
        state,
        CachedEndpoint::Search,
        &["query", "source", "match_count"],
        tools::PERFORM_RAG_QUERY,
        params,
        deadline,
    )
    .await
}

async fn handle_search_get(
    State(state): State<AppState>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Result<Response, AppError> {
    let params = query_params(query)?;
    Ok(search_pages(&state, params).await)
}

/// Accepts the same parameters as the GET form in a JSON object body.
async fn handle_search_post(State(state): State<AppState>, body: Bytes) -> Result<Response, AppError> {
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Map::new())
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => return Err(RagError::validation("Request body must be a JSON object").into()),
            Err(e) => return Err(RagError::validation(format!("Invalid JSON body: {}", e)).into()),
        }
    };
    Ok(search_pages(&state, params).await)
}

// ============ GET /api/code-examples ============

async fn handle_code_examples(
    State(state): State<AppState>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> Result<Response, AppError> {
    let params = query_params(query)?;
    let deadline = state.ctx.config.api.search_timeout_secs;
    Ok(cached_call(
        &state,
        CachedEndpoint::CodeExamples,
        &["query", "source_id", "match_count"],
        tools::SEARCH_CODE_EXAMPLES,
        params,
        deadline,
    )
    .await)
}

// ============ GET /api/status ============

async fn handle_status(State(state): State<AppState>) -> Response {
    let body = json!({
        "api_version": API_VERSION,
        "status": "operational",
        "endpoints": ENDPOINTS,
        "transport": "http",
        "cors_enabled": !state.ctx.config.api.cors_origins.is_empty(),
    });
    json_response(StatusCode::OK, body.to_string())
}

// ============ GET /api/cache-stats ============

async fn handle_cache_stats(State(state): State<AppState>) -> Response {
    let data: Map<String, Value> = state
        .cache
        .stats()
        .into_iter()
        .map(|(endpoint, stats)| {
            (
                endpoint.stats_name().to_string(),
                json!({
                    "hits": stats.hits,
                    "misses": stats.misses,
                    "size": stats.size,
                    "ttl_seconds": stats.ttl_seconds,
                }),
            )
        })
        .collect();
    let envelope = Envelope::ok(Value::Object(data), "Cache statistics");
    json_response(StatusCode::OK, envelope.to_json_string())
}

// ============ POST /api/cache-clear ============

async fn handle_cache_clear(State(state): State<AppState>) -> Response {
    state.cache.clear();
    tracing::info!("response caches cleared");
    let body = json!({
        "success": true,
        "message": "All caches cleared successfully",
    });
    json_response(StatusCode::OK, body.to_string())
}

// ============ Fallback ============

async fn handle_not_found(method: Method, OriginalUri(uri): OriginalUri) -> AppError {
    AppError(RagError::NotFound(format!("No route for {} {}", method, uri.path())))
}
