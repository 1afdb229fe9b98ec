//! MCP JSON-RPC protocol bridge.
//!
//! Exposes the [`ToolRegistry`] as MCP tools, over streamable HTTP at `/mcp`
//! next to the `/api` routes or over stdio. A tool call returns one text
//! content item holding the compact JSON of the same [`Envelope`] the HTTP
//! facade would send; failures are flagged with `is_error`.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt};

use crate::context::AppContext;
use crate::envelope::Envelope;
use crate::error::RagError;
use crate::tools::ToolRegistry;

/// Each MCP session gets a clone; all sessions share the registry.
#[derive(Clone)]
pub struct McpBridge {
    ctx: AppContext,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(ctx: AppContext, tools: Arc<ToolRegistry>) -> Self {
        Self { ctx, tools }
    }

    fn to_mcp_tool(tool: &dyn crate::tools::Tool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> = match tool.parameters_schema() {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };
        let read_only = tool.name() != crate::tools::INGEST_PAGES;

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(read_only)),
            execution: None,
            icons: None,
            meta: None,
        }
    }

    /// Runs a tool and renders the envelope as the tool result.
    pub async fn invoke(&self, name: &str, arguments: Option<serde_json::Map<String, serde_json::Value>>) -> CallToolResult {
        let params = arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        match self.tools.call(name, params, &self.ctx).await {
            Ok(envelope) => {
                let text = envelope.to_json_string();
                if envelope.success {
                    CallToolResult::success(vec![Content::text(text)])
                } else {
                    CallToolResult::error(vec![Content::text(text)])
                }
            }
            Err(err) => {
                tracing::warn!(tool = name, code = err.kind().code(), "{}", err.message());
                CallToolResult::error(vec![Content::text(Envelope::failure(&err).to_json_string())])
            }
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "crawl-rag".to_string(),
                title: Some("Crawl RAG".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Retrieval over crawled web content. Call get_available_sources to see which \
                 domains are indexed, then perform_rag_query (optionally filtered by source) \
                 or search_code_examples to find relevant chunks."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if self.tools.find(&request.name).is_none() {
            return Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                RagError::NotFound(format!("no tool registered with name: {}", request.name)).to_string(),
                None,
            ));
        }
        Ok(self.invoke(&request.name, request.arguments).await)
    }
}

/// Serves the bridge over stdin/stdout until the client disconnects.
pub async fn serve_stdio(bridge: McpBridge) -> anyhow::Result<()> {
    tracing::info!("MCP server running on stdio");
    let service = bridge.serve(rmcp::transport::io::stdio()).await?;
    service.waiting().await?;
    Ok(())
}
