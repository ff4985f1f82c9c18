//! Shipflow MCP Server
//!
//! 公式 rmcp SDK を使用した MCP サーバー実装。
//! stdio トランスポートで動作し、エンジンのツールレジストリをそのまま MCP ツールとして公開する。

use anyhow::Result;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt, model::*,
    service::RequestContext,
};
use shipflow_engine::{Engine, ToolOutput, ToolSpec};
use std::sync::Arc;
use tracing::error;

// ============================================================================
// 変換
// ============================================================================

/// ツール定義を MCP のツールに変換
pub fn to_mcp_tool(spec: &ToolSpec) -> Tool {
    Tool::new(spec.name, spec.description, Arc::new(spec.input_schema()))
}

/// ツール結果を MCP の結果に変換（本文は JSON）
pub fn to_call_result(output: &ToolOutput) -> CallToolResult {
    let text = serde_json::to_string_pretty(output)
        .unwrap_or_else(|e| format!("{{\"success\":false,\"error\":\"{}\"}}", e));
    if output.success {
        CallToolResult::success(vec![Content::text(text)])
    } else {
        CallToolResult::error(vec![Content::text(text)])
    }
}

// ============================================================================
// MCP サーバー
// ============================================================================

/// Shipflow MCP サーバー
#[derive(Clone)]
pub struct ShipflowServer {
    engine: Arc<Engine>,
}

impl ShipflowServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.engine.specs().iter().map(to_mcp_tool).collect()
    }

    pub async fn call(&self, name: &str, arguments: Option<JsonObject>) -> CallToolResult {
        let output = self
            .engine
            .call(name, arguments.unwrap_or_default())
            .await;
        if let Some(err) = &output.error {
            tracing::info!("Tool {} returned {}: {}", name, err.kind, err.message);
        }
        to_call_result(&output)
    }
}

impl ServerHandler for ShipflowServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build()).with_instructions(
            "Shipflow MCP server. Watch git repositories, build and push container images, \
             deploy to Kubernetes/OpenShift and run pipelines or prompt-driven workflows.",
        )
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.tools(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self.call(&request.name, request.arguments).await)
    }
}

/// MCP サーバーを起動（stdio トランスポート）
///
/// サーバーが動いている間はリポジトリのポーリングも行う。
pub async fn run_server(engine: Arc<Engine>) -> Result<()> {
    let watcher = engine.start_watcher();
    let server = ShipflowServer::new(engine.clone());
    let transport = (tokio::io::stdin(), tokio::io::stdout());

    let service = server.serve(transport).await.map_err(|e| {
        error!("MCP server initialization failed: {}", e);
        anyhow::anyhow!("MCP server initialization failed: {}", e)
    })?;

    // サーバーが終了するまで待機
    let waited = service.waiting().await;
    engine.shutdown();
    let _ = watcher.await;
    waited.map_err(|e| {
        error!("MCP server error: {}", e);
        anyhow::anyhow!("MCP server error: {}", e)
    })?;

    Ok(())
}
