use shipflow_config::EngineConfig;
use std::sync::Arc;

pub async fn handle(config: EngineConfig) -> anyhow::Result<()> {
    let engine = Arc::new(super::connect(config).await?);
    tracing::info!("Starting shipflow MCP server");
    // rmcp SDK ベースの MCP サーバーを起動（stdio トランスポート）
    shipflow_mcp::run_server(engine).await
}
