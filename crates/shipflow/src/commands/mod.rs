pub mod analyze;
pub mod call;
pub mod serve;
pub mod tools;

use shipflow_config::EngineConfig;
use shipflow_engine::Engine;

/// ローカルの Docker とクラスタに接続したエンジン
pub async fn connect(config: EngineConfig) -> anyhow::Result<Engine> {
    Engine::connect(config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize engine: {}", e))
}
