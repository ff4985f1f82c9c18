mod commands;

use clap::{Parser, Subcommand};
use shipflow_config::EngineConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shipflow")]
#[command(about = "git の変更からクラスタへのデプロイまでを自動化する CI/CD エンジン", long_about = None)]
struct Cli {
    /// 設定ファイル（省略時は SHIPFLOW_CONFIG または既定の場所を探す）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// MCP サーバー（stdio）とリポジトリ監視を起動
    Serve,
    /// 利用可能なツールを表示
    Tools {
        /// JSON で出力
        #[arg(long)]
        json: bool,
    },
    /// ツールを呼び出す
    Call {
        /// ツール名（例: pipeline_list）
        tool: String,
        /// key=value 形式のパラメータ
        params: Vec<String>,
    },
    /// プロンプトに合うワークフローを解析（実行はしない）
    Analyze {
        /// 自然言語のプロンプト
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },
    /// バージョン情報を表示
    Version,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => {
            let mut config = EngineConfig::from_file(path)?;
            config.apply_env_overrides()?;
            Ok(config)
        }
        None => Ok(EngineConfig::load()?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout は JSON-RPC 通信に使うので、ログはファイルに出力
    if matches!(cli.command, Commands::Serve) {
        use std::fs::OpenOptions;
        let log_path = std::env::temp_dir().join("shipflow-mcp.log");
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .ok();

        if let Some(file) = log_file {
            tracing_subscriber::fmt()
                .with_writer(file)
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::DEBUG.into()),
                )
                .with_ansi(false)
                .init();
        }

        let config = load_config(cli.config.as_ref())?;
        return commands::serve::handle(config).await;
    }

    // 通常のコマンドは stderr にログ出力
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Version は設定ファイル不要
    if matches!(cli.command, Commands::Version) {
        println!("shipflow {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Tools { json } => commands::tools::handle(config, json).await,
        Commands::Call { tool, params } => commands::call::handle(config, &tool, &params).await,
        Commands::Analyze { prompt } => commands::analyze::handle(config, &prompt.join(" ")).await,
        Commands::Serve | Commands::Version => Ok(()),
    }
}
