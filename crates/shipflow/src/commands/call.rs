use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use shipflow_config::EngineConfig;
use shipflow_engine::Params;
use std::time::Duration;

pub async fn handle(config: EngineConfig, tool: &str, pairs: &[String]) -> anyhow::Result<()> {
    let params = Params::from_pairs(pairs).map_err(|e| anyhow::anyhow!("{}", e))?;
    let engine = super::connect(config).await?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("Running {}...", tool));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let output = engine.tools().call(tool, &params).await;
    spinner.finish_and_clear();
    engine.shutdown();

    println!("{}", serde_json::to_string_pretty(&output)?);
    match output.error {
        Some(error) if !output.success => {
            eprintln!("{} {} ({})", "✗".red(), error.message, error.kind);
            anyhow::bail!("{} failed", tool)
        }
        Some(warning) => {
            eprintln!("{} {}", "!".yellow(), warning.message);
            Ok(())
        }
        None => {
            eprintln!("{} {}", "✓".green(), tool);
            Ok(())
        }
    }
}
