use colored::Colorize;
use shipflow_config::EngineConfig;
use shipflow_engine::EngineError;

pub async fn handle(config: EngineConfig, prompt: &str) -> anyhow::Result<()> {
    let engine = super::connect(config).await?;
    let orchestrator = engine.orchestrator();

    let analysis = match orchestrator.analyze(prompt) {
        Ok(analysis) => analysis,
        Err(EngineError::NoMatch { best_score }) => {
            println!("{}", "No workflow matched the prompt.".yellow());
            print_scores(&orchestrator.score_all(prompt));
            anyhow::bail!("no workflow scored at least 50 (best: {})", best_score);
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "{} {} (score {})",
        "Selected workflow:".bold(),
        analysis.workflow.name.green().bold(),
        analysis.score
    );
    println!("  {}", analysis.workflow.description);

    println!();
    println!("{}", "Steps:".bold());
    for (i, step) in analysis.workflow.steps.iter().enumerate() {
        println!("  {}. {}", i + 1, step.tool.cyan());
        for child in &step.on_success {
            println!("     on success: {}", child.tool.cyan());
        }
    }

    println!();
    println!("{}", "Extracted parameters:".bold());
    if analysis.params.as_map().is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for (key, value) in analysis.params.as_map() {
        let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
        println!("  {} = {}", key, value);
    }

    println!();
    print_scores(&analysis.scores);
    Ok(())
}

fn print_scores(scores: &std::collections::BTreeMap<String, i32>) {
    println!("{}", "Scores:".bold());
    for (name, score) in scores {
        println!("  {:<22} {}", name, score);
    }
}
