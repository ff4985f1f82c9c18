use colored::Colorize;
use shipflow_config::EngineConfig;

pub async fn handle(config: EngineConfig, json: bool) -> anyhow::Result<()> {
    let engine = super::connect(config).await?;
    let specs = engine.specs();

    if json {
        let tools: Vec<serde_json::Value> = specs
            .iter()
            .map(|spec| {
                serde_json::json!({
                    "name": spec.name,
                    "description": spec.description,
                    "input_schema": spec.input_schema(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    println!("{} ({})", "Available tools".bold(), specs.len());
    for spec in &specs {
        println!();
        println!("  {}  {}", spec.name.cyan().bold(), spec.description);
        for param in &spec.params {
            let required = if param.required {
                "required".yellow().to_string()
            } else {
                "optional".dimmed().to_string()
            };
            println!(
                "      {:<18} {:<8} {:<9} {}",
                param.name,
                format!("{:?}", param.kind).to_lowercase(),
                required,
                param.description.dimmed()
            );
        }
    }
    Ok(())
}
