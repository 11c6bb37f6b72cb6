//! `parley tools`: list the tools the configured providers offer.

use parley_config::AppConfig;

use super::runtime::start_gateway;

pub async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    if config.tools.providers.is_empty() {
        println!();
        println!("  No tool providers configured.");
        println!("  Add one under [[tools.providers]] in:");
        println!("    {}", AppConfig::config_dir().join("config.toml").display());
        println!();
        return Ok(());
    }

    let gateway = start_gateway(&config).await?;
    let listed = gateway.list_tools().await;
    gateway.shutdown().await;
    let tools = listed.map_err(|e| format!("Failed to list tools: {e}"))?;

    println!();
    println!("  Providers: {}", gateway.provider_names().join(", "));
    println!("  Tools:     {}", tools.len());
    println!();
    for tool in &tools {
        println!("  [{}]", tool.provider);
        for line in tool.format_for_llm().lines() {
            println!("    {line}");
        }
        println!();
    }

    Ok(())
}
