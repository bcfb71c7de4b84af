use anyhow::Context;
use rate_gate::{config::GateConfig, init_tracing, run_server};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/rate-gate.yaml".to_string());

    // File first, then RATE_GATE__* overrides
    let config = GateConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_tracing(config.rate_limit.debug);

    run_server(config).await.context("Server error")?;
    Ok(())
}
