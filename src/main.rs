// src/main.rs
use regprobe::{config::Config, sequencer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let report = sequencer::run(&config).await?.into_result()?;

    info!(
        run_id = %report.metadata.run_id,
        probes = report.outcomes.len(),
        captured = report.captured,
        "all probes passed"
    );
    Ok(())
}
