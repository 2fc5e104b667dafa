use tracing::info;
use tracing_subscriber::EnvFilter;

use deskbridge::config::BridgeConfig;
use deskbridge::server::run_server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = BridgeConfig::from_env()?;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    run_server(config, shutdown).await?;
    Ok(())
}
