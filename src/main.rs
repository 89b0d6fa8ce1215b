use anyhow::Result;
use clap::Parser;
use matchgate::config::{Cli, Config};
use matchgate::gateway::Gateway;
use matchgate::server::Server;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config =
        Config::load(&cli).map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("matchgate={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting matchgate");
    tracing::info!(
        "Configuration: bind_addr={}, upstream={}, global_limit={}/{}ms",
        config.bind_addr,
        config.upstream_base_url,
        config.global_rate_limit,
        config.global_rate_window_ms
    );

    let gateway = Arc::new(
        Gateway::new(config).map_err(|e| anyhow::anyhow!("Failed to build gateway: {}", e))?,
    );
    let sweeper = gateway.spawn_cache_sweeper();

    Server::new(gateway)
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    sweeper.abort();
    Ok(())
}
