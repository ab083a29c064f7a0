use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("whapp_irc=info".parse()?))
        .init();

    let config = whapp_irc::config::ServerConfig::parse();
    tracing::info!("Starting whapp-irc on {}", config.listen_addr);
    tracing::info!("Platform sidecar at {}", config.platform_url);

    let server = whapp_irc::server::Server::new(config)?;
    server.run().await
}
