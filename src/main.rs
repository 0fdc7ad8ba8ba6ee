use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use ngsild_broker::{config::BrokerConfig, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = BrokerConfig::load(config_path.as_deref())?;

    info!(
        host = %config.host,
        port = config.port,
        registrations = config.registrations.len(),
        "starting NGSI-LD context broker"
    );

    let server = Server::builder().config(config).build().await?;
    server.run().await?;

    Ok(())
}
