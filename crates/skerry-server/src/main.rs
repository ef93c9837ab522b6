use tracing::info;

use skerry_server::relay::config::RelayConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("skerry — payloads pass through, never read");

    let config = RelayConfig::from_env();
    skerry_server::relay::server::run(config).await
}
