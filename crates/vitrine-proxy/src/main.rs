use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vitrine_proxy::{ProxyConfig, ProxyServer};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(exit_error) = run().await {
        error!(%exit_error, "proxy terminated");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), vitrine_proxy::ProxyError> {
    let config = ProxyConfig::from_env();
    info!(
        port = config.listen_port,
        cache_mb = config.cache.max_size_bytes / (1024 * 1024),
        cache_max_age_secs = config.cache.default_ttl.as_secs(),
        "starting vitrine proxy"
    );

    let server = ProxyServer::new(config)?;
    server.run().await?;
    Ok(())
}
