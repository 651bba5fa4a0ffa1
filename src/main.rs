use anyhow::{Context, Result};
use clap::Parser;

use filehub::{bind, serve, Config, Hub};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    env_logger::Builder::new()
        .filter_level(config.log_filter())
        .parse_default_env()
        .init();

    let index_page = config.index_page().with_context(|| {
        format!("Could not read UI page {:?}", config.ui)
    })?;
    let hub = Hub::new(index_page, config.wait_timeout());

    let addr = config.socket_addr().await?;
    let listener = bind(addr, config.backlog)
        .with_context(|| format!("Could not listen on {}", addr))?;

    if config.bind.trim().is_empty() {
        log::info!("Server serving at <all interfaces>:{}", config.port);
    } else {
        log::info!("Server serving at {}", listener.local_addr()?);
    }
    if let Some(limit) = config.wait_timeout() {
        log::info!("Uploads give up after {:?} without a downloader", limit);
    }

    tokio::select! {
        result = serve(listener, hub) => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }
    Ok(())
}
