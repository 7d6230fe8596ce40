//! Uplink relay daemon entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting uplink relay");

    let path = config::config_path(std::env::args().skip(1))?;
    let config = config::RelayConfig::load(path.as_deref())?;
    config.validate()?;
    tracing::info!(
        tier = config.transfer.tier.as_str(),
        bind = %config.server.bind,
        port = config.server.port,
        sink_root = %config.sink.root.display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("relay shut down cleanly");
    Ok(())
}
