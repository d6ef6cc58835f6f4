use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use disputant::config::ServiceConfig;
use disputant::server;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,disputant=debug")),
        )
        .init();

    if let Err(error) = run() {
        tracing::error!("startup failed: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = ServiceConfig::load().context("loading configuration")?;
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(server::serve(config))
}
