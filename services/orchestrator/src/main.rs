//! stumatch-orchestrator
//!
//! Command-line consumer of the node orchestrator. Provisions storage nodes,
//! follows uploads and keeps a refreshed view of the storage network.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stumatch_orchestrator::cli::Cli;
use stumatch_orchestrator::output::print_failure;
use stumatch_orchestrator::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    cli.apply_overrides(&mut config);

    // RUST_LOG wins over the configured level.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    info!(api_url = %config.api_url, "Configuration loaded");

    if let Err(e) = cli.run(config).await {
        print_failure(&format!("{e:#}"));
        std::process::exit(1);
    }

    Ok(())
}
