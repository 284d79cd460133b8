use clap::Parser;
use silt_mgmt::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli.run().await {
        tracing::debug!(error = ?e, "command failed");
        eprintln!("silt: {:#}", e);
        std::process::exit(1);
    }
}
