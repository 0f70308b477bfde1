use clap::Parser;
use std::process;
use tracing::error;

use roster_core::cli::{self, Cli};
use roster_core::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging comes from the same file the command will use
    let logging_config = cli::load_config(cli.config.as_ref())
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Err(e) = logging::init(&logging_config) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = cli::run(cli).await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
