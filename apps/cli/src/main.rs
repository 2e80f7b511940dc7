//! amlflow CLI: AML risk assessment for financial transactions.
//!
//! Extracts entities from transaction text, enriches them against registries
//! and watchlists, and stores every fact of the run for audit.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
