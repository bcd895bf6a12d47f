//! Linetag CLI: weekly keyword classification runs.
//!
//! Loads the week's keyword records, classifies them in two passes against
//! the product taxonomy, and merges and publishes the result.

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
