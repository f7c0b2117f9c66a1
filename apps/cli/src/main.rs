//! Folio CLI: build a print-ready book artifact from a content tree.
//!
//! Compiles, inspects, renders, normalizes and validates in a loop until
//! the artifact passes or the attempt budget runs out.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
