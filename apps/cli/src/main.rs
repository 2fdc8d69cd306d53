//! MLS CLI: multi-level summaries of hierarchical outlines.
//!
//! Resolves root-text excerpts onto an outline, drives a summarizer once per
//! node, and merges the annotations back into a single document.

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
