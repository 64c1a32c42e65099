//! ## skansen-cli
//! **Operational entrypoint**
//!
//! `skansen run` enforces the configured policy until Ctrl-C; `simulate` and
//! `fuzz` drive seeded chaos runs against the in-memory kernel; `translate`
//! shows what a policy file resolves to without touching any interface.

use clap::Parser;

mod commands;
mod error;

use commands::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::run_command(cli).await?;
    Ok(())
}
