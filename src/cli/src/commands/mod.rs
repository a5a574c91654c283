//! CLI command definitions and dispatch.

mod build;

use clap::{Parser, Subcommand};

use zeroimage_engine::error::Result;

/// zeroimage — build "from scratch" OCI images around single binaries.
#[derive(Parser)]
#[command(name = "zeroimage", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from an entrypoint binary
    Build(build::BuildArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
    }
}
