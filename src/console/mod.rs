//! The `torrkit` command line surface.
//!
//! Two commands front the torrent engine: `create` builds a v1, v2 or
//! hybrid torrent from a file or directory, `inspect` parses one and
//! prints its identity. The process exits zero on success and non-zero
//! on any validation or generation failure.
pub mod create;
pub mod inspect;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::Configuration;

#[derive(Parser)]
#[command(name = "torrkit", version, about = "BitTorrent client core: torrent creation and inspection")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "TORRKIT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a torrent from a file or directory.
    Create(create::CreateArgs),
    /// Parse a torrent file and print a summary.
    Inspect(inspect::InspectArgs),
}

/// Parses the command line and runs the selected command.
///
/// # Errors
///
/// Will return an error on any validation, IO or generation failure;
/// `main` maps it to a non-zero exit code.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let configuration = match &cli.config {
        Some(path) => Configuration::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Configuration::default(),
    };

    match cli.command {
        Command::Create(args) => create::run(&args, &configuration),
        Command::Inspect(args) => inspect::run(&args),
    }
}
