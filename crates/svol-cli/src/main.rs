//! # svol
//!
//! Command-line interface for shortvol, a FUSE-based block device that
//! stores its data in someone else's URL shortener. Mount it, format the
//! exposed `block` file with the filesystem of your choice, and loop-mount
//! that.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod mount;

#[derive(Parser)]
#[command(name = "svol")]
#[command(version, about = "A block device that lives in someone else's URL shortener")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the volume described by the config file
    Mount(mount::MountArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Mount(args) => mount::run(args),
    }
}
