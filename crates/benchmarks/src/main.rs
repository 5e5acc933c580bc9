//! `convtune` executable.

use anyhow::Result;
use clap::Parser;
use convtune_driver::cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
