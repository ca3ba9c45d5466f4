use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = islm_cli::Cli::parse();
    islm_cli::run_cli(cli)
}
