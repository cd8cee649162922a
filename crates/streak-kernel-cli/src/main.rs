use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = streak_kernel_cli::Cli::parse();
    streak_kernel_cli::run_cli(cli)
}
