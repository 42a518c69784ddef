use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = keel::cli::Cli::parse();
    cli.execute().await
}
