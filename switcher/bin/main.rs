use anyhow::Result;
use stratum_switcher::cli;

#[tokio::main]
async fn main() -> Result<()> {
    cli::run().await
}
