use anyhow::Result;
use clap::Parser;
use saldo::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal; real environment variables still apply
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    saldo::logging::init(cli.verbose);
    cli.run().await
}
