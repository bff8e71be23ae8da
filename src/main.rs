use env_logger::{Builder, Env};
use goodchain::cli::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    Builder::from_env(Env::default().default_filter_or("info")).init();
    let mut cli = Cli::new();
    cli.run().await
}
