use clap::Parser;

use rollout::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = cli::execute(cli).await;
    std::process::exit(code);
}
