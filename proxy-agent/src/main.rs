//! gatewatch entry point

use clap::Parser;
use proxy_agent::{run, Args};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        tracing::error!("gatewatch failed: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
