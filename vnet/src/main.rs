use clap::Parser;
use vnet::cli::{run, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("vnet v{}", env!("CARGO_PKG_VERSION"));
    run(Args::parse()).await
}
