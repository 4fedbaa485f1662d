//! Ingest Worker - Entry Point
//!
//! Moves messages from the source queue into object storage and publishes
//! a notification for each stored object.

use clap::Parser;
use ingest_worker::Cli;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    ingest_worker::run(Cli::parse()).await
}
