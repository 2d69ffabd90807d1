//! cake
//!
//! Bootstraps a Kubernetes management cluster onto vSphere.

use clap::Parser;

use cake_cli::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.run().await
}
