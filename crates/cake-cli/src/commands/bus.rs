//! `cake bus`: a standalone event bus broker

use clap::Args;
use tracing::info;

use cake_common::events::BusServer;

use crate::{LogArgs, Result};

/// Run the TCP event bus broker in the foreground
#[derive(Args, Debug)]
pub struct BusArgs {
    /// Address to accept publishers and subscribers on, e.g. `0.0.0.0:9090`
    #[arg(long)]
    pub listen: String,
}

/// Serve until interrupted
pub async fn run(args: BusArgs, logging: &LogArgs) -> Result<()> {
    logging.init(None)?;

    let server = BusServer::bind(&args.listen).await?;
    info!(addr = %server.local_addr()?, "event bus broker ready");

    tokio::select! {
        _ = server.serve() => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupted, stopping broker");
        }
    }
    Ok(())
}
