//! `margin` command line.
//!
//! Usage:
//!   margin run                         # follow the firehose and reconcile in the background
//!   margin sync did:plc:...            # reconcile one identity now
//!   margin verify record.json --cid b… # check a payload against its CID
//!   margin cursor                      # print the stored stream position

mod cli;

use anyhow::Result;
use clap::Parser;
use margin_config::AppConfig;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    cli::execute(args.command, config).await
}
