use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use margin_config::AppConfig;
use margin_index::{CursorStore, DuckStore};
use margin_lexicon::DecoderRegistry;
use margin_sync::{
    ConsumerConfig, Crawler, CrawlerConfig, FirehoseConsumer, JetstreamSource, SchedulerConfig,
    StaticClientFactory, SyncScheduler, XrpcRepoClient,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "margin", version, about)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Follow the firehose until Ctrl-C, reconciling active identities in the background
    Run,
    /// Reconcile every tracked collection of one identity and print the results
    Sync {
        /// DID of the repository to reconcile
        did: String,
    },
    /// Verify a JSON record payload against its claimed CID
    Verify {
        /// File holding the record payload
        file: PathBuf,
        #[arg(long)]
        cid: String,
        /// Record URI, used in the mismatch report
        #[arg(long, default_value = "at://unknown")]
        uri: String,
    },
    /// Print the stored firehose cursor
    Cursor,
}

pub async fn execute(command: Command, config: AppConfig) -> Result<()> {
    match command {
        Command::Run => run(config).await,
        Command::Sync { did } => sync(config, &did).await,
        Command::Verify { file, cid, uri } => verify(&file, &cid, &uri),
        Command::Cursor => cursor(&config),
    }
}

fn open_store(config: &AppConfig) -> Result<Arc<DuckStore>> {
    let store = DuckStore::open(&config.database.path)
        .with_context(|| format!("opening index at {}", config.database.path.display()))?;
    Ok(Arc::new(store))
}

fn scheduler(
    config: &AppConfig,
    store: Arc<DuckStore>,
    registry: Arc<DecoderRegistry>,
) -> Result<SyncScheduler> {
    let client = XrpcRepoClient::from_config(&config.sync)?;
    let crawler = Crawler::new(store, registry, CrawlerConfig::from(&config.sync));
    Ok(SyncScheduler::new(
        Arc::new(crawler),
        Arc::new(StaticClientFactory::new(Arc::new(client))),
        SchedulerConfig::from(&config.sync),
    ))
}

async fn run(config: AppConfig) -> Result<()> {
    let store = open_store(&config)?;
    let registry = Arc::new(DecoderRegistry::standard());
    let scheduler = Arc::new(scheduler(&config, store.clone(), registry.clone())?);

    let consumer = Arc::new(
        FirehoseConsumer::new(
            Arc::new(JetstreamSource::new(config.firehose.url.clone())),
            store.clone(),
            store,
            registry,
            ConsumerConfig::from(&config.firehose),
        )
        .with_sync_trigger(scheduler.clone()),
    );

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let consumer = consumer.clone();
        let shutdown = shutdown.clone();
        async move { consumer.run(shutdown).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutting down");

    shutdown.cancel();
    scheduler.shutdown().await;
    task.await.context("firehose consumer task")?;

    let stats = consumer.stats();
    info!(?stats, position = consumer.position(), "stopped");
    Ok(())
}

async fn sync(config: AppConfig, did: &str) -> Result<()> {
    if !did.starts_with("did:") {
        bail!("`{did}` is not a DID");
    }
    let store = open_store(&config)?;
    let registry = Arc::new(DecoderRegistry::standard());
    let results = scheduler(&config, store, registry)?.sync_now(did).await?;
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn verify(file: &Path, cid: &str, uri: &str) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    margin_cid::verify(&raw, cid, uri)?;
    println!("ok {cid}");
    Ok(())
}

fn cursor(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    match store.load_cursor(&config.firehose.subscription)? {
        Some(cursor) => println!("{cursor}"),
        None => println!("no cursor stored for {}", config.firehose.subscription),
    }
    Ok(())
}
