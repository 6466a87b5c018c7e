use clap::Parser;
use color_eyre::Result;
use offcache::app::App;
use offcache::cache::{BlobStore, SqliteBlobStore};
use offcache::config::Config;
use offcache::engine::Engine;
use offcache::event::EventHandler;
use offcache::logging;
use offcache::queue::{QueueStore, SqliteQueueStore};
use offcache::transport::ReqwestTransport;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "An offline-caching request intermediary speaking JSON lines on stdin/stdout")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offcache.yaml, then $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin that relative URLs resolve against
  #[arg(short, long)]
  origin: Option<String>,

  /// Directory for the cache and queue databases
  #[arg(long)]
  data_dir: Option<PathBuf>,

  /// Keep everything in memory; nothing survives a restart
  #[arg(long)]
  in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
    config.origin_url()?;
  }
  if let Some(dir) = args.data_dir {
    config.data_dir = Some(dir);
  }

  let _guard = logging::init(&config)?;

  let (blobs, queue): (Arc<dyn BlobStore>, Arc<dyn QueueStore>) = if args.in_memory {
    (
      Arc::new(SqliteBlobStore::open_in_memory()?),
      Arc::new(SqliteQueueStore::open_in_memory()?),
    )
  } else {
    let dir = config.data_dir()?;
    (
      Arc::new(SqliteBlobStore::open(&dir.join("cache.db"))?),
      Arc::new(SqliteQueueStore::open(&dir.join("queue.db"))?),
    )
  };

  let engine = Engine::new(&config, blobs, queue, Arc::new(ReqwestTransport::new()?))?;

  // A failed install leaves the previous precache in place
  if let Err(e) = engine.install().await {
    error!("Install failed: {:#}", e);
  }
  engine.activate()?;
  info!(origin = %config.origin, version = %config.version, "ready");

  let retry = config.replay.retry_interval_secs.map(Duration::from_secs);
  let events = EventHandler::new(
    BufReader::new(tokio::io::stdin()),
    Arc::clone(engine.sync()),
    retry,
  );

  App::new(engine, events).run(tokio::io::stdout()).await
}
