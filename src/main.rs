mod app;
mod cache;
mod config;
mod connectivity;
mod context;
mod db;
mod event;
mod lifecycle;
mod logging;
mod net;
mod queue;
mod submit;
mod sync;
mod tasks;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "scan-offline")]
#[command(about = "Offline cache and submission queue for the card-scanning widget")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/scan-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level unless SCAN_OFFLINE_LOG or RUST_LOG is set
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the manifest into the configured generation
  Install,
  /// Purge every other generation and serve the configured one
  Activate,
  /// Fetch a URL through the cache
  Fetch {
    url: Url,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Submit a scan payload (JSON file, or - for stdin); queued if delivery fails
  Submit { payload: PathBuf },
  /// Replay queued submissions now
  Sync {
    /// Sync tag (defaults to the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// List queued submissions
  Queue,
  /// Show cache generations and queue size
  Status,
  /// Run the background worker: watch connectivity and replay on reconnect
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(config.log_dir.as_deref(), args.verbose)?;

  let app = app::App::new(config)?;

  match args.command {
    Command::Install => app.install().await,
    Command::Activate => app.activate().await,
    Command::Fetch { url, output } => app.fetch(url, output.as_deref()).await,
    Command::Submit { payload } => app.submit(&payload).await,
    Command::Sync { tag } => app.sync(tag).await,
    Command::Queue => app.queue(),
    Command::Status => app.status(),
    Command::Watch => app.watch().await,
  }
}
