//! Command-line driver for the swcache offline worker.
//!
//! Runs the worker against a real origin over HTTP, with the cache kept on
//! disk between runs.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the manifest for the configured origin
//! swcache --config sw.json precache
//!
//! # Show what is cached
//! swcache list
//!
//! # Fetch through the worker, as if offline
//! swcache fetch /blog --navigate --offline
//!
//! # Check how the worker reads a message payload
//! swcache message '{"type": "SKIP_WAITING"}'
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use swcache_common::{init_logging, LogConfig, LogFormat};
use swcache_net::{Fetcher, HttpFetcher, LoaderConfig, OfflineFetcher, Request};
use swcache_worker::{
    CacheStore, FetchEvent, FileCacheStore, LifecycleController, MessageOutcome, OfflineWorker,
    WorkerCapabilities, WorkerConfig,
};
use tracing::debug;

#[derive(Parser)]
#[command(name = "swcache")]
#[command(about = "Offline caching worker: precache, inspect and fetch through the cache")]
#[command(version)]
struct Cli {
    /// Worker configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the cache store
    #[arg(long, global = true, default_value = ".swcache")]
    store_dir: PathBuf,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Tracing filter directives, e.g. "swcache_worker=debug,reqwest=warn"
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the precache manifest and store it
    Precache,

    /// List caches and their entries
    List {
        /// Only this cache
        #[arg(long)]
        cache: Option<String>,
    },

    /// Fetch a URL through the worker
    Fetch {
        /// Absolute URL, or a path relative to the configured origin
        url: String,
        /// Treat the request as a top-level navigation
        #[arg(long)]
        navigate: bool,
        /// Behave as if the network were down
        #[arg(long)]
        offline: bool,
        /// Print the response body
        #[arg(long)]
        body: bool,
    },

    /// Show how the worker interprets a message payload
    ///
    /// Offline check only: no cache or worker is touched.
    Message {
        /// JSON payload, e.g. '{"type": "SKIP_WAITING"}'
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::default()
        .with_verbosity(cli.verbose)
        .with_format(cli.log_format);
    if let Some(filter) = cli.log_filter {
        log_config = log_config.with_filter(filter);
    }
    init_logging(log_config)?;

    let config = load_config(cli.config.as_deref())?;
    debug!(cache = %config.cache_name, origin = %config.origin, "Loaded config");

    match cli.command {
        Commands::Precache => precache(config, &cli.store_dir).await,
        Commands::List { cache } => list(&cli.store_dir, cache.as_deref()).await,
        Commands::Fetch {
            url,
            navigate,
            offline,
            body,
        } => fetch(config, &cli.store_dir, &url, navigate, offline, body).await,
        Commands::Message { payload } => message(&payload),
    }
}

fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(WorkerConfig::default()),
    }
}

async fn open_store(dir: &Path) -> Result<Arc<FileCacheStore>> {
    let store = FileCacheStore::open_dir(dir)
        .await
        .with_context(|| format!("opening cache store at {}", dir.display()))?;
    Ok(Arc::new(store))
}

async fn build_worker(
    config: WorkerConfig,
    store_dir: &Path,
    offline: bool,
) -> Result<OfflineWorker> {
    let store = open_store(store_dir).await?;
    let fetcher: Arc<dyn Fetcher> = if offline {
        Arc::new(OfflineFetcher)
    } else {
        Arc::new(HttpFetcher::new(LoaderConfig::default())?)
    };
    // No runtime here starts navigation preloads.
    let capabilities = WorkerCapabilities::detect(&config, false);
    Ok(OfflineWorker::new(config, store, fetcher, capabilities)?)
}

async fn precache(config: WorkerConfig, store_dir: &Path) -> Result<()> {
    let worker = build_worker(config, store_dir, false).await?;
    let report = worker.install().await.context("precache failed")?;

    println!("Precached {} entries into '{}'", report.entries, report.cache_name);
    println!("  Bytes: {}", report.bytes);
    Ok(())
}

async fn list(store_dir: &Path, only: Option<&str>) -> Result<()> {
    let store = open_store(store_dir).await?;
    let names = match only {
        Some(name) => {
            if !store.has(name).await? {
                bail!("no cache named '{}' in {}", name, store_dir.display());
            }
            vec![name.to_string()]
        }
        None => store.cache_names().await?,
    };

    if names.is_empty() {
        println!("No caches in {}", store_dir.display());
    }
    for name in names {
        let keys = store.keys(&name).await?;
        println!("{} ({} entries)", name, keys.len());
        for key in keys {
            println!("  {}", key);
        }
    }
    Ok(())
}

async fn fetch(
    config: WorkerConfig,
    store_dir: &Path,
    url: &str,
    navigate: bool,
    offline: bool,
    print_body: bool,
) -> Result<()> {
    let url = config.resolve(url)?;
    let worker = build_worker(config, store_dir, offline).await?;

    let request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };
    let mut handled = worker
        .handle_fetch(FetchEvent::new(request))
        .await
        .context("fetch failed")?;

    let content_type = handled
        .response
        .content_type()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("Status:       {}", handled.response.status);
    println!("Source:       {:?}", handled.source);
    println!("Content-Type: {}", content_type);
    println!("Bytes:        {}", handled.response.body().len());

    // Let the background refresh land in the store before exiting.
    handled.settle().await;

    if print_body {
        println!();
        println!("{}", String::from_utf8_lossy(handled.response.body()));
    }
    Ok(())
}

fn interpret_message(payload: &str) -> Result<MessageOutcome> {
    let data: serde_json::Value =
        serde_json::from_str(payload).context("message payload is not valid JSON")?;
    Ok(LifecycleController::new().handle_message(&data))
}

fn message(payload: &str) -> Result<()> {
    match interpret_message(payload)? {
        MessageOutcome::SkipWaiting => println!("Worker will skip waiting"),
        MessageOutcome::Ignored => println!("Message ignored"),
    }
    Ok(())
}
