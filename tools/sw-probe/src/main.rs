//! Probe a site through the pwakit service worker.
//!
//! Installs a worker for a live origin with a real network loader, then
//! fetches paths through it and reports where each response came from.
//!
//! ## Usage
//!
//! ```bash
//! # Validate a worker config and show the partition names it implies
//! sw-probe check --config config/worker.json
//!
//! # Precache the static manifest of a site into a cache directory
//! sw-probe install --config config/worker.json --origin https://example.com/ --cache-dir .sw-cache
//!
//! # Fetch pages through the worker
//! sw-probe fetch --config config/worker.json --origin https://example.com/ / /portfolio.html
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use http::header::ACCEPT;
use http::HeaderValue;
use pwakit_common::{init_logging, LogConfig, LogFormat, PwaError, Result, ResultExt};
use pwakit_net::{Request, ResourceLoader};
use pwakit_sw::{CacheStorage, ServedResponse, ServiceWorkerContainer, WorkerConfig};
use serde::Serialize;
use tracing::{error, warn, Level};
use url::Url;

#[derive(Parser)]
#[command(name = "sw-probe")]
#[command(about = "Probe a site through the pwakit service worker")]
struct Cli {
    /// Log format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a worker config
    Check {
        /// Worker config (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Install the worker and report the precached partitions
    Install {
        /// Worker config (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Origin to serve, e.g. https://example.com/
        #[arg(short, long)]
        origin: String,
        /// Persist caches here instead of in memory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },

    /// Install the worker, then fetch paths through it
    Fetch {
        /// Worker config (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Origin to serve, e.g. https://example.com/
        #[arg(short, long)]
        origin: String,
        /// Persist caches here instead of in memory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Accept header to send
        #[arg(long, default_value = "text/html")]
        accept: String,
        /// Paths to fetch, relative to the origin
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct PartitionReport {
    name: String,
    entries: usize,
}

#[derive(Debug, Serialize)]
struct FetchReport {
    url: String,
    status: u16,
    source: String,
    content_type: Option<String>,
    redirected: bool,
    bytes: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    if let Err(e) = init_logging(LogConfig {
        level,
        ..LogConfig::default().with_format(cli.log_format)
    }) {
        eprintln!("sw-probe: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(category = e.category(), error = %e, "sw-probe failed");
            if let (true, Some(backtrace)) = (cli.verbose, e.backtrace()) {
                eprintln!("{backtrace:?}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Check { config } => {
            let config = WorkerConfig::from_file(&config)?;
            print_json(&check_report(&config))?;
        }

        Commands::Install {
            config,
            origin,
            cache_dir,
        } => {
            let (_container, caches) = install(&config, &origin, cache_dir.as_deref()).await?;
            let mut partitions = Vec::new();
            for name in caches.keys().await {
                let entries = caches.entry_count(&name).await.unwrap_or(0);
                partitions.push(PartitionReport { name, entries });
            }
            print_json(&partitions)?;
        }

        Commands::Fetch {
            config,
            origin,
            cache_dir,
            accept,
            paths,
        } => {
            let (container, _caches) = install(&config, &origin, cache_dir.as_deref()).await?;
            let base = parse_origin(&origin)?;
            let accept = HeaderValue::from_str(&accept)
                .map_err(|e| PwaError::InvalidArgument(format!("accept '{accept}': {e}")))?;

            let mut reports = Vec::new();
            for path in &paths {
                let url = base
                    .join(path)
                    .map_err(|e| PwaError::InvalidArgument(format!("{path}: {e}")))?;
                let request = Request::get(url).header(ACCEPT, accept.clone());
                match container.fetch(request).await {
                    Ok(served) => reports.push(fetch_report(&served)),
                    Err(e) => {
                        let e = PwaError::from(e);
                        warn!(path = %path, category = e.category(), error = %e, "Fetch failed");
                    }
                }
            }
            container.settle().await;
            print_json(&reports)?;
        }
    }

    Ok(())
}

fn check_report(config: &WorkerConfig) -> serde_json::Value {
    serde_json::json!({
        "version": config.version_name(),
        "static_cache": config.static_cache_name(),
        "dynamic_cache": config.dynamic_cache_name(),
        "static_files": config.static_files.len(),
    })
}

fn fetch_report(served: &ServedResponse) -> FetchReport {
    let response = &served.response;
    FetchReport {
        url: response.url.to_string(),
        status: response.status.as_u16(),
        source: format!("{:?}", served.source),
        content_type: response
            .content_type()
            .map(|mime| mime.essence_str().to_string()),
        redirected: response.redirected,
        bytes: response.body.len(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("encoding report")?;
    println!("{json}");
    Ok(())
}

fn parse_origin(origin: &str) -> Result<Url> {
    Url::parse(origin).map_err(|e| PwaError::InvalidArgument(format!("origin '{origin}': {e}")))
}

async fn install(
    config: &Path,
    origin: &str,
    cache_dir: Option<&Path>,
) -> Result<(ServiceWorkerContainer, Arc<CacheStorage>)> {
    let config = WorkerConfig::from_file(config)?;
    parse_origin(origin)?;
    let caches = Arc::new(match cache_dir {
        Some(dir) => CacheStorage::persistent(dir).await?,
        None => CacheStorage::new(),
    });
    let loader = Arc::new(ResourceLoader::new(Default::default())?);

    let (container, _events) = ServiceWorkerContainer::new(Arc::clone(&caches), loader);
    container.register(origin, config).await?;
    Ok((container, caches))
}
