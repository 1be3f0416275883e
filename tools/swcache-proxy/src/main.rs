//! SwCache proxy.
//!
//! Serves a site through the offline cache router: pre-caches the static
//! manifest, then answers every request with the strategy its path maps to.
//!
//! ## Usage
//!
//! ```bash
//! # Write a config to edit
//! swcache-proxy init-config swcache.json
//!
//! # Proxy the site configured in swcache.json on port 8080
//! swcache-proxy serve --config swcache.json --listen 127.0.0.1:8080
//!
//! # Which strategy handles a URL?
//! swcache-proxy classify http://localhost:3000/images/logo.png
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use swcache_common::{init_logging, LogConfig, LogFormat};
use swcache_net::{Fetcher, FetcherConfig, HttpFetcher, Request};
use swcache_sw::{
    dispatch, Dispatch, MemoryCacheStorage, RouteTable, RouterConfig, ServiceWorkerHost,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use url::Url;

mod server;

use server::{AppState, BackgroundTasks};

#[derive(Parser)]
#[command(name = "swcache-proxy")]
#[command(about = "Serve a site through the SwCache offline router")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the caching reverse proxy
    Serve {
        /// Router config (JSON). Defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,
        /// Cache snapshot restored at startup and saved on shutdown
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Log output format (pretty, compact, json)
        #[arg(long, default_value = "pretty")]
        log_format: LogFormat,
        /// Network timeout in seconds. No timeout when omitted
        #[arg(long)]
        timeout: Option<u64>,
        /// Debug logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print the strategy a URL is handled with
    Classify {
        url: Url,
        /// Router config (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Write the default config to a file
    InitConfig {
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            listen,
            snapshot,
            log_format,
            timeout,
            verbose,
        } => {
            init_logging(LogConfig::verbose(verbose).with_format(log_format));

            let config = load_config(config.as_deref())?;
            let snapshot = snapshot.or_else(default_snapshot_path);
            serve(config, listen, snapshot, timeout.map(Duration::from_secs)).await?;
        }

        Commands::Classify { url, config } => {
            let config = load_config(config.as_deref())?;
            let routes = RouteTable::from_config(&config.routes);
            match dispatch(&routes, &Request::get(url)) {
                Dispatch::Handle(strategy) => println!("{strategy}"),
                Dispatch::Passthrough(reason) => println!("passthrough ({reason})"),
            }
        }

        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            RouterConfig::default().save(&path)?;
            println!("Config written to: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RouterConfig> {
    match path {
        Some(path) => RouterConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(RouterConfig::default()),
    }
}

fn default_snapshot_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("swcache").join("snapshot.json"))
}

async fn serve(
    config: RouterConfig,
    listen: SocketAddr,
    snapshot: Option<PathBuf>,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let storage = match snapshot.as_deref() {
        Some(path) if path.exists() => MemoryCacheStorage::load_snapshot(path)
            .await
            .unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable cache snapshot");
                MemoryCacheStorage::new()
            }),
        _ => MemoryCacheStorage::new(),
    };
    let storage = Arc::new(storage);

    let fetcher_config = FetcherConfig {
        timeout,
        ..Default::default()
    };
    let worker_network: Arc<dyn Fetcher> =
        Arc::new(HttpFetcher::new(&config.scope, fetcher_config.clone())?);
    // Forwarded requests hand redirects back to the client untouched.
    let passthrough: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(
        &config.scope,
        FetcherConfig {
            max_redirects: 0,
            ..fetcher_config
        },
    )?);
    let origin = config.scope.clone();
    let host = Arc::new(ServiceWorkerHost::new(config, storage.clone(), worker_network)?);

    match host.register().await {
        Ok(state) => info!(%state, "Worker registered"),
        Err(e) => warn!(error = %e, "Worker registration failed, passing requests through"),
    }

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;

    let state = AppState {
        host,
        network: passthrough,
        origin,
        background: BackgroundTasks::default(),
    };
    server::serve(listener, state, shutdown_signal()).await?;

    if let Some(path) = snapshot {
        storage.save_snapshot(&path).await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
