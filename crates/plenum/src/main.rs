//! Plenum - Meeting platform autoupdate service
//!
//! # Usage
//!
//! ```bash
//! # Run the server (default)
//! plenum
//! plenum --config configs/plenum.toml
//!
//! # Explicit subcommand
//! plenum serve --config configs/plenum.toml
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use plenum_autoupdate::Autoupdate;
use plenum_config::Config;
use plenum_datastore::{Datastore, HttpSource, RetryPolicy};
use plenum_http::{HeaderAuth, Server};
use plenum_projector::SlideStore;
use plenum_restrict::Restricter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Plenum - meeting platform autoupdate service
#[derive(Parser, Debug)]
#[command(name = "plenum")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, default_value = "configs/plenum.toml", global = true)]
    config: std::path::PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the autoupdate server
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("loading config {}", cli.config.display()))?
    } else {
        Config::default()
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    init_logging(level)?;

    match cli.command {
        Some(Command::Serve(_)) | None => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    let retry = RetryPolicy {
        max_retries: config.datastore.max_retries,
        base_delay: config.datastore.retry_base_delay(),
    };
    let (source, change_feed) =
        HttpSource::new(&config.datastore.url, config.datastore.timeout(), retry)
            .context("building datastore source")?;

    let ds = Datastore::new(Arc::new(source));
    tokio::spawn({
        let ds = ds.clone();
        let token = cancel.clone();
        async move { ds.listen(token).await }
    });

    plenum_projector::register(&ds, SlideStore::with_defaults());

    let restricter = Restricter::new(ds.clone());
    let autoupdate = Arc::new(Autoupdate::new(ds, restricter));

    info!(
        reader = %config.datastore.url,
        addr = %config.http.addr(),
        "starting autoupdate service"
    );

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("ctrl-c handler unavailable");
                return;
            }
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    let server = Server::new(config.http.addr(), autoupdate, Arc::new(HeaderAuth));
    let result = server.run(cancel.clone()).await;

    // The change-stream transport pushes batches through this handle;
    // dropping it ends the update loop.
    drop(change_feed);
    cancel.cancel();

    result.context("running http server")
}

/// Initialize the tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}
