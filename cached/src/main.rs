use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cached::config;
use cached::gc;

/// A caching, single-flighted pull-through proxy for the Nix binary
/// cache protocol.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file. Falls back to the XDG config search
    /// path if not given.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Mode to run.
    #[clap(long, default_value = "monolithic")]
    mode: ServerMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    /// Run migrations, then serve and periodically run LRU eviction
    /// until the process exits.
    Monolithic,

    /// Serve, without running migrations or LRU eviction first.
    ///
    /// A placeholder: the HTTP listener itself is out of scope for
    /// this crate, so this mode just keeps the engine alive for
    /// whatever embeds it.
    Serve,

    /// Run database migrations then exit.
    Migrate,

    /// Run LRU eviction once then exit.
    GcOnce,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let opts = Opts::parse();
    let config = config::load_config(opts.config.as_deref()).await?;

    match opts.mode {
        ServerMode::Monolithic => {
            cached::run_migrations(&config).await?;
            let engine = cached::build_engine(&config).await?;
            tracing::info!("ncpsd started, serving from {}", config.hostname);
            gc::run_lru_eviction_periodically(engine, Duration::from_secs(3600)).await;
        }
        ServerMode::Serve => {
            let engine = cached::build_engine(&config).await?;
            tracing::info!("ncpsd started (serve mode), serving from {}", config.hostname);
            gc::run_lru_eviction_periodically(engine, Duration::from_secs(3600)).await;
        }
        ServerMode::Migrate => {
            cached::run_migrations(&config).await?;
            tracing::info!("Migrations complete");
        }
        ServerMode::GcOnce => {
            let engine = cached::build_engine(&config).await?;
            gc::run_lru_eviction_once(&engine).await?;
            tracing::info!("LRU eviction pass complete");
        }
    }

    Ok(())
}

fn init_logging() {
    let env_filter = EnvFilter::from_default_env();
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);
    let error_layer = ErrorLayer::default();

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(error_layer)
        .init();
}
