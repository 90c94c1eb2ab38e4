use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::join;
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use ferry_server::config;

/// Cross-instance migration server.
#[derive(Debug, Parser)]
#[clap(version)]
#[clap(propagate_version = true)]
struct Opts {
    /// Path to the config file.
    #[clap(short = 'f', long)]
    config: Option<PathBuf>,

    /// Socket address to listen on.
    ///
    /// This overrides `listen` in the config.
    #[clap(short = 'l', long)]
    listen: Option<SocketAddr>,

    /// Mode to run.
    #[clap(long, default_value = "monolithic")]
    mode: ServerMode,

    /// Whether to emit logs as JSON.
    #[clap(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServerMode {
    /// Run all components.
    Monolithic,

    /// Run the API server.
    ApiServer,

    /// Run the pipeline workers.
    Worker,

    /// Run the stale work reaper periodically.
    Reaper,

    /// Run the stale work reaper then exit.
    ReaperOnce,

    /// Run the database migrations then exit.
    DbMigrations,

    /// Check the configuration then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    init_logging(opts.json_logs);
    dump_version();

    let config = config::load_config(opts.config.as_deref())?;

    match opts.mode {
        ServerMode::Monolithic => {
            ferry_server::run_migrations(config.clone()).await?;

            let (api_server, workers, _) = join!(
                ferry_server::run_api_server(opts.listen, config.clone()),
                ferry_server::run_workers(config.clone()),
                ferry_server::reaper::run_reaper(config.clone()),
            );

            api_server?;
            workers?;
        }
        ServerMode::ApiServer => {
            ferry_server::run_api_server(opts.listen, config).await?;
        }
        ServerMode::Worker => {
            ferry_server::run_workers(config).await?;
        }
        ServerMode::Reaper => {
            ferry_server::reaper::run_reaper(config).await;
        }
        ServerMode::ReaperOnce => {
            ferry_server::reaper::run_reaper_once(config).await?;
        }
        ServerMode::DbMigrations => {
            ferry_server::run_migrations(config).await?;
        }
        ServerMode::CheckConfig => {
            // config is valid, let's just exit :)
        }
    }

    Ok(())
}

fn init_logging(json: bool) {
    let env_filter = EnvFilter::from_default_env();

    let (fmt_layer, json_layer) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    let error_layer = ErrorLayer::default();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(json_layer)
        .with(error_layer)
        .init();
}

fn dump_version() {
    #[cfg(debug_assertions)]
    eprintln!("Ferry Server {} (debug)", env!("CARGO_PKG_VERSION"));

    #[cfg(not(debug_assertions))]
    eprintln!("Ferry Server {} (release)", env!("CARGO_PKG_VERSION"));
}
