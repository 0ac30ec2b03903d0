//! folio - command-line client for the novel reading service
//!
//! Signs in, keeps the session alive, imports novels on the server while
//! showing live progress, and reads chapters through a local window cache.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Command-line client for the novel reading service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./folio.toml or ~/.config/folio/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// API base URL (overrides config)
    #[arg(long, global = true)]
    api_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and save the session
    Login(cmd::auth::LoginArgs),
    /// Sign out and forget the saved session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Import a novel's chapters on the server
    Import(cmd::import::ImportArgs),
    /// Read a chapter, prefetching the ones after it
    Read(cmd::read::ReadArgs),
    /// Inspect or clear the local chapter cache
    Cache(cmd::cache::CacheArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command;

    let progress = Arc::new(folio_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug, progress bars show activity
    //   non-TTY: info unless --debug, logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    folio_core::init_logging(quiet, cli.debug, multi);

    let mut config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };
    if let Some(url) = cli.api_url {
        config.api.base_url = url;
    }

    if let Command::Config = command {
        cmd::show_config(&config);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let ctx = cmd::Ctx::new(config, progress).await?;
        match command {
            Command::Login(args) => cmd::auth::login(args, &ctx).await,
            Command::Logout => cmd::auth::logout(&ctx).await,
            Command::Whoami => cmd::auth::whoami(&ctx).await,
            Command::Import(args) => cmd::import::run(args, &ctx).await,
            Command::Read(args) => cmd::read::run(args, &ctx).await,
            Command::Cache(args) => cmd::cache::run(args, &ctx).await,
            Command::Config => Ok(()),
        }
    })
}
