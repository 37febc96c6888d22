mod cache;
mod commands;
mod config;
mod db;
mod dispatch;
mod lifecycle;
mod net;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::net::Destination;

#[derive(Parser, Debug)]
#[command(name = "gallery-cache")]
#[command(about = "Offline request interception and cache strategies for a static image gallery")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./gallery-cache.yaml, then $XDG_CONFIG_HOME/gallery-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the gallery base URL
  #[arg(long)]
  scope: Option<String>,

  /// Log at debug level
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell (with retries), then drop stale namespaces
  Install,
  /// Drop namespaces other than the current static and image ones
  Activate,
  /// Send one request through the dispatcher
  Fetch {
    /// Absolute URL, or path relative to the scope
    url: String,

    /// Request destination: image, document, script, style, other
    #[arg(short, long, default_value = "other")]
    destination: Destination,

    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Behave as if the network were down
    #[arg(long)]
    offline: bool,
  },
  /// List namespaces
  Status,
  /// Delete the image namespace
  ClearImages,
}

fn init_tracing(verbose: bool, log: &LogConfig) -> Result<Option<WorkerGuard>> {
  let directives = if verbose {
    "debug".to_string()
  } else {
    std::env::var("GALLERY_CACHE_LOG")
      .or_else(|_| std::env::var("RUST_LOG"))
      .unwrap_or_else(|_| "info".to_string())
  };
  let filter = EnvFilter::try_new(&directives)
    .map_err(|e| eyre!("Invalid log filter '{}': {}", directives, e))?;

  match &log.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Override scope if specified on command line
  if let Some(scope) = args.scope {
    config.scope = scope;
    config.validate()?;
  }

  let _guard = init_tracing(args.verbose, &config.log)?;

  match args.command {
    Command::Install => commands::install(&config).await,
    Command::Activate => commands::activate(&config).await,
    Command::Fetch {
      url,
      destination,
      method,
      output,
      offline,
    } => {
      let options = commands::FetchOptions {
        url,
        method,
        destination,
        output,
        offline,
      };
      commands::fetch(&config, &options).await
    }
    Command::Status => commands::status(&config),
    Command::ClearImages => commands::clear_images(&config),
  }
}
