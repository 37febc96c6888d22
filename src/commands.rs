//! Subcommands. This is the host side: it fires install/activate, retries a
//! failed install, and feeds single requests through the dispatcher.

use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::{Config, InstallConfig};
use crate::dispatch::{Dispatcher, Outcome};
use crate::lifecycle::LifecycleManager;
use crate::net::{Destination, HttpClient, InterceptedRequest, Network, OfflineNetwork};

/// Options for a single dispatched request
#[derive(Debug, Clone)]
pub struct FetchOptions {
  pub url: String,
  pub method: String,
  pub destination: Destination,
  pub output: Option<PathBuf>,
  pub offline: bool,
}

fn open_storage(config: &Config) -> Result<Arc<SqliteStorage>> {
  let path = config.database_path()?;
  Ok(Arc::new(SqliteStorage::open(&path)?))
}

fn network(config: &Config, offline: bool) -> Result<Arc<dyn Network>> {
  if offline {
    Ok(Arc::new(OfflineNetwork))
  } else {
    Ok(Arc::new(HttpClient::new(&config.network)?))
  }
}

fn lifecycle<S: CacheStorage + 'static>(
  config: &Config,
  storage: &Arc<S>,
  network: &Arc<dyn Network>,
) -> Result<LifecycleManager<S>> {
  LifecycleManager::new(
    Arc::clone(storage),
    Arc::clone(network),
    config.namespaces(),
    config.manifest()?,
  )
}

/// Run install until it succeeds or the attempts run out.
async fn install_with_retry<S: CacheStorage + 'static>(
  lifecycle: &mut LifecycleManager<S>,
  policy: &InstallConfig,
) -> Result<usize> {
  let attempts = policy.max_attempts.max(1);
  let mut attempt = 1;

  loop {
    match lifecycle.on_install().await {
      Ok(count) => return Ok(count),
      Err(e) if attempt < attempts => {
        warn!(attempt, attempts, "Install attempt failed, retrying: {}", e);
        tokio::time::sleep(Duration::from_millis(policy.retry_delay_ms)).await;
        attempt += 1;
      }
      Err(e) => {
        return Err(eyre!("Install failed after {} attempt(s): {}", attempt, e));
      }
    }
  }
}

/// Install then activate, like a freshly registered worker.
async fn install_and_activate<S: CacheStorage + 'static>(
  lifecycle: &mut LifecycleManager<S>,
  policy: &InstallConfig,
) -> Result<()> {
  let count = install_with_retry(lifecycle, policy).await?;
  let report = lifecycle.on_activate().await?;
  info!(
    state = ?lifecycle.state(),
    precached = count,
    deleted = report.deleted.len(),
    failed = report.failed.len(),
    "Worker activated"
  );
  Ok(())
}

pub async fn install(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  let network = network(config, false)?;
  let mut lifecycle = lifecycle(config, &storage, &network)?;

  install_and_activate(&mut lifecycle, &config.install).await?;
  println!(
    "Installed {} ({} entries)",
    config.static_cache,
    config.manifest()?.urls().len()
  );
  Ok(())
}

pub async fn activate(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  let network = network(config, true)?;
  let mut lifecycle = lifecycle(config, &storage, &network)?;

  let report = lifecycle.on_activate().await?;
  for name in &report.deleted {
    println!("deleted {}", name);
  }
  for name in &report.failed {
    println!("failed  {}", name);
  }
  if report.deleted.is_empty() && report.failed.is_empty() {
    println!("Nothing to clean up");
  }
  Ok(())
}

/// Install the app shell if it is missing (unless the network is disabled),
/// then build a dispatcher over the promoted static namespace.
async fn prepare_dispatcher<S: CacheStorage + 'static>(
  config: &Config,
  storage: Arc<S>,
  network: Arc<dyn Network>,
  offline: bool,
) -> Result<Dispatcher<S>> {
  let mut lifecycle = lifecycle(config, &storage, &network)?;
  if !lifecycle.is_installed()? {
    if offline {
      info!("App shell not installed and network disabled, skipping install");
    } else {
      info!("App shell not installed yet, installing first");
      if let Err(e) = install_and_activate(&mut lifecycle, &config.install).await {
        warn!("Continuing without an installed app shell: {}", e);
      }
    }
  }

  Ok(Dispatcher::new(
    storage,
    network,
    lifecycle.serving_namespaces(),
    config.scope_url()?,
    &config.offline_url()?,
  ))
}

pub async fn fetch(config: &Config, options: &FetchOptions) -> Result<()> {
  let storage = open_storage(config)?;
  let network = network(config, options.offline)?;

  let url = config
    .scope_url()?
    .join(&options.url)
    .map_err(|e| eyre!("Invalid URL '{}': {}", options.url, e))?;
  let request = InterceptedRequest::new(&options.method, url, options.destination);

  let dispatcher = prepare_dispatcher(config, storage, network, options.offline).await?;
  let outcome = dispatcher.handle(&request).await;
  dispatcher.flush().await;

  let served = match outcome {
    Outcome::Served(served) => served,
    Outcome::Unavailable => return Err(eyre!("{} is unavailable", request.url)),
  };

  eprintln!(
    "{} {:?} {} ({})",
    served.response.status,
    served.source,
    served.response.url,
    served.response.header("content-type").unwrap_or("-")
  );
  if let Some(cached_at) = served.cached_at {
    eprintln!("cached at {}", cached_at.to_rfc3339());
  }

  match &options.output {
    Some(path) => std::fs::write(path, &served.response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => std::io::stdout()
      .lock()
      .write_all(&served.response.body)
      .map_err(|e| eyre!("Failed to write response body: {}", e))?,
  }

  Ok(())
}

pub fn status(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  let namespaces = config.namespaces();

  let existing = storage.namespaces()?;
  if existing.is_empty() {
    println!("No namespaces");
    return Ok(());
  }

  println!("{:<36} {:>8}  {:<5}  STATE", "NAMESPACE", "ENTRIES", "READY");
  for ns in existing {
    let state = if ns.name == namespaces.static_cache {
      "current"
    } else if ns.name == namespaces.image_cache {
      "images"
    } else {
      "stale"
    };
    println!(
      "{:<36} {:>8}  {:<5}  {}",
      ns.name,
      ns.entries,
      if ns.ready { "yes" } else { "no" },
      state
    );
  }
  Ok(())
}

/// Drop the image namespace. Nothing else ever shrinks it.
pub fn clear_images(config: &Config) -> Result<()> {
  let storage = open_storage(config)?;
  if storage.delete_namespace(&config.image_cache)? {
    println!("Deleted {}", config.image_cache);
  } else {
    println!("{} does not exist", config.image_cache);
  }
  Ok(())
}
