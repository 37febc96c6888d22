//! Cache lifecycle: precache the app shell on install, drop superseded
//! namespaces on activate.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{with_storage, CacheStorage, Namespaces, RequestKey};
use crate::net::{Destination, InterceptedRequest, Network};

/// Ordered, de-duplicated list of app-shell URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheManifest {
  urls: Vec<Url>,
}

impl PrecacheManifest {
  /// Resolve `entries` against `base`. Absolute entries are kept as-is.
  pub fn resolve(base: &Url, entries: &[String]) -> Result<Self> {
    let mut seen = HashSet::new();
    let mut urls = Vec::with_capacity(entries.len());

    for entry in entries {
      let url = base
        .join(entry)
        .map_err(|e| eyre!("Invalid precache entry '{}': {}", entry, e))?;
      if seen.insert(RequestKey::get(&url)) {
        urls.push(url);
      }
    }

    Ok(Self { urls })
  }

  pub fn urls(&self) -> &[Url] {
    &self.urls
  }

  pub fn contains(&self, url: &Url) -> bool {
    let key = RequestKey::get(url);
    self.urls.iter().any(|u| RequestKey::get(u) == key)
  }
}

/// Where the worker is in its install/activate sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install failed; a fresh install attempt is needed
  Redundant,
}

/// What an activation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  /// Stale namespaces whose deletion failed; retried on the next activation
  pub failed: Vec<String>,
}

/// Owns the namespace lifecycle for one deployed version.
pub struct LifecycleManager<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  namespaces: Namespaces,
  manifest: PrecacheManifest,
  state: WorkerState,
}

impl<S: CacheStorage + 'static> LifecycleManager<S> {
  /// A manager whose current static namespace is already ready starts out
  /// `Installed`.
  pub fn new(
    storage: Arc<S>,
    network: Arc<dyn Network>,
    namespaces: Namespaces,
    manifest: PrecacheManifest,
  ) -> Result<Self> {
    let state = if storage.is_ready(&namespaces.static_cache)? {
      WorkerState::Installed
    } else {
      WorkerState::Parsed
    };

    Ok(Self {
      storage,
      network,
      namespaces,
      manifest,
      state,
    })
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  /// Whether the current static namespace holds a committed precache.
  pub fn is_installed(&self) -> Result<bool> {
    self.storage.is_ready(&self.namespaces.static_cache)
  }

  /// Namespaces requests should be served from.
  ///
  /// The configured static namespace once it is promoted; until then the most
  /// recently promoted static namespace still in storage. Falls back to the
  /// configured names when nothing is promoted.
  pub fn serving_namespaces(&self) -> Namespaces {
    let configured = &self.namespaces;
    let existing = match self.storage.namespaces() {
      Ok(existing) => existing,
      Err(e) => {
        warn!("Failed to enumerate namespaces: {}", e);
        return configured.clone();
      }
    };

    if existing
      .iter()
      .any(|ns| ns.ready && ns.name == configured.static_cache)
    {
      return configured.clone();
    }

    let previous = existing
      .into_iter()
      .filter(|ns| ns.ready && ns.name != configured.image_cache)
      .max_by_key(|ns| ns.promotion);

    match previous {
      Some(ns) => {
        info!(
          configured = %configured.static_cache,
          serving = %ns.name,
          "Configured namespace not promoted, serving previous app shell"
        );
        Namespaces::new(ns.name, configured.image_cache.clone())
      }
      None => configured.clone(),
    }
  }

  /// Fetch every manifest entry and commit them into the current static
  /// namespace as one unit. Any network error or non-2xx status fails the
  /// whole install and nothing is written.
  pub async fn on_install(&mut self) -> Result<usize> {
    self.state = WorkerState::Installing;
    info!(
      namespace = %self.namespaces.static_cache,
      entries = self.manifest.urls().len(),
      "Installing app shell"
    );

    match self.precache().await {
      Ok(count) => {
        self.state = WorkerState::Installed;
        info!(namespace = %self.namespaces.static_cache, count, "Install complete");
        Ok(count)
      }
      Err(e) => {
        self.state = WorkerState::Redundant;
        warn!(namespace = %self.namespaces.static_cache, "Install failed: {}", e);
        Err(e)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let namespace = self.namespaces.static_cache.clone();
    {
      let namespace = namespace.clone();
      with_storage(&self.storage, move |s| s.open(&namespace)).await?;
    }

    let fetches = self.manifest.urls().iter().map(|url| {
      let network = Arc::clone(&self.network);
      let request = InterceptedRequest::get(url.clone(), Destination::Other);
      async move {
        let response = network.fetch(&request).await?;
        if !response.is_success() {
          return Err(eyre!(
            "Precache of {} failed with status {}",
            request.url,
            response.status
          ));
        }
        debug!(url = %request.url, status = response.status, "Precached");
        Ok::<_, color_eyre::Report>((RequestKey::from(&request), response))
      }
    });

    let entries = try_join_all(fetches).await?;
    let count = entries.len();
    with_storage(&self.storage, move |s| s.commit_precache(&namespace, &entries)).await?;

    Ok(count)
  }

  /// Delete every namespace other than the current static one and the image
  /// one. Enumeration and delete errors are logged and skipped.
  pub async fn on_activate(&mut self) -> Result<ActivationReport> {
    match self.state {
      WorkerState::Installed | WorkerState::Activated => {}
      state => return Err(eyre!("Cannot activate a worker in state {:?}", state)),
    }

    self.state = WorkerState::Activating;
    let mut report = ActivationReport::default();

    let existing = match with_storage(&self.storage, |s| s.namespaces()).await {
      Ok(existing) => existing,
      Err(e) => {
        warn!("Failed to enumerate namespaces, skipping cleanup: {}", e);
        self.state = WorkerState::Activated;
        return Ok(report);
      }
    };

    for ns in existing {
      if self.namespaces.retains(&ns.name) {
        continue;
      }
      let name = ns.name.clone();
      match with_storage(&self.storage, move |s| s.delete_namespace(&name)).await {
        Ok(true) => {
          info!(namespace = %ns.name, entries = ns.entries, "Deleted stale namespace");
          report.deleted.push(ns.name);
        }
        Ok(false) => debug!(namespace = %ns.name, "Stale namespace already gone"),
        Err(e) => {
          warn!(namespace = %ns.name, "Failed to delete stale namespace: {}", e);
          report.failed.push(ns.name);
        }
      }
    }

    self.state = WorkerState::Activated;
    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, NamespaceInfo, StoredResponse};
  use crate::net::stub::StubNetwork;
  use crate::net::Response;

  const ORIGIN: &str = "https://gallery.test/";

  fn manifest(entries: &[&str]) -> PrecacheManifest {
    let entries: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
    PrecacheManifest::resolve(&Url::parse(ORIGIN).unwrap(), &entries).unwrap()
  }

  fn shell_network() -> StubNetwork {
    StubNetwork::new()
      .respond("https://gallery.test/", 200, "<html>root</html>")
      .respond("https://gallery.test/index.html", 200, "<html>index</html>")
      .respond("https://gallery.test/main.js", 200, "console.log(1)")
      .respond("https://gallery.test/offline.html", 200, "<html>offline</html>")
  }

  fn manager(
    storage: &Arc<MemoryStorage>,
    network: StubNetwork,
    static_cache: &str,
  ) -> LifecycleManager<MemoryStorage> {
    LifecycleManager::new(
      Arc::clone(storage),
      Arc::new(network),
      Namespaces::new(static_cache, "image-cache"),
      manifest(&["/", "/index.html", "/main.js", "/offline.html"]),
    )
    .unwrap()
  }

  fn key(url: &str) -> RequestKey {
    RequestKey::get(&Url::parse(url).unwrap())
  }

  #[test]
  fn test_manifest_resolves_and_dedupes() {
    let m = manifest(&["./", "./index.html", "index.html#x", "https://cdn.test/lib.js"]);
    let urls: Vec<&str> = m.urls().iter().map(Url::as_str).collect();
    assert_eq!(
      urls,
      vec![
        "https://gallery.test/",
        "https://gallery.test/index.html",
        "https://cdn.test/lib.js"
      ]
    );
    assert!(m.contains(&Url::parse("https://gallery.test/index.html").unwrap()));
    assert!(!m.contains(&Url::parse("https://gallery.test/style.css").unwrap()));
  }

  #[tokio::test]
  async fn test_install_stores_every_manifest_entry() {
    let storage = Arc::new(MemoryStorage::new());
    let mut lifecycle = manager(&storage, shell_network(), "static-v1");
    assert_eq!(lifecycle.state(), WorkerState::Parsed);

    let count = lifecycle.on_install().await.unwrap();
    assert_eq!(count, 4);
    assert_eq!(lifecycle.state(), WorkerState::Installed);
    assert!(lifecycle.is_installed().unwrap());

    for url in [
      "https://gallery.test/",
      "https://gallery.test/index.html",
      "https://gallery.test/main.js",
      "https://gallery.test/offline.html",
    ] {
      assert!(storage.get("static-v1", &key(url)).unwrap().is_some(), "{url}");
    }
  }

  #[tokio::test]
  async fn test_install_fails_on_404_and_promotes_nothing() {
    let storage = Arc::new(MemoryStorage::new());
    let network = shell_network().respond("https://gallery.test/main.js", 404, "not found");
    let mut lifecycle = manager(&storage, network, "static-v1");

    let err = lifecycle.on_install().await.unwrap_err();
    assert!(err.to_string().contains("404"));
    assert_eq!(lifecycle.state(), WorkerState::Redundant);
    assert!(!lifecycle.is_installed().unwrap());
    assert!(storage
      .get("static-v1", &key("https://gallery.test/index.html"))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_install_fails_on_network_error() {
    let storage = Arc::new(MemoryStorage::new());
    let network = shell_network().fail("https://gallery.test/offline.html");
    let mut lifecycle = manager(&storage, network, "static-v1");

    assert!(lifecycle.on_install().await.is_err());
    assert!(!storage.is_ready("static-v1").unwrap());
  }

  #[tokio::test]
  async fn test_install_can_be_retried_after_failure() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(shell_network());
    let mut lifecycle = LifecycleManager::new(
      Arc::clone(&storage),
      network.clone(),
      Namespaces::new("static-v1", "image-cache"),
      manifest(&["/", "/offline.html"]),
    )
    .unwrap();

    network.set_offline(true);
    assert!(lifecycle.on_install().await.is_err());

    network.set_offline(false);
    assert_eq!(lifecycle.on_install().await.unwrap(), 2);
    assert_eq!(lifecycle.state(), WorkerState::Installed);
  }

  #[tokio::test]
  async fn test_activate_deletes_only_superseded_static_namespace() {
    let storage = Arc::new(MemoryStorage::new());
    storage.commit_precache("static-v1", &[]).unwrap();
    storage
      .put("image-cache", &key("https://gallery.test/a.png"), &Response::new(200, "https://gallery.test/a.png", "png"))
      .unwrap();

    let mut lifecycle = manager(&storage, shell_network(), "static-v2");
    lifecycle.on_install().await.unwrap();

    let report = lifecycle.on_activate().await.unwrap();
    assert_eq!(report.deleted, vec!["static-v1".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(lifecycle.state(), WorkerState::Activated);

    let names: Vec<String> = storage.namespaces().unwrap().into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["image-cache".to_string(), "static-v2".to_string()]);
  }

  #[tokio::test]
  async fn test_activate_is_idempotent() {
    let storage = Arc::new(MemoryStorage::new());
    let mut lifecycle = manager(&storage, shell_network(), "static-v1");
    lifecycle.on_install().await.unwrap();
    storage.open("image-cache").unwrap();

    lifecycle.on_activate().await.unwrap();
    let before = storage.namespaces().unwrap();

    let report = lifecycle.on_activate().await.unwrap();
    assert_eq!(report, ActivationReport::default());
    assert_eq!(storage.namespaces().unwrap(), before);
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let storage = Arc::new(MemoryStorage::new());
    let mut lifecycle = manager(&storage, shell_network(), "static-v1");
    assert!(lifecycle.on_activate().await.is_err());
  }

  #[tokio::test]
  async fn test_ready_namespace_resumes_as_installed() {
    let storage = Arc::new(MemoryStorage::new());
    storage.commit_precache("static-v1", &[]).unwrap();
    storage.open("static-v0").unwrap();

    let network = StubNetwork::new();
    let mut lifecycle = manager(&storage, network, "static-v1");
    assert_eq!(lifecycle.state(), WorkerState::Installed);

    let report = lifecycle.on_activate().await.unwrap();
    assert_eq!(report.deleted, vec!["static-v0".to_string()]);
  }

  /// Memory storage that fails enumeration, or deletes of one namespace.
  #[derive(Default)]
  struct FaultyStorage {
    inner: MemoryStorage,
    stuck: Option<&'static str>,
    broken_listing: bool,
  }

  impl CacheStorage for FaultyStorage {
    fn open(&self, namespace: &str) -> Result<()> {
      self.inner.open(namespace)
    }

    fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
      if self.broken_listing {
        return Err(eyre!("disk I/O error"));
      }
      self.inner.namespaces()
    }

    fn is_ready(&self, namespace: &str) -> Result<bool> {
      self.inner.is_ready(namespace)
    }

    fn delete_namespace(&self, namespace: &str) -> Result<bool> {
      if self.stuck == Some(namespace) {
        return Err(eyre!("database is locked"));
      }
      self.inner.delete_namespace(namespace)
    }

    fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
      self.inner.get(namespace, key)
    }

    fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<()> {
      self.inner.put(namespace, key, response)
    }

    fn commit_precache(&self, namespace: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
      self.inner.commit_precache(namespace, entries)
    }
  }

  #[tokio::test]
  async fn test_activate_swallows_delete_failures() {
    let storage = Arc::new(FaultyStorage {
      stuck: Some("static-v0"),
      ..FaultyStorage::default()
    });
    storage.commit_precache("static-v2", &[]).unwrap();
    storage.open("static-v0").unwrap();
    storage.open("static-v1").unwrap();

    let mut lifecycle = LifecycleManager::new(
      Arc::clone(&storage),
      Arc::new(StubNetwork::new()),
      Namespaces::new("static-v2", "image-cache"),
      manifest(&["/"]),
    )
    .unwrap();

    let report = lifecycle.on_activate().await.unwrap();
    assert_eq!(report.deleted, vec!["static-v1".to_string()]);
    assert_eq!(report.failed, vec!["static-v0".to_string()]);
    assert_eq!(lifecycle.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_activate_swallows_enumeration_failure() {
    let storage = Arc::new(FaultyStorage {
      broken_listing: true,
      ..FaultyStorage::default()
    });
    storage.commit_precache("static-v2", &[]).unwrap();
    storage.open("static-v1").unwrap();

    let mut lifecycle = LifecycleManager::new(
      Arc::clone(&storage),
      Arc::new(StubNetwork::new()),
      Namespaces::new("static-v2", "image-cache"),
      manifest(&["/"]),
    )
    .unwrap();

    let report = lifecycle.on_activate().await.unwrap();
    assert_eq!(report, ActivationReport::default());
    assert_eq!(lifecycle.state(), WorkerState::Activated);

    let names: Vec<String> = storage.inner.namespaces().unwrap().into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["static-v1".to_string(), "static-v2".to_string()]);
  }

  #[tokio::test]
  async fn test_serving_namespaces_prefers_promoted_configured_namespace() {
    let storage = Arc::new(MemoryStorage::new());
    storage.commit_precache("static-v1", &[]).unwrap();
    let mut lifecycle = manager(&storage, shell_network(), "static-v2");

    assert_eq!(lifecycle.serving_namespaces().static_cache, "static-v1");

    lifecycle.on_install().await.unwrap();
    assert_eq!(lifecycle.serving_namespaces().static_cache, "static-v2");
  }

  #[tokio::test]
  async fn test_serving_namespaces_picks_latest_promotion() {
    let storage = Arc::new(MemoryStorage::new());
    storage.commit_precache("static-v2", &[]).unwrap();
    storage.commit_precache("static-v1", &[]).unwrap();
    storage.open("static-v3").unwrap();

    let lifecycle = manager(&storage, StubNetwork::new(), "static-v3");
    let serving = lifecycle.serving_namespaces();
    assert_eq!(serving.static_cache, "static-v1");
    assert_eq!(serving.image_cache, "image-cache");
  }

  #[tokio::test]
  async fn test_serving_namespaces_without_any_promotion_uses_configured() {
    let storage = Arc::new(MemoryStorage::new());
    let lifecycle = manager(&storage, StubNetwork::new(), "static-v1");
    assert_eq!(
      lifecycle.serving_namespaces(),
      Namespaces::new("static-v1", "image-cache")
    );
  }
}
