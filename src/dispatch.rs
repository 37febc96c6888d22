//! Strategy dispatch for intercepted requests.
//!
//! Every request is classified once into a [`Strategy`] by a pure function,
//! then executed against the injected storage and network:
//!
//! - Same-origin images go cache-first against the image namespace. A hit
//!   never touches the network; a miss is fetched and written back in the
//!   background.
//! - Everything else goes network-first. Nothing is written; on network
//!   failure the current static namespace is consulted, then the offline
//!   document.

use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use url::Url;

use crate::cache::{with_storage, CacheStorage, Namespaces, RequestKey, Served, StoredResponse};
use crate::net::{Destination, InterceptedRequest, Network, Response};

/// The fetch strategy chosen for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst { namespace: String },
  NetworkFirst,
}

/// Pick the strategy for `request`. First match wins:
/// 1. same origin as `scope` and an image destination → cache-first (images)
/// 2. anything else → network-first
pub fn classify(request: &InterceptedRequest, scope: &Url, namespaces: &Namespaces) -> Strategy {
  if request.origin() == scope.origin() && request.destination == Destination::Image {
    Strategy::CacheFirst {
      namespace: namespaces.image_cache.clone(),
    }
  } else {
    Strategy::NetworkFirst
  }
}

/// Result of handling one request.
#[derive(Debug, Clone)]
pub enum Outcome {
  Served(Served),
  /// Nothing to serve. The requester shows its own broken state.
  Unavailable,
}

impl Outcome {
  #[allow(dead_code)]
  pub fn served(&self) -> Option<&Served> {
    match self {
      Outcome::Served(served) => Some(served),
      Outcome::Unavailable => None,
    }
  }
}

/// Routes intercepted requests to their strategy.
pub struct Dispatcher<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  namespaces: Namespaces,
  scope: Url,
  offline_key: RequestKey,
  /// Background cache writes started by cache-first
  pending_writes: Mutex<JoinSet<()>>,
}

impl<S: CacheStorage + 'static> Dispatcher<S> {
  pub fn new(
    storage: Arc<S>,
    network: Arc<dyn Network>,
    namespaces: Namespaces,
    scope: Url,
    offline_page: &Url,
  ) -> Self {
    Self {
      storage,
      network,
      namespaces,
      scope,
      offline_key: RequestKey::get(offline_page),
      pending_writes: Mutex::new(JoinSet::new()),
    }
  }

  pub fn strategy_for(&self, request: &InterceptedRequest) -> Strategy {
    classify(request, &self.scope, &self.namespaces)
  }

  /// Handle one intercepted request. Never fails; the worst case is
  /// [`Outcome::Unavailable`].
  pub async fn handle(&self, request: &InterceptedRequest) -> Outcome {
    let strategy = self.strategy_for(request);
    debug!(
      method = %request.method,
      url = %request.url,
      destination = %request.destination,
      ?strategy,
      "Intercepted request"
    );

    match strategy {
      Strategy::CacheFirst { namespace } => self.cache_first(request, &namespace).await,
      Strategy::NetworkFirst => self.network_first(request).await,
    }
  }

  async fn cache_first(&self, request: &InterceptedRequest, namespace: &str) -> Outcome {
    let key = RequestKey::from(request);

    if request.is_get() {
      if let Some(stored) = self.lookup(namespace, &key).await {
        debug!(url = %request.url, namespace, "Cache hit");
        return Outcome::Served(Served::from_cache(stored));
      }
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if request.is_get() && response.is_success() {
          self.store_in_background(namespace, key, response.clone());
        } else {
          debug!(url = %request.url, status = response.status, "Not caching response");
        }
        Outcome::Served(Served::from_network(response))
      }
      Err(e) => {
        debug!(url = %request.url, "Network failed with no cached copy: {}", e);
        Outcome::Unavailable
      }
    }
  }

  async fn network_first(&self, request: &InterceptedRequest) -> Outcome {
    let e = match self.network.fetch(request).await {
      Ok(response) => return Outcome::Served(Served::from_network(response)),
      Err(e) => e,
    };
    debug!(url = %request.url, "Network failed, falling back to cache: {}", e);

    let static_cache = &self.namespaces.static_cache;

    if request.is_get() {
      if let Some(stored) = self.lookup(static_cache, &RequestKey::from(request)).await {
        return Outcome::Served(Served::from_cache(stored));
      }
    }

    match self.lookup(static_cache, &self.offline_key).await {
      Some(stored) => {
        debug!(url = %request.url, "Serving offline document");
        Outcome::Served(Served::offline_fallback(stored))
      }
      None => {
        error!(
          url = %request.url,
          offline = self.offline_key.url(),
          "Offline document missing from {}",
          static_cache
        );
        Outcome::Unavailable
      }
    }
  }

  /// A failed read counts as a miss.
  async fn lookup(&self, namespace: &str, key: &RequestKey) -> Option<StoredResponse> {
    let read_namespace = namespace.to_string();
    let read_key = key.clone();
    match with_storage(&self.storage, move |s| s.get(&read_namespace, &read_key)).await {
      Ok(found) => found,
      Err(e) => {
        warn!(namespace, url = key.url(), "Cache read failed: {}", e);
        None
      }
    }
  }

  /// Write `response` on the blocking pool without holding up the caller.
  /// Failures are logged.
  fn store_in_background(&self, namespace: &str, key: RequestKey, response: Response) {
    let storage = Arc::clone(&self.storage);
    let namespace = namespace.to_string();
    let write = move || match storage.put(&namespace, &key, &response) {
      Ok(()) => debug!(namespace = %namespace, url = key.url(), "Stored response"),
      Err(e) => warn!(namespace = %namespace, url = key.url(), "Cache write failed: {}", e),
    };

    match self.pending_writes.lock() {
      Ok(mut writes) => {
        // Reap writes that already finished
        while writes.try_join_next().is_some() {}
        writes.spawn_blocking(write);
      }
      Err(_) => {
        tokio::task::spawn_blocking(write);
      }
    }
  }

  /// Wait for every background write started so far.
  pub async fn flush(&self) {
    let mut writes = match self.pending_writes.lock() {
      Ok(mut writes) => std::mem::take(&mut *writes),
      Err(_) => return,
    };

    while let Some(result) = writes.join_next().await {
      if let Err(e) = result {
        warn!("Background cache write did not complete: {}", e);
      }
    }
  }
}
