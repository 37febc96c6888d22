//! Core types shared by the lifecycle manager and the dispatcher.

use chrono::{DateTime, Utc};

use crate::net::Response;

/// The two namespace names the layer works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespaces {
  /// Current static namespace, versioned by build.
  pub static_cache: String,
  /// Image namespace, shared across builds.
  pub image_cache: String,
}

impl Namespaces {
  pub fn new(static_cache: impl Into<String>, image_cache: impl Into<String>) -> Self {
    Self {
      static_cache: static_cache.into(),
      image_cache: image_cache.into(),
    }
  }

  /// Whether activation keeps `name`. Everything else is stale.
  pub fn retains(&self, name: &str) -> bool {
    name == self.static_cache || name == self.image_cache
  }
}

/// A response read back from a namespace.
#[derive(Debug, Clone)]
pub struct StoredResponse {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Summary of one namespace, as enumerated from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceInfo {
  pub name: String,
  pub entries: usize,
  /// Set once a precache has been committed into it.
  pub ready: bool,
  /// Promotion order among ready namespaces; the highest was committed last
  pub promotion: Option<u64>,
}

/// A response handed back to the requester, with where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ServedFrom,
  /// When the entry was cached (if not from network)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(stored: StoredResponse) -> Self {
    Self {
      response: stored.response,
      source: ServedFrom::Cache,
      cached_at: Some(stored.cached_at),
    }
  }

  pub fn offline_fallback(stored: StoredResponse) -> Self {
    Self {
      response: stored.response,
      source: ServedFrom::OfflineFallback,
      cached_at: Some(stored.cached_at),
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Fresh from the network
  Network,
  /// Entry matching the request key
  Cache,
  /// Network down and no match: the offline document
  OfflineFallback,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retains_only_current_static_and_images() {
    let namespaces = Namespaces::new("static-image-gallery-v2", "image-cache");
    assert!(namespaces.retains("static-image-gallery-v2"));
    assert!(namespaces.retains("image-cache"));
    assert!(!namespaces.retains("static-image-gallery-v1"));
    assert!(!namespaces.retains(""));
  }
}
