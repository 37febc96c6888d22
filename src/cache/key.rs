//! Cache identity for requests.

use sha2::{Digest, Sha256};
use url::Url;

use crate::net::InterceptedRequest;

/// Normalized `(method, url)` pair that identifies a cache entry.
///
/// The query string is significant; the fragment is not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    Self {
      method: method.trim().to_uppercase(),
      url: normalize_url(url),
    }
  }

  /// Key for a plain `GET` of `url`.
  pub fn get(url: &Url) -> Self {
    Self::new("GET", url)
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hex digest, used as the storage primary key.
  pub fn digest(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<&InterceptedRequest> for RequestKey {
  fn from(request: &InterceptedRequest) -> Self {
    Self::new(&request.method, &request.url)
  }
}

fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_fragment_is_ignored() {
    let a = RequestKey::get(&url("https://gallery.test/index.html#top"));
    let b = RequestKey::get(&url("https://gallery.test/index.html"));
    assert_eq!(a, b);
    assert_eq!(a.digest(), b.digest());
  }

  #[test]
  fn test_query_is_significant() {
    let a = RequestKey::get(&url("https://gallery.test/thumb.jpg?w=100"));
    let b = RequestKey::get(&url("https://gallery.test/thumb.jpg?w=200"));
    assert_ne!(a.digest(), b.digest());
  }

  #[test]
  fn test_method_is_significant() {
    let target = url("https://gallery.test/api/data.json");
    let get = RequestKey::new("get", &target);
    let post = RequestKey::new("POST", &target);
    assert_eq!(get.method(), "GET");
    assert_ne!(get.digest(), post.digest());
  }

  #[test]
  fn test_host_case_is_normalized() {
    let a = RequestKey::get(&url("https://Gallery.TEST/a.png"));
    let b = RequestKey::get(&url("https://gallery.test/a.png"));
    assert_eq!(a.url(), b.url());
  }
}
