//! Request and response types that cross the interception boundary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::{Origin, Url};

/// What the requester intends to do with the response.
///
/// Mirrors the fetch destination of the browsing context. Anything the layer
/// does not specifically recognise is `Other`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Image,
  Document,
  Script,
  Style,
  #[default]
  Other,
}

impl FromStr for Destination {
  type Err = std::convert::Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(match s.trim().to_lowercase().as_str() {
      "image" => Self::Image,
      "document" => Self::Document,
      "script" => Self::Script,
      "style" => Self::Style,
      _ => Self::Other,
    })
  }
}

impl fmt::Display for Destination {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Image => "image",
      Self::Document => "document",
      Self::Script => "script",
      Self::Style => "style",
      Self::Other => "other",
    };
    f.write_str(name)
  }
}

/// A request caught by the interception layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedRequest {
  pub method: String,
  pub url: Url,
  pub destination: Destination,
}

impl InterceptedRequest {
  pub fn new(method: &str, url: Url, destination: Destination) -> Self {
    Self {
      method: method.trim().to_uppercase(),
      url,
      destination,
    }
  }

  /// Shorthand for a `GET` request.
  pub fn get(url: Url, destination: Destination) -> Self {
    Self::new("GET", url, destination)
  }

  pub fn origin(&self) -> Origin {
    self.url.origin()
  }

  /// Only `GET` requests are ever looked up in or written to a namespace.
  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }
}

/// A response as received from the network or as replayed from a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  /// Final URL after redirects.
  pub url: String,
}

#[allow(dead_code)]
impl Response {
  pub fn new(status: u16, url: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      url: url.to_string(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_lowercase(), value.to_string()));
    self
  }

  /// 2xx status.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}
