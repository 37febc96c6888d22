//! Scripted network for tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::client::Network;
use super::types::{InterceptedRequest, Response};

enum Route {
  Respond(Response),
  Fail,
}

/// Answers from a fixed route table and counts calls per URL.
///
/// Unrouted URLs fail like a refused connection.
#[derive(Default)]
pub struct StubNetwork {
  routes: Mutex<HashMap<String, Route>>,
  calls: Mutex<HashMap<String, usize>>,
  offline: AtomicBool,
}

impl StubNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(self, url: &str, status: u16, body: &str) -> Self {
    let response = Response::new(status, url, body.as_bytes().to_vec());
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Route::Respond(response));
    self
  }

  pub fn fail(self, url: &str) -> Self {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Route::Fail);
    self
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self, url: &str) -> usize {
    self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().values().sum()
  }
}

#[async_trait]
impl Network for StubNetwork {
  async fn fetch(&self, request: &InterceptedRequest) -> Result<Response> {
    let url = request.url.to_string();
    *self.calls.lock().unwrap().entry(url.clone()).or_default() += 1;

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("offline: {}", url));
    }

    match self.routes.lock().unwrap().get(&url) {
      Some(Route::Respond(response)) => Ok(response.clone()),
      Some(Route::Fail) => Err(eyre!("connection reset: {}", url)),
      None => Err(eyre!("connection refused: {}", url)),
    }
  }
}
