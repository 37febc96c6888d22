//! Network side of the interception boundary.

mod client;
#[cfg(test)]
pub mod stub;
mod types;

pub use client::{HttpClient, Network, OfflineNetwork};
pub use types::{Destination, InterceptedRequest, Response};
