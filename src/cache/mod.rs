//! Durable response namespaces.
//!
//! This module provides the storage capability shared by the lifecycle
//! manager and the dispatcher:
//! - Named namespaces holding request key → response entries
//! - Implicit namespace creation on first write, explicit deletion only
//! - All-or-nothing precache commits that mark a namespace ready
//! - No size or age eviction; entries change only by overwrite

mod key;
mod storage;
mod traits;

pub use key::RequestKey;
#[cfg(test)]
pub use storage::MemoryStorage;
pub use storage::{with_storage, CacheStorage, SqliteStorage};
pub use traits::{NamespaceInfo, Namespaces, Served, ServedFrom, StoredResponse};
