//! Cache storage trait and its SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
#[cfg(test)]
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::key::RequestKey;
use super::traits::{NamespaceInfo, StoredResponse};
use crate::db::Database;
use crate::net::Response;

/// Trait for namespace storage backends.
///
/// Every write is all-or-nothing. Concurrent writes to the same key race and
/// the last one wins.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it does not exist yet.
  fn open(&self, namespace: &str) -> Result<()>;

  /// Enumerate every namespace.
  fn namespaces(&self) -> Result<Vec<NamespaceInfo>>;

  /// Whether a precache has been committed into the namespace.
  fn is_ready(&self, namespace: &str) -> Result<bool>;

  /// Delete a namespace and all its entries. Returns false if it did not exist.
  fn delete_namespace(&self, namespace: &str) -> Result<bool>;

  /// Look up an entry.
  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

  /// Store (or overwrite) a single entry, creating the namespace if needed.
  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store every entry and mark the namespace ready, as one unit.
  fn commit_precache(&self, namespace: &str, entries: &[(RequestKey, Response)]) -> Result<()>;
}

/// Run a storage call on tokio's blocking pool. SQLite I/O must not stall the
/// async workers.
pub async fn with_storage<S, T, F>(storage: &Arc<S>, f: F) -> Result<T>
where
  S: CacheStorage + 'static,
  T: Send + 'static,
  F: FnOnce(&S) -> Result<T> + Send + 'static,
{
  let storage = Arc::clone(storage);
  tokio::task::spawn_blocking(move || f(&storage))
    .await
    .map_err(|e| eyre!("Storage task did not complete: {}", e))?
}

#[cfg(test)]
#[derive(Default)]
struct MemoryNamespace {
  promotion: Option<u64>,
  entries: HashMap<String, StoredResponse>,
}

/// Process-local storage for tests. Nothing survives a restart.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStorage {
  namespaces: Mutex<BTreeMap<String, MemoryNamespace>>,
}

#[cfg(test)]
impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, MemoryNamespace>>> {
    self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[cfg(test)]
impl CacheStorage for MemoryStorage {
  fn open(&self, namespace: &str) -> Result<()> {
    self.lock()?.entry(namespace.to_string()).or_default();
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
    Ok(
      self
        .lock()?
        .iter()
        .map(|(name, ns)| NamespaceInfo {
          name: name.clone(),
          entries: ns.entries.len(),
          ready: ns.promotion.is_some(),
          promotion: ns.promotion,
        })
        .collect(),
    )
  }

  fn is_ready(&self, namespace: &str) -> Result<bool> {
    Ok(self.lock()?.get(namespace).is_some_and(|ns| ns.promotion.is_some()))
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    Ok(self.lock()?.remove(namespace).is_some())
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    Ok(
      self
        .lock()?
        .get(namespace)
        .and_then(|ns| ns.entries.get(&key.digest()))
        .cloned(),
    )
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let stored = StoredResponse {
      response: response.clone(),
      cached_at: Utc::now(),
    };
    self
      .lock()?
      .entry(namespace.to_string())
      .or_default()
      .entries
      .insert(key.digest(), stored);
    Ok(())
  }

  fn commit_precache(&self, namespace: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let now = Utc::now();
    let mut namespaces = self.lock()?;
    let promotion = namespaces
      .values()
      .filter_map(|ns| ns.promotion)
      .max()
      .unwrap_or(0)
      + 1;
    let ns = namespaces.entry(namespace.to_string()).or_default();
    for (key, response) in entries {
      ns.entries.insert(
        key.digest(),
        StoredResponse {
          response: response.clone(),
          cached_at: now,
        },
      );
    }
    ns.promotion = Some(promotion);
    Ok(())
  }
}

/// SQLite-based namespace storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self::from_database(Database::open(path)?))
  }

  /// A store that lives only as long as this value.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::from_database(Database::open_in_memory()?))
  }

  fn from_database(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn insert_entry(
  conn: &Connection,
  namespace: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries
         (namespace, request_hash, method, url, status, headers, body, response_url, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        namespace,
        key.digest(),
        key.method(),
        key.url(),
        response.status,
        headers,
        response.body,
        response.url,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry for {}: {}", key.url(), e))?;

  Ok(())
}

fn ensure_namespace(conn: &Connection, namespace: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO namespaces (name) VALUES (?)",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to create namespace {}: {}", namespace, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, namespace: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_namespace(&conn, namespace)
  }

  fn namespaces(&self) -> Result<Vec<NamespaceInfo>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(
        "SELECT n.name, n.ready, n.promotion, COUNT(e.request_hash) FROM namespaces n
         LEFT JOIN entries e ON e.namespace = n.name
         GROUP BY n.name
         ORDER BY n.name",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        let promotion: Option<i64> = row.get(2)?;
        let entries: i64 = row.get(3)?;
        Ok(NamespaceInfo {
          name: row.get(0)?,
          ready: row.get(1)?,
          entries: entries as usize,
          promotion: promotion.map(|p| p as u64),
        })
      })
      .map_err(|e| eyre!("Failed to enumerate namespaces: {}", e))?;

    rows
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))
  }

  fn is_ready(&self, namespace: &str) -> Result<bool> {
    let conn = self.lock()?;

    let ready: Option<bool> = conn
      .query_row(
        "SELECT ready FROM namespaces WHERE name = ?",
        params![namespace],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read namespace {}: {}", namespace, e))?;

    Ok(ready.unwrap_or(false))
  }

  fn delete_namespace(&self, namespace: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE namespace = ?", params![namespace])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;
    let removed = tx
      .execute("DELETE FROM namespaces WHERE name = ?", params![namespace])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
    let conn = self.lock()?;

    let row: Option<(u16, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT status, headers, body, response_url, cached_at FROM entries
         WHERE namespace = ? AND request_hash = ?",
        params![namespace, key.digest()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry for {}: {}", key.url(), e))?;

    match row {
      Some((status, headers, body, url, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(StoredResponse {
          response: Response {
            status,
            headers,
            body,
            url,
          },
          cached_at: parse_datetime(&cached_at_str)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_namespace(&tx, namespace)?;
    insert_entry(&tx, namespace, key, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn commit_precache(&self, namespace: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_namespace(&tx, namespace)?;
    for (key, response) in entries {
      insert_entry(&tx, namespace, key, response)?;
    }
    tx.execute(
      "UPDATE namespaces
       SET ready = 1,
           promotion = (SELECT COALESCE(MAX(promotion), 0) + 1 FROM namespaces)
       WHERE name = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to mark {} ready: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
